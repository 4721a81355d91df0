//! Registry of user actors.
//!
//! Lazily spawns one actor per user on first touch and routes writer
//! callbacks back to the owning actor. The registry is also the seam the
//! writer pool uses as its [`MirrorWriteHost`], which keeps every mirror
//! row transition inside the single-writer actor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use calfed_core::config::EngineConfig;
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::ids::MirrorId;

use crate::mirror::writer::MirrorWriteHost;
use crate::mirror::{MirrorState, MirrorWriteOutcome, MirrorWriteTicket};
use crate::provider::ProviderWriteAdapter;
use crate::queue::{JobSink, MirrorJob};
use crate::store::Store;

use super::{UserActor, UserActorHandle};

struct ActorEntry {
    handle: UserActorHandle,
    join: JoinHandle<()>,
}

/// Lazily-spawning map of user id to actor.
pub struct UserRegistry {
    data_dir: PathBuf,
    config: EngineConfig,
    provider: Arc<dyn ProviderWriteAdapter>,
    jobs: OnceCell<Arc<dyn JobSink>>,
    actors: RwLock<HashMap<String, ActorEntry>>,
}

impl UserRegistry {
    pub fn new(
        data_dir: PathBuf,
        config: EngineConfig,
        provider: Arc<dyn ProviderWriteAdapter>,
    ) -> Self {
        Self {
            data_dir,
            config,
            provider,
            jobs: OnceCell::new(),
            actors: RwLock::new(HashMap::new()),
        }
    }

    /// Wire the write queue in. Must happen before the first actor spawn;
    /// the registry and the writer pool reference each other, so
    /// construction is two-phase.
    pub fn set_job_sink(&self, jobs: Arc<dyn JobSink>) {
        if self.jobs.set(jobs).is_err() {
            tracing::warn!("job sink already set, ignoring");
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle for one user, spawning the actor (and migrating its store)
    /// on first touch.
    pub async fn user(&self, user_id: &str) -> EngineResult<UserActorHandle> {
        {
            let actors = self.actors.read().await;
            if let Some(entry) = actors.get(user_id) {
                return Ok(entry.handle.clone());
            }
        }

        let jobs = self
            .jobs
            .get()
            .ok_or_else(|| EngineError::transient("engine runtime not fully wired"))?
            .clone();
        let mut actors = self.actors.write().await;
        if let Some(entry) = actors.get(user_id) {
            return Ok(entry.handle.clone());
        }
        let store = Store::open(&self.data_dir, user_id)?;
        let (handle, join) = UserActor::spawn(
            user_id.to_string(),
            store,
            self.config.clone(),
            jobs,
            Arc::clone(&self.provider),
        );
        actors.insert(
            user_id.to_string(),
            ActorEntry {
                handle: handle.clone(),
                join,
            },
        );
        Ok(handle)
    }

    /// Tear one user down completely: stop the actor and delete the
    /// database. Refuses while mirrors are still live unless `force`,
    /// so provider-side artifacts are not orphaned silently.
    pub async fn purge_user(&self, user_id: &str, force: bool) -> EngineResult<()> {
        let handle = self.user(user_id).await?;
        if !force {
            let health = handle.get_health_report().await?;
            let non_terminal: i64 = health
                .mirror_counts
                .iter()
                .filter(|(state, _)| {
                    MirrorState::parse(state)
                        .map(|s| !s.is_terminal())
                        .unwrap_or(false)
                })
                .map(|(_, count)| *count)
                .sum();
            if non_terminal > 0 {
                return Err(EngineError::conflict(format!(
                    "user {} still has {} non-terminal mirrors; drain or pass force",
                    user_id, non_terminal
                )));
            }
        }
        handle.shutdown().await?;
        if let Some(entry) = self.actors.write().await.remove(user_id) {
            let _ = entry.join.await;
        }
        Store::purge_files(&self.data_dir, user_id)?;
        tracing::info!(user_id, "user purged");
        Ok(())
    }

    /// Stop every actor. Used by daemon shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<(String, ActorEntry)> =
            self.actors.write().await.drain().collect();
        for (user_id, entry) in entries {
            if let Err(error) = entry.handle.shutdown().await {
                tracing::warn!(user_id = %user_id, error = %error, "actor shutdown failed");
            }
            let _ = entry.join.await;
        }
    }
}

#[async_trait]
impl MirrorWriteHost for UserRegistry {
    async fn begin_mirror_write(
        &self,
        job: &MirrorJob,
    ) -> EngineResult<Option<MirrorWriteTicket>> {
        let handle = self.user(&job.user_id).await?;
        handle.begin_mirror_write(job.clone()).await
    }

    async fn complete_mirror_write(
        &self,
        user_id: &str,
        mirror_id: &MirrorId,
        outcome: MirrorWriteOutcome,
    ) -> EngineResult<()> {
        let handle = self.user(user_id).await?;
        handle.complete_mirror_write(mirror_id.clone(), outcome).await
    }
}
