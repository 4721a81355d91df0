//! Mirror writer actors.
//!
//! A pool of writer tasks, sharded by target account, consumes mirror
//! jobs and performs the provider calls. Writers never touch a store
//! directly: they claim the row through the owning user actor (the
//! [`MirrorWriteHost`]), perform the provider call, and report the
//! outcome back, so every row transition stays serialized in one place.
//!
//! Retries use capped exponential backoff with full jitter; rate-limited
//! responses honor the provider's retry-after instead.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use calfed_core::config::EngineConfig;
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::ids::MirrorId;

use crate::provider::{AccessTokenProvider, ProviderWriteAdapter, ProviderWriteError};
use crate::queue::{JobSink, MirrorJob, MirrorJobKind};

use super::{MirrorWriteOutcome, MirrorWriteTicket};

/// OAuth scope writers request for calendar mutations.
const CALENDAR_WRITE_SCOPE: &str = "calendar.events.write";

/// Capped exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_delay_ms: config.backoff_base_ms,
            factor: config.backoff_factor,
            max_delay_ms: config.backoff_max_ms,
        }
    }

    /// Delay before retry number `attempt` (1-based): a uniform sample
    /// from `[0, min(max, base * factor^(attempt-1))]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(24);
        let cap = (self.base_delay_ms as f64 * self.factor.powi(exponent as i32))
            .min(self.max_delay_ms as f64) as u64;
        let jittered = rand::thread_rng().gen_range(0..=cap.max(1));
        Duration::from_millis(jittered)
    }
}

/// Routing seam back to the user actors that own the mirror rows.
#[async_trait]
pub trait MirrorWriteHost: Send + Sync {
    /// Claim the job's mirror row; `None` means the job is stale and must
    /// be acknowledged without acting.
    async fn begin_mirror_write(&self, job: &MirrorJob)
        -> EngineResult<Option<MirrorWriteTicket>>;

    /// Report the provider outcome for a claimed row.
    async fn complete_mirror_write(
        &self,
        user_id: &str,
        mirror_id: &MirrorId,
        outcome: MirrorWriteOutcome,
    ) -> EngineResult<()>;
}

/// Sharded sender half of the writer pool. Jobs for one target account
/// always land on the same writer, keeping per-account provider traffic
/// ordered.
#[derive(Clone)]
pub struct WriterPool {
    shards: Vec<mpsc::UnboundedSender<MirrorJob>>,
}

impl WriterPool {
    /// Spawn `config.writer_shards` writer tasks.
    pub fn start(
        config: &EngineConfig,
        host: Arc<dyn MirrorWriteHost>,
        provider: Arc<dyn ProviderWriteAdapter>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let shard_count = config.writer_shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);
        for shard_id in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let writer = MirrorWriter {
                shard_id,
                host: Arc::clone(&host),
                provider: Arc::clone(&provider),
                tokens: Arc::clone(&tokens),
            };
            handles.push(tokio::spawn(writer.run(rx)));
            shards.push(tx);
        }
        (Self { shards }, handles)
    }

    fn shard_for(&self, job: &MirrorJob) -> usize {
        let mut hasher = DefaultHasher::new();
        job.target_account_id.as_str().hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

impl JobSink for WriterPool {
    fn enqueue(&self, job: MirrorJob) -> EngineResult<()> {
        let shard = self.shard_for(&job);
        self.shards[shard]
            .send(job)
            .map_err(|_| EngineError::transient("mirror writer pool is shut down"))
    }
}

struct MirrorWriter {
    shard_id: usize,
    host: Arc<dyn MirrorWriteHost>,
    provider: Arc<dyn ProviderWriteAdapter>,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl MirrorWriter {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<MirrorJob>) {
        tracing::debug!(shard = self.shard_id, "mirror writer started");
        while let Some(job) = rx.recv().await {
            self.handle_job(job).await;
        }
        tracing::debug!(shard = self.shard_id, "mirror writer stopped");
    }

    async fn handle_job(&self, job: MirrorJob) {
        let ticket = match self.host.begin_mirror_write(&job).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(
                    mirror_id = %job.mirror_id,
                    error = %error,
                    "failed to claim mirror for writing"
                );
                return;
            }
        };

        let outcome = self.perform(&ticket).await;
        if let Err(error) = self
            .host
            .complete_mirror_write(&job.user_id, &ticket.mirror_id, outcome)
            .await
        {
            tracing::error!(
                mirror_id = %ticket.mirror_id,
                error = %error,
                "failed to record mirror write outcome"
            );
        }
    }

    async fn perform(&self, ticket: &MirrorWriteTicket) -> MirrorWriteOutcome {
        match self
            .tokens
            .get_access_token(&ticket.target_account_id, CALENDAR_WRITE_SCOPE)
            .await
        {
            Ok(_) => {}
            Err(error) => {
                if matches!(error, ProviderWriteError::Permanent { .. }) {
                    self.tokens
                        .record_token_revoked(&ticket.target_account_id)
                        .await;
                }
                return outcome_from_error(error);
            }
        }

        match ticket.kind {
            MirrorJobKind::CreateMirror => {
                let Some(payload) = &ticket.payload else {
                    return MirrorWriteOutcome::Permanent {
                        error: "create claimed without a desired payload".to_string(),
                    };
                };
                match self
                    .provider
                    .create_event(
                        &ticket.target_account_id,
                        &ticket.target_calendar_id,
                        payload,
                        &ticket.idempotency_key,
                    )
                    .await
                {
                    Ok(provider_event_id) => MirrorWriteOutcome::Created {
                        provider_event_id,
                        written_hash: ticket.projected_hash.clone(),
                    },
                    Err(error) => outcome_from_error(error),
                }
            }
            MirrorJobKind::UpdateMirror => {
                let (Some(payload), Some(provider_event_id)) =
                    (&ticket.payload, &ticket.provider_event_id)
                else {
                    return MirrorWriteOutcome::Permanent {
                        error: "update claimed without payload or provider id".to_string(),
                    };
                };
                match self
                    .provider
                    .update_event(
                        &ticket.target_account_id,
                        &ticket.target_calendar_id,
                        provider_event_id,
                        payload,
                    )
                    .await
                {
                    Ok(()) => MirrorWriteOutcome::Updated {
                        written_hash: ticket.projected_hash.clone(),
                    },
                    Err(error) => outcome_from_error(error),
                }
            }
            MirrorJobKind::DeleteMirror => {
                let Some(provider_event_id) = &ticket.provider_event_id else {
                    // begin_write completes provider-less deletes inline.
                    return MirrorWriteOutcome::Deleted;
                };
                match self
                    .provider
                    .delete_event(
                        &ticket.target_account_id,
                        &ticket.target_calendar_id,
                        provider_event_id,
                    )
                    .await
                {
                    Ok(()) => MirrorWriteOutcome::Deleted,
                    Err(error) => outcome_from_error(error),
                }
            }
        }
    }
}

fn outcome_from_error(error: ProviderWriteError) -> MirrorWriteOutcome {
    match error {
        ProviderWriteError::Retryable { message } => {
            MirrorWriteOutcome::Retryable { error: message }
        }
        ProviderWriteError::RateLimited { retry_after } => MirrorWriteOutcome::RateLimited {
            error: "provider rate limited".to_string(),
            retry_after,
        },
        ProviderWriteError::Permanent { message } => {
            MirrorWriteOutcome::Permanent { error: message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 300_000,
        };
        for attempt in 1..=20 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_millis(300_000));
        }
    }

    #[test]
    fn backoff_envelope_grows_with_attempts() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 300_000,
        };
        // Full jitter samples [0, cap]; check the cap by sampling many
        // times and comparing maxima across attempts.
        let max_of = |attempt: u32| {
            (0..200)
                .map(|_| policy.delay_for(attempt).as_millis())
                .max()
                .unwrap()
        };
        assert!(max_of(1) <= 1_000);
        assert!(max_of(4) > 1_000);
    }
}
