//! Shared fixture: a fully wired engine over a temp directory with the
//! in-memory provider backend.

use std::sync::Arc;
use std::time::Duration;

use calfed_core::config::EngineConfig;
use calfed_core::constraint::ConstraintKind;
use calfed_core::error::EngineResult;
use calfed_engine::actor::UserActorHandle;
use calfed_engine::testing::{InMemoryProvider, StaticTokenProvider};
use calfed_engine::{EngineRuntime, UserRegistry};
use serde_json::json;

pub struct TestEngine {
    pub registry: Arc<UserRegistry>,
    pub provider: Arc<InMemoryProvider>,
    pub tokens: Arc<StaticTokenProvider>,
    // Dropped last: deleting the directory under live stores breaks them.
    _runtime: EngineRuntime,
    _dir: tempfile::TempDir,
}

impl TestEngine {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    pub fn start_with(tune: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig {
            // Fast lanes for tests; production defaults are slower.
            backoff_base_ms: 25,
            backoff_max_ms: 100,
            sweep_interval_seconds: 1,
            writer_shards: 2,
            ..EngineConfig::default()
        };
        tune(&mut config);
        let provider = Arc::new(InMemoryProvider::new());
        let tokens = Arc::new(StaticTokenProvider::new());
        let runtime = EngineRuntime::start(
            dir.path().to_path_buf(),
            config,
            provider.clone(),
            tokens.clone(),
        )
        .expect("engine runtime");
        TestEngine {
            registry: runtime.registry(),
            provider,
            tokens,
            _runtime: runtime,
            _dir: dir,
        }
    }

    pub async fn user(&self, user_id: &str) -> UserActorHandle {
        self.registry.user(user_id).await.expect("user actor")
    }

    /// Wait until the user's mirror pipeline has no queued or in-flight
    /// writes.
    pub async fn settle(&self, handle: &UserActorHandle) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let health = handle.get_health_report().await.expect("health report");
            if health.pending_mirror_writes == 0 {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mirror pipeline did not settle: {:?}",
                health
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Edge constraint config for `source -> target/calendar`.
pub fn edge_config(source: &str, target: &str, calendar: &str, detail: &str) -> serde_json::Value {
    json!({
        "source_account": source,
        "target_account": target,
        "target_calendar": calendar,
        "detail_level": detail,
    })
}

/// Create an edge and return its id.
pub async fn add_edge(
    handle: &UserActorHandle,
    source: &str,
    target: &str,
    calendar: &str,
    detail: &str,
) -> EngineResult<String> {
    let constraint = handle
        .create_constraint(
            ConstraintKind::Edge,
            edge_config(source, target, calendar, detail),
            None,
            None,
        )
        .await?;
    Ok(constraint.constraint_id.to_string())
}
