//! Engine runtime wiring.
//!
//! Two-phase construction: the registry is built first, the writer pool
//! second with the registry as its write host, then the pool is installed
//! as the registry's job sink. After that, `registry().user(id)` is the
//! whole public surface.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use calfed_core::config::EngineConfig;
use calfed_core::error::EngineResult;

use crate::actor::registry::UserRegistry;
use crate::mirror::writer::WriterPool;
use crate::provider::{AccessTokenProvider, ProviderWriteAdapter};

/// A fully wired engine: user actors plus the mirror writer pool.
pub struct EngineRuntime {
    registry: Arc<UserRegistry>,
    writer_handles: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    pub fn start(
        data_dir: PathBuf,
        config: EngineConfig,
        provider: Arc<dyn ProviderWriteAdapter>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> EngineResult<Self> {
        let registry = Arc::new(UserRegistry::new(
            data_dir,
            config.clone(),
            Arc::clone(&provider),
        ));
        let (pool, writer_handles) = WriterPool::start(
            &config,
            Arc::clone(&registry) as Arc<dyn crate::mirror::writer::MirrorWriteHost>,
            provider,
            tokens,
        );
        registry.set_job_sink(Arc::new(pool));
        tracing::info!(shards = config.writer_shards, "engine runtime started");
        Ok(Self {
            registry,
            writer_handles,
        })
    }

    pub fn registry(&self) -> Arc<UserRegistry> {
        Arc::clone(&self.registry)
    }

    /// Graceful stop: drain user actors, then the writers.
    pub async fn shutdown(self) {
        self.registry.shutdown_all().await;
        for handle in self.writer_handles {
            handle.abort();
        }
        tracing::info!("engine runtime stopped");
    }
}
