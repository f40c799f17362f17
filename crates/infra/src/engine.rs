//! Wiring of store, executor, runner and service from an [`EngineConfig`].

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::EngineConfig;
use crate::jobs::{
    InMemoryJobStore, JobExecutor, JobService, JobStore, JobStoreError, LocalRunner,
    PostgresJobStore, ProcessorRegistry, WorkerPool,
};

/// A ready-to-use job engine backed by the in-process runner.
#[derive(Debug, Clone)]
pub struct Engine {
    service: JobService,
    runner: Arc<LocalRunner>,
}

impl Engine {
    pub fn new(config: &EngineConfig, store: Arc<dyn JobStore>, registry: ProcessorRegistry) -> Self {
        let registry = Arc::new(registry);
        let pool = WorkerPool::new(config.worker_count).with_max_attempts(config.max_attempts);
        let executor = JobExecutor::new(store.clone(), registry.clone()).with_pool(pool);
        let runner = Arc::new(LocalRunner::new(Arc::new(executor), config.dispatch));

        info!(
            workers = config.worker_count,
            max_attempts = config.max_attempts,
            dispatch = ?config.dispatch,
            "job engine ready"
        );

        Self {
            service: JobService::new(store, runner.clone(), registry),
            runner,
        }
    }

    pub fn in_memory(config: &EngineConfig, registry: ProcessorRegistry) -> Self {
        Self::new(config, InMemoryJobStore::arc(), registry)
    }

    /// Connect to `config.database_url`, create the tables and build the engine.
    ///
    /// Must be awaited inside a tokio runtime; the store keeps a handle to it.
    pub async fn postgres(
        config: &EngineConfig,
        registry: ProcessorRegistry,
    ) -> Result<Self, JobStoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| JobStoreError::Storage("DATABASE_URL is not set".to_string()))?;
        let runtime = Handle::try_current()
            .map_err(|e| JobStoreError::Storage(format!("no tokio runtime: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.worker_count as u32 + 2)
            .connect(url)
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to connect: {e}")))?;

        let store = PostgresJobStore::new(pool, runtime);
        store.migrate().await?;
        Ok(Self::new(config, Arc::new(store), registry))
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    pub fn runner(&self) -> &Arc<LocalRunner> {
        &self.runner
    }
}
