//! Asynchronous bulk import/export job engine.
//!
//! `init` wires the lock manager, job stores, upsert engine, object storage,
//! queue, worker pool, and stale-job recovery loop into one process-wide
//! [`EngineHandle`]; `shutdown` tears it down in reverse. No module holds
//! hidden global state (§9 design note) — everything lives on the handle and
//! is threaded through by parameter, the way the teacher's `JobManager` is
//! constructed once and owned by its caller rather than reached for via a
//! static.

pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod stale;
pub mod storage;
pub mod store;
pub mod upsert;
pub mod validate;
pub mod worker;

pub use config::EngineConfig;
pub use error::EngineError;
pub use model::{ExportJob, ImportJob, JobStatus, ResourceType};

use lock::sql::SqlLockBackend;
use lock::LockManager;
use orchestrator::{ExportOrchestrator, ExportPipeline, ImportOrchestrator, ImportPipeline};
use queue::{InMemoryJobQueue, JobQueue};
use sqlx::SqlitePool;
use stale::StaleJobRecovery;
use storage::ObjectStorage;
use store::sql::SqlJobStore;
use store::{ExportJobStore, ImportJobStore};
use upsert::UpsertEngine;

use std::sync::Arc;
use tokio::sync::oneshot;

/// Process-wide state produced by [`init`]. Holds everything a host binary
/// needs to enqueue jobs and to shut the engine down cleanly.
pub struct EngineHandle {
    pub import_store: Arc<dyn ImportJobStore>,
    pub export_store: Arc<dyn ExportJobStore>,
    pub upsert_engine: Arc<UpsertEngine>,
    pub storage: Arc<dyn ObjectStorage>,
    pub queue: Arc<dyn JobQueue>,
    pub config: EngineConfig,
    workers: worker::WorkerPool,
    stale_recovery_cancel: oneshot::Sender<()>,
    stale_recovery_task: tokio::task::JoinHandle<()>,
}

/// Builds every collaborator against `pool`/`storage`/`queue` and starts the
/// worker pool and stale-job recovery loop. `node_id` identifies this process
/// for lock tokens and job ownership.
pub async fn init(
    pool: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    queue: Arc<dyn JobQueue>,
    node_id: impl Into<String>,
    config: EngineConfig,
) -> Result<EngineHandle, EngineError> {
    let node_id = node_id.into();

    let job_store = Arc::new(SqlJobStore::new(pool.clone()));
    job_store.ensure_schema().await.map_err(EngineError::Store)?;
    let import_store: Arc<dyn ImportJobStore> = job_store.clone();
    let export_store: Arc<dyn ExportJobStore> = job_store;

    let upsert_engine = Arc::new(UpsertEngine::new(pool.clone(), config.max_stored_errors));
    upsert_engine.ensure_schema().await.map_err(EngineError::Upsert)?;

    let lock_backend = SqlLockBackend::new(pool.clone());
    lock_backend.ensure_schema().await.map_err(EngineError::Lock)?;
    let lock_manager = Arc::new(LockManager::new(node_id.clone(), lock_backend));

    let import_pipeline = ImportPipeline::new(
        import_store.clone(),
        upsert_engine.clone(),
        storage.clone(),
        config.clone(),
    );
    let export_pipeline = ExportPipeline::new(export_store.clone(), pool.clone(), storage.clone(), config.clone());

    let import_orchestrator: Arc<ImportOrchestrator<SqlLockBackend>> = Arc::new(orchestrator::JobRunner::new(
        import_pipeline,
        lock_manager.clone(),
        node_id.clone(),
        config.clone(),
    ));
    let export_orchestrator: Arc<ExportOrchestrator<SqlLockBackend>> = Arc::new(orchestrator::JobRunner::new(
        export_pipeline,
        lock_manager.clone(),
        node_id.clone(),
        config.clone(),
    ));

    let workers = worker::WorkerPool::spawn(queue.clone(), import_orchestrator, export_orchestrator, &config);

    let stale_recovery = StaleJobRecovery::new(lock_manager, import_store.clone(), export_store.clone(), config.clone());
    let (stale_recovery_cancel, cancel_rx) = oneshot::channel();
    let stale_recovery_task = tokio::spawn(stale_recovery.run(cancel_rx));

    Ok(EngineHandle {
        import_store,
        export_store,
        upsert_engine,
        storage,
        queue,
        config,
        workers,
        stale_recovery_cancel,
        stale_recovery_task,
    })
}

/// Convenience constructor using the default in-memory queue — suitable for
/// a single-process deployment or tests; production hosts wire their own
/// `JobQueue` and pass it to [`init`] instead.
pub async fn init_with_default_queue(
    pool: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    node_id: impl Into<String>,
    config: EngineConfig,
) -> Result<EngineHandle, EngineError> {
    init(pool, storage, Arc::new(InMemoryJobQueue::new()), node_id, config).await
}

/// Stops the stale-recovery loop and drains the worker pool. Jobs already
/// dispatched to a worker finish their current pipeline run before the pool
/// exits; nothing new is picked up after this is called.
pub async fn shutdown(handle: EngineHandle) {
    let _ = handle.stale_recovery_cancel.send(());
    handle.workers.shutdown().await;
    let _ = handle.stale_recovery_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileFormat, ResourceType};
    use sqlx::sqlite::SqlitePoolOptions;
    use storage::memory::InMemoryObjectStorage;

    #[tokio::test]
    async fn init_wires_an_engine_that_runs_an_import_job_end_to_end() {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let storage: Arc<dyn ObjectStorage> = Arc::new(InMemoryObjectStorage::new());
        storage
            .put_multipart(
                "uploads/seed.ndjson",
                b"{\"email\":\"a@example.com\",\"name\":\"A\",\"role\":\"reader\",\"active\":true}\n".to_vec(),
                1024,
                1,
            )
            .await
            .unwrap();

        let handle = init_with_default_queue(pool, storage, "node-test", EngineConfig::new().with_worker_slots(1))
            .await
            .unwrap();

        let mut job = ImportJob::new(ResourceType::Users, FileFormat::Ndjson);
        job.storage_key = Some("uploads/seed.ndjson".to_string());
        let id = job.id;
        handle.import_store.create(job).await.unwrap();
        handle.queue.push(queue::JobData::Import(id)).await;

        let mut found = None;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let job = handle.import_store.find_by_id(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                found = Some(job);
                break;
            }
        }
        let job = found.expect("import job did not finish in time");
        assert_eq!(job.status, JobStatus::Completed);

        shutdown(handle).await;
    }
}
