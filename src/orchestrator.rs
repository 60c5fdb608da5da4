//! Job orchestrator (§4.8): an explicit enum-driven async state machine,
//! generalizing the teacher's `Executor<R>` loop (`Initial → Start →
//! TryLock → Run → Done`) to `Idle → Locking → Transitioning → Pipelining →
//! Finalizing → Released`. `JobRunner` owns this loop once; `ImportPipeline`
//! and `ExportPipeline` plug their domain-specific steps into it through the
//! `Pipeline` trait, so the lock/transition/finalize/release discipline is
//! written exactly once.

use crate::codec::{decode_stream, IteratorBatchExt};
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::export;
use crate::lock::{Lock, LockBackend, LockManager};
use crate::model::{Counters, ImportJob, JobErrorEntry, JobStatus, Metrics, ResourceType};
use crate::storage::ObjectStorage;
use crate::store::{ExportJobStore, ImportJobStore, JobUpdate};
use crate::upsert::{NumberedRecord, UpsertEngine};
use crate::validate::{self, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Result of running a pipeline to completion: what `finalize_success`
/// persists onto the job record.
pub struct PipelineOutcome {
    pub counters: Counters,
    pub errors: Vec<JobErrorEntry>,
    pub metrics: Metrics,
    pub export_artifact: Option<ExportArtifact>,
}

pub struct ExportArtifact {
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub file_size: u64,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, counters: Counters);
}

/// The per-domain plug-in point for `JobRunner`.
#[async_trait]
pub trait Pipeline: Send + Sync {
    type Job: Send + Sync;

    fn lock_key(&self, id: Uuid) -> String;
    async fn begin(&self, id: Uuid, node_id: &str) -> Result<Self::Job, StoreError>;
    fn progress_sink(&self, id: Uuid) -> Box<dyn ProgressSink>;
    async fn execute(&self, job: &Self::Job, progress: &dyn ProgressSink) -> Result<PipelineOutcome, EngineError>;
    async fn finalize_success(&self, id: Uuid, outcome: PipelineOutcome) -> Result<(), StoreError>;
    async fn finalize_failure(&self, id: Uuid, message: String) -> Result<(), StoreError>;
}

enum RunnerState<J> {
    Idle(Uuid),
    Locking(Uuid),
    Transitioning(Uuid, Lock),
    Pipelining(Uuid, Lock, J),
    Finalizing(Uuid, Lock, Result<PipelineOutcome, EngineError>),
    Released(Option<EngineError>),
    Done(Option<EngineError>),
}

pub struct JobRunner<P: Pipeline, B: LockBackend> {
    pipeline: P,
    lock_manager: Arc<LockManager<B>>,
    node_id: String,
    config: EngineConfig,
}

impl<P: Pipeline, B: LockBackend> JobRunner<P, B> {
    pub fn new(
        pipeline: P,
        lock_manager: Arc<LockManager<B>>,
        node_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pipeline,
            lock_manager,
            node_id: node_id.into(),
            config,
        }
    }

    pub async fn run(&self, id: Uuid) -> Result<(), EngineError> {
        let mut state = RunnerState::Idle(id);
        loop {
            state = match state {
                RunnerState::Idle(id) => RunnerState::Locking(id),
                RunnerState::Locking(id) => self.on_locking(id).await,
                RunnerState::Transitioning(id, lock) => self.on_transitioning(id, lock).await,
                RunnerState::Pipelining(id, lock, job) => self.on_pipelining(id, lock, job).await,
                RunnerState::Finalizing(id, lock, outcome) => self.on_finalizing(id, lock, outcome).await,
                RunnerState::Released(failure) => RunnerState::Done(failure),
                RunnerState::Done(None) => return Ok(()),
                RunnerState::Done(Some(e)) => return Err(e),
            }
        }
    }

    async fn on_locking(&self, id: Uuid) -> RunnerState<P::Job> {
        let key = self.pipeline.lock_key(id);
        match self
            .lock_manager
            .acquire(
                key.clone(),
                self.config.lock_ttl,
                self.config.lock_acquire_retries,
                self.config.lock_retry_delay,
            )
            .await
        {
            Ok(Some(lock)) => RunnerState::Transitioning(id, lock),
            Ok(None) => {
                info!("job {id} skipped: lock {key} held by another node");
                RunnerState::Done(None)
            }
            Err(e) => {
                warn!("job {id} lock acquisition failed: {e}");
                RunnerState::Done(Some(e.into()))
            }
        }
    }

    async fn on_transitioning(&self, id: Uuid, lock: Lock) -> RunnerState<P::Job> {
        match self.pipeline.begin(id, &self.node_id).await {
            Ok(job) => RunnerState::Pipelining(id, lock, job),
            Err(e) => {
                warn!("job {id} could not transition to PROCESSING: {e}");
                let _ = self.lock_manager.release(lock).await;
                RunnerState::Done(Some(e.into()))
            }
        }
    }

    async fn on_pipelining(&self, id: Uuid, lock: Lock, job: P::Job) -> RunnerState<P::Job> {
        let progress = self.pipeline.progress_sink(id);
        let outcome = self.pipeline.execute(&job, progress.as_ref()).await;
        RunnerState::Finalizing(id, lock, outcome)
    }

    async fn on_finalizing(
        &self,
        id: Uuid,
        lock: Lock,
        outcome: Result<PipelineOutcome, EngineError>,
    ) -> RunnerState<P::Job> {
        let failure = match outcome {
            Ok(outcome) => {
                if let Err(e) = self.pipeline.finalize_success(id, outcome).await {
                    warn!("job {id} finalize failed: {e}");
                }
                None
            }
            Err(e) => {
                warn!("job {id} pipeline failed: {e}");
                if let Err(finalize_err) = self.pipeline.finalize_failure(id, e.to_string()).await {
                    warn!("job {id} finalize failed: {finalize_err}");
                }
                Some(e)
            }
        };
        let _ = self.lock_manager.release(lock).await;
        RunnerState::Released(failure)
    }
}

// ---------------------------------------------------------------------
// Import pipeline
// ---------------------------------------------------------------------

pub struct ImportPipeline {
    store: Arc<dyn ImportJobStore>,
    upsert: Arc<UpsertEngine>,
    storage: Arc<dyn ObjectStorage>,
    config: EngineConfig,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<dyn ImportJobStore>,
        upsert: Arc<UpsertEngine>,
        storage: Arc<dyn ObjectStorage>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            upsert,
            storage,
            config,
        }
    }
}

struct ImportProgressSink {
    store: Arc<dyn ImportJobStore>,
    id: Uuid,
}

#[async_trait]
impl ProgressSink for ImportProgressSink {
    async fn report(&self, counters: Counters) {
        let _ = self.store.update_progress(self.id, counters).await;
    }
}

#[async_trait]
impl Pipeline for ImportPipeline {
    type Job = ImportJob;

    fn lock_key(&self, id: Uuid) -> String {
        format!("import-job:{id}")
    }

    async fn begin(&self, id: Uuid, node_id: &str) -> Result<ImportJob, StoreError> {
        self.store
            .transition(id, JobStatus::Pending, JobStatus::Processing, JobUpdate::started_now(node_id))
            .await
    }

    fn progress_sink(&self, id: Uuid) -> Box<dyn ProgressSink> {
        Box::new(ImportProgressSink {
            store: self.store.clone(),
            id,
        })
    }

    async fn execute(&self, job: &ImportJob, progress: &dyn ProgressSink) -> Result<PipelineOutcome, EngineError> {
        let started = std::time::Instant::now();
        let storage_key = job
            .storage_key
            .as_deref()
            .ok_or_else(|| EngineError::Store(StoreError::Backend("import job missing storage_key".into())))?;
        let bytes = self.storage.get(storage_key).await?;

        let decoded = decode_stream(job.file_format, std::io::Cursor::new(bytes))?;

        let mut counters = Counters::default();
        let mut errors = Vec::new();
        let mut batch_index = 0u32;

        for batch in decoded.batched(self.config.batch_size) {
            let mut valid_records = Vec::new();
            for item in batch {
                match item.record {
                    Err(e) => {
                        counters.record_failure();
                        push_capped(
                            &mut errors,
                            JobErrorEntry::new(item.line_number, None::<String>, e.to_string()),
                            self.config.max_stored_errors,
                        );
                    }
                    Ok(row) => match validate::validate(job.resource_type, item.line_number, row) {
                        Verdict::Valid {
                            normalized_record,
                            line_number,
                        } => valid_records.push(NumberedRecord {
                            line_number,
                            record: normalized_record,
                        }),
                        Verdict::Invalid {
                            errors: field_errors,
                            line_number,
                            ..
                        } => {
                            counters.record_failure();
                            for field_error in field_errors {
                                push_capped(
                                    &mut errors,
                                    JobErrorEntry::new(line_number, field_error.field, field_error.message),
                                    self.config.max_stored_errors,
                                );
                            }
                        }
                    },
                }
            }

            if !valid_records.is_empty() {
                let attempted = valid_records.len() as u64;
                let outcome = match job.resource_type {
                    ResourceType::Users => self.upsert.upsert_users(valid_records).await,
                    ResourceType::Articles => self.upsert.upsert_articles(valid_records).await,
                    ResourceType::Comments => self.upsert.upsert_comments(valid_records).await,
                }?;
                counters.processed_rows += attempted;
                counters.successful_rows += outcome.successful;
                counters.failed_rows += outcome.failed;
                for error in outcome.errors {
                    push_capped(&mut errors, error, self.config.max_stored_errors);
                }
            }

            batch_index += 1;
            if batch_index % self.config.progress_flush_every_batches == 0 {
                progress.report(counters).await;
            }
        }

        progress.report(counters).await;
        let metrics = Metrics::for_import(counters.processed_rows, counters.failed_rows, started.elapsed().as_millis() as u64);

        Ok(PipelineOutcome {
            counters,
            errors,
            metrics,
            export_artifact: None,
        })
    }

    async fn finalize_success(&self, id: Uuid, outcome: PipelineOutcome) -> Result<(), StoreError> {
        self.store
            .finalize(
                id,
                JobStatus::Completed,
                JobUpdate::default()
                    .with_completed_now()
                    .with_counters(outcome.counters)
                    .with_metrics(outcome.metrics)
                    .with_errors(outcome.errors),
            )
            .await
            .map(|_| ())
    }

    async fn finalize_failure(&self, id: Uuid, message: String) -> Result<(), StoreError> {
        self.store
            .finalize(
                id,
                JobStatus::Failed,
                JobUpdate::default().with_completed_now().with_error_message(message),
            )
            .await
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------
// Export pipeline
// ---------------------------------------------------------------------

pub struct ExportPipeline {
    store: Arc<dyn ExportJobStore>,
    pool: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    config: EngineConfig,
}

impl ExportPipeline {
    pub fn new(store: Arc<dyn ExportJobStore>, pool: SqlitePool, storage: Arc<dyn ObjectStorage>, config: EngineConfig) -> Self {
        Self {
            store,
            pool,
            storage,
            config,
        }
    }
}

struct ExportProgressSink {
    store: Arc<dyn ExportJobStore>,
    id: Uuid,
}

#[async_trait]
impl ProgressSink for ExportProgressSink {
    async fn report(&self, counters: Counters) {
        let _ = self.store.update_progress(self.id, counters).await;
    }
}

#[async_trait]
impl Pipeline for ExportPipeline {
    type Job = crate::model::ExportJob;

    fn lock_key(&self, id: Uuid) -> String {
        format!("export-job:{id}")
    }

    async fn begin(&self, id: Uuid, node_id: &str) -> Result<crate::model::ExportJob, StoreError> {
        self.store
            .transition(id, JobStatus::Pending, JobStatus::Processing, JobUpdate::started_now(node_id))
            .await
    }

    fn progress_sink(&self, id: Uuid) -> Box<dyn ProgressSink> {
        Box::new(ExportProgressSink {
            store: self.store.clone(),
            id,
        })
    }

    async fn execute(
        &self,
        job: &crate::model::ExportJob,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineOutcome, EngineError> {
        let result = export::query_and_encode(
            &self.pool,
            job.resource_type,
            &job.filters,
            job.fields.as_deref(),
            job.format,
            self.config.batch_size,
        )
        .await?;

        self.store.set_total_rows(job.id, result.total_rows).await?;
        progress
            .report(Counters {
                total_rows: Some(result.total_rows),
                processed_rows: result.total_rows,
                successful_rows: result.total_rows,
                failed_rows: 0,
                skipped_rows: 0,
            })
            .await;

        let (key, file_size) = export::upload_export(&self.storage, job.id, job.format, &result, &self.config).await?;
        let expires_at = Utc::now() + chrono::Duration::from_std(self.config.download_url_ttl).unwrap_or_default();
        let download_url = self.storage.presign_download(&key, expires_at).await?;
        let metrics = export::metrics_for(&result, file_size);

        Ok(PipelineOutcome {
            counters: Counters {
                total_rows: Some(result.total_rows),
                processed_rows: result.total_rows,
                successful_rows: result.total_rows,
                failed_rows: 0,
                skipped_rows: 0,
            },
            errors: Vec::new(),
            metrics,
            export_artifact: Some(ExportArtifact {
                download_url,
                expires_at,
                file_size,
            }),
        })
    }

    async fn finalize_success(&self, id: Uuid, outcome: PipelineOutcome) -> Result<(), StoreError> {
        let artifact = outcome.export_artifact;
        self.store
            .finalize(
                id,
                JobStatus::Completed,
                JobUpdate::default()
                    .with_completed_now()
                    .with_counters(outcome.counters)
                    .with_metrics(outcome.metrics),
                artifact.as_ref().map(|a| a.download_url.clone()),
                artifact.as_ref().map(|a| a.expires_at),
                artifact.as_ref().map(|a| a.file_size),
            )
            .await
            .map(|_| ())
    }

    async fn finalize_failure(&self, id: Uuid, message: String) -> Result<(), StoreError> {
        self.store
            .finalize(
                id,
                JobStatus::Failed,
                JobUpdate::default().with_completed_now().with_error_message(message),
                None,
                None,
                None,
            )
            .await
            .map(|_| ())
    }
}

fn push_capped(errors: &mut Vec<JobErrorEntry>, entry: JobErrorEntry, cap: usize) {
    if errors.len() < cap {
        errors.push(entry);
    }
}

pub type ImportOrchestrator<B> = JobRunner<ImportPipeline, B>;
pub type ExportOrchestrator<B> = JobRunner<ExportPipeline, B>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::memory::InMemoryLockBackend;
    use crate::model::{FileFormat, ResourceType};
    use crate::storage::memory::InMemoryObjectStorage;
    use crate::store::sql::SqlJobStore;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn import_orchestrator_runs_job_to_completion() {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let job_store = Arc::new(SqlJobStore::new(pool.clone()));
        job_store.ensure_schema().await.unwrap();
        let upsert = Arc::new(UpsertEngine::new(pool.clone(), 100));
        upsert.ensure_schema().await.unwrap();
        let storage: Arc<dyn ObjectStorage> = Arc::new(InMemoryObjectStorage::new());

        let body = b"{\"email\":\"a@example.com\",\"name\":\"A\",\"role\":\"reader\",\"active\":true}\n".to_vec();
        storage.put_multipart("uploads/job.ndjson", body, 1024, 1).await.unwrap();

        let mut job = ImportJob::new(ResourceType::Users, FileFormat::Ndjson);
        job.storage_key = Some("uploads/job.ndjson".to_string());
        let id = job.id;
        ImportJobStore::create(job_store.as_ref(), job).await.unwrap();

        let pipeline = ImportPipeline::new(job_store.clone(), upsert, storage, EngineConfig::new());
        let lock_manager = Arc::new(LockManager::new("node-a", InMemoryLockBackend::new()));
        let runner = JobRunner::new(pipeline, lock_manager, "node-a", EngineConfig::new());
        runner.run(id).await.unwrap();

        let finished = ImportJobStore::find_by_id(job_store.as_ref(), id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.counters.successful_rows, 1);
    }

    struct FailingPipeline;

    #[async_trait]
    impl Pipeline for FailingPipeline {
        type Job = ();

        fn lock_key(&self, id: Uuid) -> String {
            format!("failing:{id}")
        }

        async fn begin(&self, _id: Uuid, _node_id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn progress_sink(&self, _id: Uuid) -> Box<dyn ProgressSink> {
            struct NoopSink;
            #[async_trait]
            impl ProgressSink for NoopSink {
                async fn report(&self, _counters: Counters) {}
            }
            Box::new(NoopSink)
        }

        async fn execute(&self, _job: &(), _progress: &dyn ProgressSink) -> Result<PipelineOutcome, EngineError> {
            Err(EngineError::Storage(crate::error::StorageError::NotFound("missing".into())))
        }

        async fn finalize_success(&self, _id: Uuid, _outcome: PipelineOutcome) -> Result<(), StoreError> {
            Ok(())
        }

        async fn finalize_failure(&self, _id: Uuid, _message: String) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_rethrows_a_pipeline_failure_so_the_queue_can_retry() {
        let lock_manager = Arc::new(LockManager::new("node-a", InMemoryLockBackend::new()));
        let runner = JobRunner::new(FailingPipeline, lock_manager, "node-a", EngineConfig::new());

        let err = runner.run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
