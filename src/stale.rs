//! Stale-job recovery (§4.3).
//!
//! A ticker loop shaped exactly like the teacher's executor `Sleeping` ↔
//! `CheckDue` states: `tokio::select!` between an interval tick and a cancel
//! signal, except the "due work" here is a lock-coordinated sweep rather than
//! a single scheduled job.

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::lock::{LockBackend, LockManager};
use crate::model::JobStatus;
use crate::store::{ExportJobStore, ImportJobStore, JobUpdate};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::oneshot;

const SWEEP_LOCK_KEY: &str = "stale-job-cleanup";

pub struct StaleJobRecovery<B: LockBackend> {
    lock_manager: Arc<LockManager<B>>,
    import_store: Arc<dyn ImportJobStore>,
    export_store: Arc<dyn ExportJobStore>,
    config: EngineConfig,
}

impl<B: LockBackend> StaleJobRecovery<B> {
    pub fn new(
        lock_manager: Arc<LockManager<B>>,
        import_store: Arc<dyn ImportJobStore>,
        export_store: Arc<dyn ExportJobStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            lock_manager,
            import_store,
            export_store,
            config,
        }
    }

    /// Runs the periodic sweep loop until `cancel` fires. Intended to be
    /// driven by a single `tokio::spawn` per process.
    pub async fn run(self, mut cancel: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.stale_sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("stale-job sweep failed: {e}");
                    }
                }
                _ = &mut cancel => {
                    info!("stale-job recovery loop cancelled");
                    return;
                }
            }
        }
    }

    /// Performs one sweep, coordinated so only one node in the fleet acts on
    /// a given tick. Returns `Ok(())` whether or not this node won the lock.
    pub async fn sweep_once(&self) -> Result<(), StoreError> {
        let outcome = self
            .lock_manager
            .with_lock(
                SWEEP_LOCK_KEY,
                self.config.lock_ttl,
                0,
                std::time::Duration::ZERO,
                |_lock| async {
                    self.reclaim_import_jobs().await?;
                    self.reclaim_export_jobs().await?;
                    Ok::<(), StoreError>(())
                },
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match outcome {
            Some(result) => result,
            None => {
                info!("stale-job sweep skipped: another node holds {SWEEP_LOCK_KEY}");
                Ok(())
            }
        }
    }

    async fn reclaim_import_jobs(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let stale = self
            .import_store
            .list_stale(self.config.stale_threshold, self.config.stale_lock_threshold, now)
            .await?;
        for job in stale {
            self.reclaim_one_import(job.id, job.ownership.locked_by.clone())
                .await?;
        }
        Ok(())
    }

    async fn reclaim_one_import(
        &self,
        id: uuid::Uuid,
        prior_owner: Option<String>,
    ) -> Result<(), StoreError> {
        if self.config.restart_stale_jobs {
            if self.import_store.requeue(id).await? {
                warn!("import job {id} reclaimed from stale owner {prior_owner:?}; reset to PENDING");
            }
        } else {
            let message = format!(
                "abandoned by stale owner {}",
                prior_owner.unwrap_or_else(|| "<unknown>".to_string())
            );
            let _ = self
                .import_store
                .finalize(
                    id,
                    JobStatus::Failed,
                    JobUpdate::default()
                        .with_completed_now()
                        .with_error_message(message),
                )
                .await?;
            warn!("import job {id} marked FAILED by stale-job recovery");
        }
        Ok(())
    }

    async fn reclaim_export_jobs(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let stale = self
            .export_store
            .list_stale(self.config.stale_threshold, self.config.stale_lock_threshold, now)
            .await?;
        for job in stale {
            self.reclaim_one_export(job.id, job.ownership.locked_by.clone())
                .await?;
        }
        Ok(())
    }

    async fn reclaim_one_export(
        &self,
        id: uuid::Uuid,
        prior_owner: Option<String>,
    ) -> Result<(), StoreError> {
        if self.config.restart_stale_jobs {
            if self.export_store.requeue(id).await? {
                warn!("export job {id} reclaimed from stale owner {prior_owner:?}; reset to PENDING");
            }
        } else {
            let message = format!(
                "abandoned by stale owner {}",
                prior_owner.unwrap_or_else(|| "<unknown>".to_string())
            );
            let _ = self
                .export_store
                .finalize(
                    id,
                    JobStatus::Failed,
                    JobUpdate::default()
                        .with_completed_now()
                        .with_error_message(message),
                    None,
                    None,
                    None,
                )
                .await?;
            warn!("export job {id} marked FAILED by stale-job recovery");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::memory::InMemoryLockBackend;
    use crate::model::{FileFormat, ImportJob, ResourceType};
    use crate::store::sql::SqlJobStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn setup_store() -> Arc<SqlJobStore> {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlJobStore::new(pool);
        store.ensure_schema().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn restart_mode_resets_stale_job_to_pending() {
        let store = setup_store().await;
        let mut job = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        job.status = JobStatus::Pending;
        let id = job.id;
        ImportJobStore::create(store.as_ref(), job).await.unwrap();
        ImportJobStore::transition(
            store.as_ref(),
            id,
            JobStatus::Pending,
            JobStatus::Processing,
            JobUpdate::started_now("dead-node"),
        )
        .await
        .unwrap();

        let config = EngineConfig::new()
            .with_stale_threshold(Duration::ZERO)
            .with_restart_stale_jobs(true);
        let lock_manager = Arc::new(LockManager::new("node-a", InMemoryLockBackend::new()));
        let recovery = StaleJobRecovery::new(
            lock_manager,
            store.clone() as Arc<dyn ImportJobStore>,
            store.clone() as Arc<dyn ExportJobStore>,
            config,
        );
        recovery.sweep_once().await.unwrap();

        let reloaded = ImportJobStore::find_by_id(store.as_ref(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);
        assert!(reloaded.ownership.locked_by.is_none());
    }

    #[tokio::test]
    async fn fail_mode_marks_stale_job_failed_with_prior_owner() {
        let store = setup_store().await;
        let mut job = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        job.status = JobStatus::Pending;
        let id = job.id;
        ImportJobStore::create(store.as_ref(), job).await.unwrap();
        ImportJobStore::transition(
            store.as_ref(),
            id,
            JobStatus::Pending,
            JobStatus::Processing,
            JobUpdate::started_now("dead-node"),
        )
        .await
        .unwrap();

        let config = EngineConfig::new()
            .with_stale_threshold(Duration::ZERO)
            .with_restart_stale_jobs(false);
        let lock_manager = Arc::new(LockManager::new("node-a", InMemoryLockBackend::new()));
        let recovery = StaleJobRecovery::new(
            lock_manager,
            store.clone() as Arc<dyn ImportJobStore>,
            store.clone() as Arc<dyn ExportJobStore>,
            config,
        );
        recovery.sweep_once().await.unwrap();

        let reloaded = ImportJobStore::find_by_id(store.as_ref(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert!(reloaded
            .error_message
            .unwrap()
            .contains("dead-node"));
    }
}
