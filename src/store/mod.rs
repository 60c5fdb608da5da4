//! Job store (§4.2): atomic status transitions and finalize on top of a
//! transactional relational store.

pub mod sql;

use crate::error::StoreError;
use crate::model::{Counters, ExportJob, ImportJob, JobErrorEntry, JobStatus, Metrics, Ownership};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// A partial update applied as part of a `transition`/`finalize` call.
/// Every field is optional; only `Some` fields are written.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub ownership: Option<Ownership>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub counters: Option<Counters>,
    pub append_errors: Vec<JobErrorEntry>,
    pub metrics: Option<Metrics>,
    pub error_message: Option<Option<String>>,
}

impl JobUpdate {
    pub fn started_now(node_id: impl Into<String>) -> Self {
        Self {
            ownership: Some(Ownership {
                locked_by: Some(node_id.into()),
                locked_at: Some(Utc::now()),
            }),
            started_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    pub fn release_ownership() -> Self {
        Self {
            ownership: Some(Ownership::default()),
            ..Default::default()
        }
    }

    pub fn with_completed_now(mut self) -> Self {
        self.completed_at = Some(Some(Utc::now()));
        self
    }

    pub fn with_counters(mut self, counters: Counters) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn with_errors(mut self, errors: Vec<JobErrorEntry>) -> Self {
        self.append_errors = errors;
        self
    }
}

#[async_trait]
pub trait ImportJobStore: Send + Sync {
    async fn create(&self, job: ImportJob) -> Result<ImportJob, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<ImportJob>, StoreError>;

    /// §4.2 atomic status transition: SERIALIZABLE, FOR-UPDATE-equivalent row
    /// lock, guarded compare on `from_status`.
    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        updates: JobUpdate,
    ) -> Result<ImportJob, StoreError>;

    /// §4.2 finalize: no-ops (returns `Ok(None)`) if current status isn't
    /// PROCESSING, modeling the "lost lock mid-run" silent-noop contract (§5).
    async fn finalize(
        &self,
        id: Uuid,
        terminal: JobStatus,
        updates: JobUpdate,
    ) -> Result<Option<ImportJob>, StoreError>;

    /// Non-transactional progress snapshot; may lose races under concurrent
    /// writers but must never roll counters backward (§4.8).
    async fn update_progress(&self, id: Uuid, counters: Counters) -> Result<(), StoreError>;

    /// §4.3: PROCESSING past `stale_threshold` since it started, OR any
    /// locked job (PENDING or PROCESSING) whose lock hasn't been touched in
    /// `stale_lock_threshold`.
    async fn list_stale(
        &self,
        stale_threshold: Duration,
        stale_lock_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImportJob>, StoreError>;

    /// §4.3 recovery "restart" branch: resets a stale PROCESSING job back to
    /// PENDING and clears ownership, in one guarded statement (this is a
    /// recovery action outside the normal I3 lattice, not a client transition).
    /// Returns `false` if the job had already moved on by the time this ran.
    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ExportJobStore: Send + Sync {
    async fn create(&self, job: ExportJob) -> Result<ExportJob, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExportJob>, StoreError>;

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        updates: JobUpdate,
    ) -> Result<ExportJob, StoreError>;

    async fn finalize(
        &self,
        id: Uuid,
        terminal: JobStatus,
        updates: JobUpdate,
        download_url: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        file_size: Option<u64>,
    ) -> Result<Option<ExportJob>, StoreError>;

    async fn update_progress(&self, id: Uuid, counters: Counters) -> Result<(), StoreError>;

    async fn set_total_rows(&self, id: Uuid, total_rows: u64) -> Result<(), StoreError>;

    /// §4.7 download-URL refresh: persists a freshly-presigned URL/expiry.
    async fn refresh_download_url(
        &self,
        id: Uuid,
        download_url: String,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// See [`ImportJobStore::list_stale`].
    async fn list_stale(
        &self,
        stale_threshold: Duration,
        stale_lock_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportJob>, StoreError>;

    /// See [`ImportJobStore::requeue`].
    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError>;
}
