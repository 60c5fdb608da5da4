//! SQLite-backed job store (§4.2).
//!
//! `transition`/`finalize` each run inside a `BEGIN IMMEDIATE` transaction:
//! SQLite takes the write lock up front, giving the same "nobody else can
//! start a conflicting write" guarantee a `SELECT ... FOR UPDATE` gives on a
//! row-locking engine, without pretending SQLite has real row locks.

use super::{ExportJobStore, ImportJobStore, JobUpdate};
use crate::error::StoreError;
use crate::model::{
    Counters, ExportFilters, ExportJob, FileFormat, ImportJob, JobErrorEntry, JobStatus,
    Metrics, Ownership, ResourceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Backend(e.to_string()))
    })
    .transpose()
}

fn row_to_import_job(row: &SqliteRow) -> Result<ImportJob, StoreError> {
    let errors_json: String = row.try_get("errors").map_err(backend_err)?;
    let metrics_json: Option<String> = row.try_get("metrics").map_err(backend_err)?;
    Ok(ImportJob {
        id: Uuid::parse_str(row.try_get::<String, _>("id").map_err(backend_err)?.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        resource_type: ResourceType::from_str(
            &row.try_get::<String, _>("resource_type").map_err(backend_err)?,
        )
        .map_err(StoreError::Backend)?,
        status: JobStatus::from_str(&row.try_get::<String, _>("status").map_err(backend_err)?)
            .map_err(StoreError::Backend)?,
        version: row.try_get("version").map_err(backend_err)?,
        ownership: Ownership {
            locked_by: row.try_get("locked_by").map_err(backend_err)?,
            locked_at: opt_dt(row.try_get("locked_at").map_err(backend_err)?)?,
        },
        started_at: opt_dt(row.try_get("started_at").map_err(backend_err)?)?,
        completed_at: opt_dt(row.try_get("completed_at").map_err(backend_err)?)?,
        counters: Counters {
            total_rows: row.try_get::<Option<i64>, _>("total_rows").map_err(backend_err)?.map(|v| v as u64),
            processed_rows: row.try_get::<i64, _>("processed_rows").map_err(backend_err)? as u64,
            successful_rows: row.try_get::<i64, _>("successful_rows").map_err(backend_err)? as u64,
            failed_rows: row.try_get::<i64, _>("failed_rows").map_err(backend_err)? as u64,
            skipped_rows: row.try_get::<i64, _>("skipped_rows").map_err(backend_err)? as u64,
        },
        errors: serde_json::from_str::<Vec<JobErrorEntry>>(&errors_json)
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        metrics: metrics_json
            .map(|s| serde_json::from_str::<Metrics>(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        error_message: row.try_get("error_message").map_err(backend_err)?,
        created_at: row
            .try_get::<String, _>("created_at")
            .map_err(backend_err)
            .and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })?,
        updated_at: row
            .try_get::<String, _>("updated_at")
            .map_err(backend_err)
            .and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })?,
        idempotency_key: row.try_get("idempotency_key").map_err(backend_err)?,
        file_url: row.try_get("file_url").map_err(backend_err)?,
        storage_key: row.try_get("storage_key").map_err(backend_err)?,
        file_name: row.try_get("file_name").map_err(backend_err)?,
        file_size: row
            .try_get::<Option<i64>, _>("file_size")
            .map_err(backend_err)?
            .map(|v| v as u64),
        file_format: FileFormat::from_extension(&format!(
            "x.{}",
            row.try_get::<String, _>("file_format").map_err(backend_err)?
        ))
        .ok_or_else(|| StoreError::Backend("bad file_format".into()))?,
    })
}

fn row_to_export_job(row: &SqliteRow) -> Result<ExportJob, StoreError> {
    let errors_json: String = row.try_get("errors").map_err(backend_err)?;
    let metrics_json: Option<String> = row.try_get("metrics").map_err(backend_err)?;
    let filters_json: String = row.try_get("filters").map_err(backend_err)?;
    let fields_json: Option<String> = row.try_get("fields").map_err(backend_err)?;
    Ok(ExportJob {
        id: Uuid::parse_str(row.try_get::<String, _>("id").map_err(backend_err)?.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        resource_type: ResourceType::from_str(
            &row.try_get::<String, _>("resource_type").map_err(backend_err)?,
        )
        .map_err(StoreError::Backend)?,
        status: JobStatus::from_str(&row.try_get::<String, _>("status").map_err(backend_err)?)
            .map_err(StoreError::Backend)?,
        version: row.try_get("version").map_err(backend_err)?,
        ownership: Ownership {
            locked_by: row.try_get("locked_by").map_err(backend_err)?,
            locked_at: opt_dt(row.try_get("locked_at").map_err(backend_err)?)?,
        },
        started_at: opt_dt(row.try_get("started_at").map_err(backend_err)?)?,
        completed_at: opt_dt(row.try_get("completed_at").map_err(backend_err)?)?,
        counters: Counters {
            total_rows: row.try_get::<Option<i64>, _>("total_rows").map_err(backend_err)?.map(|v| v as u64),
            processed_rows: row.try_get::<i64, _>("processed_rows").map_err(backend_err)? as u64,
            successful_rows: row.try_get::<i64, _>("successful_rows").map_err(backend_err)? as u64,
            failed_rows: row.try_get::<i64, _>("failed_rows").map_err(backend_err)? as u64,
            skipped_rows: row.try_get::<i64, _>("skipped_rows").map_err(backend_err)? as u64,
        },
        errors: serde_json::from_str::<Vec<JobErrorEntry>>(&errors_json)
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        metrics: metrics_json
            .map(|s| serde_json::from_str::<Metrics>(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        error_message: row.try_get("error_message").map_err(backend_err)?,
        created_at: row
            .try_get::<String, _>("created_at")
            .map_err(backend_err)
            .and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })?,
        updated_at: row
            .try_get::<String, _>("updated_at")
            .map_err(backend_err)
            .and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })?,
        format: FileFormat::from_extension(&format!(
            "x.{}",
            row.try_get::<String, _>("format").map_err(backend_err)?
        ))
        .ok_or_else(|| StoreError::Backend("bad format".into()))?,
        filters: serde_json::from_str::<ExportFilters>(&filters_json)
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        fields: fields_json
            .map(|s| serde_json::from_str::<Vec<String>>(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        download_url: row.try_get("download_url").map_err(backend_err)?,
        expires_at: opt_dt(row.try_get("expires_at").map_err(backend_err)?)?,
        file_size: row
            .try_get::<Option<i64>, _>("file_size")
            .map_err(backend_err)?
            .map(|v| v as u64),
    })
}

pub struct SqlJobStore {
    pool: SqlitePool,
}

impl SqlJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_jobs (
                id TEXT PRIMARY KEY,
                resource_type TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                locked_by TEXT,
                locked_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                total_rows INTEGER,
                processed_rows INTEGER NOT NULL DEFAULT 0,
                successful_rows INTEGER NOT NULL DEFAULT 0,
                failed_rows INTEGER NOT NULL DEFAULT 0,
                skipped_rows INTEGER NOT NULL DEFAULT 0,
                errors TEXT NOT NULL DEFAULT '[]',
                metrics TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                idempotency_key TEXT UNIQUE,
                file_url TEXT,
                storage_key TEXT,
                file_name TEXT,
                file_size INTEGER,
                file_format TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS export_jobs (
                id TEXT PRIMARY KEY,
                resource_type TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                locked_by TEXT,
                locked_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                total_rows INTEGER,
                processed_rows INTEGER NOT NULL DEFAULT 0,
                successful_rows INTEGER NOT NULL DEFAULT 0,
                failed_rows INTEGER NOT NULL DEFAULT 0,
                skipped_rows INTEGER NOT NULL DEFAULT 0,
                errors TEXT NOT NULL DEFAULT '[]',
                metrics TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                format TEXT NOT NULL,
                filters TEXT NOT NULL DEFAULT '{}',
                fields TEXT,
                download_url TEXT,
                expires_at TEXT,
                file_size INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(())
    }
}

#[async_trait]
impl ImportJobStore for SqlJobStore {
    async fn create(&self, job: ImportJob) -> Result<ImportJob, StoreError> {
        let errors_json = serde_json::to_string(&job.errors).unwrap();
        let result = sqlx::query(
            r#"
            INSERT INTO import_jobs (
                id, resource_type, status, version, locked_by, locked_at,
                started_at, completed_at, total_rows, processed_rows,
                successful_rows, failed_rows, skipped_rows, errors, metrics,
                error_message, created_at, updated_at, idempotency_key,
                file_url, storage_key, file_name, file_size, file_format
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.resource_type.as_str())
        .bind(job.status.as_str())
        .bind(job.version)
        .bind(&job.ownership.locked_by)
        .bind(job.ownership.locked_at.map(|d| d.to_rfc3339()))
        .bind(job.started_at.map(|d| d.to_rfc3339()))
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .bind(job.counters.total_rows.map(|v| v as i64))
        .bind(job.counters.processed_rows as i64)
        .bind(job.counters.successful_rows as i64)
        .bind(job.counters.failed_rows as i64)
        .bind(job.counters.skipped_rows as i64)
        .bind(errors_json)
        .bind(job.metrics.as_ref().map(|m| serde_json::to_string(m).unwrap()))
        .bind(&job.error_message)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(&job.idempotency_key)
        .bind(&job.file_url)
        .bind(&job.storage_key)
        .bind(&job.file_name)
        .bind(job.file_size.map(|v| v as i64))
        .bind(job.file_format.extension())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(e)) if e.message().contains("idempotency_key") => Err(
                StoreError::DuplicateIdempotencyKey(job.idempotency_key.unwrap_or_default()),
            ),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM import_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_import_job).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<ImportJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM import_jobs WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_import_job).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        updates: JobUpdate,
    ) -> Result<ImportJob, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let row = sqlx::query("SELECT * FROM import_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound(id))?;
        let current = row_to_import_job(&row)?;

        if current.status != from {
            tx.rollback().await.map_err(backend_err)?;
            return Err(StoreError::UnexpectedStatus {
                expected: from.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }

        let mut errors = current.errors.clone();
        errors.extend(updates.append_errors.clone());
        let errors_json = serde_json::to_string(&errors).unwrap();

        let ownership = updates.ownership.clone().unwrap_or(current.ownership.clone());
        let started_at = updates.started_at.unwrap_or(current.started_at);
        let completed_at = updates.completed_at.unwrap_or(current.completed_at);
        let counters = updates.counters.unwrap_or(current.counters);
        let metrics = updates.metrics.clone().or(current.metrics.clone());
        let error_message = updates.error_message.clone().unwrap_or(current.error_message.clone());
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE import_jobs SET
                status = ?, version = version + 1, locked_by = ?, locked_at = ?,
                started_at = ?, completed_at = ?, total_rows = ?, processed_rows = ?,
                successful_rows = ?, failed_rows = ?, skipped_rows = ?, errors = ?,
                metrics = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&ownership.locked_by)
        .bind(ownership.locked_at.map(|d| d.to_rfc3339()))
        .bind(started_at.map(|d| d.to_rfc3339()))
        .bind(completed_at.map(|d| d.to_rfc3339()))
        .bind(counters.total_rows.map(|v| v as i64))
        .bind(counters.processed_rows as i64)
        .bind(counters.successful_rows as i64)
        .bind(counters.failed_rows as i64)
        .bind(counters.skipped_rows as i64)
        .bind(errors_json)
        .bind(metrics.as_ref().map(|m| serde_json::to_string(m).unwrap()))
        .bind(&error_message)
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(current.version)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;

        Ok(ImportJob {
            status: to,
            version: current.version + 1,
            ownership,
            started_at,
            completed_at,
            counters,
            errors,
            metrics,
            error_message,
            updated_at: now,
            ..current
        })
    }

    async fn finalize(
        &self,
        id: Uuid,
        terminal: JobStatus,
        updates: JobUpdate,
    ) -> Result<Option<ImportJob>, StoreError> {
        match ImportJobStore::transition(self, id, JobStatus::Processing, terminal, updates).await {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::UnexpectedStatus { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_progress(&self, id: Uuid, counters: Counters) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE import_jobs SET
                total_rows = ?, processed_rows = ?, successful_rows = ?,
                failed_rows = ?, skipped_rows = ?, updated_at = ?
            WHERE id = ? AND processed_rows <= ?
            "#,
        )
        .bind(counters.total_rows.map(|v| v as i64))
        .bind(counters.processed_rows as i64)
        .bind(counters.successful_rows as i64)
        .bind(counters.failed_rows as i64)
        .bind(counters.skipped_rows as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(counters.processed_rows as i64)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn list_stale(
        &self,
        stale_threshold: Duration,
        stale_lock_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImportJob>, StoreError> {
        let started_cutoff = now - chrono::Duration::from_std(stale_threshold).unwrap_or_default();
        let lock_cutoff = now - chrono::Duration::from_std(stale_lock_threshold).unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT * FROM import_jobs
            WHERE (status = 'PROCESSING' AND started_at IS NOT NULL AND started_at <= ?)
               OR (locked_by IS NOT NULL AND locked_at IS NOT NULL AND locked_at <= ?
                   AND status IN ('PENDING', 'PROCESSING'))
            "#,
        )
        .bind(started_cutoff.to_rfc3339())
        .bind(lock_cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(row_to_import_job).collect()
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs SET
                status = 'PENDING', version = version + 1, locked_by = NULL,
                locked_at = NULL, started_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExportJobStore for SqlJobStore {
    async fn create(&self, job: ExportJob) -> Result<ExportJob, StoreError> {
        let errors_json = serde_json::to_string(&job.errors).unwrap();
        let filters_json = serde_json::to_string(&job.filters).unwrap();
        sqlx::query(
            r#"
            INSERT INTO export_jobs (
                id, resource_type, status, version, locked_by, locked_at,
                started_at, completed_at, total_rows, processed_rows,
                successful_rows, failed_rows, skipped_rows, errors, metrics,
                error_message, created_at, updated_at, format, filters, fields,
                download_url, expires_at, file_size
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.resource_type.as_str())
        .bind(job.status.as_str())
        .bind(job.version)
        .bind(&job.ownership.locked_by)
        .bind(job.ownership.locked_at.map(|d| d.to_rfc3339()))
        .bind(job.started_at.map(|d| d.to_rfc3339()))
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .bind(job.counters.total_rows.map(|v| v as i64))
        .bind(job.counters.processed_rows as i64)
        .bind(job.counters.successful_rows as i64)
        .bind(job.counters.failed_rows as i64)
        .bind(job.counters.skipped_rows as i64)
        .bind(errors_json)
        .bind(job.metrics.as_ref().map(|m| serde_json::to_string(m).unwrap()))
        .bind(&job.error_message)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.format.extension())
        .bind(filters_json)
        .bind(job.fields.as_ref().map(|f| serde_json::to_string(f).unwrap()))
        .bind(&job.download_url)
        .bind(job.expires_at.map(|d| d.to_rfc3339()))
        .bind(job.file_size.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExportJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_export_job).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        updates: JobUpdate,
    ) -> Result<ExportJob, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let row = sqlx::query("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound(id))?;
        let current = row_to_export_job(&row)?;

        if current.status != from {
            tx.rollback().await.map_err(backend_err)?;
            return Err(StoreError::UnexpectedStatus {
                expected: from.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }

        let mut errors = current.errors.clone();
        errors.extend(updates.append_errors.clone());
        let errors_json = serde_json::to_string(&errors).unwrap();

        let ownership = updates.ownership.clone().unwrap_or(current.ownership.clone());
        let started_at = updates.started_at.unwrap_or(current.started_at);
        let completed_at = updates.completed_at.unwrap_or(current.completed_at);
        let counters = updates.counters.unwrap_or(current.counters);
        let metrics = updates.metrics.clone().or(current.metrics.clone());
        let error_message = updates.error_message.clone().unwrap_or(current.error_message.clone());
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE export_jobs SET
                status = ?, version = version + 1, locked_by = ?, locked_at = ?,
                started_at = ?, completed_at = ?, total_rows = ?, processed_rows = ?,
                successful_rows = ?, failed_rows = ?, skipped_rows = ?, errors = ?,
                metrics = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&ownership.locked_by)
        .bind(ownership.locked_at.map(|d| d.to_rfc3339()))
        .bind(started_at.map(|d| d.to_rfc3339()))
        .bind(completed_at.map(|d| d.to_rfc3339()))
        .bind(counters.total_rows.map(|v| v as i64))
        .bind(counters.processed_rows as i64)
        .bind(counters.successful_rows as i64)
        .bind(counters.failed_rows as i64)
        .bind(counters.skipped_rows as i64)
        .bind(errors_json)
        .bind(metrics.as_ref().map(|m| serde_json::to_string(m).unwrap()))
        .bind(&error_message)
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(current.version)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;

        Ok(ExportJob {
            status: to,
            version: current.version + 1,
            ownership,
            started_at,
            completed_at,
            counters,
            errors,
            metrics,
            error_message,
            updated_at: now,
            ..current
        })
    }

    async fn finalize(
        &self,
        id: Uuid,
        terminal: JobStatus,
        updates: JobUpdate,
        download_url: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        file_size: Option<u64>,
    ) -> Result<Option<ExportJob>, StoreError> {
        match ExportJobStore::transition(self, id, JobStatus::Processing, terminal, updates).await {
            Ok(job) => {
                if download_url.is_some() || file_size.is_some() {
                    sqlx::query(
                        "UPDATE export_jobs SET download_url = ?, expires_at = ?, file_size = ? WHERE id = ?",
                    )
                    .bind(&download_url)
                    .bind(expires_at.map(|d| d.to_rfc3339()))
                    .bind(file_size.map(|v| v as i64))
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)?;
                }
                Ok(Some(ExportJob {
                    download_url,
                    expires_at,
                    file_size,
                    ..job
                }))
            }
            Err(StoreError::UnexpectedStatus { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_progress(&self, id: Uuid, counters: Counters) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE export_jobs SET
                total_rows = ?, processed_rows = ?, successful_rows = ?,
                failed_rows = ?, skipped_rows = ?, updated_at = ?
            WHERE id = ? AND processed_rows <= ?
            "#,
        )
        .bind(counters.total_rows.map(|v| v as i64))
        .bind(counters.processed_rows as i64)
        .bind(counters.successful_rows as i64)
        .bind(counters.failed_rows as i64)
        .bind(counters.skipped_rows as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(counters.processed_rows as i64)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn set_total_rows(&self, id: Uuid, total_rows: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE export_jobs SET total_rows = ?, updated_at = ? WHERE id = ?")
            .bind(total_rows as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn refresh_download_url(
        &self,
        id: Uuid,
        download_url: String,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE export_jobs SET download_url = ?, expires_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(download_url)
        .bind(expires_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn list_stale(
        &self,
        stale_threshold: Duration,
        stale_lock_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportJob>, StoreError> {
        let started_cutoff = now - chrono::Duration::from_std(stale_threshold).unwrap_or_default();
        let lock_cutoff = now - chrono::Duration::from_std(stale_lock_threshold).unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT * FROM export_jobs
            WHERE (status = 'PROCESSING' AND started_at IS NOT NULL AND started_at <= ?)
               OR (locked_by IS NOT NULL AND locked_at IS NOT NULL AND locked_at <= ?
                   AND status IN ('PENDING', 'PROCESSING'))
            "#,
        )
        .bind(started_cutoff.to_rfc3339())
        .bind(lock_cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(row_to_export_job).collect()
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs SET
                status = 'PENDING', version = version + 1, locked_by = NULL,
                locked_at = NULL, started_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqlJobStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlJobStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_and_find_import_job_round_trip() {
        let store = setup().await;
        let job = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        let id = job.id;
        ImportJobStore::create(&store, job).await.unwrap();

        let found = ImportJobStore::find_by_id(&store, id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Pending);
        assert_eq!(found.resource_type, ResourceType::Users);
    }

    #[tokio::test]
    async fn transition_rejects_wrong_from_status() {
        let store = setup().await;
        let job = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        let id = job.id;
        ImportJobStore::create(&store, job).await.unwrap();

        let err = ImportJobStore::transition(
            &store,
            id,
            JobStatus::Processing,
            JobStatus::Completed,
            JobUpdate::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedStatus { .. }));
    }

    #[tokio::test]
    async fn transition_bumps_version_and_applies_updates() {
        let store = setup().await;
        let job = ImportJob::new(ResourceType::Articles, FileFormat::Ndjson);
        let id = job.id;
        ImportJobStore::create(&store, job).await.unwrap();

        let updated = ImportJobStore::transition(
            &store,
            id,
            JobStatus::Pending,
            JobStatus::Processing,
            JobUpdate::started_now("node-a"),
        )
        .await
        .unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(updated.version, 1);
        assert_eq!(updated.ownership.locked_by.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn finalize_is_noop_when_not_processing() {
        let store = setup().await;
        let job = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        let id = job.id;
        ImportJobStore::create(&store, job).await.unwrap();

        let result = ImportJobStore::finalize(
            &store,
            id,
            JobStatus::Completed,
            JobUpdate::default().with_completed_now(),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_rejected() {
        let store = setup().await;
        let mut job_a = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        job_a.idempotency_key = Some("dup".into());
        let mut job_b = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        job_b.idempotency_key = Some("dup".into());

        ImportJobStore::create(&store, job_a).await.unwrap();
        let err = ImportJobStore::create(&store, job_b).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdempotencyKey(_)));
    }

    #[tokio::test]
    async fn list_stale_returns_only_processing_past_thresholds() {
        let store = setup().await;
        let mut job = ImportJob::new(ResourceType::Users, FileFormat::Csv);
        job.status = JobStatus::Pending;
        let id = job.id;
        ImportJobStore::create(&store, job).await.unwrap();
        ImportJobStore::transition(
            &store,
            id,
            JobStatus::Pending,
            JobStatus::Processing,
            JobUpdate::started_now("node-a"),
        )
        .await
        .unwrap();

        let stale = ImportJobStore::list_stale(&store, Duration::ZERO, Duration::ZERO, Utc::now())
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
    }

    #[tokio::test]
    async fn export_job_finalize_persists_download_url() {
        let store = setup().await;
        let job = ExportJob::new(ResourceType::Articles, FileFormat::Json);
        let id = job.id;
        ExportJobStore::create(&store, job).await.unwrap();
        ExportJobStore::transition(
            &store,
            id,
            JobStatus::Pending,
            JobStatus::Processing,
            JobUpdate::started_now("node-a"),
        )
        .await
        .unwrap();

        let result = ExportJobStore::finalize(
            &store,
            id,
            JobStatus::Completed,
            JobUpdate::default().with_completed_now(),
            Some("https://example.test/a".into()),
            Some(Utc::now() + chrono::Duration::hours(1)),
            Some(1024),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.download_url.as_deref(), Some("https://example.test/a"));
        assert_eq!(result.file_size, Some(1024));
    }
}
