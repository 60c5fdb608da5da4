//! The durable job record and its supporting types (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One of the three domains this engine can bulk-import and bulk-export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Users,
    Articles,
    Comments,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Users => "users",
            ResourceType::Articles => "articles",
            ResourceType::Comments => "comments",
        }
    }

    /// The natural key used for upsert matching (§4.6 / glossary).
    pub fn natural_key_field(&self) -> &'static str {
        match self {
            ResourceType::Users => "email",
            ResourceType::Articles => "slug",
            ResourceType::Comments => "id",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(ResourceType::Users),
            "articles" => Ok(ResourceType::Articles),
            "comments" => Ok(ResourceType::Comments),
            other => Err(format!("unknown resource_type: {other}")),
        }
    }
}

/// Wire format for import uploads and export artifacts (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Json,
    Ndjson,
    Csv,
}

impl FileFormat {
    /// Detects a format from a filename extension (§6: auto-detect rule).
    pub fn from_extension(name: &str) -> Option<Self> {
        let ext = name.rsplit('.').next()?.to_lowercase();
        match ext.as_str() {
            "json" => Some(FileFormat::Json),
            "ndjson" | "jsonl" => Some(FileFormat::Ndjson),
            "csv" => Some(FileFormat::Csv),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Ndjson => "ndjson",
            FileFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileFormat::Json => "application/json",
            FileFormat::Ndjson => "application/x-ndjson",
            FileFormat::Csv => "text/csv",
        }
    }
}

/// Job lifecycle state (§3 I3 lattice).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition under the I3 lattice.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row-level failure recorded on a job (§3 `errors`, bounded to
/// [`crate::config::EngineConfig::max_stored_errors`] entries, I5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub row: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl JobErrorEntry {
    /// Truncates an offending value to 100 chars with a `…` suffix (B3).
    const VALUE_TRUNCATE_LEN: usize = 100;

    pub fn new(row: u64, field: Option<impl Into<String>>, message: impl Into<String>) -> Self {
        Self {
            row,
            field: field.map(Into::into),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(truncate_value(&value.into(), Self::VALUE_TRUNCATE_LEN));
        self
    }
}

fn truncate_value(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        value.to_string()
    } else {
        let truncated: String = value.chars().take(max_len).collect();
        format!("{truncated}…")
    }
}

/// Non-negative progress counters; invariant P1 holds once `total` is `Some`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total_rows: Option<u64>,
    pub processed_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
    pub skipped_rows: u64,
}

impl Counters {
    pub fn record_success(&mut self) {
        self.processed_rows += 1;
        self.successful_rows += 1;
    }

    pub fn record_failure(&mut self) {
        self.processed_rows += 1;
        self.failed_rows += 1;
    }

    /// Checks P1: `successful + failed + skipped <= processed <= total`.
    pub fn satisfies_invariant(&self) -> bool {
        let sum = self.successful_rows + self.failed_rows + self.skipped_rows;
        if sum > self.processed_rows {
            return false;
        }
        match self.total_rows {
            Some(total) => self.processed_rows <= total,
            None => true,
        }
    }
}

/// Throughput/size metrics populated on finalize (§3 `metrics`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub rows_per_second: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl Metrics {
    pub fn for_import(total_rows: u64, failed_rows: u64, duration_ms: u64) -> Self {
        let rows_per_second = rate_per_second(total_rows, duration_ms);
        let error_rate = if total_rows > 0 {
            Some(failed_rows as f64 / total_rows as f64)
        } else {
            Some(0.0)
        };
        Self {
            rows_per_second,
            duration_ms,
            error_rate,
            total_bytes: None,
        }
    }

    pub fn for_export(total_rows: u64, duration_ms: u64, total_bytes: u64) -> Self {
        Self {
            rows_per_second: rate_per_second(total_rows, duration_ms),
            duration_ms,
            error_rate: None,
            total_bytes: Some(total_bytes),
        }
    }
}

fn rate_per_second(rows: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        0.0
    } else {
        rows as f64 * 1000.0 / duration_ms as f64
    }
}

/// Structured export filters (§4.7, semantic not per-field SQL).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// Ownership fields shared by the I1/I2 invariants.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ownership {
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub status: JobStatus,
    pub version: i64,
    pub ownership: Ownership,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: Counters,
    pub errors: Vec<JobErrorEntry>,
    pub metrics: Option<Metrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub idempotency_key: Option<String>,
    pub file_url: Option<String>,
    pub storage_key: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_format: FileFormat,
}

impl ImportJob {
    pub fn new(resource_type: ResourceType, file_format: FileFormat) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_type,
            status: JobStatus::Pending,
            version: 0,
            ownership: Ownership::default(),
            started_at: None,
            completed_at: None,
            counters: Counters::default(),
            errors: Vec::new(),
            metrics: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            idempotency_key: None,
            file_url: None,
            storage_key: None,
            file_name: None,
            file_size: None,
            file_format,
        }
    }

    /// Appends an error, enforcing the I5/P6 cap; returns whether it was stored.
    pub fn push_error(&mut self, entry: JobErrorEntry, max_stored: usize) -> bool {
        if self.errors.len() < max_stored {
            self.errors.push(entry);
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub status: JobStatus,
    pub version: i64,
    pub ownership: Ownership,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: Counters,
    pub errors: Vec<JobErrorEntry>,
    pub metrics: Option<Metrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub format: FileFormat,
    pub filters: ExportFilters,
    pub fields: Option<Vec<String>>,
    pub download_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
}

impl ExportJob {
    pub fn new(resource_type: ResourceType, format: FileFormat) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_type,
            status: JobStatus::Pending,
            version: 0,
            ownership: Ownership::default(),
            started_at: None,
            completed_at: None,
            counters: Counters::default(),
            errors: Vec::new(),
            metrics: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            format,
            filters: ExportFilters::default(),
            fields: None,
            download_url: None,
            expires_at: None,
            file_size: None,
        }
    }

    /// Whether the presigned URL needs regeneration per §4.7's refresh rule.
    pub fn needs_url_refresh(&self, now: DateTime<Utc>, refresh_margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + refresh_margin,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lattice_matches_i3() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn counters_invariant_p1() {
        let mut c = Counters {
            total_rows: Some(4),
            ..Default::default()
        };
        c.record_success();
        c.record_failure();
        assert!(c.satisfies_invariant());
        c.skipped_rows = 10;
        assert!(!c.satisfies_invariant());
    }

    #[test]
    fn error_value_truncated_with_ellipsis() {
        let long = "x".repeat(150);
        let entry = JobErrorEntry::new(1, Some("field"), "bad").with_value(long);
        let value = entry.value.unwrap();
        assert_eq!(value.chars().count(), 101);
        assert!(value.ends_with('…'));
    }

    #[test]
    fn file_format_detected_from_extension() {
        assert_eq!(FileFormat::from_extension("a.csv"), Some(FileFormat::Csv));
        assert_eq!(
            FileFormat::from_extension("a.jsonl"),
            Some(FileFormat::Ndjson)
        );
        assert_eq!(
            FileFormat::from_extension("a.ndjson"),
            Some(FileFormat::Ndjson)
        );
        assert_eq!(FileFormat::from_extension("a.json"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("a.exe"), None);
    }
}
