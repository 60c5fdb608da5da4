//! Export query, encode, and upload pipeline (§4.7).

use crate::codec::{encoder_for, Row};
use crate::config::EngineConfig;
use crate::error::ExportError;
use crate::model::{ExportFilters, FileFormat, Metrics, ResourceType};
use crate::storage::ObjectStorage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

/// Cursor for keyset pagination: `(created_at, id)`, the same tiebreaker
/// used by the count query's `ORDER BY` so the two never drift apart.
#[derive(Clone, Copy)]
struct Cursor {
    created_at: DateTime<Utc>,
    id: Uuid,
}

struct FilteredQuery {
    where_clause: String,
    binds: Vec<String>,
}

fn build_filter(resource_type: ResourceType, filters: &ExportFilters) -> FilteredQuery {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(ids) = &filters.ids {
        let placeholders = vec!["?"; ids.len()].join(",");
        clauses.push(format!("id IN ({placeholders})"));
        binds.extend(ids.iter().map(|id| id.to_string()));
    }
    if let Some(after) = filters.created_after {
        clauses.push("created_at > ?".to_string());
        binds.push(after.to_rfc3339());
    }
    if let Some(before) = filters.created_before {
        clauses.push("created_at < ?".to_string());
        binds.push(before.to_rfc3339());
    }
    if let Some(after) = filters.updated_after {
        clauses.push("updated_at > ?".to_string());
        binds.push(after.to_rfc3339());
    }
    if let Some(before) = filters.updated_before {
        clauses.push("updated_at < ?".to_string());
        binds.push(before.to_rfc3339());
    }
    if resource_type == ResourceType::Users {
        if let Some(active) = filters.active {
            clauses.push("active = ?".to_string());
            binds.push(if active { "1" } else { "0" }.to_string());
        }
    }
    if resource_type == ResourceType::Articles {
        if let Some(status) = &filters.status {
            clauses.push("status = ?".to_string());
            binds.push(status.clone());
        }
        if let Some(author_id) = filters.author_id {
            clauses.push("author_id = ?".to_string());
            binds.push(author_id.to_string());
        }
    }
    if resource_type == ResourceType::Comments {
        if let Some(article_id) = filters.article_id {
            clauses.push("article_id = ?".to_string());
            binds.push(article_id.to_string());
        }
        if let Some(user_id) = filters.user_id {
            clauses.push("user_id = ?".to_string());
            binds.push(user_id.to_string());
        }
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    FilteredQuery { where_clause, binds }
}

fn table_for(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Users => "users",
        ResourceType::Articles => "articles",
        ResourceType::Comments => "comments",
    }
}

pub async fn count_rows(
    pool: &SqlitePool,
    resource_type: ResourceType,
    filters: &ExportFilters,
) -> Result<u64, ExportError> {
    let table = table_for(resource_type);
    let filtered = build_filter(resource_type, filters);
    let sql = format!("SELECT COUNT(*) FROM {table} {}", filtered.where_clause);
    let mut query = sqlx::query_as::<_, (i64,)>(&sql);
    for bind in &filtered.binds {
        query = query.bind(bind);
    }
    let (count,) = query
        .fetch_one(pool)
        .await
        .map_err(|e| ExportError::Query(e.to_string()))?;
    Ok(count as u64)
}

async fn fetch_page(
    pool: &SqlitePool,
    resource_type: ResourceType,
    filters: &ExportFilters,
    after: Option<Cursor>,
    limit: usize,
) -> Result<Vec<Row>, ExportError> {
    let table = table_for(resource_type);
    let mut filtered = build_filter(resource_type, filters);

    if let Some(cursor) = after {
        let cursor_clause = "(created_at > ? OR (created_at = ? AND id > ?))";
        if filtered.where_clause.is_empty() {
            filtered.where_clause = format!("WHERE {cursor_clause}");
        } else {
            filtered.where_clause = format!("{} AND {cursor_clause}", filtered.where_clause);
        }
        filtered.binds.push(cursor.created_at.to_rfc3339());
        filtered.binds.push(cursor.created_at.to_rfc3339());
        filtered.binds.push(cursor.id.to_string());
    }

    let sql = format!(
        "SELECT * FROM {table} {} ORDER BY created_at ASC, id ASC LIMIT ?",
        filtered.where_clause
    );
    let mut query = sqlx::query(&sql);
    for bind in &filtered.binds {
        query = query.bind(bind);
    }
    query = query.bind(limit as i64);

    let sql_rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| ExportError::Query(e.to_string()))?;

    sql_rows
        .iter()
        .map(|row| row_to_export_record(resource_type, row))
        .collect()
}

fn row_to_export_record(resource_type: ResourceType, row: &SqliteRow) -> Result<Row, ExportError> {
    let get = |col: &str| -> Result<String, ExportError> {
        row.try_get(col).map_err(|e| ExportError::Query(e.to_string()))
    };
    let mut record = Row::new();
    record.insert("id".into(), Value::String(get("id")?));
    record.insert("created_at".into(), Value::String(get("created_at")?));

    match resource_type {
        ResourceType::Users => {
            record.insert("email".into(), Value::String(get("email")?));
            record.insert("name".into(), Value::String(get("name")?));
            record.insert("role".into(), Value::String(get("role")?));
            let active: i64 = row.try_get("active").map_err(|e| ExportError::Query(e.to_string()))?;
            record.insert("active".into(), Value::Bool(active != 0));
            record.insert("updated_at".into(), Value::String(get("updated_at")?));
        }
        ResourceType::Articles => {
            record.insert("slug".into(), Value::String(get("slug")?));
            record.insert("title".into(), Value::String(get("title")?));
            record.insert("body".into(), Value::String(get("body")?));
            record.insert("author_id".into(), Value::String(get("author_id")?));
            let tags_json: String = row.try_get("tags").map_err(|e| ExportError::Query(e.to_string()))?;
            let tags: Value = serde_json::from_str(&tags_json).unwrap_or(Value::Array(vec![]));
            record.insert("tags".into(), tags);
            record.insert("status".into(), Value::String(get("status")?));
            let published_at: Option<String> =
                row.try_get("published_at").map_err(|e| ExportError::Query(e.to_string()))?;
            record.insert(
                "published_at".into(),
                published_at.map(Value::String).unwrap_or(Value::Null),
            );
            record.insert("updated_at".into(), Value::String(get("updated_at")?));
        }
        ResourceType::Comments => {
            record.insert("article_id".into(), Value::String(get("article_id")?));
            record.insert("user_id".into(), Value::String(get("user_id")?));
            record.insert("body".into(), Value::String(get("body")?));
        }
    }
    Ok(record)
}

fn project(record: Row, fields: Option<&[String]>) -> Row {
    match fields {
        None => record,
        Some(fields) => {
            let mut projected = Row::new();
            for field in fields {
                if let Some(value) = record.get(field) {
                    projected.insert(field.clone(), value.clone());
                }
            }
            projected
        }
    }
}

pub struct ExportResult {
    pub body: Vec<u8>,
    pub total_rows: u64,
    pub duration_ms: u64,
}

/// Runs steps 1-4 of §4.7 (count, stream, project, encode) and returns the
/// fully encoded body. Upload and finalize are the orchestrator's job since
/// they need the job id for the storage key and the store handle to persist
/// the result.
pub async fn query_and_encode(
    pool: &SqlitePool,
    resource_type: ResourceType,
    filters: &ExportFilters,
    fields: Option<&[String]>,
    format: FileFormat,
    batch_size: usize,
) -> Result<ExportResult, ExportError> {
    let started = std::time::Instant::now();
    let total_rows = count_rows(pool, resource_type, filters).await?;

    let mut encoder = encoder_for(format, fields.map(|f| f.to_vec()));
    let mut body = Vec::new();
    encoder.start(&mut body)?;

    let mut cursor = None;
    let mut seen = 0u64;
    loop {
        let page = fetch_page(pool, resource_type, filters, cursor, batch_size).await?;
        if page.is_empty() {
            break;
        }
        for record in &page {
            let created_at = record
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let id = record
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4);
            cursor = Some(Cursor { created_at, id });

            let projected = project(record.clone(), fields);
            encoder.write_row(&mut body, &projected)?;
            seen += 1;
        }
        if page.len() < batch_size {
            break;
        }
    }
    encoder.finish(&mut body)?;

    let _ = seen;
    Ok(ExportResult {
        body,
        total_rows,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Step 5-6: uploads the encoded body and computes the metrics the
/// orchestrator persists on finalize.
pub async fn upload_export(
    storage: &Arc<dyn ObjectStorage>,
    job_id: Uuid,
    format: FileFormat,
    result: &ExportResult,
    config: &EngineConfig,
) -> Result<(String, u64), ExportError> {
    let date = Utc::now().format("%Y-%m-%d");
    let key = format!("exports/{date}/{job_id}/export.{}", format.extension());
    let size = result.body.len() as u64;
    storage
        .put_multipart(
            &key,
            result.body.clone(),
            config.upload_part_size_bytes,
            config.upload_max_concurrent_parts,
        )
        .await
        .map_err(|e| ExportError::Upload(e.to_string()))?;
    Ok((key, size))
}

pub fn metrics_for(result: &ExportResult, file_size: u64) -> Metrics {
    Metrics::for_export(result.total_rows, result.duration_ms, file_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceType;
    use crate::upsert::{NumberedRecord, UpsertEngine};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let engine = UpsertEngine::new(pool.clone(), 100);
        engine.ensure_schema().await.unwrap();
        for i in 0..3 {
            engine
                .upsert_users(vec![NumberedRecord {
                    line_number: i,
                    record: serde_json::from_value(serde_json::json!({
                        "email": format!("user{i}@example.com"),
                        "name": "A", "role": "reader", "active": true,
                    }))
                    .unwrap(),
                }])
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn counts_and_encodes_all_rows_as_ndjson() {
        let pool = seeded_pool().await;
        let result = query_and_encode(
            &pool,
            ResourceType::Users,
            &ExportFilters::default(),
            None,
            FileFormat::Ndjson,
            2,
        )
        .await
        .unwrap();
        assert_eq!(result.total_rows, 3);
        let lines: Vec<&str> = std::str::from_utf8(&result.body).unwrap().lines().collect();
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn projection_restricts_fields() {
        let pool = seeded_pool().await;
        let fields = vec!["email".to_string()];
        let result = query_and_encode(
            &pool,
            ResourceType::Users,
            &ExportFilters::default(),
            Some(&fields),
            FileFormat::Ndjson,
            10,
        )
        .await
        .unwrap();
        let first_line = std::str::from_utf8(&result.body).unwrap().lines().next().unwrap();
        let value: Value = serde_json::from_str(first_line).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 1);
        assert!(value.get("email").is_some());
    }
}
