//! Upsert engine (§4.6): transactional batch upsert with per-row savepoints.
//!
//! One transaction per batch, committed once; per row a `SAVEPOINT` bounds
//! the blast radius of a single bad record so one failing row doesn't
//! poison the rest of the batch the way an ungoverned single-statement
//! transaction would.

use crate::codec::Row;
use crate::error::UpsertError;
use crate::model::JobErrorEntry;
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub successful: u64,
    pub failed: u64,
    pub errors: Vec<JobErrorEntry>,
}

impl BatchOutcome {
    fn push_error(&mut self, entry: JobErrorEntry, max_stored: usize) {
        self.failed += 1;
        if self.errors.len() < max_stored {
            self.errors.push(entry);
        }
    }
}

/// A validated row paired with the 1-based position it came from in the
/// import file, for duplicate/error messages.
pub struct NumberedRecord {
    pub line_number: u64,
    pub record: Row,
}

pub struct UpsertEngine {
    pool: SqlitePool,
    max_stored_errors: usize,
}

impl UpsertEngine {
    pub fn new(pool: SqlitePool, max_stored_errors: usize) -> Self {
        Self {
            pool,
            max_stored_errors,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), UpsertError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('admin','manager','author','editor','reader')),
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| UpsertError::Transaction(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                author_id TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL CHECK (status IN ('draft','published','archived')),
                published_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| UpsertError::Transaction(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                article_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| UpsertError::Transaction(e.to_string()))?;

        Ok(())
    }

    pub async fn upsert_users(&self, rows: Vec<NumberedRecord>) -> Result<BatchOutcome, UpsertError> {
        let mut outcome = BatchOutcome::default();
        let mut seen: HashMap<String, u64> = HashMap::new();
        let mut to_process = Vec::with_capacity(rows.len());

        for numbered in rows {
            let email = numbered.record["email"].as_str().unwrap_or_default().to_string();
            if let Some(&first_row) = seen.get(&email) {
                outcome.push_error(
                    JobErrorEntry::new(
                        numbered.line_number,
                        Some("email"),
                        format!("Duplicate email in import file: {email} (first seen on row {first_row})"),
                    ),
                    self.max_stored_errors,
                );
                continue;
            }
            seen.insert(email, numbered.line_number);
            to_process.push(numbered);
        }

        let emails: Vec<&str> = to_process
            .iter()
            .map(|n| n.record["email"].as_str().unwrap_or_default())
            .collect();
        let existing = self.fetch_existing_ids(&self.pool, "users", "email", &emails).await?;

        let mut tx = self.pool.begin().await.map_err(|e| UpsertError::Transaction(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        for (idx, numbered) in to_process.into_iter().enumerate() {
            let savepoint = format!("row_{idx}");
            let record = numbered.record;
            let email = record["email"].as_str().unwrap().to_string();
            let name = record["name"].as_str().unwrap().to_string();
            let role = record["role"].as_str().unwrap().to_string();
            let active = record["active"].as_bool().unwrap();

            sqlx::query(&format!("SAVEPOINT {savepoint}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| UpsertError::Transaction(e.to_string()))?;

            let result = if let Some(id) = existing.get(&email) {
                sqlx::query(
                    "UPDATE users SET name = ?, role = ?, active = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&name)
                .bind(&role)
                .bind(active)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await
            } else {
                let id = record
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                sqlx::query(
                    "INSERT INTO users (id, email, name, role, active, created_at, updated_at) VALUES (?,?,?,?,?,?,?)",
                )
                .bind(&id)
                .bind(&email)
                .bind(&name)
                .bind(&role)
                .bind(active)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await
            };

            finish_row(&mut tx, &savepoint, result, numbered.line_number, "email", &mut outcome, self.max_stored_errors)
                .await?;
        }

        tx.commit().await.map_err(|e| UpsertError::Transaction(e.to_string()))?;
        Ok(outcome)
    }

    pub async fn upsert_articles(
        &self,
        rows: Vec<NumberedRecord>,
    ) -> Result<BatchOutcome, UpsertError> {
        let mut outcome = BatchOutcome::default();
        let mut seen: HashMap<String, u64> = HashMap::new();
        let mut to_process = Vec::with_capacity(rows.len());

        for numbered in rows {
            let slug = numbered.record["slug"].as_str().unwrap_or_default().to_string();
            if let Some(&first_row) = seen.get(&slug) {
                outcome.push_error(
                    JobErrorEntry::new(
                        numbered.line_number,
                        Some("slug"),
                        format!("Duplicate slug in import file: {slug} (first seen on row {first_row})"),
                    ),
                    self.max_stored_errors,
                );
                continue;
            }
            seen.insert(slug, numbered.line_number);
            to_process.push(numbered);
        }

        let slugs: Vec<&str> = to_process
            .iter()
            .map(|n| n.record["slug"].as_str().unwrap_or_default())
            .collect();
        let existing = self.fetch_existing_ids(&self.pool, "articles", "slug", &slugs).await?;

        let author_ids: Vec<&str> = to_process
            .iter()
            .map(|n| n.record["author_id"].as_str().unwrap_or_default())
            .collect();
        let valid_authors = self.fetch_existing_id_set(&self.pool, "users", "id", &author_ids).await?;

        let mut tx = self.pool.begin().await.map_err(|e| UpsertError::Transaction(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        for (idx, numbered) in to_process.into_iter().enumerate() {
            let record = numbered.record;
            let author_id = record["author_id"].as_str().unwrap().to_string();
            if !valid_authors.contains(&author_id) {
                outcome.push_error(
                    JobErrorEntry::new(numbered.line_number, Some("author_id"), "references a user that does not exist")
                        .with_value(author_id),
                    self.max_stored_errors,
                );
                continue;
            }

            let savepoint = format!("row_{idx}");
            let slug = record["slug"].as_str().unwrap().to_string();
            let title = record["title"].as_str().unwrap().to_string();
            let body = record["body"].as_str().unwrap().to_string();
            let tags = record.get("tags").cloned().unwrap_or(Value::Array(vec![]));
            let tags_json = serde_json::to_string(&tags).unwrap();
            let status = record["status"].as_str().unwrap().to_string();
            let published_at = record.get("published_at").and_then(|v| v.as_str()).map(|s| s.to_string());

            sqlx::query(&format!("SAVEPOINT {savepoint}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| UpsertError::Transaction(e.to_string()))?;

            let result = if let Some(id) = existing.get(&slug) {
                sqlx::query(
                    "UPDATE articles SET title = ?, body = ?, author_id = ?, tags = ?, status = ?, published_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&title)
                .bind(&body)
                .bind(&author_id)
                .bind(&tags_json)
                .bind(&status)
                .bind(&published_at)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await
            } else {
                let id = record
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                sqlx::query(
                    "INSERT INTO articles (id, slug, title, body, author_id, tags, status, published_at, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?,?,?)",
                )
                .bind(&id)
                .bind(&slug)
                .bind(&title)
                .bind(&body)
                .bind(&author_id)
                .bind(&tags_json)
                .bind(&status)
                .bind(&published_at)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await
            };

            finish_row(&mut tx, &savepoint, result, numbered.line_number, "slug", &mut outcome, self.max_stored_errors)
                .await?;
        }

        tx.commit().await.map_err(|e| UpsertError::Transaction(e.to_string()))?;
        Ok(outcome)
    }

    pub async fn upsert_comments(
        &self,
        rows: Vec<NumberedRecord>,
    ) -> Result<BatchOutcome, UpsertError> {
        let mut outcome = BatchOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut to_process = Vec::with_capacity(rows.len());

        for numbered in rows {
            let id = numbered
                .record
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if !seen.insert(id.clone()) {
                outcome.push_error(
                    JobErrorEntry::new(numbered.line_number, Some("id"), format!("Duplicate id in import file: {id}")),
                    self.max_stored_errors,
                );
                continue;
            }
            to_process.push((id, numbered));
        }

        let article_ids: Vec<&str> = to_process
            .iter()
            .map(|(_, n)| n.record["article_id"].as_str().unwrap_or_default())
            .collect();
        let user_ids: Vec<&str> = to_process
            .iter()
            .map(|(_, n)| n.record["user_id"].as_str().unwrap_or_default())
            .collect();
        let valid_articles = self.fetch_existing_id_set(&self.pool, "articles", "id", &article_ids).await?;
        let valid_users = self.fetch_existing_id_set(&self.pool, "users", "id", &user_ids).await?;

        let mut tx = self.pool.begin().await.map_err(|e| UpsertError::Transaction(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        for (idx, (id, numbered)) in to_process.into_iter().enumerate() {
            let record = numbered.record;
            let article_id = record["article_id"].as_str().unwrap().to_string();
            let user_id = record["user_id"].as_str().unwrap().to_string();

            if !valid_articles.contains(&article_id) {
                outcome.push_error(
                    JobErrorEntry::new(numbered.line_number, Some("article_id"), "references an article that does not exist")
                        .with_value(article_id),
                    self.max_stored_errors,
                );
                continue;
            }
            if !valid_users.contains(&user_id) {
                outcome.push_error(
                    JobErrorEntry::new(numbered.line_number, Some("user_id"), "references a user that does not exist")
                        .with_value(user_id),
                    self.max_stored_errors,
                );
                continue;
            }

            let savepoint = format!("row_{idx}");
            let body = record["body"].as_str().unwrap().to_string();

            sqlx::query(&format!("SAVEPOINT {savepoint}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| UpsertError::Transaction(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO comments (id, article_id, user_id, body, created_at) VALUES (?,?,?,?,?)
                ON CONFLICT(id) DO UPDATE SET body = excluded.body, article_id = excluded.article_id, user_id = excluded.user_id
                "#,
            )
            .bind(&id)
            .bind(&article_id)
            .bind(&user_id)
            .bind(&body)
            .bind(&now)
            .execute(&mut *tx)
            .await;

            finish_row(&mut tx, &savepoint, result, numbered.line_number, "id", &mut outcome, self.max_stored_errors)
                .await?;
        }

        tx.commit().await.map_err(|e| UpsertError::Transaction(e.to_string()))?;
        Ok(outcome)
    }

    async fn fetch_existing_ids(
        &self,
        pool: &SqlitePool,
        table: &str,
        key_column: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, String>, UpsertError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; keys.len()].join(",");
        let query_str = format!("SELECT id, {key_column} FROM {table} WHERE {key_column} IN ({placeholders})");
        let mut query = sqlx::query_as::<_, (String, String)>(&query_str);
        for key in keys {
            query = query.bind(*key);
        }
        let rows = query
            .fetch_all(pool)
            .await
            .map_err(|e| UpsertError::Transaction(e.to_string()))?;
        Ok(rows.into_iter().map(|(id, key)| (key, id)).collect())
    }

    async fn fetch_existing_id_set(
        &self,
        pool: &SqlitePool,
        table: &str,
        key_column: &str,
        keys: &[&str],
    ) -> Result<HashSet<String>, UpsertError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; keys.len()].join(",");
        let query_str = format!("SELECT DISTINCT {key_column} FROM {table} WHERE {key_column} IN ({placeholders})");
        let mut query = sqlx::query_as::<_, (String,)>(&query_str);
        for key in keys {
            query = query.bind(*key);
        }
        let rows = query
            .fetch_all(pool)
            .await
            .map_err(|e| UpsertError::Transaction(e.to_string()))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// Releases or rolls back the given savepoint depending on `result`,
/// classifying the DB error into a `JobErrorEntry` on failure (§4.6 step 4).
async fn finish_row(
    tx: &mut Transaction<'_, Sqlite>,
    savepoint: &str,
    result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
    line_number: u64,
    natural_key_field: &str,
    outcome: &mut BatchOutcome,
    max_stored_errors: usize,
) -> Result<(), UpsertError> {
    match result {
        Ok(_) => {
            sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}"))
                .execute(&mut **tx)
                .await
                .map_err(|e| UpsertError::Transaction(e.to_string()))?;
            outcome.successful += 1;
        }
        Err(e) => {
            sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                .execute(&mut **tx)
                .await
                .map_err(|e| UpsertError::Transaction(e.to_string()))?;
            let (field, message) = classify_db_error(&e, natural_key_field);
            outcome.push_error(JobErrorEntry::new(line_number, field, message), max_stored_errors);
        }
    }
    Ok(())
}

fn classify_db_error(e: &sqlx::Error, natural_key_field: &str) -> (Option<String>, String) {
    if let sqlx::Error::Database(db_err) = e {
        if db_err.is_unique_violation() {
            return (Some(natural_key_field.to_string()), db_err.message().to_string());
        }
        let message = db_err.message();
        if message.contains("CHECK constraint failed") {
            for field in ["role", "status"] {
                if message.contains(field) {
                    return (Some(field.to_string()), message.to_string());
                }
            }
            return (None, message.to_string());
        }
    }
    (None, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceType;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> UpsertEngine {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let engine = UpsertEngine::new(pool, 100);
        engine.ensure_schema().await.unwrap();
        engine
    }

    fn user_row(line: u64, email: &str) -> NumberedRecord {
        NumberedRecord {
            line_number: line,
            record: serde_json::from_value(serde_json::json!({
                "email": email, "name": "A", "role": "reader", "active": true,
            }))
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn inserts_new_users_and_updates_on_second_pass() {
        let engine = setup().await;
        let outcome = engine
            .upsert_users(vec![user_row(1, "a@example.com")])
            .await
            .unwrap();
        assert_eq!(outcome.successful, 1);
        assert_eq!(outcome.failed, 0);

        let outcome2 = engine
            .upsert_users(vec![user_row(1, "a@example.com")])
            .await
            .unwrap();
        assert_eq!(outcome2.successful, 1);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&engine.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn in_batch_duplicate_email_recorded_as_failure() {
        let engine = setup().await;
        let outcome = engine
            .upsert_users(vec![user_row(1, "dup@example.com"), user_row(2, "dup@example.com")])
            .await
            .unwrap();
        assert_eq!(outcome.successful, 1);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.errors[0].message.contains("Duplicate email"));
    }

    #[tokio::test]
    async fn article_with_unknown_author_fails_fk_precheck() {
        let engine = setup().await;
        let missing_author = Uuid::new_v4().to_string();
        let row = NumberedRecord {
            line_number: 1,
            record: serde_json::from_value(serde_json::json!({
                "slug": "a-b", "title": "T", "body": "b",
                "author_id": missing_author, "status": "draft",
            }))
            .unwrap(),
        };
        let outcome = engine.upsert_articles(vec![row]).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors[0].field.as_deref(), Some("author_id"));
        let _ = ResourceType::Articles;
    }
}
