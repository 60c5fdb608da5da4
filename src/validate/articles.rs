//! Article record validation (§4.5).

use super::coerce;
use super::{FieldError, Verdict};
use crate::codec::Row;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::OnceLock;

const VALID_STATUSES: &[&str] = &["draft", "published", "archived"];

fn slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap())
}

pub fn validate(line_number: u64, raw: Row) -> Verdict {
    let mut errors = Vec::new();
    let mut normalized = Row::new();

    if let Some(raw_id) = raw.get("id") {
        match coerce::as_uuid(Some(raw_id)) {
            Some(id) => {
                normalized.insert("id".into(), Value::String(id.to_string()));
            }
            None => errors.push(FieldError::new("id", "must be a UUIDv4")),
        }
    }

    match coerce::as_trimmed_string(raw.get("slug")) {
        Some(slug) if slug_re().is_match(&slug) => {
            normalized.insert("slug".into(), Value::String(slug));
        }
        Some(slug) => {
            errors.push(FieldError::new("slug", "must be kebab-case (lowercase, hyphen-separated)").with_value(slug))
        }
        None => errors.push(FieldError::new("slug", "is required")),
    }

    match coerce::as_trimmed_string(raw.get("title")) {
        Some(title) if !title.is_empty() && title.len() <= 500 => {
            normalized.insert("title".into(), Value::String(title));
        }
        Some(_) => errors.push(FieldError::new("title", "must be 1..500 characters")),
        None => errors.push(FieldError::new("title", "is required")),
    }

    match raw.get("body") {
        Some(Value::String(body)) if !body.trim().is_empty() => {
            normalized.insert("body".into(), Value::String(body.clone()));
        }
        _ => errors.push(FieldError::new("body", "must be a non-empty string")),
    }

    match coerce::as_uuid(raw.get("author_id")) {
        Some(author_id) => {
            normalized.insert("author_id".into(), Value::String(author_id.to_string()));
        }
        None => errors.push(FieldError::new("author_id", "must be a UUIDv4")),
    }

    if let Some(raw_tags) = raw.get("tags") {
        match coerce::as_string_array(Some(raw_tags)) {
            Some(tags) => {
                let mut seen = std::collections::HashSet::new();
                let mut deduped = Vec::new();
                for tag in tags {
                    let normalized_tag = tag.trim().to_lowercase();
                    if normalized_tag.is_empty() {
                        errors.push(FieldError::new("tags", "tag entries must be non-empty strings"));
                        continue;
                    }
                    if seen.insert(normalized_tag.clone()) {
                        deduped.push(normalized_tag);
                    }
                }
                normalized.insert("tags".into(), json!(deduped));
            }
            None => errors.push(FieldError::new("tags", "must be an array of strings")),
        }
    }

    let status = coerce::as_trimmed_string(raw.get("status")).map(|s| s.to_lowercase());
    match &status {
        Some(status) if VALID_STATUSES.contains(&status.as_str()) => {
            normalized.insert("status".into(), Value::String(status.clone()));
        }
        Some(status) => errors.push(
            FieldError::new("status", format!("must be one of {}", VALID_STATUSES.join(", ")))
                .with_value(status.clone()),
        ),
        None => errors.push(FieldError::new("status", "is required")),
    }

    if let Some(raw_value) = raw.get("published_at") {
        match coerce::as_datetime(Some(raw_value)) {
            Some(dt) => {
                if status.as_deref() == Some("draft") {
                    errors.push(FieldError::new(
                        "published_at",
                        "must be absent when status is draft",
                    ));
                } else {
                    normalized.insert("published_at".into(), Value::String(dt.to_rfc3339()));
                }
            }
            None => errors.push(FieldError::new("published_at", "must be an ISO-8601 date-time")),
        }
    }

    for field in ["created_at", "updated_at"] {
        if let Some(raw_value) = raw.get(field) {
            match coerce::as_datetime(Some(raw_value)) {
                Some(dt) => {
                    normalized.insert(field.into(), Value::String(dt.to_rfc3339()));
                }
                None => errors.push(FieldError::new(field, "must be an ISO-8601 date-time")),
            }
        }
    }

    if errors.is_empty() {
        Verdict::Valid {
            normalized_record: normalized,
            line_number,
        }
    } else {
        Verdict::Invalid {
            errors,
            line_number,
            raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn valid_article_dedupes_and_lowercases_tags() {
        let author_id = Uuid::new_v4().to_string();
        let verdict = validate(
            1,
            row(json!({
                "slug": "hello-world",
                "title": "Hello World",
                "body": "content",
                "author_id": author_id,
                "tags": ["Rust", "rust", " WebDev "],
                "status": "published",
            })),
        );
        match verdict {
            Verdict::Valid { normalized_record, .. } => {
                assert_eq!(normalized_record["tags"], json!(["rust", "webdev"]));
            }
            Verdict::Invalid { errors, .. } => panic!("expected valid, got {errors:?}"),
        }
    }

    #[test]
    fn published_at_rejected_for_draft_status() {
        let author_id = Uuid::new_v4().to_string();
        let verdict = validate(
            1,
            row(json!({
                "slug": "a-b",
                "title": "T",
                "body": "b",
                "author_id": author_id,
                "status": "draft",
                "published_at": "2024-01-01T00:00:00Z",
            })),
        );
        match verdict {
            Verdict::Invalid { errors, .. } => {
                assert!(errors.iter().any(|e| e.field.as_deref() == Some("published_at")));
            }
            Verdict::Valid { .. } => panic!("expected invalid"),
        }
    }

    #[test]
    fn bad_slug_rejected() {
        let author_id = Uuid::new_v4().to_string();
        let verdict = validate(
            1,
            row(json!({
                "slug": "Not Kebab",
                "title": "T",
                "body": "b",
                "author_id": author_id,
                "status": "draft",
            })),
        );
        assert!(!verdict.is_valid());
    }
}
