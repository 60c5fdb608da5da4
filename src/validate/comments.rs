//! Comment record validation (§4.5).

use super::coerce;
use super::{FieldError, Verdict};
use crate::codec::Row;
use serde_json::Value;
use uuid::Uuid;

const MAX_BODY_CHARS: usize = 10_000;
const MAX_BODY_WORDS: usize = 500;

pub fn validate(line_number: u64, raw: Row) -> Verdict {
    let mut errors = Vec::new();
    let mut normalized = Row::new();

    if let Some(raw_id) = raw.get("id") {
        match raw_id {
            Value::String(s) => {
                let stripped = s.strip_prefix("cm_").unwrap_or(s);
                match Uuid::parse_str(stripped.trim()) {
                    Ok(id) => {
                        normalized.insert("id".into(), Value::String(id.to_string()));
                    }
                    Err(_) => errors.push(FieldError::new("id", "must be a UUIDv4, optionally prefixed cm_")),
                }
            }
            _ => errors.push(FieldError::new("id", "must be a UUIDv4, optionally prefixed cm_")),
        }
    }

    match coerce::as_uuid(raw.get("article_id")) {
        Some(article_id) => {
            normalized.insert("article_id".into(), Value::String(article_id.to_string()));
        }
        None => errors.push(FieldError::new("article_id", "must be a UUIDv4")),
    }

    match coerce::as_uuid(raw.get("user_id")) {
        Some(user_id) => {
            normalized.insert("user_id".into(), Value::String(user_id.to_string()));
        }
        None => errors.push(FieldError::new("user_id", "must be a UUIDv4")),
    }

    match raw.get("body") {
        Some(Value::String(body)) if !body.trim().is_empty() => {
            let char_count = body.chars().count();
            let word_count = body.split_whitespace().count();
            if char_count > MAX_BODY_CHARS {
                errors.push(FieldError::new(
                    "body",
                    format!("must be at most {MAX_BODY_CHARS} characters"),
                ));
            } else if word_count > MAX_BODY_WORDS {
                errors.push(FieldError::new("body", format!("must be at most {MAX_BODY_WORDS} words")));
            } else {
                normalized.insert("body".into(), Value::String(body.clone()));
            }
        }
        _ => errors.push(FieldError::new("body", "must be a non-empty string")),
    }

    if let Some(raw_value) = raw.get("created_at") {
        match coerce::as_datetime(Some(raw_value)) {
            Some(dt) => {
                normalized.insert("created_at".into(), Value::String(dt.to_rfc3339()));
            }
            None => errors.push(FieldError::new("created_at", "must be an ISO-8601 date-time")),
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

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn cm_prefixed_id_is_stripped() {
        let id = Uuid::new_v4();
        let article_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let verdict = validate(
            1,
            row(json!({
                "id": format!("cm_{id}"),
                "article_id": article_id.to_string(),
                "user_id": user_id.to_string(),
                "body": "nice post",
            })),
        );
        match verdict {
            Verdict::Valid { normalized_record, .. } => {
                assert_eq!(normalized_record["id"], id.to_string());
            }
            Verdict::Invalid { errors, .. } => panic!("expected valid, got {errors:?}"),
        }
    }

    #[test]
    fn body_over_word_limit_rejected() {
        let article_id = Uuid::new_v4().to_string();
        let user_id = Uuid::new_v4().to_string();
        let body = "word ".repeat(501);
        let verdict = validate(
            1,
            row(json!({"article_id": article_id, "user_id": user_id, "body": body})),
        );
        match verdict {
            Verdict::Invalid { errors, .. } => {
                assert!(errors.iter().any(|e| e.field.as_deref() == Some("body")));
            }
            Verdict::Valid { .. } => panic!("expected invalid"),
        }
    }
}
