//! User record validation (§4.5).

use super::coerce;
use super::{FieldError, Verdict};
use crate::codec::Row;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const VALID_ROLES: &[&str] = &["admin", "manager", "author", "editor", "reader"];

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
}

pub fn validate(line_number: u64, raw: Row) -> Verdict {
    let mut errors = Vec::new();
    let mut normalized = Row::new();

    match coerce::as_trimmed_string(raw.get("email")) {
        Some(email) => {
            let lowered = email.to_lowercase();
            if lowered.len() > 255 {
                errors.push(FieldError::new("email", "must be at most 255 characters"));
            } else if !email_re().is_match(&lowered) {
                errors.push(FieldError::new("email", "is not a valid email address").with_value(lowered));
            } else {
                normalized.insert("email".into(), Value::String(lowered));
            }
        }
        None => errors.push(FieldError::new("email", "is required")),
    }

    match coerce::as_trimmed_string(raw.get("name")) {
        Some(name) if name.len() <= 255 => {
            normalized.insert("name".into(), Value::String(name));
        }
        Some(_) => errors.push(FieldError::new("name", "must be at most 255 characters")),
        None => errors.push(FieldError::new("name", "is required")),
    }

    match coerce::as_trimmed_string(raw.get("role")) {
        Some(role) => {
            let lowered = role.to_lowercase();
            if VALID_ROLES.contains(&lowered.as_str()) {
                normalized.insert("role".into(), Value::String(lowered));
            } else {
                errors.push(
                    FieldError::new("role", format!("must be one of {}", VALID_ROLES.join(", ")))
                        .with_value(lowered),
                );
            }
        }
        None => errors.push(FieldError::new("role", "is required")),
    }

    match coerce::as_bool(raw.get("active")) {
        Some(active) => {
            normalized.insert("active".into(), Value::Bool(active));
        }
        None => errors.push(FieldError::new("active", "is required and must be a boolean")),
    }

    if let Some(raw_id) = raw.get("id") {
        match coerce::as_uuid(Some(raw_id)) {
            Some(id) => {
                normalized.insert("id".into(), Value::String(id.to_string()));
            }
            None => errors.push(FieldError::new("id", "must be a UUIDv4")),
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

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn valid_user_normalizes_email_and_role_case() {
        let verdict = validate(
            1,
            row(json!({
                "email": "  Ada@Example.COM ",
                "name": "Ada",
                "role": "Admin",
                "active": "yes",
            })),
        );
        match verdict {
            Verdict::Valid { normalized_record, .. } => {
                assert_eq!(normalized_record["email"], "ada@example.com");
                assert_eq!(normalized_record["role"], "admin");
                assert_eq!(normalized_record["active"], true);
            }
            Verdict::Invalid { errors, .. } => panic!("expected valid, got {errors:?}"),
        }
    }

    #[test]
    fn missing_active_is_invalid_with_no_default() {
        let verdict = validate(
            1,
            row(json!({"email": "a@b.com", "name": "A", "role": "reader"})),
        );
        match verdict {
            Verdict::Invalid { errors, .. } => {
                assert!(errors.iter().any(|e| e.field.as_deref() == Some("active")));
            }
            Verdict::Valid { .. } => panic!("expected invalid"),
        }
    }

    #[test]
    fn malformed_email_rejected() {
        let verdict = validate(
            1,
            row(json!({"email": "not-an-email", "name": "A", "role": "reader", "active": true})),
        );
        assert!(!verdict.is_valid());
    }
}
