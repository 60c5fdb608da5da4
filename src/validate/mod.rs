//! Record validator (§4.5): pure per-resource functions over a decoded row.
//! Never touches the database, never panics — an unparseable record is
//! data (`Verdict::Invalid`), not a `Result::Err`.

pub mod articles;
pub mod comments;
pub mod users;

use crate::codec::Row;
use crate::model::ResourceType;

/// One field-level failure on an invalid record.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldError {
    pub field: Option<String>,
    pub message: String,
    pub value: Option<String>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

#[derive(Debug)]
pub enum Verdict {
    Valid {
        normalized_record: Row,
        line_number: u64,
    },
    Invalid {
        errors: Vec<FieldError>,
        line_number: u64,
        raw: Row,
    },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid { .. })
    }
}

pub fn validate(resource_type: ResourceType, line_number: u64, raw: Row) -> Verdict {
    match resource_type {
        ResourceType::Users => users::validate(line_number, raw),
        ResourceType::Articles => articles::validate(line_number, raw),
        ResourceType::Comments => comments::validate(line_number, raw),
    }
}

/// Coercion helpers over `serde_json::Value`, matched directly against its
/// `Null | Bool | Number | String | Array | Object` shape rather than
/// through a parallel hand-rolled enum (§9 design note).
pub mod coerce {
    use serde_json::Value;
    use uuid::Uuid;

    pub fn as_trimmed_string(value: Option<&Value>) -> Option<String> {
        match value {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            _ => None,
        }
    }

    pub fn as_bool(value: Option<&Value>) -> Option<bool> {
        match value {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            Some(Value::Number(n)) => {
                if n.as_i64() == Some(1) {
                    Some(true)
                } else if n.as_i64() == Some(0) {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_uuid(value: Option<&Value>) -> Option<Uuid> {
        match value {
            Some(Value::String(s)) => Uuid::parse_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_datetime(value: Option<&Value>) -> Option<chrono::DateTime<chrono::Utc>> {
        match value {
            Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            _ => None,
        }
    }

    pub fn as_string_array(value: Option<&Value>) -> Option<Vec<String>> {
        match value {
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => out.push(s.clone()),
                        _ => return None,
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }
}
