//! JSON-array decode/encode (§4.4).
//!
//! Unlike ndjson/CSV this format cannot be parsed incrementally: the closing
//! bracket has to be seen before `serde_json` can hand back anything, so
//! decode reads the whole input once. Encoding stays streaming — the opening
//! and closing brackets are emitted around an otherwise row-at-a-time write.

use super::{DecodedRow, Encoder, Row};
use crate::error::CodecError;
use serde_json::Value;
use std::io::{Read, Write};

pub fn decode(mut reader: impl Read) -> Result<Vec<DecodedRow>, CodecError> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf).map_err(CodecError::Io)?;

    let value: Value = serde_json::from_str(&buf).map_err(|e| CodecError::Parse {
        line: 1,
        message: e.to_string(),
    })?;
    let array = value.as_array().ok_or(CodecError::NotAnArray)?;

    Ok(array
        .iter()
        .enumerate()
        .map(|(idx, element)| {
            let line_number = idx as u64 + 1;
            let record = element.as_object().cloned().ok_or_else(|| CodecError::Parse {
                line: line_number,
                message: "array element is not an object".to_string(),
            });
            DecodedRow { line_number, record }
        })
        .collect())
}

pub struct JsonArrayEncoder {
    wrote_any: bool,
}

impl JsonArrayEncoder {
    pub fn new() -> Self {
        Self { wrote_any: false }
    }
}

impl Default for JsonArrayEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for JsonArrayEncoder {
    fn start(&mut self, out: &mut dyn Write) -> Result<(), CodecError> {
        out.write_all(b"[").map_err(CodecError::Io)
    }

    fn write_row(&mut self, out: &mut dyn Write, row: &Row) -> Result<(), CodecError> {
        if self.wrote_any {
            out.write_all(b",").map_err(CodecError::Io)?;
        }
        serde_json::to_writer(&mut *out, row).map_err(|e| CodecError::Parse {
            line: 0,
            message: e.to_string(),
        })?;
        self.wrote_any = true;
        Ok(())
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<(), CodecError> {
        out.write_all(b"]").map_err(CodecError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_array_of_objects_with_1_based_index() {
        let rows = decode(r#"[{"a":1},{"a":2}]"#.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(rows[1].line_number, 2);
    }

    #[test]
    fn non_array_input_is_fatal() {
        let err = decode(r#"{"a":1}"#.as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::NotAnArray));
    }

    #[test]
    fn encoder_brackets_and_commas_separate_rows() {
        let mut out = Vec::new();
        let mut enc = JsonArrayEncoder::new();
        enc.start(&mut out).unwrap();
        let row_a: Row = serde_json::from_value(serde_json::json!({"a": 1})).unwrap();
        let row_b: Row = serde_json::from_value(serde_json::json!({"a": 2})).unwrap();
        enc.write_row(&mut out, &row_a).unwrap();
        enc.write_row(&mut out, &row_b).unwrap();
        enc.finish(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"[{"a":1},{"a":2}]"#);
    }
}
