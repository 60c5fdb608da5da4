//! Line-delimited JSON decode/encode (§4.4).

use super::{DecodedRow, Encoder, Row};
use crate::error::CodecError;
use std::io::{BufRead, Write};

/// Splits on `\n`, trims, skips empty lines, JSON-decodes each remaining
/// line. `BufRead::lines()` already handles a trailing line with no
/// terminating newline, so no explicit flush step is needed.
pub fn decode(reader: impl BufRead + Send) -> impl Iterator<Item = DecodedRow> {
    reader.lines().enumerate().filter_map(|(idx, line)| {
        let line_number = idx as u64 + 1;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                return Some(DecodedRow {
                    line_number,
                    record: Err(CodecError::Io(e)),
                })
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let record = serde_json::from_str::<Row>(trimmed).map_err(|e| CodecError::Parse {
            line: line_number,
            message: e.to_string(),
        });
        Some(DecodedRow { line_number, record })
    })
}

pub struct NdjsonEncoder;

impl Encoder for NdjsonEncoder {
    fn write_row(&mut self, out: &mut dyn Write, row: &Row) -> Result<(), CodecError> {
        serde_json::to_writer(&mut *out, row).map_err(|e| CodecError::Parse {
            line: 0,
            message: e.to_string(),
        })?;
        out.write_all(b"\n").map_err(CodecError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_lines_skipping_blanks() {
        let input = "{\"a\":1}\n\n  \n{\"a\":2}\n";
        let rows: Vec<_> = decode(input.as_bytes()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(rows[1].line_number, 4);
    }

    #[test]
    fn bad_json_line_is_a_parse_error_not_fatal() {
        let input = "{\"a\":1}\nnot json\n{\"a\":2}\n";
        let rows: Vec<_> = decode(input.as_bytes()).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].record.is_err());
        assert!(rows[2].record.is_ok());
    }

    #[test]
    fn encoder_writes_one_json_object_per_line() {
        let mut out = Vec::new();
        let mut enc = NdjsonEncoder;
        let row: Row = serde_json::from_value(json!({"a": 1})).unwrap();
        enc.write_row(&mut out, &row).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\"a\":1}\n");
    }
}
