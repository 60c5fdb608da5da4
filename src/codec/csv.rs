//! CSV decode/encode (§4.4), built on the `csv` crate's incremental reader
//! and writer so escaping/quoting follows its behavior rather than a
//! hand-rolled rule.

use super::{DecodedRow, Encoder, Row};
use crate::error::CodecError;
use csv::{ReaderBuilder, WriterBuilder};
use serde_json::Value;
use std::io::{Read, Write};

/// Header row consumed first; each subsequent row becomes a map keyed by
/// header. Values are raw strings — no implicit type coercion beyond
/// trimming, which `csv::Trim::All` performs for us.
pub fn decode(reader: impl Read + Send) -> Result<impl Iterator<Item = DecodedRow>, CodecError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| CodecError::Parse {
            line: 1,
            message: e.to_string(),
        })?
        .iter()
        .map(|s| s.to_string())
        .collect();

    Ok(rdr.into_records().enumerate().filter_map(move |(idx, result)| {
        // Row 1 is the header; data rows start at 2.
        let line_number = idx as u64 + 2;
        match result {
            Err(e) => Some(DecodedRow {
                line_number,
                record: Err(CodecError::Parse {
                    line: line_number,
                    message: e.to_string(),
                }),
            }),
            Ok(string_record) => {
                if string_record.iter().all(|field| field.is_empty()) {
                    return None;
                }
                let mut map = Row::new();
                for (key, value) in headers.iter().zip(string_record.iter()) {
                    map.insert(key.clone(), Value::String(value.to_string()));
                }
                Some(DecodedRow {
                    line_number,
                    record: Ok(map),
                })
            }
        }
    }))
}

/// First record written establishes header order unless an explicit field
/// list was supplied; later records project those keys positionally.
pub struct CsvEncoder {
    header: Option<Vec<String>>,
    header_written: bool,
}

impl CsvEncoder {
    pub fn new(fields: Option<Vec<String>>) -> Self {
        Self {
            header: fields,
            header_written: false,
        }
    }

    fn cell(value: Option<&Value>) -> String {
        match value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn write_record(out: &mut dyn Write, fields: &[String]) -> Result<(), CodecError> {
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(out);
        wtr.write_record(fields).map_err(|e| CodecError::Parse {
            line: 0,
            message: e.to_string(),
        })?;
        wtr.flush().map_err(CodecError::Io)
    }
}

impl Encoder for CsvEncoder {
    fn write_row(&mut self, out: &mut dyn Write, row: &Row) -> Result<(), CodecError> {
        if self.header.is_none() {
            self.header = Some(row.keys().cloned().collect());
        }
        let header = self.header.clone().unwrap();

        if !self.header_written {
            Self::write_record(out, &header)?;
            self.header_written = true;
        }

        let values: Vec<String> = header.iter().map(|key| Self::cell(row.get(key))).collect();
        Self::write_record(out, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_rows_keyed_by_header() {
        let input = "name,age\nAda,30\nGrace,40\n";
        let rows: Vec<_> = decode(input.as_bytes()).unwrap().collect();
        assert_eq!(rows.len(), 2);
        let first = rows[0].record.as_ref().unwrap();
        assert_eq!(first.get("name").unwrap(), "Ada");
        assert_eq!(first.get("age").unwrap(), "30");
        assert_eq!(rows[0].line_number, 2);
    }

    #[test]
    fn skips_blank_lines() {
        let input = "name,age\nAda,30\n\nGrace,40\n";
        let rows: Vec<_> = decode(input.as_bytes()).unwrap().collect();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn encoder_quotes_values_containing_commas() {
        let mut out = Vec::new();
        let mut enc = CsvEncoder::new(None);
        let row: Row = serde_json::from_value(json!({"name": "Doe, Jane"})).unwrap();
        enc.write_row(&mut out, &row).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"Doe, Jane\""));
    }

    #[test]
    fn encoder_respects_explicit_field_list_and_order() {
        let mut out = Vec::new();
        let mut enc = CsvEncoder::new(Some(vec!["b".to_string(), "a".to_string()]));
        let row: Row = serde_json::from_value(json!({"a": 1, "b": 2})).unwrap();
        enc.write_row(&mut out, &row).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "b,a\n2,1\n");
    }
}
