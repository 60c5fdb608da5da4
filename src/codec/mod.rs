//! Streaming codec layer (§4.4): bounded-memory decoders and encoders for
//! the three wire formats, plus the batching/metering transforms the import
//! and export pipelines share.
//!
//! Decoding and encoding are deliberately synchronous (`std::io::{Read,
//! Write}`) — the `csv` crate's incremental reader and `BufRead::lines()`
//! already stream a row at a time without materializing the whole file, and
//! driving them from async code is a matter of running them on a blocking
//! task (`tokio::task::spawn_blocking`), not rewriting them as `Stream`s.

pub mod csv;
pub mod json_array;
pub mod ndjson;

use crate::error::CodecError;
use crate::model::FileFormat;
use serde_json::{Map, Value};
use std::io::{BufRead, Read, Write};
use std::time::{Duration, Instant};

/// A decoded/encoded row — `serde_json::Value` restricted to its `Object`
/// variant. `Value`'s own shape already is the tagged sum a record needs;
/// no parallel enum is introduced.
pub type Row = Map<String, Value>;

/// One item out of a decoder: a 1-based position plus either the row or the
/// parse failure at that position. A parse failure does not stop decoding —
/// callers fold it into a [`crate::model::JobErrorEntry`] and move on.
#[derive(Debug)]
pub struct DecodedRow {
    pub line_number: u64,
    pub record: Result<Row, CodecError>,
}

/// Dispatches to the decoder for `format`. Returns a boxed iterator so
/// callers don't need to know which concrete decoder produced it.
///
/// For JSON array input this reads the whole buffer up front (the format
/// requires seeing the closing bracket before anything can be parsed); for
/// ndjson/CSV each item is produced from the next unread line.
pub fn decode_stream(
    format: FileFormat,
    reader: impl BufRead + Send + 'static,
) -> Result<Box<dyn Iterator<Item = DecodedRow> + Send>, CodecError> {
    match format {
        FileFormat::Ndjson => Ok(Box::new(ndjson::decode(reader))),
        FileFormat::Csv => Ok(Box::new(csv::decode(reader)?)),
        FileFormat::Json => Ok(Box::new(json_array::decode(reader)?.into_iter())),
    }
}

/// Incremental encoder for one of the three wire formats. `start`/`finish`
/// bracket the stream (only meaningful for JSON array); `write_row` is
/// called once per record in order.
pub trait Encoder {
    fn start(&mut self, _out: &mut dyn Write) -> Result<(), CodecError> {
        Ok(())
    }
    fn write_row(&mut self, out: &mut dyn Write, row: &Row) -> Result<(), CodecError>;
    fn finish(&mut self, _out: &mut dyn Write) -> Result<(), CodecError> {
        Ok(())
    }
}

pub fn encoder_for(format: FileFormat, fields: Option<Vec<String>>) -> Box<dyn Encoder + Send> {
    match format {
        FileFormat::Ndjson => Box::new(ndjson::NdjsonEncoder),
        FileFormat::Csv => Box::new(csv::CsvEncoder::new(fields)),
        FileFormat::Json => Box::new(json_array::JsonArrayEncoder::new()),
    }
}

/// Groups an iterator into fixed-size batches, flushing a final partial
/// batch at end of input (§4.4).
pub struct Batcher<I: Iterator> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Batcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.size);
        for item in self.inner.by_ref().take(self.size) {
            batch.push(item);
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

pub trait IteratorBatchExt: Iterator + Sized {
    fn batched(self, size: usize) -> Batcher<Self> {
        Batcher { inner: self, size }
    }
}

impl<I: Iterator> IteratorBatchExt for I {}

/// Pass-through `Read` wrapper tracking total bytes read (§4.4 byte counter).
pub struct ByteCountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> ByteCountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn bytes_read(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for ByteCountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// A periodic throughput report (§4.4 metrics meter).
#[derive(Clone, Copy, Debug)]
pub struct MetricsReport {
    pub total_rows: u64,
    pub rows_per_second_since_last: f64,
    pub elapsed_ms: u64,
}

/// Counts rows and invokes `callback` at most once per `interval`, plus a
/// final report when [`MetricsMeter::finish`] is called.
pub struct MetricsMeter<F: FnMut(MetricsReport)> {
    total_rows: u64,
    rows_since_last_report: u64,
    started: Instant,
    last_report_at: Instant,
    interval: Duration,
    callback: F,
}

impl<F: FnMut(MetricsReport)> MetricsMeter<F> {
    pub fn new(interval: Duration, callback: F) -> Self {
        let now = Instant::now();
        Self {
            total_rows: 0,
            rows_since_last_report: 0,
            started: now,
            last_report_at: now,
            interval,
            callback,
        }
    }

    pub fn record(&mut self, rows: u64) {
        self.total_rows += rows;
        self.rows_since_last_report += rows;
        if self.last_report_at.elapsed() >= self.interval {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let elapsed_since_last = self.last_report_at.elapsed();
        let rows_per_second_since_last = if elapsed_since_last.as_secs_f64() > 0.0 {
            self.rows_since_last_report as f64 / elapsed_since_last.as_secs_f64()
        } else {
            0.0
        };
        (self.callback)(MetricsReport {
            total_rows: self.total_rows,
            rows_per_second_since_last,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
        self.rows_since_last_report = 0;
        self.last_report_at = Instant::now();
    }

    /// Emits one last report regardless of whether `interval` has elapsed.
    pub fn finish(&mut self) {
        self.flush();
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batcher_flushes_final_partial_batch() {
        let batches: Vec<Vec<i32>> = (1..=7).batched(3).collect();
        assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[test]
    fn batcher_empty_input_yields_no_batches() {
        let batches: Vec<Vec<i32>> = std::iter::empty::<i32>().batched(3).collect();
        assert!(batches.is_empty());
    }

    #[test]
    fn byte_counting_reader_tracks_total() {
        let data = b"hello world".to_vec();
        let mut reader = ByteCountingReader::new(&data[..]);
        let mut buf = [0u8; 5];
        reader.read(&mut buf).unwrap();
        reader.read(&mut buf).unwrap();
        assert_eq!(reader.bytes_read(), 10);
    }

    #[test]
    fn metrics_meter_reports_final_total_on_finish() {
        let mut reports = Vec::new();
        let mut meter = MetricsMeter::new(Duration::from_secs(3600), |r| reports.push(r));
        meter.record(10);
        meter.record(5);
        meter.finish();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total_rows, 15);
    }
}
