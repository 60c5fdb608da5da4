use thiserror::Error;

/// Errors raised by the distributed lock backend.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
    #[error("lock refresh failed for key {0:?}: lease lost")]
    RefreshLost(String),
}

/// Errors raised by the job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),
    #[error("status is {actual}, expected {expected}")]
    UnexpectedStatus { expected: String, actual: String },
    #[error("idempotency key {0:?} already in use")]
    DuplicateIdempotencyKey(String),
}

/// Errors raised by the streaming codec layer.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("line {line}: {message}")]
    Parse { line: u64, message: String },
    #[error("input is not a JSON array")]
    NotAnArray,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the upsert engine at the transaction level (not per-row).
#[derive(Error, Debug)]
pub enum UpsertError {
    #[error("transaction failed: {0}")]
    Transaction(String),
}

/// Errors raised by the export query/encode/upload pipeline.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("encode failed: {0}")]
    Encode(#[from] CodecError),
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Errors raised by object storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object storage error: {0}")]
    Backend(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

/// Top-level error surfaced by the job orchestrator to its caller (the queue layer).
///
/// Only fatal, job-aborting conditions become an `EngineError`; per-row and
/// per-batch failures are absorbed into `JobErrorEntry`s on the job record
/// (see [`crate::model::JobErrorEntry`]).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Upsert(#[from] UpsertError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("file too large: {size} bytes exceeds cap of {cap} bytes")]
    FileTooLarge { size: u64, cap: u64 },
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
