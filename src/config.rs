use std::time::Duration;

/// Process-wide configuration for the job engine.
///
/// Built with documented defaults and adjusted with `with_*` builder methods,
/// the same convention the lock/job-scheduling layer this crate grew out of
/// used for `JobConfig`. [`EngineConfig::from_env`] reads `IMPORT_EXPORT_*`
/// variables on top of the same defaults, so a host binary never has to
/// duplicate the defaults table.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// TTL for the per-job distributed lock (§4.1, §4.8: default 5 minutes).
    pub lock_ttl: Duration,
    /// Number of retries `LockManager::acquire` performs before giving up.
    pub lock_acquire_retries: u32,
    /// Delay between lock acquire retries.
    pub lock_retry_delay: Duration,
    /// Interval between stale-job recovery sweeps (default 5 minutes).
    pub stale_sweep_interval: Duration,
    /// A job in PROCESSING longer than this without a lock is considered stale.
    pub stale_threshold: Duration,
    /// A job whose lock is older than this (regardless of status) is considered stale.
    pub stale_lock_threshold: Duration,
    /// Whether stale-job recovery resets PROCESSING jobs to PENDING (true) or fails them.
    pub restart_stale_jobs: bool,
    /// Row batch size for both the upsert engine and the export pagination.
    pub batch_size: usize,
    /// Flush progress counters to the store every N batches.
    pub progress_flush_every_batches: u32,
    /// Number of worker slots (concurrent jobs) this process runs.
    pub worker_slots: usize,
    /// Maximum accepted upload size for an import file.
    pub max_file_size_bytes: u64,
    /// Maximum number of `JobErrorEntry` records retained per job (I5).
    pub max_stored_errors: usize,
    /// Expiry duration for presigned export download URLs.
    pub download_url_ttl: Duration,
    /// A download URL is refreshed once less than this remains before expiry.
    pub download_url_refresh_margin: Duration,
    /// Interval at which the metrics meter reports throughput.
    pub metrics_report_interval: Duration,
    /// Multipart upload part size for object storage writes.
    pub upload_part_size_bytes: usize,
    /// Maximum concurrent multipart upload parts in flight.
    pub upload_max_concurrent_parts: usize,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5 * 60),
            lock_acquire_retries: 0,
            lock_retry_delay: Duration::from_millis(250),
            stale_sweep_interval: Duration::from_secs(5 * 60),
            stale_threshold: Duration::from_secs(30 * 60),
            stale_lock_threshold: Duration::from_secs(10 * 60),
            restart_stale_jobs: true,
            batch_size: 1000,
            progress_flush_every_batches: 10,
            worker_slots: 2,
            max_file_size_bytes: 500 * 1024 * 1024,
            max_stored_errors: 100,
            download_url_ttl: Duration::from_secs(24 * 60 * 60),
            download_url_refresh_margin: Duration::from_secs(60 * 60),
            metrics_report_interval: Duration::from_secs(5),
            upload_part_size_bytes: 5 * 1024 * 1024,
            upload_max_concurrent_parts: 4,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_restart_stale_jobs(mut self, restart: bool) -> Self {
        self.restart_stale_jobs = restart;
        self
    }

    /// Reads overrides from `IMPORT_EXPORT_*` environment variables, falling
    /// back to [`EngineConfig::new`]'s defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::new();
        if let Some(v) = env_u64("IMPORT_EXPORT_LOCK_TTL_SECS") {
            cfg.lock_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("IMPORT_EXPORT_STALE_THRESHOLD_SECS") {
            cfg.stale_threshold = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("IMPORT_EXPORT_STALE_LOCK_THRESHOLD_SECS") {
            cfg.stale_lock_threshold = Duration::from_secs(v);
        }
        if let Some(v) = env_bool("IMPORT_EXPORT_RESTART_STALE_JOBS") {
            cfg.restart_stale_jobs = v;
        }
        if let Some(v) = env_usize("IMPORT_EXPORT_BATCH_SIZE") {
            cfg.batch_size = v;
        }
        if let Some(v) = env_usize("IMPORT_EXPORT_WORKER_SLOTS") {
            cfg.worker_slots = v;
        }
        if let Some(v) = env_u64("IMPORT_EXPORT_MAX_FILE_SIZE_BYTES") {
            cfg.max_file_size_bytes = v;
        }
        cfg
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
