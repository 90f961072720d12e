//! Worker pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Shortest period accepted for the background loops
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of base workers
    pub workers: usize,

    /// Shared queue slots per base worker
    pub queue_capacity_per_worker: usize,

    /// How often the retry buffer drainer runs
    #[serde(with = "duration_millis")]
    pub drain_interval: Duration,

    /// How often the status reporter logs queue state
    #[serde(with = "duration_millis")]
    pub status_interval: Duration,

    /// How long an idle replacement worker lingers before retiring
    #[serde(with = "duration_millis")]
    pub replacement_idle_timeout: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Failed tasks remembered per pool
    pub failed_task_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_capacity_per_worker: 1000,
            drain_interval: Duration::from_secs(10),
            status_interval: Duration::from_secs(10),
            replacement_idle_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            failed_task_capacity: 1000,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with the given number of base workers
    pub fn new(workers: usize) -> Self {
        Self::default().with_workers(workers)
    }

    /// Load configuration from `FILEVAULT_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(workers) = parse_var(&lookup, "FILEVAULT_WORKERS")? {
            config = config.with_workers(workers as usize);
        }
        if let Some(capacity) = parse_var(&lookup, "FILEVAULT_QUEUE_CAPACITY")? {
            config = config.with_queue_capacity_per_worker(capacity as usize);
        }
        if let Some(ms) = parse_interval(&lookup, "FILEVAULT_DRAIN_INTERVAL_MS")? {
            config = config.with_drain_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_interval(&lookup, "FILEVAULT_STATUS_INTERVAL_MS")? {
            config = config.with_status_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, "FILEVAULT_SHUTDOWN_TIMEOUT_MS")? {
            config = config.with_shutdown_timeout(Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// Set the number of base workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the shared queue slots per base worker
    pub fn with_queue_capacity_per_worker(mut self, capacity: usize) -> Self {
        self.queue_capacity_per_worker = capacity.max(1);
        self
    }

    /// Set the retry buffer drain interval, at least [`MIN_INTERVAL`]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Set the status reporter interval, at least [`MIN_INTERVAL`]
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Set how long idle replacement workers linger
    pub fn with_replacement_idle_timeout(mut self, timeout: Duration) -> Self {
        self.replacement_idle_timeout = timeout;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the failed task capacity per pool
    pub fn with_failed_task_capacity(mut self, capacity: usize) -> Self {
        self.failed_task_capacity = capacity;
        self
    }

    /// Capacity of the shared queue
    pub fn queue_capacity(&self) -> usize {
        self.workers * self.queue_capacity_per_worker
    }
}

fn parse_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Like [`parse_var`], but a zero period is rejected
fn parse_interval(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match parse_var(lookup, name)? {
        Some(0) => Err(ConfigError::InvalidValue {
            name,
            value: "0".to_string(),
        }),
        ms => Ok(ms),
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
