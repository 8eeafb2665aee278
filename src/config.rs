//! Runtime configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it changes:
//!
//! ```
//! use echowire::config::Config;
//!
//! let config = Config::from_json_str(r#"{ "max_call_depth": 4, "log_level": "warn" }"#).unwrap();
//! assert_eq!(config.max_call_depth, 4);
//! assert_eq!(config.max_node_depth, 16);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EchowireError, Result};
use crate::logging::LogLevel;

/// Default max services from root to any echo.
pub const DEFAULT_MAX_NODE_DEPTH: u64 = 16;

/// Default max transitive call depth.
pub const DEFAULT_MAX_CALL_DEPTH: u64 = 16;

/// Default workers per slot.
pub const DEFAULT_WORKERS_PER_SLOT: usize = 8192;

/// Default workers examined per sweeper pass.
pub const DEFAULT_GC_SWEEP_BATCH: usize = 4096;

/// Default sweeper cadence in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 16;

/// Default indicator tick in milliseconds.
pub const DEFAULT_QPS_INTERVAL_MS: u64 = 1000;

/// Default max inbound message size (64 MiB).
pub const DEFAULT_READ_LIMIT: usize = 64 * 1024 * 1024;

/// Default per-read deadline in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 60_000;

/// Default per-connection outbound queue.
pub const DEFAULT_REPLY_CHANNEL_CAPACITY: usize = 1024;

/// Default wait for room in a full outbound queue, in milliseconds.
pub const DEFAULT_REPLY_SEND_TIMEOUT_MS: u64 = 5_000;

const MIN_SLOTS: usize = 4;
const MAX_SLOTS: usize = 128;

/// Processor, transport and logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_node_depth: u64,
    pub max_call_depth: u64,
    /// Derived from the CPU count when `None`.
    pub num_slots: Option<usize>,
    pub workers_per_slot: usize,
    pub gc_sweep_batch: usize,
    pub sweep_interval_ms: u64,
    pub qps_interval_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub read_limit: usize,
    pub read_timeout_ms: u64,
    pub reply_channel_capacity: usize,
    /// How long a worker waits on a full outbound queue before the
    /// connection is closed.
    pub reply_send_timeout_ms: u64,
    /// Record `from` origins in every indicator.
    pub capture_origins: bool,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_node_depth: DEFAULT_MAX_NODE_DEPTH,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            num_slots: None,
            workers_per_slot: DEFAULT_WORKERS_PER_SLOT,
            gc_sweep_batch: DEFAULT_GC_SWEEP_BATCH,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            qps_interval_ms: DEFAULT_QPS_INTERVAL_MS,
            read_limit: DEFAULT_READ_LIMIT,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            reply_channel_capacity: DEFAULT_REPLY_CHANNEL_CAPACITY,
            reply_send_timeout_ms: DEFAULT_REPLY_SEND_TIMEOUT_MS,
            capture_origins: false,
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the processor cannot run with.
    pub fn validate(&self) -> Result<()> {
        let zero =
            |name: &str| Err(EchowireError::Config(format!("{name} must be greater than zero")));

        if self.num_slots == Some(0) {
            return zero("num_slots");
        }
        if self.workers_per_slot == 0 {
            return zero("workers_per_slot");
        }
        if self.gc_sweep_batch == 0 {
            return zero("gc_sweep_batch");
        }
        if self.sweep_interval_ms == 0 {
            return zero("sweep_interval_ms");
        }
        if self.qps_interval_ms == 0 {
            return zero("qps_interval_ms");
        }
        if self.read_timeout_ms == 0 {
            return zero("read_timeout_ms");
        }
        if self.reply_channel_capacity == 0 {
            return zero("reply_channel_capacity");
        }
        if self.reply_send_timeout_ms == 0 {
            return zero("reply_send_timeout_ms");
        }
        Ok(())
    }

    /// Slot count: the configured value, or `clamp(cpus * 4, 4, 128)`.
    pub fn resolved_num_slots(&self) -> usize {
        self.num_slots.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (cpus * 4).clamp(MIN_SLOTS, MAX_SLOTS)
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn qps_interval(&self) -> Duration {
        Duration::from_millis(self.qps_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reply_send_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_send_timeout_ms)
    }

    pub fn with_max_node_depth(mut self, depth: u64) -> Self {
        self.max_node_depth = depth;
        self
    }

    pub fn with_max_call_depth(mut self, depth: u64) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_num_slots(mut self, slots: usize) -> Self {
        self.num_slots = Some(slots);
        self
    }

    pub fn with_workers_per_slot(mut self, workers: usize) -> Self {
        self.workers_per_slot = workers;
        self
    }

    pub fn with_gc_sweep_batch(mut self, batch: usize) -> Self {
        self.gc_sweep_batch = batch;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_qps_interval(mut self, interval: Duration) -> Self {
        self.qps_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reply_channel_capacity(mut self, capacity: usize) -> Self {
        self.reply_channel_capacity = capacity;
        self
    }

    pub fn with_reply_send_timeout(mut self, timeout: Duration) -> Self {
        self.reply_send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_capture_origins(mut self, capture: bool) -> Self {
        self.capture_origins = capture;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}
