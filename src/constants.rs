pub const TASK_TX_ERR: &str = "Failed to send task to res_tx";

pub const DEFAULT_MEMORY_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_STDERR_CAPTURE_BYTES: usize = 64 * 1024;
/// Programs writing more than this to stdout are killed.
pub const DEFAULT_STDOUT_CAPTURE_BYTES: usize = 256 * 1024 * 1024;

/// Ceiling for runs whose limits are still unknown (calibration samples).
pub const PROVISIONAL_TIME_LIMIT_MS: u64 = 60_000;
pub const PROVISIONAL_MEMORY_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

/// Ceiling for sanitizer and checker runs.
pub const TOOL_TIME_LIMIT_MS: u64 = 10_000;
pub const TOOL_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;

pub const TIME_GRANULARITY_MS: u64 = 100;
pub const MEMORY_GRANULARITY_BYTES: u64 = 1024 * 1024;

/// Limit search stops once the bracket is narrower than this share of its upper end.
pub const LIMIT_SEARCH_RATIO: f64 = 0.05;

pub const DEFAULT_SAFETY_MULTIPLIER: f64 = 1.5;
