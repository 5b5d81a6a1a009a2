//! Constants Module - Single Source of Truth
//!
//! Defaults for every tunable the daemon exposes. Config structs and
//! reconnect/backoff loops read from here rather than hardcoding values.

// ============================================
// APPLICATION CONSTANTS
// ============================================

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent for webhook requests
pub const USER_AGENT: &str = concat!("dockployment/", env!("CARGO_PKG_VERSION"));

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "./dockployment.json";

// ============================================
// DOCKER CLI
// ============================================

/// Upper bound for a single docker command (seconds)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// stderr fragments meaning the daemon itself is unreachable
pub const DOCKER_UNAVAILABLE_MARKERS: [&str; 3] = [
    "Cannot connect to the Docker daemon",
    "error during connect",
    "Is the docker daemon running",
];

/// stderr fragment for missing images/containers
pub const DOCKER_NOT_FOUND_MARKER: &str = "No such";

// ============================================
// EVENT STREAM RECONNECTION
// ============================================

/// Reconnection base delay (milliseconds)
pub const EVENTS_RECONNECT_BASE_MS: u64 = 1000;

/// Maximum reconnection delay (milliseconds)
pub const EVENTS_RECONNECT_MAX_MS: u64 = 30000;

/// Consecutive failed connects before the watcher gives up
pub const EVENTS_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Buffer between the event reader task and the watcher loop
pub const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// An event stream that stayed up this long counts as a successful connect
pub const EVENTS_STABLE_SECS: u64 = 10;

// ============================================
// DEPLOYMENT
// ============================================

pub const DEFAULT_MAX_CONCURRENT_DEPLOYS: usize = 4;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STARTUP_GRACE_SECS: u64 = 3;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEALTH_POLL_MS: u64 = 1000;

/// How long shutdown waits for running deployments (seconds)
pub const SHUTDOWN_DRAIN_TIMEOUT_SECS: u64 = 120;

// ============================================
// RETRY POLICY
// ============================================

/// Retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base retry delay in milliseconds (doubles each attempt)
pub const DEFAULT_RETRY_BASE_MS: u64 = 1000;

/// Maximum retry delay in milliseconds
pub const DEFAULT_RETRY_MAX_MS: u64 = 30000;

/// Jitter percentage applied to each retry delay
pub const RETRY_JITTER_PERCENT: u64 = 20;

// ============================================
// WATCHER / HISTORY / API
// ============================================

pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 8750;

/// Default page size for `/v1/deployments`
pub const DEFAULT_DEPLOYMENTS_LIMIT: usize = 50;
