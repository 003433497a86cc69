//! Worker configuration — environment-sourced settings with defaults
//!
//! The agent is configured entirely through environment variables so it can
//! run unattended next to an arbitrary model server. All values have
//! defaults suitable for local development.

use std::path::PathBuf;
use std::time::Duration;

/// Seconds between readiness-poll attempts during calibration.
pub const HEALTHCHECK_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Seconds between periodic health probes once calibrated.
pub const HEALTHCHECK_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Per-probe timeout for health checks.
pub const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for fetching the autoscaler public key.
pub const PUBKEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Total pubkey fetch failures tolerated before downgrading to unsecured.
pub const MAX_PUBKEY_FETCH_ATTEMPTS: u32 = 3;
/// Seconds between autoscaler status reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(2);
/// Delay between delete-notification retry cycles.
pub const DELETE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Worker agent configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the model server this agent fronts
    pub model_server_url: String,
    /// Health endpoint path on the backend; `None` disables health polling
    pub healthcheck_endpoint: Option<String>,
    /// Whether the backend handles parallel requests
    pub allow_parallel_requests: bool,
    /// Maximum estimated queue wait before rejecting with 429
    pub max_wait_time: f64,
    /// Initial-boot readiness timeout in seconds (model may need downloading)
    pub ready_timeout: u64,
    /// Resume readiness timeout in seconds (weights already on disk)
    pub resume_ready_timeout: u64,
    /// Signature verification disabled by operator
    pub unsecured: bool,
    /// Autoscaler address for key fetch, reports and delete notifications
    pub report_addr: String,
    /// Worker identity token included in reports
    pub mtoken: String,
    /// Numeric worker id included in reports
    pub worker_id: i64,
    /// Externally visible URL of this worker, echoed in reports
    pub worker_url: String,
    /// Name of a registered benchmark function, if any
    pub benchmark: Option<String>,
    /// Consecutive health-probe failures before declaring the backend errored
    pub healthcheck_consecutive_failures: u32,
    /// Listen address for the agent's own HTTP server
    pub listen_addr: String,
    /// Path of the persisted benchmark result
    pub benchmark_file: PathBuf,
}

impl WorkerConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            model_server_url: env_or("MODEL_SERVER_URL", "http://localhost:8000"),
            healthcheck_endpoint: std::env::var("HEALTHCHECK_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty()),
            allow_parallel_requests: env_bool("ALLOW_PARALLEL", true),
            max_wait_time: env_parse("MAX_WAIT_TIME", 10.0),
            ready_timeout: env_parse("READY_TIMEOUT", 1200),
            resume_ready_timeout: env_parse("RESUME_READY_TIMEOUT", 120),
            unsecured: env_bool("UNSECURED", false),
            report_addr: env_or("REPORT_ADDR", "https://run.vast.ai"),
            mtoken: env_or("MASTER_TOKEN", ""),
            worker_id: env_parse("WORKER_ID", 0),
            worker_url: env_or("WORKER_URL", ""),
            benchmark: std::env::var("BENCHMARK").ok().filter(|s| !s.is_empty()),
            healthcheck_consecutive_failures: env_parse("HEALTHCHECK_CONSECUTIVE_FAILURES", 3),
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:3000"),
            benchmark_file: PathBuf::from(env_or("BENCHMARK_FILE", ".max_throughput")),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model_server_url: "http://localhost:8000".to_string(),
            healthcheck_endpoint: None,
            allow_parallel_requests: true,
            max_wait_time: 10.0,
            ready_timeout: 1200,
            resume_ready_timeout: 120,
            unsecured: false,
            report_addr: "https://run.vast.ai".to_string(),
            mtoken: String::new(),
            worker_id: 0,
            worker_url: String::new(),
            benchmark: None,
            healthcheck_consecutive_failures: 3,
            listen_addr: "0.0.0.0:3000".to_string(),
            benchmark_file: PathBuf::from(".max_throughput"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => parse_bool(&v, default),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse a boolean the way the deploy tooling writes it ("true"/"false",
/// any casing). Anything unrecognized falls back to the default.
fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => default,
    }
}
