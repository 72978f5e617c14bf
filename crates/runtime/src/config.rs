//! Runtime configuration.
//!
//! What looks global in a deployment (region, peer function name,
//! timeouts) is per-worker configuration injected at construction.

use serde::{Deserialize, Serialize};
use teal_vm::ExecutionLimits;

/// Default wall-clock timeout for `wait_for_finish`, in seconds.
pub const DEFAULT_FIXED_TIMEOUT_SECS: u64 = 5;

/// Default polling period for `wait_for_finish`, in seconds.
pub const DEFAULT_CHECK_PERIOD_SECS: f64 = 1.0;

/// Default time to wait for the session lock, in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default advisory lock lease, in milliseconds. A crashed worker's
/// lock becomes stealable after this long.
pub const DEFAULT_LOCK_LEASE_MS: u64 = 30_000;

/// Default in-process worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Per-worker runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Deployment region selector, when relevant to the dispatcher
    pub region: Option<String>,

    /// Name of the peer function invoked to resume threads remotely
    pub resume_fn_name: String,

    /// Fallback `wait_for_finish` timeout when a request carries none
    pub fixed_timeout_secs: u64,

    /// Opt-in structured logging
    pub enable_logging: bool,

    /// Record per-step probe logs on every thread
    pub enable_probes: bool,

    /// VM execution limits
    pub limits: ExecutionLimits,

    /// How long to wait for the session lock
    pub lock_timeout_ms: u64,

    /// Advisory lock lease
    pub lock_lease_ms: u64,

    /// In-process worker pool size
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            region: None,
            resume_fn_name: "resume".to_string(),
            fixed_timeout_secs: DEFAULT_FIXED_TIMEOUT_SECS,
            enable_logging: false,
            enable_probes: true,
            limits: ExecutionLimits::default(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_lease_ms: DEFAULT_LOCK_LEASE_MS,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl RuntimeConfig {
    /// Builds a configuration from the environment, falling back to
    /// defaults: `TEAL_REGION`, `TEAL_RESUME_FN`, `TEAL_FIXED_TIMEOUT`
    /// (seconds), `TEAL_ENABLE_LOGGING`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(region) = std::env::var("TEAL_REGION") {
            if !region.is_empty() {
                config.region = Some(region);
            }
        }
        if let Ok(name) = std::env::var("TEAL_RESUME_FN") {
            if !name.is_empty() {
                config.resume_fn_name = name;
            }
        }
        if let Ok(timeout) = std::env::var("TEAL_FIXED_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                config.fixed_timeout_secs = secs;
            }
        }
        if let Ok(flag) = std::env::var("TEAL_ENABLE_LOGGING") {
            config.enable_logging = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        config
    }

    /// Installs the global tracing subscriber when logging is enabled.
    /// `RUST_LOG` refines the filter; repeated calls are harmless.
    pub fn init_logging(&self) {
        if !self.enable_logging {
            return;
        }
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}
