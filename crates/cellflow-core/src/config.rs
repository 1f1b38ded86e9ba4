//! Orchestrator configuration.
//!
//! All timing knobs live here so hosts can tune them in one place.
//! Defaults match the behavior of the interactive notebook frontend:
//! a 150ms completion poll, a 30s per-unit ceiling, and a 500ms reload
//! debounce window.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the annotation channel the kernel writes output markers into.
///
/// Resolution is by exact match; a sibling highlighting channel with a
/// similar name must never be selected.
pub const DEFAULT_OUTPUT_CHANNEL: &str = "cellflow-output-marks";

/// TTL rule mapping a key pattern to a cache lifetime.
///
/// Patterns use `*` as a wildcard (e.g. `"kernel.*"`). The first matching
/// rule wins; unmatched keys fall back to [`OrchestratorConfig::default_ttl`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlRule {
    /// Key pattern with `*` wildcards.
    pub pattern: String,
    /// Lifetime for matching keys.
    pub ttl: Duration,
}

impl TtlRule {
    /// Create a new rule.
    pub fn new(pattern: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            ttl,
        }
    }
}

/// Configuration for the orchestration subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Interval between completion-channel polls.
    pub poll_interval: Duration,

    /// Per-unit completion ceiling; past it the run logs and continues.
    pub completion_timeout: Duration,

    /// Delay between a unit's completion and the next dispatch, letting
    /// the kernel's output rendering catch up.
    pub settle_delay: Duration,

    /// Minimum spacing between guarded reload entries.
    pub guard_debounce: Duration,

    /// Hard ceiling on nested reload depth.
    pub max_reload_depth: u32,

    /// Kernel tick interval (ms) applied while a guard is held.
    pub guarded_tick_interval_ms: u64,

    /// Debounce window for coalescing durable state flushes.
    pub flush_debounce: Duration,

    /// Path of the durable state file.
    pub state_path: PathBuf,

    /// Exact name of the output marker channel.
    pub output_channel: String,

    /// TTL rules for the shared cache.
    pub ttl_rules: Vec<TtlRule>,

    /// Cache lifetime for keys no rule matches.
    pub default_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(150),
            completion_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(200),
            guard_debounce: Duration::from_millis(500),
            max_reload_depth: 5,
            guarded_tick_interval_ms: 2_000,
            flush_debounce: Duration::from_millis(300),
            state_path: default_state_path(),
            output_channel: DEFAULT_OUTPUT_CHANNEL.to_string(),
            ttl_rules: vec![
                // Kernel lookups churn on restart; keep them short-lived.
                TtlRule::new("kernel.*", Duration::from_secs(30)),
                // Environment probes are expensive and stable.
                TtlRule::new("env.*", Duration::from_secs(300)),
            ],
            default_ttl: Duration::from_secs(60),
        }
    }
}

/// Default location of the durable state file.
///
/// `<user data dir>/cellflow/state.json`, falling back to the current
/// directory when no platform data dir is available.
pub fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cellflow")
        .join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert!(config.poll_interval < config.completion_timeout);
        assert!(config.max_reload_depth >= 1);
        assert!(config.state_path.ends_with("cellflow/state.json"));
    }
}
