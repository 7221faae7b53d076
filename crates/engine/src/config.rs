//! Engine and runner configuration (defaults + `KEEL_*` environment overrides).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FINALIZER: &str = "example.com/finalizer";
pub const DEFAULT_SELECTOR_KEY: &str = "app";

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Finalizer token the engine owns on every record.
    pub finalizer: String,
    /// Label key whose value is the record name; selects the workload's pods.
    pub selector_key: String,
    /// Delay of the drift-catching requeue after a converged pass.
    pub requeue_after: Duration,
    /// Upper bound for a single store call.
    pub call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            finalizer: DEFAULT_FINALIZER.to_string(),
            selector_key: DEFAULT_SELECTOR_KEY.to_string(),
            requeue_after: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            finalizer: env_string("KEEL_FINALIZER").unwrap_or(d.finalizer),
            selector_key: env_string("KEEL_SELECTOR_KEY").unwrap_or(d.selector_key),
            requeue_after: env_parse::<u64>("KEEL_REQUEUE_SECS").map(Duration::from_secs).unwrap_or(d.requeue_after),
            call_timeout: env_parse::<u64>("KEEL_CALL_TIMEOUT_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.call_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { workers: 4, backoff_base: Duration::from_millis(500), backoff_max: Duration::from_secs(300) }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse::<usize>("KEEL_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            backoff_base: env_parse::<u64>("KEEL_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_parse::<u64>("KEEL_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
        }
    }

    /// Delay before retrying a key that has failed `failures` times in a row (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.finalizer, "example.com/finalizer");
        assert_eq!(c.selector_key, "app");
        assert_eq!(c.requeue_after, Duration::from_secs(30));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let r = RunnerConfig { workers: 1, backoff_base: Duration::from_millis(100), backoff_max: Duration::from_secs(1) };
        assert_eq!(r.backoff(1), Duration::from_millis(100));
        assert_eq!(r.backoff(2), Duration::from_millis(200));
        assert_eq!(r.backoff(4), Duration::from_millis(800));
        assert_eq!(r.backoff(5), Duration::from_secs(1));
        assert_eq!(r.backoff(u32::MAX), Duration::from_secs(1));
    }
}
