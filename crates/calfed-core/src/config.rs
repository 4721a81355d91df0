//! Engine configuration.
//!
//! All knobs have production defaults; `from_env` overrides them from
//! `CALFED_*` environment variables, logging and keeping the default on a
//! malformed value instead of failing boot.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by the user actors, the mirror writer pool, and the
/// scheduling layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hold lifetime for scheduling proposals.
    pub hold_ttl_minutes: u32,
    /// Retryable mirror-write attempts before a mirror goes `FAILED`.
    pub mirror_max_attempts: u32,
    /// Backoff base delay for mirror retries.
    pub backoff_base_ms: u64,
    /// Backoff growth factor.
    pub backoff_factor: f64,
    /// Backoff delay cap.
    pub backoff_max_ms: u64,
    /// Pending mirror writes above which ingestion refuses new batches.
    pub queue_high_watermark: u64,
    /// Pending mirror writes below which ingestion resumes.
    pub queue_low_watermark: u64,
    /// Interval of the per-user sweeper (hold expiry, mirror retries).
    pub sweep_interval_seconds: u64,
    /// Per-operation deadline for user-actor calls.
    pub op_timeout_seconds: u64,
    /// Writer actors in the pool; jobs shard by target account.
    pub writer_shards: usize,
    /// Salt for participant hashes.
    pub participant_salt: String,
    /// Extended-property key marking another system's busy mirrors.
    pub external_mirror_tag: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_minutes: 10,
            mirror_max_attempts: 8,
            backoff_base_ms: 1_000,
            backoff_factor: 2.0,
            backoff_max_ms: 300_000, // 5 minutes
            queue_high_watermark: 256,
            queue_low_watermark: 64,
            sweep_interval_seconds: 60,
            op_timeout_seconds: 30,
            writer_shards: 4,
            participant_salt: "calfed-dev-salt".to_string(),
            external_mirror_tag: None,
        }
    }
}

impl EngineConfig {
    /// Build from the environment, falling back to defaults per knob.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hold_ttl_minutes: env_parsed("CALFED_HOLD_TTL_MINUTES", defaults.hold_ttl_minutes),
            mirror_max_attempts: env_parsed(
                "CALFED_MIRROR_MAX_ATTEMPTS",
                defaults.mirror_max_attempts,
            ),
            backoff_base_ms: env_parsed("CALFED_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_factor: env_parsed("CALFED_BACKOFF_FACTOR", defaults.backoff_factor),
            backoff_max_ms: env_parsed("CALFED_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            queue_high_watermark: env_parsed(
                "CALFED_QUEUE_HIGH_WATERMARK",
                defaults.queue_high_watermark,
            ),
            queue_low_watermark: env_parsed(
                "CALFED_QUEUE_LOW_WATERMARK",
                defaults.queue_low_watermark,
            ),
            sweep_interval_seconds: env_parsed(
                "CALFED_SWEEP_INTERVAL_SECONDS",
                defaults.sweep_interval_seconds,
            ),
            op_timeout_seconds: env_parsed(
                "CALFED_OP_TIMEOUT_SECONDS",
                defaults.op_timeout_seconds,
            ),
            writer_shards: env_parsed("CALFED_WRITER_SHARDS", defaults.writer_shards).max(1),
            participant_salt: env::var("CALFED_PARTICIPANT_SALT")
                .unwrap_or(defaults.participant_salt),
            external_mirror_tag: env::var("CALFED_EXTERNAL_MIRROR_TAG").ok(),
        }
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.hold_ttl_minutes) * 60)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_seconds)
    }
}

fn env_parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.mirror_max_attempts, 8);
        assert_eq!(config.hold_ttl(), Duration::from_secs(600));
        assert!(config.queue_low_watermark < config.queue_high_watermark);
    }
}
