//! Engine tuning knobs.
//!
//! Every field has a default, so a config file only needs to name the values it
//! overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct SyncConfig {
    /// Period of the clock-sync round over all players.
    pub clock_sync_interval_ms: u64,
    /// Outstanding pings older than this are forgotten.
    pub ping_timeout_ms: u64,
    /// Latency samples kept per client.
    pub latency_history: usize,
    /// Upper bound on the preload barrier.
    pub readiness_timeout_ms: u64,
    /// Lead time every scheduled play gets regardless of latency.
    pub minimum_buffer_ms: u64,
    /// Multiplier on the worst observed one-way latency.
    pub latency_safety_factor: f64,
    /// Lead time for pause commands.
    pub pause_buffer_ms: u64,
    pub drift_check_interval_ms: u64,
    /// Reported drift beyond this is logged as a warning.
    pub drift_warn_threshold_ms: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            clock_sync_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            latency_history: 10,
            readiness_timeout_ms: 3_000,
            minimum_buffer_ms: 500,
            latency_safety_factor: 3.0,
            pause_buffer_ms: 100,
            drift_check_interval_ms: 5_000,
            drift_warn_threshold_ms: 250.0,
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file, filling unspecified fields with defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.latency_history > 0, "latency_history must be at least 1");
        anyhow::ensure!(
            self.latency_safety_factor.is_finite() && self.latency_safety_factor >= 1.0,
            "latency_safety_factor must be a finite value >= 1.0"
        );
        anyhow::ensure!(
            self.clock_sync_interval_ms > 0 && self.drift_check_interval_ms > 0,
            "loop intervals must be non-zero"
        );
        Ok(())
    }

    pub fn clock_sync_interval(&self) -> Duration {
        Duration::from_millis(self.clock_sync_interval_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn drift_check_interval(&self) -> Duration {
        Duration::from_millis(self.drift_check_interval_ms)
    }

    /// Lead time for a play command given the worst one-way latency among
    /// its targets. Grows with `worst_latency_ms` and never drops below
    /// `minimum_buffer_ms`.
    pub fn coordination_buffer_ms(&self, worst_latency_ms: f64) -> i64 {
        let scaled = worst_latency_ms.max(0.0) * self.latency_safety_factor;
        self.minimum_buffer_ms as i64 + scaled.ceil() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "minimum_buffer_ms": 800 }"#).unwrap();
        assert_eq!(config.minimum_buffer_ms, 800);
        assert_eq!(config.readiness_timeout_ms, 3_000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<SyncConfig>(r#"{ "bogus": 1 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn buffer_never_below_minimum_and_grows_with_latency() {
        let config = SyncConfig::default();
        assert_eq!(config.coordination_buffer_ms(0.0), 500);
        assert!(config.coordination_buffer_ms(10.0) > config.coordination_buffer_ms(0.0));
        assert!(config.coordination_buffer_ms(250.0) > 1_000);
        assert!(config.coordination_buffer_ms(250.0) >= (250.0 * 3.0) as i64);
    }

    #[test]
    fn validate_rejects_zero_history() {
        let config = SyncConfig {
            latency_history: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
