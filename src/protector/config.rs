//! Tunables for the monitor.
//!
//! Defaults are the reference tuning. Hosts that need different values can
//! deserialize a JSON document; every field is optional and durations are
//! given in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Result;

/// Iterations of the timing-probe workload
const DEFAULT_TIMING_WORKLOAD: u32 = 10_000;

/// Wall-clock budget for the timing workload before it counts as an anomaly
const DEFAULT_TIMING_THRESHOLD: Duration = Duration::from_millis(10);

/// How long an emulator verdict stays valid
const DEFAULT_EMULATOR_CACHE_TTL: Duration = Duration::from_secs(60);

/// Size of each leaked noise buffer
const DEFAULT_NOISE_BUFFER_SIZE: usize = 1024;

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Sleep between ticks at level 3
    #[serde(with = "millis")]
    pub maximum_interval: Duration,
    /// Sleep between ticks at level 2
    #[serde(with = "millis")]
    pub enhanced_interval: Duration,
    /// Sleep between ticks at level 1
    #[serde(with = "millis")]
    pub normal_interval: Duration,

    /// Emulator and virtualization probes run on every Nth tick
    pub heavy_probe_every: u64,
    /// Timing probe runs on every Nth tick
    pub timing_probe_every: u64,
    /// Identity spoofing runs on every Nth tick that saw a threat
    pub spoof_every: u64,

    /// Iterations of the timing workload
    pub timing_workload: u32,
    /// Threshold above which the timing workload is considered slowed down.
    /// Hardware-dependent; slow devices need a larger value.
    #[serde(with = "millis")]
    pub timing_threshold: Duration,

    #[serde(with = "millis")]
    pub emulator_cache_ttl: Duration,

    pub noise_buffer_size: usize,

    /// Raise the level from 1 to 2 the first time the loop sees a threat
    pub escalate_on_threat: bool,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        ProtectionConfig {
            maximum_interval: Duration::from_millis(100),
            enhanced_interval: Duration::from_millis(200),
            normal_interval: Duration::from_millis(300),
            heavy_probe_every: 10,
            timing_probe_every: 5,
            spoof_every: 20,
            timing_workload: DEFAULT_TIMING_WORKLOAD,
            timing_threshold: DEFAULT_TIMING_THRESHOLD,
            emulator_cache_ttl: DEFAULT_EMULATOR_CACHE_TTL,
            noise_buffer_size: DEFAULT_NOISE_BUFFER_SIZE,
            escalate_on_threat: false,
        }
    }
}

impl ProtectionConfig {
    /// Parse a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProtectionConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Replace zero cadences with 1 so the modulo schedule stays defined.
    pub(crate) fn sanitized(mut self) -> Self {
        self.heavy_probe_every = self.heavy_probe_every.max(1);
        self.timing_probe_every = self.timing_probe_every.max(1);
        self.spoof_every = self.spoof_every.max(1);
        self
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_tuning() {
        let config = ProtectionConfig::default();
        assert_eq!(config.maximum_interval, Duration::from_millis(100));
        assert_eq!(config.enhanced_interval, Duration::from_millis(200));
        assert_eq!(config.normal_interval, Duration::from_millis(300));
        assert_eq!(config.timing_threshold, Duration::from_millis(10));
        assert_eq!(config.emulator_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.noise_buffer_size, 1024);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ProtectionConfig::from_json(r#"{ "timing_threshold": 45, "spoof_every": 0 }"#)
            .expect("valid config");

        assert_eq!(config.timing_threshold, Duration::from_millis(45));
        assert_eq!(config.spoof_every, 1, "zero cadence must be clamped");
        assert_eq!(config.normal_interval, Duration::from_millis(300));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = ProtectionConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
