use crate::error::StreamError;
use failure::{Error, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How I/Q samples are laid out in the 32-bit payload words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackMode {
    /// One 16-bit I and one 16-bit Q per word, so one sample per word
    Unpacked,
    /// 12-bit I/Q values, so every 3 words carry 4 samples
    Packed,
}

impl PackMode {
    /// Number of samples (and therefore timestamp ticks) carried by `words` payload words
    pub fn samples_in_words(self, words: u32) -> u64 {
        match self {
            PackMode::Unpacked => u64::from(words),
            PackMode::Packed => u64::from(words) * 4 / 3,
        }
    }
}

impl Default for PackMode {
    fn default() -> Self {
        PackMode::Unpacked
    }
}

/// What a receive worker does with a block once it has been checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Staging {
    /// Hand every block to the sink as soon as it arrives
    WriteThrough,
    /// Stage blocks in the handle's ring buffer and hand them to the sink in batches
    Buffered,
}

impl Default for Staging {
    fn default() -> Self {
        Staging::WriteThrough
    }
}

/// Pass/fail criteria checked against the final report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum acceptable throughput in MB/s
    pub target_mbps: Option<f64>,
    /// A handle with at least this many timestamp gaps fails
    pub max_gaps: Option<u64>,
    /// A transmit stream with at least this many late or underrun completions fails
    pub max_late: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub pack_mode: PackMode,
    pub staging: Staging,
    /// How often the monitor samples the shared counters
    pub monitor_interval_ms: u64,
    /// Stop the session after this many seconds
    pub run_time_secs: Option<u64>,
    /// A handle is complete once this many blocks have been acquired from it
    pub blocks_per_handle: Option<u64>,
    pub thresholds: Thresholds,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            pack_mode: PackMode::Unpacked,
            staging: Staging::WriteThrough,
            monitor_interval_ms: 1000,
            run_time_secs: None,
            blocks_per_handle: None,
            thresholds: Thresholds::default(),
        }
    }
}

impl StreamConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: StreamConfig = serde_json::from_str(json).context("parsing stream config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|_| format!("reading {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.monitor_interval_ms == 0 {
            return Err(StreamError::Config(
                "monitor interval must be non-zero".to_string(),
            ));
        }
        if self.run_time_secs == Some(0) {
            return Err(StreamError::Config("run time must be non-zero".to_string()));
        }
        if self.thresholds.max_gaps == Some(0) {
            return Err(StreamError::Config(
                "cannot specify a timestamp gap threshold of 0".to_string(),
            ));
        }
        if self.thresholds.max_late == Some(0) {
            return Err(StreamError::Config(
                "cannot specify a late block threshold of 0".to_string(),
            ));
        }
        if let Some(target) = self.thresholds.target_mbps {
            if !(target > 0.) {
                return Err(StreamError::Config(format!(
                    "target throughput must be positive, got {}",
                    target
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_words_carry_four_samples_per_three_words() {
        assert_eq!(PackMode::Unpacked.samples_in_words(1018), 1018);
        assert_eq!(PackMode::Packed.samples_in_words(1017), 1356);
        assert_eq!(PackMode::Packed.samples_in_words(3), 4);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = StreamConfig::from_json(
            r#"{ "pack_mode": "packed", "thresholds": { "max_gaps": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.pack_mode, PackMode::Packed);
        assert_eq!(config.staging, Staging::WriteThrough);
        assert_eq!(config.monitor_interval(), Duration::from_secs(1));
        assert_eq!(config.thresholds.max_gaps, Some(3));
        assert_eq!(config.thresholds.target_mbps, None);
    }

    #[test]
    fn zero_gap_threshold_is_rejected() {
        let err = StreamConfig::from_json(r#"{ "thresholds": { "max_gaps": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("gap threshold"));
    }

    #[test]
    fn zero_late_threshold_is_rejected() {
        let err = StreamConfig::from_json(r#"{ "thresholds": { "max_late": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("late block threshold"));
        let config = StreamConfig::from_json(r#"{ "thresholds": { "max_late": 5 } }"#).unwrap();
        assert_eq!(config.thresholds.max_late, Some(5));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = StreamConfig::default();
        config.monitor_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.run_time_secs = Some(0);
        assert!(config.validate().is_err());
    }
}
