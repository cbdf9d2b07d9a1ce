//! Daemon configuration
//!
//! All tunables live in one TOML-backed struct with compiled defaults.
//! A missing config file is valid and yields the defaults; a malformed
//! file is a startup error.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default capture and transmit sample rate (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default 16-bit samples per capture buffer
pub const DEFAULT_SAMPLES_PER_BUFFER: usize = 0x400;

/// Default number of recycled capture buffers per session
pub const DEFAULT_NUM_BUFFERS: usize = 8;

/// Default transmit target latency (microseconds)
pub const DEFAULT_TARGET_LATENCY_US: u64 = 4_000;

/// Capture is considered desynchronized once the newest released buffer
/// is older than this many nominal buffer periods.
///
/// Two periods matches observed scheduling jitter when an interactive
/// application takes over capture; anything past that means the relay
/// lost scheduling priority and the capture session must be reopened.
pub const DEFAULT_DESYNC_PERIODS: u32 = 2;

/// Default period of the best-effort reconnect timer (seconds)
pub const DEFAULT_RECONNECT_PERIOD_S: u64 = 10;

/// Default delay of the one-shot first-connect reconnect workaround (seconds)
pub const DEFAULT_WORKAROUND_DELAY_S: u64 = 5;

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_samples_per_buffer() -> usize {
    DEFAULT_SAMPLES_PER_BUFFER
}

fn default_num_buffers() -> usize {
    DEFAULT_NUM_BUFFERS
}

fn default_target_latency_us() -> u64 {
    DEFAULT_TARGET_LATENCY_US
}

fn default_desync_periods() -> u32 {
    DEFAULT_DESYNC_PERIODS
}

fn default_reconnect_period_s() -> u64 {
    DEFAULT_RECONNECT_PERIOD_S
}

fn default_workaround_delay_s() -> u64 {
    DEFAULT_WORKAROUND_DELAY_S
}

fn default_prefs_path() -> PathBuf {
    PathBuf::from("config/btrelay/settings.bin")
}

/// Relay daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Capture and transmit sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// 16-bit samples per capture buffer
    #[serde(default = "default_samples_per_buffer")]
    pub samples_per_buffer: usize,

    /// Number of recycled capture buffers per session
    #[serde(default = "default_num_buffers")]
    pub num_buffers: usize,

    /// Transmit target latency (microseconds)
    #[serde(default = "default_target_latency_us")]
    pub target_latency_us: u64,

    /// Capture desync threshold, in nominal buffer periods
    #[serde(default = "default_desync_periods")]
    pub desync_periods: u32,

    /// Period of the best-effort reconnect timer (seconds)
    #[serde(default = "default_reconnect_period_s")]
    pub reconnect_period_s: u64,

    /// Delay of the one-shot first-connect workaround timer (seconds)
    #[serde(default = "default_workaround_delay_s")]
    pub workaround_delay_s: u64,

    /// Path of the persisted device-preference record
    #[serde(default = "default_prefs_path")]
    pub prefs_path: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            sample_rate: DEFAULT_SAMPLE_RATE,
            samples_per_buffer: DEFAULT_SAMPLES_PER_BUFFER,
            num_buffers: DEFAULT_NUM_BUFFERS,
            target_latency_us: DEFAULT_TARGET_LATENCY_US,
            desync_periods: DEFAULT_DESYNC_PERIODS,
            reconnect_period_s: DEFAULT_RECONNECT_PERIOD_S,
            workaround_delay_s: DEFAULT_WORKAROUND_DELAY_S,
            prefs_path: default_prefs_path(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// `None` or a missing file yields the compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(RelayConfig::default());
        };

        if !path.exists() {
            return Ok(RelayConfig::default());
        }

        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Nominal duration of one capture buffer
    pub fn buffer_period(&self) -> Duration {
        let nanos = 1_000_000_000u64 * self.samples_per_buffer as u64 / self.sample_rate as u64;
        Duration::from_nanos(nanos)
    }

    /// Capture-desync threshold (`desync_periods` buffer periods)
    pub fn desync_threshold(&self) -> Duration {
        self.buffer_period() * self.desync_periods
    }

    /// Transmit target latency
    pub fn target_latency(&self) -> Duration {
        Duration::from_micros(self.target_latency_us)
    }

    /// Period of the best-effort reconnect timer
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_secs(self.reconnect_period_s)
    }

    /// Delay of the one-shot first-connect workaround timer
    pub fn workaround_delay(&self) -> Duration {
        Duration::from_secs(self.workaround_delay_s)
    }
}
