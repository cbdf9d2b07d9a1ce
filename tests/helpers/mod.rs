//! Shared test harness: a relay daemon wired to the simulated backend
//! with control handles for every collaborator.

use btrelay::services::sim::{SimCapture, SimPower, SimSystemAudio, SimTransport};
use btrelay::services::{capture, power, transport};
use btrelay::{DeviceAddress, RelayConfig, RelayDaemon, RelayDeps};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub daemon: RelayDaemon,
    pub transport: SimTransport,
    pub capture: SimCapture,
    pub sysaudio: SimSystemAudio,
    pub power: SimPower,
    // Keeps the preference record alive for the daemon's lifetime
    _prefs_dir: tempfile::TempDir,
}

impl Harness {
    /// Start a daemon over manual (test-driven) capture
    pub async fn start(config: RelayConfig) -> Harness {
        Harness::start_with_capture(config, SimCapture::manual(440.0)).await
    }

    /// Start a daemon over real-time paced capture
    pub async fn start_paced(config: RelayConfig) -> Harness {
        Harness::start_with_capture(config, SimCapture::paced(440.0)).await
    }

    async fn start_with_capture(mut config: RelayConfig, capture_ctl: SimCapture) -> Harness {
        let prefs_dir = tempfile::tempdir().expect("tempdir");
        config.prefs_path = prefs_dir.path().join("settings.bin");

        let transport_ctl = SimTransport::new();
        let sysaudio_ctl = SimSystemAudio::new(15);
        let power_ctl = SimPower::new();

        let deps = RelayDeps {
            transport: transport::shared(transport_ctl.clone()),
            capture: capture::shared(capture_ctl.clone()),
            sysaudio: Arc::new(sysaudio_ctl.clone()),
            power: power::shared(power_ctl.clone()),
        };

        let daemon = RelayDaemon::start(deps, config).await.expect("daemon start");

        Harness {
            daemon,
            transport: transport_ctl,
            capture: capture_ctl,
            sysaudio: sysaudio_ctl,
            power: power_ctl,
            _prefs_dir: prefs_dir,
        }
    }

    pub async fn active_sinks(&self) -> Vec<DeviceAddress> {
        self.daemon.active_sinks().await
    }
}

pub fn addr_a() -> DeviceAddress {
    DeviceAddress([0xaa, 1, 2, 3, 4, 5])
}

pub fn addr_b() -> DeviceAddress {
    DeviceAddress([0xbb, 1, 2, 3, 4, 5])
}

/// Small buffers so scenarios run quickly
pub fn test_config() -> RelayConfig {
    RelayConfig {
        num_buffers: 4,
        samples_per_buffer: 256,
        ..RelayConfig::default()
    }
}

/// Poll a condition until it holds, failing after a few seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Async flavor of [`wait_until`] for conditions that must lock
pub async fn wait_until_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
