//! Daemon orchestration
//!
//! Wires the reconciler and the power-state listener together, owns
//! their stop signal, and exposes start/shutdown plus a small
//! observability surface.

use crate::address::DeviceAddress;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::prefs::PreferenceStore;
use crate::relay::power_listener::PowerListener;
use crate::relay::reconciler::{DeviceSet, Reconciler, SuspendHandle};
use crate::services::capture::SharedCapture;
use crate::services::power::{SharedPower, POWER_MODULE_ID, SIBLING_MODULES};
use crate::services::sysaudio::SharedSystemAudio;
use crate::services::transport::SharedTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Injected external collaborators
pub struct RelayDeps {
    pub transport: SharedTransport,
    pub capture: SharedCapture,
    pub sysaudio: SharedSystemAudio,
    pub power: SharedPower,
}

/// Running relay daemon
pub struct RelayDaemon {
    stop_tx: watch::Sender<bool>,
    reconciler_task: JoinHandle<()>,
    power_task: JoinHandle<()>,
    sessions: DeviceSet,
    suspend: SuspendHandle,
}

impl RelayDaemon {
    /// Load preferences, register with the power-state service, and
    /// start the two control loops.
    pub async fn start(deps: RelayDeps, config: RelayConfig) -> Result<RelayDaemon> {
        info!("starting relay daemon");

        let prefs = {
            let mut t = deps.transport.lock().await;
            PreferenceStore::load(config.prefs_path.clone(), &mut **t)?
        };
        match prefs.address() {
            Some(addr) => info!("preferred sink on record: {addr}"),
            None => info!("no preferred sink on record yet"),
        }

        let reconciler = Reconciler::new(
            deps.transport,
            deps.capture,
            deps.sysaudio,
            prefs,
            config,
        );
        let suspend = reconciler.suspend_handle();
        let sessions = reconciler.device_set();

        let notifications = {
            let mut power = deps.power.lock().await;
            power.register_module(POWER_MODULE_ID, SIBLING_MODULES)?;
            power.subscribe()
        };

        let (stop_tx, stop_rx) = watch::channel(false);

        let listener = PowerListener::new(deps.power, suspend.clone());
        let listener_stop = stop_rx.clone();
        let power_task = tokio::spawn(async move {
            if let Err(e) = listener.run(notifications, listener_stop).await {
                error!("power listener failed: {e}");
            }
        });

        let reconciler_task = tokio::spawn(reconciler.run(stop_rx));

        info!("relay daemon started");
        Ok(RelayDaemon {
            stop_tx,
            reconciler_task,
            power_task,
            sessions,
            suspend,
        })
    }

    /// Addresses with an active relay session
    pub async fn active_sinks(&self) -> Vec<DeviceAddress> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Suspend/resume interface (also used by tests)
    pub fn suspend_handle(&self) -> SuspendHandle {
        self.suspend.clone()
    }

    /// Stop both control loops and wait for their teardown to finish
    pub async fn shutdown(self) {
        info!("stopping relay daemon");
        let _ = self.stop_tx.send(true);

        if let Err(e) = self.power_task.await {
            warn!("power listener did not exit cleanly: {e}");
        }
        if let Err(e) = self.reconciler_task.await {
            warn!("reconciler did not exit cleanly: {e}");
        }

        info!("relay daemon stopped");
    }
}
