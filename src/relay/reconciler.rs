//! Device set reconciliation
//!
//! Keeps the set of relay sessions matched to the transport's
//! connected-device list, mutes/unmutes the system output as sinks
//! appear and disappear, persists the preferred sink, and retries the
//! preferred sink when nothing is connected.
//!
//! Every wait cycle acquires the suspend gate before acting, which is
//! what lets the power-state listener hold the whole reconciler still
//! across a sleep transition.

use crate::address::DeviceAddress;
use crate::config::RelayConfig;
use crate::prefs::PreferenceStore;
use crate::relay::session::RelaySession;
use crate::services::capture::SharedCapture;
use crate::services::sysaudio::SharedSystemAudio;
use crate::services::transport::SharedTransport;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Active sessions, keyed by sink address.
///
/// Written only by the reconciler loop and the suspend path; the
/// suspend gate serializes the two.
pub type DeviceSet = Arc<Mutex<BTreeMap<DeviceAddress, RelaySession>>>;

/// Narrow suspend/resume interface handed to the power-state listener.
///
/// The listener only ever calls these two operations; it never touches
/// reconciler internals.
#[derive(Clone)]
pub struct SuspendHandle {
    gate: Arc<Mutex<()>>,
    sessions: DeviceSet,
}

/// Held for the duration of a suspend; dropping it resumes the
/// reconciler.
pub struct SuspendGuard {
    _gate: OwnedMutexGuard<()>,
}

impl SuspendHandle {
    /// Block the reconciler and destroy every active session.
    ///
    /// The returned guard must be held until the system is awake again;
    /// while it exists the reconciler cannot create sessions or open
    /// transport connections.
    pub async fn suspend(&self) -> SuspendGuard {
        let gate = Arc::clone(&self.gate).lock_owned().await;

        let drained: Vec<RelaySession> = {
            let mut sessions = self.sessions.lock().await;
            std::mem::take(&mut *sessions).into_values().collect()
        };

        for session in drained {
            info!("suspending relay session for {}", session.address());
            session.shutdown().await;
        }

        SuspendGuard { _gate: gate }
    }

    /// Unblock the reconciler. The transport's own wake-up reconnect
    /// delivers a connection-changed event, so no refresh is forced here.
    pub fn resume(&self, guard: SuspendGuard) {
        drop(guard);
    }
}

/// Device set reconciler
pub struct Reconciler {
    transport: SharedTransport,
    capture: SharedCapture,
    sysaudio: SharedSystemAudio,
    prefs: Arc<Mutex<PreferenceStore>>,
    config: RelayConfig,
    sessions: DeviceSet,
    gate: Arc<Mutex<()>>,
    first_connect_done: bool,
    workaround_deadline: Option<tokio::time::Instant>,
}

impl Reconciler {
    pub fn new(
        transport: SharedTransport,
        capture: SharedCapture,
        sysaudio: SharedSystemAudio,
        prefs: PreferenceStore,
        config: RelayConfig,
    ) -> Self {
        Reconciler {
            transport,
            capture,
            sysaudio,
            prefs: Arc::new(Mutex::new(prefs)),
            config,
            sessions: Arc::new(Mutex::new(BTreeMap::new())),
            gate: Arc::new(Mutex::new(())),
            first_connect_done: false,
            workaround_deadline: None,
        }
    }

    /// Suspend/resume interface for the power-state listener
    pub fn suspend_handle(&self) -> SuspendHandle {
        SuspendHandle {
            gate: Arc::clone(&self.gate),
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Shared view of the active session map (observability)
    pub fn device_set(&self) -> DeviceSet {
        Arc::clone(&self.sessions)
    }

    /// Control loop: waits on connection-changed events, informational
    /// events, the periodic reconnect timer, and the armed one-shot
    /// workaround timer. Runs until the stop signal fires.
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        let (mut conn_rx, mut info_rx) = {
            let mut t = self.transport.lock().await;
            (t.subscribe_connection_changes(), t.subscribe_info_events())
        };

        let period = self.config.reconnect_period();
        let mut reconnect = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        reconnect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Catch sinks that connected before we started listening.
        {
            let _gate = Arc::clone(&self.gate).lock_owned().await;
            self.refresh_device_set().await;
        }

        loop {
            let workaround_deadline = self.workaround_deadline;

            tokio::select! {
                _ = stop_rx.changed() => break,
                event = conn_rx.recv() => match event {
                    Some(()) => {
                        let _gate = Arc::clone(&self.gate).lock_owned().await;
                        self.refresh_device_set().await;
                    }
                    None => {
                        warn!("connection-changed events ended; stopping reconciler");
                        break;
                    }
                },
                event = info_rx.recv() => match event {
                    // Informational only
                    Some(()) => {
                        let _gate = Arc::clone(&self.gate).lock_owned().await;
                        debug!("transport info event");
                    }
                    None => {
                        warn!("info events ended; stopping reconciler");
                        break;
                    }
                },
                _ = reconnect.tick() => {
                    let _gate = Arc::clone(&self.gate).lock_owned().await;
                    self.try_reconnect_preferred().await;
                }
                _ = tokio::time::sleep_until(workaround_deadline.unwrap_or_else(tokio::time::Instant::now)),
                        if workaround_deadline.is_some() => {
                    let _gate = Arc::clone(&self.gate).lock_owned().await;
                    self.workaround_deadline = None;
                    self.fire_connect_workaround().await;
                }
            }
        }

        self.shutdown_all().await;
    }

    /// Reconcile the session map against the transport's connected list.
    ///
    /// Idempotent: with no transport change a second call produces no
    /// session churn.
    pub async fn refresh_device_set(&mut self) {
        let connected = {
            let mut t = self.transport.lock().await;
            match t.connected_devices() {
                Ok(list) => list,
                Err(e) => {
                    debug!("reading connected devices failed: {e}");
                    return;
                }
            }
        };

        let mut sessions = self.sessions.lock().await;

        for addr in &connected {
            if sessions.contains_key(addr) {
                continue;
            }

            // Mute the console speakers before the new session negotiates
            // so nothing audible leaks out during setup.
            if let Err(e) = self.sysaudio.set_master_mute(true) {
                warn!("muting system output: {e}");
            }

            info!("new audio sink {addr}");
            match RelaySession::connect(
                *addr,
                Arc::clone(&self.transport),
                Arc::clone(&self.capture),
                Arc::clone(&self.sysaudio),
                self.config.clone(),
            )
            .await
            {
                Ok(session) => {
                    sessions.insert(*addr, session);
                    self.remember_preferred(*addr).await;

                    if !self.first_connect_done {
                        // Some sinks need a forced reconnect shortly after
                        // the very first connect to stabilize.
                        self.first_connect_done = true;
                        self.workaround_deadline = Some(
                            tokio::time::Instant::now() + self.config.workaround_delay(),
                        );
                        debug!("armed first-connect workaround timer");
                    }
                }
                Err(e) => {
                    warn!("failed to initialize relay session for {addr}: {e}");
                }
            }
        }

        let gone: Vec<DeviceAddress> = sessions
            .keys()
            .filter(|addr| !connected.contains(addr))
            .copied()
            .collect();

        for addr in gone {
            if let Some(session) = sessions.remove(&addr) {
                info!("audio sink {addr} disconnected");
                session.shutdown().await;
            }
        }

        // Console speakers and a Bluetooth sink must not play at once.
        if let Err(e) = self.sysaudio.set_master_mute(!sessions.is_empty()) {
            warn!("updating system output mute: {e}");
        }
    }

    /// Persist `addr` as the preferred sink
    async fn remember_preferred(&self, addr: DeviceAddress) {
        let mut prefs = self.prefs.lock().await;
        let mut t = self.transport.lock().await;
        if let Err(e) = prefs.set_address(addr, &mut **t) {
            warn!("persisting preferred sink {addr}: {e}");
        }
    }

    /// Best-effort reconnect to the preferred sink when nothing is
    /// connected. Errors are ignored; the connection-changed event
    /// drives actual session creation on success.
    async fn try_reconnect_preferred(&mut self) {
        if !self.sessions.lock().await.is_empty() {
            return;
        }

        let preferred = self.prefs.lock().await.address();
        let Some(addr) = preferred else {
            return;
        };

        debug!("attempting reconnect to preferred sink {addr}");
        let mut t = self.transport.lock().await;
        if let Err(e) = t.open_audio_connection(addr) {
            debug!("reconnect attempt to {addr} failed: {e}");
        }
    }

    /// Force-close the transport connection to the preferred sink,
    /// triggering it to reconnect cleanly.
    async fn fire_connect_workaround(&mut self) {
        let preferred = self.prefs.lock().await.address();
        let Some(addr) = preferred else {
            return;
        };

        info!("first-connect workaround: forcing reconnect of {addr}");
        let mut t = self.transport.lock().await;
        if let Err(e) = t.close_audio_connection(addr) {
            debug!("workaround close of {addr} failed: {e}");
        }
    }

    /// Destroy every session on the way out and unmute the speakers
    async fn shutdown_all(&mut self) {
        let drained: Vec<RelaySession> = {
            let mut sessions = self.sessions.lock().await;
            std::mem::take(&mut *sessions).into_values().collect()
        };

        for session in drained {
            session.shutdown().await;
        }

        if let Err(e) = self.sysaudio.set_master_mute(false) {
            warn!("unmuting system output: {e}");
        }
    }
}
