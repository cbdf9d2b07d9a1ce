//! Simulated backend
//!
//! Deterministic in-process implementations of all four collaborator
//! interfaces. The binary wires the daemon to these so it runs
//! end-to-end without hardware, and the integration suite drives every
//! relay scenario through them: connected-device lists, synthesized
//! capture audio, volume levels, and power notifications are all
//! injectable, and call counts are observable for assertions.

use crate::address::DeviceAddress;
use crate::error::{Error, Result};
use crate::services::capture::{AudioBuffer, CaptureService, CaptureSession, ReleasedBuffer};
use crate::services::power::{PowerModuleId, PowerService, PowerState};
use crate::services::sysaudio::SystemAudio;
use crate::services::transport::{
    AudioOutHandle, AudioOutState, PairingRecord, PcmParams, TransportDriver,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

// ========================================
// Transport
// ========================================

struct SimOutput {
    addr: DeviceAddress,
    started: bool,
    state_txs: Vec<mpsc::UnboundedSender<()>>,
}

#[derive(Default)]
struct TransportState {
    connected: Vec<DeviceAddress>,
    next_handle: AudioOutHandle,
    outputs: HashMap<AudioOutHandle, SimOutput>,
    opens: usize,
    closes: usize,
    sent_blocks: usize,
    bytes_sent: usize,
    last_block: Vec<i16>,
    conn_opens: Vec<DeviceAddress>,
    conn_closes: Vec<DeviceAddress>,
    conn_txs: Vec<mpsc::UnboundedSender<()>>,
    info_txs: Vec<mpsc::UnboundedSender<()>>,
    pairing: HashMap<DeviceAddress, PairingRecord>,
    fail_open_out: bool,
}

/// Simulated transport driver.
///
/// Clones share state, so tests keep one clone as a control surface
/// while the daemon owns another behind the transport lock.
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<TransportState>>,
}

impl SimTransport {
    pub fn new() -> Self {
        SimTransport::default()
    }

    /// Replace the connected-device list and fire a connection-changed event
    pub fn set_connected(&self, addrs: Vec<DeviceAddress>) {
        self.state.lock().unwrap().connected = addrs;
        self.fire_connection_changed();
    }

    pub fn fire_connection_changed(&self) {
        let mut state = self.state.lock().unwrap();
        state.conn_txs.retain(|tx| tx.send(()).is_ok());
    }

    pub fn fire_info_event(&self) {
        let mut state = self.state.lock().unwrap();
        state.info_txs.retain(|tx| tx.send(()).is_ok());
    }

    /// Make the next `open_audio_out` fail
    pub fn fail_next_open_out(&self) {
        self.state.lock().unwrap().fail_open_out = true;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn active_outputs(&self) -> usize {
        self.state.lock().unwrap().outputs.len()
    }

    pub fn sent_block_count(&self) -> usize {
        self.state.lock().unwrap().sent_blocks
    }

    pub fn bytes_sent(&self) -> usize {
        self.state.lock().unwrap().bytes_sent
    }

    pub fn last_sent_block(&self) -> Vec<i16> {
        self.state.lock().unwrap().last_block.clone()
    }

    /// Raw audio connections opened by the reconnect heuristic
    pub fn audio_connection_opens(&self) -> Vec<DeviceAddress> {
        self.state.lock().unwrap().conn_opens.clone()
    }

    /// Raw audio connections force-closed by the workaround timer
    pub fn audio_connection_closes(&self) -> Vec<DeviceAddress> {
        self.state.lock().unwrap().conn_closes.clone()
    }

    pub fn insert_pairing(&self, record: PairingRecord) {
        self.state
            .lock()
            .unwrap()
            .pairing
            .insert(record.addr, record);
    }

    pub fn pairing_record(&self, addr: DeviceAddress) -> Option<PairingRecord> {
        self.state.lock().unwrap().pairing.get(&addr).cloned()
    }
}

impl TransportDriver for SimTransport {
    fn open_audio_out(&mut self, addr: DeviceAddress) -> Result<AudioOutHandle> {
        let mut state = self.state.lock().unwrap();

        if state.fail_open_out {
            state.fail_open_out = false;
            return Err(Error::Transport(format!("simulated open failure for {addr}")));
        }

        state.next_handle += 1;
        let handle = state.next_handle;
        state.outputs.insert(
            handle,
            SimOutput {
                addr,
                started: false,
                state_txs: Vec::new(),
            },
        );
        state.opens += 1;
        Ok(handle)
    }

    fn close_audio_out(&mut self, handle: AudioOutHandle) {
        let mut state = self.state.lock().unwrap();
        if state.outputs.remove(&handle).is_some() {
            state.closes += 1;
        }
    }

    fn subscribe_output_state(
        &mut self,
        handle: AudioOutHandle,
    ) -> Result<mpsc::UnboundedReceiver<()>> {
        let mut state = self.state.lock().unwrap();
        let output = state
            .outputs
            .get_mut(&handle)
            .ok_or_else(|| Error::Transport(format!("unknown output handle {handle}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        output.state_txs.push(tx);
        Ok(rx)
    }

    fn audio_out_state(&mut self, handle: AudioOutHandle) -> Result<AudioOutState> {
        let state = self.state.lock().unwrap();
        let output = state
            .outputs
            .get(&handle)
            .ok_or_else(|| Error::Transport(format!("unknown output handle {handle}")))?;

        Ok(if output.started {
            AudioOutState::Started
        } else {
            AudioOutState::Stopped
        })
    }

    fn start_audio_out(
        &mut self,
        handle: AudioOutHandle,
        _params: PcmParams,
        target_latency: Duration,
    ) -> Result<Duration> {
        let mut state = self.state.lock().unwrap();
        let output = state
            .outputs
            .get_mut(&handle)
            .ok_or_else(|| Error::Transport(format!("unknown output handle {handle}")))?;

        if output.started {
            return Err(Error::AlreadyStarted);
        }

        output.started = true;
        Ok(target_latency)
    }

    fn stop_audio_out(&mut self, handle: AudioOutHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(output) = state.outputs.get_mut(&handle) {
            output.started = false;
        }
    }

    fn send_audio(&mut self, handle: AudioOutHandle, pcm: &[i16]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.outputs.contains_key(&handle) {
            return Err(Error::Transport(format!("unknown output handle {handle}")));
        }

        let bytes = pcm.len() * 2;
        state.sent_blocks += 1;
        state.bytes_sent += bytes;
        state.last_block = pcm.to_vec();
        Ok(bytes)
    }

    fn connected_devices(&mut self) -> Result<Vec<DeviceAddress>> {
        Ok(self.state.lock().unwrap().connected.clone())
    }

    fn open_audio_connection(&mut self, addr: DeviceAddress) -> Result<()> {
        self.state.lock().unwrap().conn_opens.push(addr);
        Ok(())
    }

    fn close_audio_connection(&mut self, addr: DeviceAddress) -> Result<()> {
        self.state.lock().unwrap().conn_closes.push(addr);
        Ok(())
    }

    fn subscribe_connection_changes(&mut self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().conn_txs.push(tx);
        rx
    }

    fn subscribe_info_events(&mut self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().info_txs.push(tx);
        rx
    }

    fn paired_device_settings(&mut self, addr: DeviceAddress) -> Result<Option<PairingRecord>> {
        Ok(self.state.lock().unwrap().pairing.get(&addr).cloned())
    }

    fn register_paired_device(&mut self, record: &PairingRecord) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .pairing
            .insert(record.addr, record.clone());
        Ok(())
    }
}

// ========================================
// Capture
// ========================================

struct CaptureSessionState {
    sample_rate: u32,
    tone_hz: f64,
    phase: f64,
    pending: VecDeque<AudioBuffer>,
    released: VecDeque<ReleasedBuffer>,
    release_txs: Vec<mpsc::UnboundedSender<()>>,
    submitted_total: usize,
    stopped: bool,
}

impl CaptureSessionState {
    /// Fill a slot with a continuing sine tone at full scale
    fn fill(&mut self, buffer: &mut AudioBuffer) {
        let step = 2.0 * std::f64::consts::PI * self.tone_hz / f64::from(self.sample_rate);
        for sample in buffer.pcm.iter_mut() {
            *sample = (self.phase.sin() * f64::from(i16::MAX)) as i16;
            self.phase += step;
        }
        self.phase %= 2.0 * std::f64::consts::PI;
    }
}

/// Release the oldest pending slot, backdating its timestamp by `lag`.
/// Returns false when nothing was pending.
fn release_one(state: &Arc<Mutex<CaptureSessionState>>, lag: Duration) -> bool {
    let mut s = state.lock().unwrap();
    let Some(mut buffer) = s.pending.pop_front() else {
        return false;
    };

    s.fill(&mut buffer);
    s.released.push_back(ReleasedBuffer {
        buffer,
        released_at: Instant::now() - lag,
    });
    s.release_txs.retain(|tx| tx.send(()).is_ok());
    true
}

#[derive(Default)]
struct CaptureCtl {
    paced: bool,
    tone_hz: f64,
    sessions_opened: usize,
    fail_next_open: bool,
    fail_next_start: bool,
    current: Option<Arc<Mutex<CaptureSessionState>>>,
}

/// Simulated capture service.
///
/// In paced mode each open session runs a timer task that fills and
/// releases submitted slots at the nominal real-time buffer rate. In
/// manual mode tests drive releases explicitly via [`SimCapture::release_all`].
#[derive(Clone)]
pub struct SimCapture {
    state: Arc<Mutex<CaptureCtl>>,
}

impl SimCapture {
    /// Real-time paced capture of a sine tone
    pub fn paced(tone_hz: f64) -> Self {
        SimCapture {
            state: Arc::new(Mutex::new(CaptureCtl {
                paced: true,
                tone_hz,
                ..CaptureCtl::default()
            })),
        }
    }

    /// Manually driven capture; nothing is released until the test says so
    pub fn manual(tone_hz: f64) -> Self {
        SimCapture {
            state: Arc::new(Mutex::new(CaptureCtl {
                paced: false,
                tone_hz,
                ..CaptureCtl::default()
            })),
        }
    }

    /// Number of capture sessions opened over the service's lifetime
    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions_opened
    }

    /// Make the next `open` fail
    pub fn fail_next_open(&self) {
        self.state.lock().unwrap().fail_next_open = true;
    }

    /// Make the next session's `start` fail
    pub fn fail_next_start(&self) {
        self.state.lock().unwrap().fail_next_start = true;
    }

    /// Release every pending slot of the current session, backdating the
    /// release timestamps by `lag`. Returns the number released.
    pub fn release_all(&self, lag: Duration) -> usize {
        let Some(session) = self.current_session() else {
            return 0;
        };

        let mut count = 0;
        while release_one(&session, lag) {
            count += 1;
        }
        count
    }

    /// Slot indices currently queued (submitted, not yet released) in the
    /// current session
    pub fn pending_slots(&self) -> Vec<usize> {
        match self.current_session() {
            Some(session) => session
                .lock()
                .unwrap()
                .pending
                .iter()
                .map(|b| b.slot)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Total slots ever submitted to the current session
    pub fn submitted_total(&self) -> usize {
        match self.current_session() {
            Some(session) => session.lock().unwrap().submitted_total,
            None => 0,
        }
    }

    fn current_session(&self) -> Option<Arc<Mutex<CaptureSessionState>>> {
        self.state.lock().unwrap().current.clone()
    }
}

impl CaptureService for SimCapture {
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn CaptureSession>> {
        let mut ctl = self.state.lock().unwrap();

        if ctl.fail_next_open {
            ctl.fail_next_open = false;
            return Err(Error::Capture("simulated recorder open failure".into()));
        }

        let state = Arc::new(Mutex::new(CaptureSessionState {
            sample_rate,
            tone_hz: ctl.tone_hz,
            phase: 0.0,
            pending: VecDeque::new(),
            released: VecDeque::new(),
            release_txs: Vec::new(),
            submitted_total: 0,
            stopped: false,
        }));

        ctl.sessions_opened += 1;
        ctl.current = Some(Arc::clone(&state));

        Ok(Box::new(SimCaptureSession {
            state,
            paced: ctl.paced,
            fail_start: std::mem::take(&mut ctl.fail_next_start),
            stop_tx: None,
        }))
    }
}

/// One simulated recorder session
pub struct SimCaptureSession {
    state: Arc<Mutex<CaptureSessionState>>,
    paced: bool,
    fail_start: bool,
    stop_tx: Option<watch::Sender<bool>>,
}

impl CaptureSession for SimCaptureSession {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(Error::Capture("simulated recorder start failure".into()));
        }

        if self.paced {
            let (tx, mut rx) = watch::channel(false);
            self.stop_tx = Some(tx);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                loop {
                    let period = {
                        let s = state.lock().unwrap();
                        if s.stopped {
                            break;
                        }
                        let samples = s.pending.front().map_or(1024, |b| b.pcm.len());
                        Duration::from_nanos(
                            1_000_000_000u64 * samples as u64 / u64::from(s.sample_rate),
                        )
                    };

                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = tokio::time::sleep(period) => {}
                    }

                    release_one(&state, Duration::ZERO);
                }
            });
        }

        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().stopped = true;
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
    }

    fn subscribe_released(&mut self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().release_txs.push(tx);
        rx
    }

    fn submit(&mut self, buffer: AudioBuffer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return Err(Error::Capture("recorder session is stopped".into()));
        }

        state.submitted_total += 1;
        state.pending.push_back(buffer);
        Ok(())
    }

    fn poll_released(&mut self, max: usize) -> Result<Vec<ReleasedBuffer>> {
        let mut state = self.state.lock().unwrap();
        let count = state.released.len().min(max);
        Ok(state.released.drain(..count).collect())
    }

    fn reclaim(&mut self) -> Vec<AudioBuffer> {
        let mut state = self.state.lock().unwrap();
        let mut slots: Vec<AudioBuffer> = state.pending.drain(..).collect();
        slots.extend(state.released.drain(..).map(|r| r.buffer));
        slots
    }
}

// ========================================
// System audio
// ========================================

#[derive(Default)]
struct SysAudioState {
    level: u8,
    muted: bool,
    fail_reads: bool,
    mute_writes: usize,
}

/// Simulated system volume and mute service
#[derive(Clone)]
pub struct SimSystemAudio {
    state: Arc<Mutex<SysAudioState>>,
}

impl SimSystemAudio {
    pub fn new(level: u8) -> Self {
        SimSystemAudio {
            state: Arc::new(Mutex::new(SysAudioState {
                level,
                ..SysAudioState::default()
            })),
        }
    }

    pub fn set_level(&self, level: u8) {
        self.state.lock().unwrap().level = level;
    }

    pub fn muted(&self) -> bool {
        self.state.lock().unwrap().muted
    }

    pub fn mute_write_count(&self) -> usize {
        self.state.lock().unwrap().mute_writes
    }

    /// Make volume reads fail until cleared
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }
}

impl SystemAudio for SimSystemAudio {
    fn output_volume_level(&self) -> Result<u8> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(Error::SystemAudio("simulated volume read failure".into()));
        }
        Ok(state.level)
    }

    fn set_master_mute(&self, muted: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.muted = muted;
        state.mute_writes += 1;
        Ok(())
    }
}

// ========================================
// Power
// ========================================

#[derive(Default)]
struct PowerCtl {
    txs: Vec<mpsc::UnboundedSender<PowerState>>,
    registered: Option<(u32, Vec<PowerModuleId>)>,
    acks: Vec<PowerState>,
}

/// Simulated power-state notifier
#[derive(Clone, Default)]
pub struct SimPower {
    state: Arc<Mutex<PowerCtl>>,
}

impl SimPower {
    pub fn new() -> Self {
        SimPower::default()
    }

    /// Deliver a power-state notification to all subscribers
    pub fn notify(&self, state: PowerState) {
        let mut ctl = self.state.lock().unwrap();
        ctl.txs.retain(|tx| tx.send(state).is_ok());
    }

    /// Notifications acknowledged so far
    pub fn acks(&self) -> Vec<PowerState> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn registered_module(&self) -> Option<(u32, Vec<PowerModuleId>)> {
        self.state.lock().unwrap().registered.clone()
    }
}

impl PowerService for SimPower {
    fn register_module(&mut self, module_id: u32, deps: &[PowerModuleId]) -> Result<()> {
        self.state.lock().unwrap().registered = Some((module_id, deps.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PowerState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().txs.push(tx);
        rx
    }

    fn acknowledge(&mut self, state: PowerState) -> Result<()> {
        self.state.lock().unwrap().acks.push(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_open_close_accounting() {
        let mut transport = SimTransport::new();
        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);

        let handle = transport.open_audio_out(addr).unwrap();
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.active_outputs(), 1);

        transport.close_audio_out(handle);
        assert_eq!(transport.close_count(), 1);
        assert_eq!(transport.active_outputs(), 0);
    }

    #[test]
    fn test_transport_double_start_reports_already_started() {
        let mut transport = SimTransport::new();
        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);
        let handle = transport.open_audio_out(addr).unwrap();
        let params = PcmParams::pcm16(48_000);

        transport
            .start_audio_out(handle, params, Duration::from_micros(4_000))
            .unwrap();

        let err = transport
            .start_audio_out(handle, params, Duration::from_micros(4_000))
            .unwrap_err();
        assert!(err.is_already_started());
    }

    #[test]
    fn test_capture_manual_release_cycle() {
        let mut service = SimCapture::manual(440.0);
        let ctl = service.clone();

        let mut session = service.open(48_000).unwrap();
        session.start().unwrap();
        session
            .submit(AudioBuffer {
                slot: 0,
                pcm: vec![0; 64],
            })
            .unwrap();

        assert_eq!(ctl.pending_slots(), vec![0]);
        assert_eq!(ctl.release_all(Duration::ZERO), 1);

        let released = session.poll_released(8).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].buffer.slot, 0);
        // The sim fills with a sine tone, not silence
        assert!(released[0].buffer.pcm.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_capture_reclaim_returns_every_slot() {
        let mut service = SimCapture::manual(440.0);
        let ctl = service.clone();
        let mut session = service.open(48_000).unwrap();

        for slot in 0..4 {
            session
                .submit(AudioBuffer {
                    slot,
                    pcm: vec![0; 16],
                })
                .unwrap();
        }
        ctl.release_all(Duration::ZERO);
        session
            .submit(AudioBuffer {
                slot: 4,
                pcm: vec![0; 16],
            })
            .unwrap();

        let mut slots: Vec<usize> = session.reclaim().iter().map(|b| b.slot).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sysaudio_failure_injection() {
        let sysaudio = SimSystemAudio::new(10);
        assert_eq!(sysaudio.output_volume_level().unwrap(), 10);

        sysaudio.set_fail_reads(true);
        assert!(sysaudio.output_volume_level().is_err());
    }

    #[tokio::test]
    async fn test_power_notify_and_ack() {
        let mut power = SimPower::new();
        let ctl = power.clone();

        let mut rx = power.subscribe();
        ctl.notify(PowerState::ReadySleep);

        assert_eq!(rx.recv().await, Some(PowerState::ReadySleep));

        power.acknowledge(PowerState::ReadySleep).unwrap();
        assert_eq!(ctl.acks(), vec![PowerState::ReadySleep]);
    }
}
