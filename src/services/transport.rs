//! Wireless transport driver interface
//!
//! Abstracts the Bluetooth audio link: per-sink audio output
//! connections, raw audio connections used by the reconnect heuristics,
//! the connected-device list, and the per-address pairing store.
//!
//! The driver is not safe for concurrent use from multiple sessions, so
//! every caller goes through one process-wide lock ([`SharedTransport`]).

use crate::address::DeviceAddress;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Fixed length of the opaque pairing-settings blob
pub const PAIRING_SETTINGS_LEN: usize = 512;

/// Handle to an open per-sink audio output connection
pub type AudioOutHandle = u32;

/// PCM stream parameters for starting audio output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    pub sample_rate: u32,
    pub bits_per_sample: u8,
}

impl PcmParams {
    pub fn pcm16(sample_rate: u32) -> Self {
        PcmParams {
            sample_rate,
            bits_per_sample: 16,
        }
    }
}

/// Transport-reported state of an audio output connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioOutState {
    #[default]
    Stopped,
    Started,
}

/// Per-address pairing record as stored by the transport
#[derive(Clone, PartialEq, Eq)]
pub struct PairingRecord {
    pub addr: DeviceAddress,
    pub settings: [u8; PAIRING_SETTINGS_LEN],
}

impl PairingRecord {
    /// All-zero record, meaning "nothing paired"
    pub fn empty() -> Self {
        PairingRecord {
            addr: DeviceAddress::EMPTY,
            settings: [0; PAIRING_SETTINGS_LEN],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_empty() && self.settings.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Debug for PairingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingRecord")
            .field("addr", &self.addr)
            .field("settings_len", &self.settings.len())
            .finish()
    }
}

/// Wireless transport driver primitives.
///
/// Calls may block; none of them are retried here. Event subscriptions
/// return channel receivers that fire once per underlying notification.
pub trait TransportDriver: Send {
    /// Open an audio output connection to a sink
    fn open_audio_out(&mut self, addr: DeviceAddress) -> Result<AudioOutHandle>;

    /// Close an audio output connection
    fn close_audio_out(&mut self, handle: AudioOutHandle);

    /// Subscribe to output-state-changed notifications for a connection
    fn subscribe_output_state(
        &mut self,
        handle: AudioOutHandle,
    ) -> Result<mpsc::UnboundedReceiver<()>>;

    /// Read the current output state of a connection
    fn audio_out_state(&mut self, handle: AudioOutHandle) -> Result<AudioOutState>;

    /// Start output streaming with a target latency; returns the latency
    /// actually granted. Fails with [`crate::Error::AlreadyStarted`] if
    /// output is already streaming.
    fn start_audio_out(
        &mut self,
        handle: AudioOutHandle,
        params: PcmParams,
        target_latency: Duration,
    ) -> Result<Duration>;

    /// Stop output streaming
    fn stop_audio_out(&mut self, handle: AudioOutHandle);

    /// Send one block of samples; returns the number of bytes transferred
    fn send_audio(&mut self, handle: AudioOutHandle, pcm: &[i16]) -> Result<usize>;

    /// List currently connected audio sink addresses
    fn connected_devices(&mut self) -> Result<Vec<DeviceAddress>>;

    /// Open a raw audio connection by address (reconnect heuristics)
    fn open_audio_connection(&mut self, addr: DeviceAddress) -> Result<()>;

    /// Close a raw audio connection by address
    fn close_audio_connection(&mut self, addr: DeviceAddress) -> Result<()>;

    /// Subscribe to audio-connection-changed notifications
    fn subscribe_connection_changes(&mut self) -> mpsc::UnboundedReceiver<()>;

    /// Subscribe to informational audio events
    fn subscribe_info_events(&mut self) -> mpsc::UnboundedReceiver<()>;

    /// Read the authoritative pairing record for an address, if any
    fn paired_device_settings(&mut self, addr: DeviceAddress) -> Result<Option<PairingRecord>>;

    /// Register (or overwrite) a pairing record
    fn register_paired_device(&mut self, record: &PairingRecord) -> Result<()>;
}

/// Process-wide transport lock.
///
/// All transport calls across all sessions are serialized by this one
/// lock; holding it across an `.await` is avoided everywhere except the
/// short synchronous call sequences themselves.
pub type SharedTransport = Arc<Mutex<Box<dyn TransportDriver>>>;

/// Wrap a driver in the process-wide transport lock
pub fn shared(driver: impl TransportDriver + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(driver)))
}
