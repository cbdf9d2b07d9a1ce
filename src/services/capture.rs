//! System audio capture interface
//!
//! The capture source hands out fixed-size buffers of recorded system
//! audio through an asynchronous buffer-exchange API: the session
//! submits empty slots, the recorder fills them and releases them back.
//! Slots are recycled by ownership transfer and never reallocated.

use crate::error::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

/// One recycled PCM slot.
///
/// `slot` identifies the buffer within its session's pool; the same
/// allocation travels session -> capture -> session for the lifetime of
/// the pool.
#[derive(Debug)]
pub struct AudioBuffer {
    pub slot: usize,
    pub pcm: Vec<i16>,
}

/// A filled buffer handed back by the recorder
#[derive(Debug)]
pub struct ReleasedBuffer {
    pub buffer: AudioBuffer,
    /// When the recorder released the buffer
    pub released_at: Instant,
}

/// Factory for capture sessions
pub trait CaptureService: Send {
    /// Open a capture session at a fixed sample rate
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn CaptureSession>>;
}

/// One open recorder session.
///
/// Calls are private to the owning relay session's worker and need no
/// external synchronization.
pub trait CaptureSession: Send {
    /// Start recording
    fn start(&mut self) -> Result<()>;

    /// Stop recording
    fn stop(&mut self);

    /// Subscribe to buffer-released notifications
    fn subscribe_released(&mut self) -> mpsc::UnboundedReceiver<()>;

    /// Submit a slot for filling
    fn submit(&mut self, buffer: AudioBuffer) -> Result<()>;

    /// Poll for released (filled) buffers, bounded by `max`
    fn poll_released(&mut self, max: usize) -> Result<Vec<ReleasedBuffer>>;

    /// Take back every slot still held by the recorder.
    ///
    /// Called during teardown and desync recovery so the pool never
    /// loses a slot to a dead session.
    fn reclaim(&mut self) -> Vec<AudioBuffer>;
}

/// Shared handle to the capture service
pub type SharedCapture = Arc<Mutex<Box<dyn CaptureService>>>;

/// Wrap a capture service in a shared handle
pub fn shared(service: impl CaptureService + 'static) -> SharedCapture {
    Arc::new(Mutex::new(Box::new(service)))
}
