//! System volume and mute service interface

use crate::error::Result;
use std::sync::Arc;

/// System-wide output volume and mute control.
///
/// Methods take `&self`; implementations use interior mutability so the
/// per-block volume read inside session workers needs no extra lock.
pub trait SystemAudio: Send + Sync {
    /// Current discrete output volume level (0-15)
    fn output_volume_level(&self) -> Result<u8>;

    /// Mute or unmute the system output device
    fn set_master_mute(&self, muted: bool) -> Result<()>;
}

/// Shared handle to the system audio service
pub type SharedSystemAudio = Arc<dyn SystemAudio>;
