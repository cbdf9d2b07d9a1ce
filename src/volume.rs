//! Volume shaping for relayed audio
//!
//! Maps the system's discrete output volume level (0-15) to a
//! multiplicative gain and applies it in place to a block of 16-bit
//! samples with rounding and saturation.

use crate::error::Result;
use crate::services::sysaudio::SystemAudio;

/// Highest discrete system volume level
pub const MAX_VOLUME_LEVEL: u8 = 15;

/// Per-level gain ratio.
///
/// Chosen so that level 15 is unity gain and level 0 would be 1/128:
/// x^15 = 1/128, x = 0.7236346187201891.
pub const VOLUME_STEP: f64 = 0.723_634_618_720_189_1;

/// Gain for a discrete volume level in [0, 15].
///
/// Level 0 is forced to exactly 0.0 (silence); the formula alone would
/// yield a small non-zero gain. Levels above 15 clamp to unity.
pub fn gain_for_level(level: u8) -> f32 {
    if level == 0 {
        return 0.0;
    }

    let level = level.min(MAX_VOLUME_LEVEL);
    VOLUME_STEP.powi(i32::from(MAX_VOLUME_LEVEL - level)) as f32
}

/// Apply a gain to a block of interleaved 16-bit samples in place.
///
/// Each sample is widened to float, scaled, rounded, and narrowed back.
/// The float-to-int cast saturates, so clipping never wraps around.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    for sample in samples.iter_mut() {
        *sample = (f32::from(*sample) * gain).round() as i16;
    }
}

/// Shape a block against the current system volume level.
///
/// If the level cannot be read the block is left unmodified and the
/// error is surfaced to the caller.
pub fn shape(samples: &mut [i16], sysaudio: &dyn SystemAudio) -> Result<()> {
    let level = sysaudio.output_volume_level()?;
    apply_gain(samples, gain_for_level(level));
    Ok(())
}
