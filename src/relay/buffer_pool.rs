//! Fixed pool of recycled capture buffers
//!
//! N slots are preallocated once per session and then recycled between
//! the pool, the capture session, and the send path; never reallocated.
//! Allocation failure is fatal to the session being constructed, not to
//! the process, so the pool allocates fallibly.

use crate::error::{Error, Result};
use crate::services::capture::AudioBuffer;

/// Fixed set of preallocated PCM slots.
///
/// Invariant: every slot index is either parked here or in flight
/// (submitted to capture or being shaped/sent); a slot is never in both
/// places, and `put` rejects duplicates.
pub struct BufferPool {
    slots: Vec<Option<AudioBuffer>>,
}

impl BufferPool {
    /// Preallocate `num_buffers` slots of `samples_per_buffer` samples each
    pub fn new(num_buffers: usize, samples_per_buffer: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(num_buffers)
            .map_err(|e| Error::Allocation(format!("slot table: {e}")))?;

        for slot in 0..num_buffers {
            let mut pcm = Vec::new();
            pcm.try_reserve_exact(samples_per_buffer)
                .map_err(|e| Error::Allocation(format!("slot {slot}: {e}")))?;
            pcm.resize(samples_per_buffer, 0i16);
            slots.push(Some(AudioBuffer { slot, pcm }));
        }

        Ok(BufferPool { slots })
    }

    /// Total number of slots in the pool
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently in flight (not parked in the pool)
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Take every parked slot, in slot order
    pub fn take_all(&mut self) -> Vec<AudioBuffer> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Park a slot back in the pool.
    ///
    /// Rejects unknown slot indices and duplicates so a lost or doubled
    /// buffer is caught at the boundary rather than corrupting the cycle.
    pub fn put(&mut self, buffer: AudioBuffer) -> Result<()> {
        let entry = self
            .slots
            .get_mut(buffer.slot)
            .ok_or_else(|| Error::Session(format!("unknown buffer slot {}", buffer.slot)))?;

        if entry.is_some() {
            return Err(Error::Session(format!("duplicate buffer slot {}", buffer.slot)));
        }

        *entry = Some(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_all_and_put_round_trip() {
        let mut pool = BufferPool::new(4, 16).unwrap();
        assert_eq!(pool.num_slots(), 4);
        assert_eq!(pool.outstanding(), 0);

        let buffers = pool.take_all();
        assert_eq!(buffers.len(), 4);
        assert_eq!(pool.outstanding(), 4);

        let slots: Vec<usize> = buffers.iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);

        for buffer in buffers {
            pool.put(buffer).unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_put_is_rejected() {
        let mut pool = BufferPool::new(2, 16).unwrap();
        let _taken = pool.take_all();

        pool.put(AudioBuffer {
            slot: 0,
            pcm: vec![0; 16],
        })
        .unwrap();

        let err = pool.put(AudioBuffer {
            slot: 0,
            pcm: vec![0; 16],
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_slot_is_rejected() {
        let mut pool = BufferPool::new(2, 16).unwrap();
        let err = pool.put(AudioBuffer {
            slot: 7,
            pcm: vec![0; 16],
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_allocation_failure_is_an_error() {
        // An absurd slot size must fail cleanly, not abort
        let result = BufferPool::new(1, usize::MAX / 4);
        assert!(matches!(result, Err(Error::Allocation(_))));
    }
}
