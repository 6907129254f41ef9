//! Fixed-capacity byte rings used for the raw, processed and output feeds.
//!
//! Storage is a `ringbuf::HeapRb<u8>`. The ring itself has no locking: every
//! instance is owned by the pipeline and only touched under one of the
//! pipeline's mutexes.
//!
//! A ring created with capacity `C` holds at most `C - 1` bytes. One slot is
//! kept empty so that a full ring and an empty ring never look alike, which
//! keeps fill-level reporting identical to the firmware's cursor arithmetic.

pub mod pcm;

use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};

use crate::error::{AudioError, Result};

/// Circular byte buffer with single-writer / single-reader semantics.
pub struct ByteRing {
    rb: HeapRb<u8>,
    /// Nominal capacity `C`; `C - 1` bytes are usable.
    capacity: usize,
}

impl ByteRing {
    /// Allocate a ring with nominal capacity `capacity` bytes.
    ///
    /// # Errors
    /// Returns `AudioError::InvalidCapacity` when `capacity < 2`, since such a
    /// ring could never hold a single byte, and `AudioError::AllocationFailed`
    /// when the storage can't be reserved.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(AudioError::InvalidCapacity { capacity });
        }
        let rb = HeapRb::try_new(capacity - 1)
            .map_err(|_| AudioError::AllocationFailed { capacity })?;
        Ok(Self { rb, capacity })
    }

    /// Copy up to `data.len()` bytes in, truncating silently to free space.
    ///
    /// Returns the number of bytes accepted. Never blocks.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.rb.push_slice(data)
    }

    /// Copy the whole of `data` in, or nothing at all.
    ///
    /// Returns `false` (and leaves the ring untouched) when `data` does not
    /// fit in the current free space.
    pub fn write_all_or_nothing(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free_space() {
            return false;
        }
        self.rb.push_slice(data);
        true
    }

    /// Move up to `out.len()` of the oldest unread bytes into `out`.
    ///
    /// Returns `0` when the ring is empty.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.rb.pop_slice(out)
    }

    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        self.rb.occupied_len()
    }

    /// Bytes currently writable (`capacity - 1 - available`).
    pub fn free_space(&self) -> usize {
        self.rb.vacant_len()
    }

    /// Nominal capacity `C` the ring was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level as an integer percentage of the nominal capacity.
    pub fn fill_percent(&self) -> u8 {
        (self.available() * 100 / self.capacity) as u8
    }

    /// Drop all buffered bytes. Caller must hold the owning lock.
    pub fn reset(&mut self) {
        self.rb.clear();
    }
}

impl std::fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_capacity() {
        assert!(matches!(
            ByteRing::new(1),
            Err(AudioError::InvalidCapacity { capacity: 1 })
        ));
        assert!(ByteRing::new(0).is_err());
        assert!(ByteRing::new(2).is_ok());
    }

    #[test]
    fn oversized_capacity_is_an_error_not_an_abort() {
        let capacity = 1usize << 62;
        assert!(matches!(
            ByteRing::new(capacity),
            Err(AudioError::AllocationFailed { capacity: c }) if c == capacity
        ));
    }

    #[test]
    fn keeps_one_slot_empty() {
        let mut ring = ByteRing::new(16).unwrap();
        assert_eq!(ring.free_space(), 15);
        let written = ring.write(&[7u8; 32]);
        assert_eq!(written, 15);
        assert_eq!(ring.available(), 15);
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.write(&[1]), 0);
    }

    #[test]
    fn read_from_empty_returns_zero() {
        let mut ring = ByteRing::new(8).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn partial_read_preserves_fifo_order() {
        let mut ring = ByteRing::new(32).unwrap();
        ring.write(&[1, 2, 3, 4, 5, 6]);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        let mut rest = [0u8; 8];
        assert_eq!(ring.read(&mut rest), 2);
        assert_eq!(&rest[..2], &[5, 6]);
    }

    #[test]
    fn round_trip_across_wrap_boundary() {
        let mut ring = ByteRing::new(16).unwrap();
        // Walk the cursors near the end of the arena.
        let mut scratch = [0u8; 12];
        assert_eq!(ring.write(&[0xAA; 12]), 12);
        assert_eq!(ring.read(&mut scratch), 12);

        let seq: Vec<u8> = (1..=10).collect();
        assert_eq!(ring.write(&seq), seq.len());
        let mut out = vec![0u8; seq.len()];
        assert_eq!(ring.read(&mut out), seq.len());
        assert_eq!(out, seq);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn all_or_nothing_write_leaves_ring_untouched_on_miss() {
        let mut ring = ByteRing::new(10).unwrap();
        assert!(ring.write_all_or_nothing(&[1; 6]));
        assert!(!ring.write_all_or_nothing(&[2; 4]));
        assert_eq!(ring.available(), 6);
        assert!(ring.write_all_or_nothing(&[3; 3]));
        assert_eq!(ring.free_space(), 0);
    }

    #[test]
    fn capacity_invariant_holds_over_mixed_traffic() {
        let mut ring = ByteRing::new(64).unwrap();
        let mut out = [0u8; 64];
        for step in 0..500usize {
            let len = (step * 7) % 50;
            let free_before = ring.free_space();
            let written = ring.write(&vec![step as u8; len]);
            assert!(written <= len);
            assert!(written <= free_before);
            assert!(ring.available() <= ring.capacity() - 1);
            assert_eq!(ring.free_space(), ring.capacity() - 1 - ring.available());

            let want = (step * 3) % 40;
            ring.read(&mut out[..want]);
            assert!(ring.available() <= ring.capacity() - 1);
        }
    }

    #[test]
    fn reset_discards_buffered_bytes() {
        let mut ring = ByteRing::new(20).unwrap();
        ring.write(&[9; 10]);
        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.free_space(), 19);
    }

    #[test]
    fn fill_percent_uses_nominal_capacity() {
        let mut ring = ByteRing::new(200).unwrap();
        ring.write(&[0; 50]);
        assert_eq!(ring.fill_percent(), 25);
    }
}
