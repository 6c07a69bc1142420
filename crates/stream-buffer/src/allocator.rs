//! Slot placement arithmetic.
//!
//! The buffer tracks two monotonic positions: `head` (next write) and `tail`
//! (oldest slot still needed). Everything in `[tail, head)` is live, so
//! `head - tail <= capacity` always holds. This module decides where the next
//! slot goes and whether it fits; it never touches shared memory.

use crate::protocol::{SLOT_ALIGN, SLOT_HEADER_SIZE};

/// Round `n` up to the slot alignment.
pub const fn align_up(n: usize) -> usize {
    (n + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// Bytes needed for an event with the given stream name and payload.
pub const fn slot_size(stream_len: usize, payload_len: usize) -> usize {
    align_up(SLOT_HEADER_SIZE + stream_len + payload_len)
}

/// Where the next slot lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Position of the slot header.
    pub start: u64,
    /// Bytes skipped at the end of the region before `start` (0 if none).
    pub pad: u64,
    /// New head once the slot is written.
    pub end: u64,
}

impl Placement {
    pub fn wraps(&self) -> bool {
        self.pad > 0
    }
}

/// Position arithmetic over a region of fixed capacity.
#[derive(Debug, Clone, Copy)]
pub struct SlotAllocator {
    capacity: u64,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        debug_assert_eq!(capacity % SLOT_ALIGN, 0);
        Self {
            capacity: capacity as u64,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Byte offset of `pos` inside the data region.
    pub fn offset(&self, pos: u64) -> usize {
        (pos % self.capacity) as usize
    }

    /// Bytes from `pos` to the physical end of the region.
    pub fn contiguous(&self, pos: u64) -> u64 {
        self.capacity - pos % self.capacity
    }

    /// First position of the next lap.
    pub fn next_lap(&self, pos: u64) -> u64 {
        pos + self.contiguous(pos)
    }

    /// Whether `pos` is a pad region too short to hold a slot header.
    pub fn is_short_pad(&self, pos: u64) -> bool {
        self.contiguous(pos) < SLOT_HEADER_SIZE as u64
    }

    pub fn used(&self, head: u64, tail: u64) -> u64 {
        head - tail
    }

    pub fn free(&self, head: u64, tail: u64) -> u64 {
        self.capacity - self.used(head, tail)
    }

    /// Place a slot of `size` bytes at `head`, wrapping when it does not fit
    /// contiguously.
    pub fn place(&self, head: u64, size: usize) -> Placement {
        let size = size as u64;
        let contiguous = self.contiguous(head);
        let pad = if size <= contiguous { 0 } else { contiguous };
        let start = head + pad;
        Placement {
            start,
            pad,
            end: start + size,
        }
    }

    /// Whether writing `placement` keeps the live range within capacity.
    pub fn fits(&self, placement: &Placement, tail: u64) -> bool {
        placement.end - tail <= self.capacity
    }

    /// Whether a wrap marker header fits into the pad of `placement`.
    pub fn needs_wrap_marker(&self, placement: &Placement) -> bool {
        placement.pad >= SLOT_HEADER_SIZE as u64
    }

    /// Whether an event of `size` bytes can ever be stored.
    pub fn can_hold(&self, size: usize) -> bool {
        size as u64 <= self.capacity
    }
}
