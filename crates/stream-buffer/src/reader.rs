//! Per-reader cursor over a stream buffer.
//!
//! A [`Reader`] walks the live range in append order, skipping slots that do
//! not list it. At most one event is pinned at a time: [`PinnedEvent`]
//! mutably borrows its reader, and dropping or unpinning it clears the
//! reader's bit in the slot.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error};

use crate::buffer::{Step, StreamBuffer};
use crate::error::StreamResult;
use crate::protocol::{SlotHeader, MAX_READERS};

/// Longest single latch wait before re-checking the buffer.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Reading,
}

/// An event copied out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub stream: String,
    pub encoding: u8,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl StreamBuffer {
    /// Open a cursor for `reader_id`, starting at the current tail. Registers
    /// the reader if it is not registered yet.
    pub fn open_reader(&self, reader_id: usize) -> StreamResult<Reader<'_>> {
        self.register_reader(reader_id)?;
        let position = {
            let _guard = self.lock();
            self.header().tail.load(Ordering::Acquire)
        };
        debug!(buffer = %self.id(), reader = reader_id, position = position, "Opened reader");
        Ok(Reader {
            buffer: self,
            id: reader_id,
            position,
            state: ReaderState::Idle,
        })
    }
}

pub struct Reader<'a> {
    buffer: &'a StreamBuffer,
    id: usize,
    position: u64,
    state: ReaderState,
}

impl Reader<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Find the next slot listing this reader and move past it.
    fn locate_next(&mut self) -> Option<u64> {
        debug_assert!(self.id < MAX_READERS);
        let _guard = self.buffer.lock();
        let header = self.buffer.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);

        // Everything behind the tail was released by every reader.
        if self.position < tail {
            self.position = tail;
        }

        while self.position < head {
            match self.buffer.step(self.position) {
                Step::Skip(next) => self.position = next,
                Step::Slot(slot) => {
                    let here = self.position;
                    self.position += slot.size as u64;
                    if slot.is_member(self.id) {
                        return Some(here);
                    }
                }
            }
        }
        None
    }

    fn pin_at(&mut self, position: u64) -> PinnedEvent<'_> {
        self.state = ReaderState::Reading;
        PinnedEvent {
            buffer: self.buffer,
            slot: self.buffer.slot_at(position),
            state: &mut self.state,
            reader: self.id,
            position,
            released: false,
        }
    }

    /// Pin the next event for this reader, if one is available now.
    pub fn pin_next(&mut self) -> Option<PinnedEvent<'_>> {
        let position = self.locate_next()?;
        Some(self.pin_at(position))
    }

    /// Pin the next event, sleeping on the reader's latch until one arrives.
    /// Returns `None` when `timeout` elapses or the buffer shuts down.
    pub fn next_blocking(
        &mut self,
        timeout: Option<Duration>,
    ) -> StreamResult<Option<PinnedEvent<'_>>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Reset before scanning so an append racing with the scan still
            // leaves the latch set.
            self.buffer.reset_latch(self.id)?;

            if let Some(position) = self.locate_next() {
                return Ok(Some(self.pin_at(position)));
            }
            if self.buffer.is_shutdown() {
                return Ok(None);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            self.buffer.wait_latch(self.id, Some(slice))?;
        }
    }

    /// Drain every available event into owned copies.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.pin_next() {
            events.push(event.to_event());
        }
        events
    }

    /// Stop reading. Slots appended for this reader stay held until it is
    /// unregistered from the buffer or a new cursor consumes them.
    pub fn close(self) {
        debug!(
            buffer = %self.buffer.id(),
            reader = self.id,
            position = self.position,
            "Closed reader"
        );
    }
}

/// An event held in place until unpinned.
pub struct PinnedEvent<'r> {
    buffer: &'r StreamBuffer,
    slot: &'r SlotHeader,
    state: &'r mut ReaderState,
    reader: usize,
    position: u64,
    released: bool,
}

impl PinnedEvent<'_> {
    pub fn stream(&self) -> &str {
        let (stream, _) = self.buffer.slot_body(self.position, self.slot);
        std::str::from_utf8(stream).unwrap_or_default()
    }

    pub fn payload(&self) -> &[u8] {
        self.buffer.slot_body(self.position, self.slot).1
    }

    pub fn encoding(&self) -> u8 {
        self.slot.encoding
    }

    pub fn sequence(&self) -> u64 {
        self.slot.seq
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn to_event(&self) -> StreamEvent {
        StreamEvent {
            stream: self.stream().to_string(),
            encoding: self.encoding(),
            sequence: self.sequence(),
            payload: self.payload().to_vec(),
        }
    }

    /// Release the slot for this reader.
    pub fn unpin(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.slot.release(self.reader) {
            error!(
                buffer = %self.buffer.id(),
                reader = self.reader,
                position = self.position,
                "Pinned slot was already released"
            );
        }
        *self.state = ReaderState::Idle;
    }
}

impl Drop for PinnedEvent<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
