//! The shared stream buffer.
//!
//! One process creates the buffer ([`StreamBuffer::create`]); every other
//! process that appends or reads opens it by id ([`StreamBuffer::open`]).
//! Structural changes (moving `head` or `tail`, scanning slots) happen under
//! the buffer spinlock. Releasing a slot is a single atomic `fetch_and` on
//! its `readby` word and needs no lock.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pipeline_config_and_utils::Config;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::allocator::{slot_size, Placement, SlotAllocator};
use crate::error::{StreamError, StreamResult};
use crate::protocol::{
    calculate_shm_size, BufferHeader, ReaderSet, SlotHeader, HEADER_SIZE, MAX_CAPACITY,
    MAX_READERS, MIN_CAPACITY, SLOT_ALIGN, SLOT_HEADER_SIZE,
};
use crate::shm_name_for_buffer;
use crate::unix::{latch_reset, latch_set, latch_wait, SharedRegion};

/// Prefix of stream buffer shm names.
pub(crate) const SHM_PREFIX: &str = "psb";

/// How often a stalled append repeats its warning.
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Spins before yielding while taking the buffer lock.
const SPIN_LIMIT: u32 = 64;

/// Local tuning for one handle on a buffer.
#[derive(Debug, Clone)]
pub struct StreamBufferConfig {
    /// Data region size in bytes (creator only).
    pub capacity: usize,
    /// Sleep between eviction checks while an append waits.
    pub eviction_sleep: Duration,
    /// Give up on an append after this long. `None` waits indefinitely.
    pub max_eviction_wait: Option<Duration>,
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for StreamBufferConfig {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.stream_buffer_capacity(),
            eviction_sleep: config.eviction_sleep(),
            max_eviction_wait: config.max_eviction_wait(),
        }
    }
}

/// Where an appended event landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub position: u64,
    pub sequence: u64,
    pub size: usize,
}

/// Point-in-time view of a buffer.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub id: String,
    pub capacity: u64,
    /// Bytes between tail and head, including released slots not yet
    /// reclaimed.
    pub used: u64,
    pub head: u64,
    pub tail: u64,
    pub appended: u64,
    pub eviction_waits: u64,
    pub active_readers: usize,
    pub shutdown: bool,
}

/// What lives at a position inside the live range.
pub(crate) enum Step<'a> {
    /// Padding; continue at the given position.
    Skip(u64),
    Slot(&'a SlotHeader),
}

/// Holds the buffer spinlock until dropped.
pub(crate) struct SpinGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

/// Circular multi-reader event buffer in shared memory.
pub struct StreamBuffer {
    id: String,
    region: SharedRegion,
    alloc: SlotAllocator,
    config: StreamBufferConfig,
}

impl StreamBuffer {
    /// Create and initialize the buffer. Fails if one with this id exists.
    pub fn create(id: &str, config: StreamBufferConfig) -> StreamResult<Self> {
        if config.capacity < MIN_CAPACITY
            || config.capacity > MAX_CAPACITY
            || config.capacity % SLOT_ALIGN != 0
        {
            return Err(StreamError::InvalidConfig(format!(
                "capacity must be a multiple of {} between {} and {}, got {}",
                SLOT_ALIGN, MIN_CAPACITY, MAX_CAPACITY, config.capacity
            )));
        }

        let name = shm_name_for_buffer(id);
        let size = calculate_shm_size(config.capacity);

        info!(
            buffer = %id,
            name = %name,
            capacity = config.capacity,
            "Creating stream buffer"
        );

        let region = SharedRegion::create(&name, size)?;
        let header = unsafe { &mut *(region.as_ptr() as *mut BufferHeader) };
        header.init(config.capacity as u64);

        Ok(Self {
            id: id.to_string(),
            alloc: SlotAllocator::new(config.capacity),
            region,
            config,
        })
    }

    /// Open a buffer created by another handle or process. The capacity in
    /// `config` is ignored in favour of the stored one.
    pub fn open(id: &str, config: StreamBufferConfig) -> StreamResult<Self> {
        let name = shm_name_for_buffer(id);
        let region = SharedRegion::open(&name)?;

        if region.size() < HEADER_SIZE {
            return Err(StreamError::InvalidHeader(format!(
                "region of {} bytes is smaller than the header",
                region.size()
            )));
        }
        let header = unsafe { &*(region.as_ptr() as *const BufferHeader) };
        if !header.validate() {
            return Err(StreamError::InvalidHeader(format!(
                "invalid magic {:x} or version {}",
                header.magic, header.version
            )));
        }
        if header.total_size() != region.size() {
            return Err(StreamError::InvalidHeader(format!(
                "header describes {} bytes, region has {}",
                header.total_size(),
                region.size()
            )));
        }

        let capacity = header.capacity as usize;
        if capacity > MAX_CAPACITY {
            return Err(StreamError::InvalidHeader(format!(
                "capacity {} exceeds {}",
                capacity, MAX_CAPACITY
            )));
        }
        debug!(buffer = %id, capacity = capacity, "Opened stream buffer");

        Ok(Self {
            id: id.to_string(),
            alloc: SlotAllocator::new(capacity),
            region,
            config: StreamBufferConfig { capacity, ..config },
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.alloc.capacity() as usize
    }

    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    pub(crate) fn header(&self) -> &BufferHeader {
        unsafe { &*(self.region.as_ptr() as *const BufferHeader) }
    }

    fn slot_ptr(&self, pos: u64) -> *mut SlotHeader {
        unsafe {
            self.region
                .as_ptr()
                .add(HEADER_SIZE + self.alloc.offset(pos)) as *mut SlotHeader
        }
    }

    /// Slot header at a position inside the live range.
    pub(crate) fn slot_at(&self, pos: u64) -> &SlotHeader {
        unsafe { &*self.slot_ptr(pos) }
    }

    /// Stream name and payload bytes of a live slot.
    pub(crate) fn slot_body(&self, pos: u64, slot: &SlotHeader) -> (&[u8], &[u8]) {
        let stream_len = slot.stream_len as usize;
        let payload_len = slot.payload_len as usize;
        unsafe {
            let body = (self.slot_ptr(pos) as *const u8).add(SLOT_HEADER_SIZE);
            (
                std::slice::from_raw_parts(body, stream_len),
                std::slice::from_raw_parts(body.add(stream_len), payload_len),
            )
        }
    }

    /// Classify the live-range position `pos`. Must hold the lock.
    pub(crate) fn step(&self, pos: u64) -> Step<'_> {
        if self.alloc.is_short_pad(pos) {
            return Step::Skip(self.alloc.next_lap(pos));
        }
        let slot = self.slot_at(pos);
        if slot.is_wrap() {
            return Step::Skip(self.alloc.next_lap(pos));
        }
        assert!(
            slot.is_slot(),
            "corrupt stream buffer {}: bad slot magic {:#x} at position {}",
            self.id,
            slot.magic,
            pos
        );
        Step::Slot(slot)
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        let lock = &self.header().lock;
        let mut spins = 0u32;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        SpinGuard { lock }
    }

    fn check_reader(reader: usize) -> StreamResult<()> {
        if reader >= MAX_READERS {
            return Err(StreamError::InvalidReader(reader));
        }
        Ok(())
    }

    /// Mark `reader` as interested in future appends. Idempotent.
    pub fn register_reader(&self, reader: usize) -> StreamResult<()> {
        Self::check_reader(reader)?;
        let bit = 1u64 << (reader % 64);
        let previous = {
            let _guard = self.lock();
            self.header().active_readers[reader / 64].fetch_or(bit, Ordering::AcqRel)
        };
        if previous & bit == 0 {
            debug!(buffer = %self.id, reader = reader, "Registered reader");
        }
        Ok(())
    }

    /// Drop `reader` and release every slot it still holds. Must not be
    /// called while that reader has an event pinned. Returns the number of
    /// slots released.
    pub fn unregister_reader(&self, reader: usize) -> StreamResult<usize> {
        Self::check_reader(reader)?;
        let header = self.header();
        let released = {
            let _guard = self.lock();
            header.active_readers[reader / 64].fetch_and(!(1u64 << (reader % 64)), Ordering::AcqRel);

            let mut released = 0;
            let head = header.head.load(Ordering::Acquire);
            let mut pos = header.tail.load(Ordering::Acquire);
            while pos < head {
                match self.step(pos) {
                    Step::Skip(next) => pos = next,
                    Step::Slot(slot) => {
                        if slot.release(reader) {
                            released += 1;
                        }
                        pos += slot.size as u64;
                    }
                }
            }
            self.compact_tail();
            released
        };
        latch_reset(&header.latches[reader]);

        info!(buffer = %self.id, reader = reader, released = released, "Unregistered reader");
        Ok(released)
    }

    pub fn is_registered(&self, reader: usize) -> bool {
        self.header().active().contains(reader)
    }

    /// Append an event for `readers` and wake them.
    ///
    /// Readers not registered with the buffer are dropped from the set. When
    /// the space the event needs still holds slots some reader has not
    /// released, the call sleeps in `eviction_sleep` steps until it frees up,
    /// `max_eviction_wait` elapses, or the buffer shuts down.
    pub fn append(
        &self,
        stream: &str,
        encoding: u8,
        payload: &[u8],
        readers: ReaderSet,
    ) -> StreamResult<SlotInfo> {
        if stream.len() > u16::MAX as usize {
            return Err(StreamError::StreamNameTooLong(stream.len()));
        }
        let size = slot_size(stream.len(), payload.len());
        if !self.alloc.can_hold(size) {
            error!(
                buffer = %self.id,
                stream = %stream,
                size = size,
                capacity = self.capacity(),
                "Event can never fit in the stream buffer"
            );
            return Err(StreamError::EventTooLarge {
                size,
                capacity: self.capacity(),
            });
        }

        let header = self.header();
        let started = Instant::now();
        let mut waited = false;
        let mut next_warning = WARN_INTERVAL;

        loop {
            if header.is_shutdown() {
                return Err(StreamError::Shutdown);
            }

            let written = {
                let _guard = self.lock();
                self.compact_tail();
                // Registration changes under the lock too.
                let members = readers.intersection(&header.active());
                self.try_write(stream, encoding, payload, size, members)
                    .map(|info| (info, members))
            };

            if let Some((info, members)) = written {
                for reader in members.iter() {
                    latch_set(&header.latches[reader]);
                }
                trace!(
                    buffer = %self.id,
                    stream = %stream,
                    sequence = info.sequence,
                    position = info.position,
                    readers = members.len(),
                    "Appended event"
                );
                return Ok(info);
            }

            if !waited {
                waited = true;
                header.eviction_waits.fetch_add(1, Ordering::Relaxed);
            }

            let elapsed = started.elapsed();
            if let Some(max_wait) = self.config.max_eviction_wait {
                if elapsed >= max_wait {
                    warn!(
                        buffer = %self.id,
                        stream = %stream,
                        waited_ms = elapsed.as_millis() as u64,
                        "Append gave up waiting for eviction"
                    );
                    return Err(StreamError::EvictionTimeout {
                        waited_ms: elapsed.as_millis() as u64,
                    });
                }
            }
            if elapsed >= next_warning {
                let stats = self.stats();
                warn!(
                    buffer = %self.id,
                    stream = %stream,
                    waited_ms = elapsed.as_millis() as u64,
                    needed = size,
                    used = stats.used,
                    "Append waiting for readers to release slots"
                );
                next_warning += WARN_INTERVAL;
            }

            thread::sleep(self.config.eviction_sleep);
        }
    }

    /// Write the slot if it fits. Must hold the lock.
    fn try_write(
        &self,
        stream: &str,
        encoding: u8,
        payload: &[u8],
        size: usize,
        readers: ReaderSet,
    ) -> Option<SlotInfo> {
        let header = self.header();
        let mut head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);

        let mut placement = self.alloc.place(head, size);
        if placement.wraps() && head == tail {
            // Nothing is live: restart at the next lap instead of padding.
            head = self.alloc.next_lap(head);
            header.tail.store(head, Ordering::Release);
            header.head.store(head, Ordering::Release);
            placement = self.alloc.place(head, size);
        }

        let tail = header.tail.load(Ordering::Acquire);
        if !self.alloc.fits(&placement, tail) {
            return None;
        }

        let sequence = header.next_seq.fetch_add(1, Ordering::Relaxed);
        self.write_slot(head, &placement, sequence, stream, encoding, payload, readers);
        Some(SlotInfo {
            position: placement.start,
            sequence,
            size,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_slot(
        &self,
        head: u64,
        placement: &Placement,
        sequence: u64,
        stream: &str,
        encoding: u8,
        payload: &[u8],
        readers: ReaderSet,
    ) {
        let header = self.header();
        let size = placement.end - placement.start;

        unsafe {
            if self.alloc.needs_wrap_marker(placement) {
                ptr::write(self.slot_ptr(head), SlotHeader::wrap());
            }

            let slot = self.slot_ptr(placement.start);
            ptr::write(
                slot,
                SlotHeader::new(
                    size as u32,
                    stream.len() as u16,
                    payload.len() as u32,
                    encoding,
                    sequence,
                    readers,
                ),
            );
            let body = (slot as *mut u8).add(SLOT_HEADER_SIZE);
            ptr::copy_nonoverlapping(stream.as_ptr(), body, stream.len());
            ptr::copy_nonoverlapping(payload.as_ptr(), body.add(stream.len()), payload.len());
        }

        header.head.store(placement.end, Ordering::Release);
        header.appended.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance the tail over released slots and padding. Must hold the lock.
    fn compact_tail(&self) -> u64 {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let mut tail = header.tail.load(Ordering::Acquire);

        while tail < head {
            match self.step(tail) {
                Step::Skip(next) => tail = next,
                Step::Slot(slot) if slot.is_released() => tail += slot.size as u64,
                Step::Slot(_) => break,
            }
        }

        header.tail.store(tail, Ordering::Release);
        tail
    }

    /// Periodic maintenance: clear bits left behind by readers that are no
    /// longer registered, then reclaim whatever became free.
    pub fn update(&self) -> BufferStats {
        let header = self.header();
        let purged = {
            let _guard = self.lock();
            let active = header.active().words();
            let head = header.head.load(Ordering::Acquire);
            let mut pos = header.tail.load(Ordering::Acquire);
            let mut purged = 0usize;

            while pos < head {
                match self.step(pos) {
                    Step::Skip(next) => pos = next,
                    Step::Slot(slot) => {
                        for (word, mask) in slot.readby.iter().zip(active) {
                            let before = word.fetch_and(mask, Ordering::AcqRel);
                            purged += (before & !mask).count_ones() as usize;
                        }
                        pos += slot.size as u64;
                    }
                }
            }
            self.compact_tail();
            purged
        };

        if purged > 0 {
            info!(buffer = %self.id, purged = purged, "Purged bits of inactive readers");
        }
        self.stats()
    }

    pub fn stats(&self) -> BufferStats {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        BufferStats {
            id: self.id.clone(),
            capacity: self.alloc.capacity(),
            used: self.alloc.used(head, tail),
            head,
            tail,
            appended: header.appended.load(Ordering::Relaxed),
            eviction_waits: header.eviction_waits.load(Ordering::Relaxed),
            active_readers: header.active().len(),
            shutdown: header.is_shutdown(),
        }
    }

    /// Stop the buffer: appends fail with `Shutdown`, blocked readers wake.
    pub fn shutdown(&self) {
        let header = self.header();
        if header.is_shutdown() {
            return;
        }
        info!(buffer = %self.id, "Shutting down stream buffer");
        header.set_shutdown();
        for latch in header.latches.iter() {
            latch_set(latch);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.header().is_shutdown()
    }

    /// Block until `reader`'s latch is set or `timeout` elapses. Returns
    /// whether the latch was set.
    pub fn wait_latch(&self, reader: usize, timeout: Option<Duration>) -> StreamResult<bool> {
        Self::check_reader(reader)?;
        Ok(latch_wait(&self.header().latches[reader], timeout))
    }

    pub fn set_latch(&self, reader: usize) -> StreamResult<()> {
        Self::check_reader(reader)?;
        latch_set(&self.header().latches[reader]);
        Ok(())
    }

    pub fn reset_latch(&self, reader: usize) -> StreamResult<()> {
        Self::check_reader(reader)?;
        latch_reset(&self.header().latches[reader]);
        Ok(())
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        if self.is_owner() {
            self.shutdown();
            info!(buffer = %self.id, "Dropping stream buffer");
        }
    }
}
