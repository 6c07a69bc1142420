//! Shared memory layout of the stream buffer.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  BufferHeader (HEADER_SIZE bytes, cache-line aligned)            │
//! │  ├─ magic, version, capacity                                     │
//! │  ├─ head: u64         (next write position, monotonic)           │
//! │  ├─ tail: u64         (oldest live position, monotonic)          │
//! │  ├─ lock: u32         (buffer spinlock)                          │
//! │  ├─ flags: u32        (SHUTDOWN)                                 │
//! │  ├─ next_seq, appended, eviction_waits                           │
//! │  ├─ active_readers: [u64; 2]                                     │
//! │  └─ latches: [u32; MAX_READERS]                                  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Data region (capacity bytes)                                    │
//! │  ┌────────┬────────┬────────┬─────┬──────┐                       │
//! │  │ Slot   │ Slot   │ Slot   │ ... │ WRAP │  ← end of region      │
//! │  └────────┴────────┴────────┴─────┴──────┘                       │
//! │                                                                  │
//! │  Each slot:                                                      │
//! │  ├─ SlotHeader (40 bytes)                                        │
//! │  │   ├─ magic: u32        (SLOT_MAGIC or WRAP_MAGIC)             │
//! │  │   ├─ size: u32         (whole slot, 8-byte aligned)           │
//! │  │   ├─ payload_len: u32                                         │
//! │  │   ├─ stream_len: u16                                          │
//! │  │   ├─ encoding: u8                                             │
//! │  │   ├─ seq: u64          (append order)                         │
//! │  │   └─ readby: [u64; 2]  (readers that still must observe it)   │
//! │  ├─ stream name bytes                                            │
//! │  └─ payload bytes, padded to 8                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Positions are monotonic byte counters; the offset of a position inside
//! the data region is `position % capacity`. Nothing in the region stores a
//! native pointer, so every process may map it at a different address.
//!
//! A position whose remaining contiguous space is shorter than a slot header,
//! or which holds a `WRAP_MAGIC` header, continues at the next multiple of
//! `capacity`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number for validating the region: "PSBF"
pub const MAGIC: u32 = 0x5053_4246;

/// Layout version. Increment when making breaking changes.
pub const VERSION: u32 = 1;

/// Maximum number of concurrently registered readers.
pub const MAX_READERS: usize = 128;

const READER_WORDS: usize = MAX_READERS / 64;

/// Size of the buffer header.
pub const HEADER_SIZE: usize = std::mem::size_of::<BufferHeader>();

/// Size of each slot's header.
pub const SLOT_HEADER_SIZE: usize = 40;

/// Slot alignment inside the data region.
pub const SLOT_ALIGN: usize = 8;

/// Smallest accepted data region.
pub const MIN_CAPACITY: usize = 256;

/// Largest accepted data region. Slot sizes are stored as `u32`.
pub const MAX_CAPACITY: usize = u32::MAX as usize / SLOT_ALIGN * SLOT_ALIGN;

/// Marks a live slot.
pub const SLOT_MAGIC: u32 = 0x534C_4F54;

/// Marks the unused tail of the region before a wrap.
pub const WRAP_MAGIC: u32 = 0x5752_4150;

/// Header flags
pub mod flags {
    /// Shutdown requested - appends fail, waiting readers return
    pub const SHUTDOWN: u32 = 1 << 0;
}

/// Header at the start of the shared region.
#[repr(C, align(64))]
pub struct BufferHeader {
    pub magic: u32,
    pub version: u32,
    /// Data region size in bytes (multiple of `SLOT_ALIGN`)
    pub capacity: u64,
    /// Next write position
    pub head: AtomicU64,
    /// Oldest position that may still be read
    pub tail: AtomicU64,
    /// Buffer spinlock (0 = free)
    pub lock: AtomicU32,
    /// Flags (see `flags` module)
    pub flags: AtomicU32,
    /// Sequence number handed to the next appended event
    pub next_seq: AtomicU64,
    /// Total events appended
    pub appended: AtomicU64,
    /// Appends that had to wait for eviction
    pub eviction_waits: AtomicU64,
    /// Registered readers
    pub active_readers: [AtomicU64; READER_WORDS],
    /// One wake word per reader id
    pub latches: [AtomicU32; MAX_READERS],
}

impl BufferHeader {
    /// Initialize a freshly mapped (zeroed) header.
    pub fn init(&mut self, capacity: u64) {
        self.magic = MAGIC;
        self.version = VERSION;
        self.capacity = capacity;
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
        *self.lock.get_mut() = 0;
        *self.flags.get_mut() = 0;
        *self.next_seq.get_mut() = 0;
        *self.appended.get_mut() = 0;
        *self.eviction_waits.get_mut() = 0;
        for word in self.active_readers.iter_mut() {
            *word.get_mut() = 0;
        }
        for latch in self.latches.iter_mut() {
            *latch.get_mut() = 0;
        }
    }

    /// Validate magic and version.
    pub fn validate(&self) -> bool {
        self.magic == MAGIC && self.version == VERSION
    }

    /// Region size this header describes.
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.capacity as usize
    }

    pub fn is_shutdown(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flags::SHUTDOWN != 0
    }

    pub fn set_shutdown(&self) {
        self.flags.fetch_or(flags::SHUTDOWN, Ordering::Release);
    }

    /// Snapshot of the registered readers.
    pub fn active(&self) -> ReaderSet {
        ReaderSet::from_words(load_words(&self.active_readers))
    }
}

/// Header for each slot in the data region.
#[repr(C)]
pub struct SlotHeader {
    pub magic: u32,
    /// Whole slot size including this header
    pub size: u32,
    pub payload_len: u32,
    pub stream_len: u16,
    pub encoding: u8,
    pub _reserved: u8,
    /// Append sequence number
    pub seq: u64,
    /// Readers that still must observe this slot
    pub readby: [AtomicU64; READER_WORDS],
}

impl SlotHeader {
    /// Header for a live slot whose readby set is `readers`.
    pub fn new(size: u32, stream_len: u16, payload_len: u32, encoding: u8, seq: u64, readers: ReaderSet) -> Self {
        let [lo, hi] = readers.words();
        Self {
            magic: SLOT_MAGIC,
            size,
            payload_len,
            stream_len,
            encoding,
            _reserved: 0,
            seq,
            readby: [AtomicU64::new(lo), AtomicU64::new(hi)],
        }
    }

    /// Marker that sends readers back to the start of the region.
    pub fn wrap() -> Self {
        Self {
            magic: WRAP_MAGIC,
            size: 0,
            payload_len: 0,
            stream_len: 0,
            encoding: 0,
            _reserved: 0,
            seq: 0,
            readby: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn is_wrap(&self) -> bool {
        self.magic == WRAP_MAGIC
    }

    pub fn is_slot(&self) -> bool {
        self.magic == SLOT_MAGIC
    }

    /// Readers that have not yet unpinned this slot.
    pub fn readers(&self) -> ReaderSet {
        ReaderSet::from_words(load_words(&self.readby))
    }

    /// Slot is reclaimable once nobody still needs it.
    pub fn is_released(&self) -> bool {
        self.readby
            .iter()
            .all(|word| word.load(Ordering::Acquire) == 0)
    }

    pub fn is_member(&self, reader: usize) -> bool {
        let (word, bit) = ReaderSet::locate(reader);
        self.readby[word].load(Ordering::Acquire) & bit != 0
    }

    /// Clear `reader`'s bit. Returns whether the bit was set.
    pub fn release(&self, reader: usize) -> bool {
        let (word, bit) = ReaderSet::locate(reader);
        self.readby[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
}

fn load_words(words: &[AtomicU64; READER_WORDS]) -> [u64; READER_WORDS] {
    [
        words[0].load(Ordering::Acquire),
        words[1].load(Ordering::Acquire),
    ]
}

/// Fixed-size set of reader ids (`0..MAX_READERS`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderSet {
    words: [u64; READER_WORDS],
}

impl ReaderSet {
    pub const fn empty() -> Self {
        Self {
            words: [0; READER_WORDS],
        }
    }

    pub fn from_words(words: [u64; READER_WORDS]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> [u64; READER_WORDS] {
        self.words
    }

    fn locate(reader: usize) -> (usize, u64) {
        debug_assert!(reader < MAX_READERS);
        (reader / 64, 1u64 << (reader % 64))
    }

    /// Add a reader. Ids `>= MAX_READERS` are ignored.
    pub fn insert(&mut self, reader: usize) {
        if reader < MAX_READERS {
            let (word, bit) = Self::locate(reader);
            self.words[word] |= bit;
        }
    }

    pub fn remove(&mut self, reader: usize) {
        if reader < MAX_READERS {
            let (word, bit) = Self::locate(reader);
            self.words[word] &= !bit;
        }
    }

    pub fn contains(&self, reader: usize) -> bool {
        if reader >= MAX_READERS {
            return false;
        }
        let (word, bit) = Self::locate(reader);
        self.words[word] & bit != 0
    }

    pub fn intersection(&self, other: &ReaderSet) -> ReaderSet {
        ReaderSet {
            words: [self.words[0] & other.words[0], self.words[1] & other.words[1]],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_READERS).filter(move |r| self.contains(*r))
    }
}

impl FromIterator<usize> for ReaderSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = ReaderSet::empty();
        for reader in iter {
            set.insert(reader);
        }
        set
    }
}

/// Required shared memory size for a data region of `capacity` bytes.
pub fn calculate_shm_size(capacity: usize) -> usize {
    HEADER_SIZE + capacity
}
