//! Shared acknowledgment table.
//!
//! Writers that need to know when their tuples were received or processed
//! take a record from this table, attach an [`AckRef`] to every micro-batch
//! they send, and wait on the record's counters. Workers and combiners bump
//! the counters through the reference they received.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ AckTableHeader: magic, version, capacity,                │
//! │                 counter (rotating allocator), generation │
//! ├──────────────────────────────────────────────────────────┤
//! │ AckRecord[capacity]                                      │
//! │   id: u64  (0 = free; top 2 bits = InsertLevel)          │
//! │   wrecv, wtups, wacks, ctups, cacks, users: u32          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A reference is only meaningful while the record still carries the id it
//! was created with; once the writer frees the record every stale reference
//! is silently ignored. `users` counts counter updates in flight, and a
//! record is not reset for a new writer until it drops to zero.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use stream_buffer::unix::{shm_name, SharedRegion};
use stream_buffer::StreamError;
use tracing::{debug, trace, warn};

use crate::error::{MicrobatchError, MicrobatchResult};

/// Magic number for validating the table: "PACK"
const MAGIC: u32 = 0x5041_434B;
const VERSION: u32 = 2;
const SHM_PREFIX: &str = "pack";

const LEVEL_SHIFT: u32 = 62;
const LOW_MASK: u64 = (1 << LEVEL_SHIFT) - 1;

/// Poll interval of [`AckHandle::wait`].
const WAIT_POLL: Duration = Duration::from_millis(1);

/// Longest a new writer waits for in-flight updates of a reused record.
const USERS_WAIT: Duration = Duration::from_millis(10);

/// Durability a writer asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InsertLevel {
    /// Do not wait.
    Asynchronous = 0,
    /// Wait until workers received every tuple.
    SynchronousReceive = 1,
    /// Wait until workers and combiners processed every tuple.
    SynchronousCommit = 2,
    /// Like `SynchronousCommit`, for flush markers.
    Flush = 3,
}

impl InsertLevel {
    /// Level encoded in a record id.
    pub fn from_tag(tag: u64) -> Self {
        match tag >> LEVEL_SHIFT {
            0 => InsertLevel::Asynchronous,
            1 => InsertLevel::SynchronousReceive,
            2 => InsertLevel::SynchronousCommit,
            _ => InsertLevel::Flush,
        }
    }
}

/// Reference to a record as carried inside micro-batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AckRef {
    pub tag: u64,
    pub index: u32,
}

impl AckRef {
    pub fn level(&self) -> InsertLevel {
        InsertLevel::from_tag(self.tag)
    }
}

/// Snapshot of one record's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckCounters {
    pub wrecv: u32,
    pub wtups: u32,
    pub wacks: u32,
    pub ctups: u32,
    pub cacks: u32,
}

impl AckCounters {
    pub fn is_received(&self) -> bool {
        self.wrecv >= self.wtups
    }

    pub fn is_acked(&self) -> bool {
        self.wacks >= self.wtups && self.cacks >= self.ctups
    }
}

#[repr(C, align(64))]
struct AckTableHeader {
    magic: u32,
    version: u32,
    capacity: u64,
    counter: AtomicU64,
    generation: AtomicU64,
}

#[repr(C)]
struct AckRecord {
    id: AtomicU64,
    wrecv: AtomicU32,
    wtups: AtomicU32,
    wacks: AtomicU32,
    ctups: AtomicU32,
    cacks: AtomicU32,
    users: AtomicU32,
}

impl AckRecord {
    fn reset_counters(&self) {
        for counter in [&self.wrecv, &self.wtups, &self.wacks, &self.ctups, &self.cacks] {
            counter.store(0, Ordering::Release);
        }
    }

    /// Wait out updates that passed the id check before the record was
    /// claimed. Gives up after `USERS_WAIT`; only a process that died
    /// mid-update holds it that long.
    fn wait_for_users(&self) {
        let start = Instant::now();
        while self.users.load(Ordering::SeqCst) != 0 {
            if start.elapsed() > USERS_WAIT {
                warn!(
                    users = self.users.load(Ordering::Relaxed),
                    "Reusing ack record with updates in flight"
                );
                return;
            }
            std::hint::spin_loop();
        }
    }

    fn counters(&self) -> AckCounters {
        AckCounters {
            wrecv: self.wrecv.load(Ordering::Acquire),
            wtups: self.wtups.load(Ordering::Acquire),
            wacks: self.wacks.load(Ordering::Acquire),
            ctups: self.ctups.load(Ordering::Acquire),
            cacks: self.cacks.load(Ordering::Acquire),
        }
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<AckTableHeader>();
const RECORD_SIZE: usize = std::mem::size_of::<AckRecord>();

/// Which counter an operation bumps.
#[derive(Debug, Clone, Copy)]
enum Counter {
    Wrecv,
    Wtups,
    Wacks,
    Ctups,
    Cacks,
}

/// Fixed-size table of acknowledgment records in shared memory.
pub struct AckTable {
    region: SharedRegion,
    capacity: usize,
}

impl AckTable {
    pub fn create(id: &str, capacity: usize) -> MicrobatchResult<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(MicrobatchError::Codec(format!(
                "invalid acknowledgment table capacity {}",
                capacity
            )));
        }

        let region = SharedRegion::create(
            &shm_name(SHM_PREFIX, id),
            HEADER_SIZE + capacity * RECORD_SIZE,
        )?;
        let header = unsafe { &mut *(region.as_ptr() as *mut AckTableHeader) };
        header.magic = MAGIC;
        header.version = VERSION;
        header.capacity = capacity as u64;

        debug!(table = %id, capacity = capacity, "Created acknowledgment table");
        Ok(Self { region, capacity })
    }

    pub fn open(id: &str) -> MicrobatchResult<Self> {
        let region = SharedRegion::open(&shm_name(SHM_PREFIX, id))?;
        if region.size() < HEADER_SIZE {
            return Err(StreamError::InvalidHeader("acknowledgment table too small".into()).into());
        }

        let header = unsafe { &*(region.as_ptr() as *const AckTableHeader) };
        if header.magic != MAGIC || header.version != VERSION {
            return Err(StreamError::InvalidHeader(format!(
                "acknowledgment table magic {:x} version {}",
                header.magic, header.version
            ))
            .into());
        }
        let capacity = header.capacity as usize;
        if region.size() != HEADER_SIZE + capacity * RECORD_SIZE {
            return Err(StreamError::InvalidHeader(format!(
                "acknowledgment table of {} records in {} bytes",
                capacity,
                region.size()
            ))
            .into());
        }

        Ok(Self { region, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn header(&self) -> &AckTableHeader {
        unsafe { &*(self.region.as_ptr() as *const AckTableHeader) }
    }

    fn records(&self) -> &[AckRecord] {
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(HEADER_SIZE) as *const AckRecord,
                self.capacity,
            )
        }
    }

    /// Record behind `ack`, if the reference is still live.
    fn live(&self, ack: &AckRef) -> Option<&AckRecord> {
        let record = self.records().get(ack.index as usize)?;
        (record.id.load(Ordering::Acquire) == ack.tag).then_some(record)
    }

    pub fn generation(&self) -> u64 {
        self.header().generation.load(Ordering::Acquire)
    }

    /// Mark a restart of the worker/combiner set; writers waiting on records
    /// created before it give up.
    pub fn bump_generation(&self) -> u64 {
        let generation = self.header().generation.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(generation = generation, "Acknowledgment generation bumped");
        generation
    }

    /// Take a free record for a writer.
    pub fn new_ack(&self, level: InsertLevel) -> MicrobatchResult<AckHandle<'_>> {
        let low = (rand::random::<u64>() & LOW_MASK).max(1);
        let id = ((level as u64) << LEVEL_SHIFT) | low;
        let header = self.header();
        let records = self.records();

        for _ in 0..self.capacity {
            let index = (header.counter.fetch_add(1, Ordering::AcqRel) % self.capacity as u64) as usize;
            let record = &records[index];
            if record
                .id
                .compare_exchange(0, id, Ordering::SeqCst, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            record.wait_for_users();
            record.reset_counters();

            trace!(index = index, level = ?level, "Allocated ack record");
            return Ok(AckHandle {
                table: self,
                ack: AckRef {
                    tag: id,
                    index: index as u32,
                },
                generation: self.generation(),
            });
        }

        warn!(capacity = self.capacity, "Acknowledgment table full");
        Err(MicrobatchError::AckTableFull(self.capacity))
    }

    pub fn is_valid(&self, ack: &AckRef) -> bool {
        self.live(ack).is_some()
    }

    pub fn counters(&self, ack: &AckRef) -> Option<AckCounters> {
        self.live(ack).map(AckRecord::counters)
    }

    fn bump(&self, ack: &AckRef, counter: Counter, n: u32) -> bool {
        let Some(record) = self.records().get(ack.index as usize) else {
            return false;
        };
        // Register before checking the id, so a writer that claims the record
        // afterwards resets it only once this update is done.
        record.users.fetch_add(1, Ordering::SeqCst);
        if record.id.load(Ordering::SeqCst) != ack.tag {
            record.users.fetch_sub(1, Ordering::SeqCst);
            trace!(tag = ack.tag, index = ack.index, counter = ?counter, "Skipping stale ack reference");
            return false;
        }
        let word = match counter {
            Counter::Wrecv => &record.wrecv,
            Counter::Wtups => &record.wtups,
            Counter::Wacks => &record.wacks,
            Counter::Ctups => &record.ctups,
            Counter::Cacks => &record.cacks,
        };
        word.fetch_add(n, Ordering::AcqRel);
        record.users.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Tuples sent to workers. Returns false for a stale reference.
    pub fn add_wtups(&self, ack: &AckRef, n: u32) -> bool {
        self.bump(ack, Counter::Wtups, n)
    }

    pub fn inc_wrecv(&self, ack: &AckRef, n: u32) -> bool {
        self.bump(ack, Counter::Wrecv, n)
    }

    pub fn inc_wacks(&self, ack: &AckRef, n: u32) -> bool {
        self.bump(ack, Counter::Wacks, n)
    }

    pub fn inc_ctups(&self, ack: &AckRef, n: u32) -> bool {
        self.bump(ack, Counter::Ctups, n)
    }

    pub fn inc_cacks(&self, ack: &AckRef, n: u32) -> bool {
        self.bump(ack, Counter::Cacks, n)
    }
}

/// A writer's record. Freed when dropped.
pub struct AckHandle<'t> {
    table: &'t AckTable,
    ack: AckRef,
    generation: u64,
}

impl AckHandle<'_> {
    pub fn ack_ref(&self) -> AckRef {
        self.ack
    }

    pub fn level(&self) -> InsertLevel {
        self.ack.level()
    }

    pub fn add_wtups(&self, n: u32) {
        self.table.add_wtups(&self.ack, n);
    }

    pub fn counters(&self) -> AckCounters {
        self.table.counters(&self.ack).unwrap_or_default()
    }

    pub fn is_received(&self) -> bool {
        self.counters().is_received()
    }

    pub fn is_acked(&self) -> bool {
        self.counters().is_acked()
    }

    /// Block until the record satisfies the handle's level.
    ///
    /// Returns false when `timeout` elapses or the table generation moves on
    /// (the processes that would have acked are gone). A generation of 0 at
    /// creation means workers were still starting, so it keeps waiting.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let done = match self.level() {
                InsertLevel::Asynchronous => return true,
                InsertLevel::SynchronousReceive => self.is_received(),
                InsertLevel::SynchronousCommit | InsertLevel::Flush => self.is_acked(),
            };
            if done {
                return true;
            }

            let generation = self.table.generation();
            if self.generation != 0 && generation != self.generation {
                debug!(
                    started = self.generation,
                    current = generation,
                    "Ack wait abandoned after restart"
                );
                return false;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }

            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl Drop for AckHandle<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.table.records().get(self.ack.index as usize) {
            let _ = record
                .id
                .compare_exchange(self.ack.tag, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}
