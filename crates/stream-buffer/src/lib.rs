//! Multi-reader event buffer in POSIX shared memory.
//!
//! Writers append events (a stream name, an encoding tag and an opaque
//! payload) together with the set of readers that must observe them. Each
//! reader walks the buffer in append order, pins one event at a time and
//! unpins it when done. Space is reclaimed only once every listed reader has
//! unpinned a slot; until then writers wait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  append(stream, payload, readers)  ┌──────────────────┐
//! │   Writers    │ ─────────────────────────────────▶ │                  │
//! └──────────────┘                                    │  Shared Memory   │
//!                                                     │  head ─▶ [slots] │
//! ┌──────────────┐  pin_next() / next_blocking()      │  tail ─▶         │
//! │ Reader 0..N  │ ◀───────────────────────────────── │                  │
//! └──────────────┘  unpin() clears the reader's bit   └──────────────────┘
//! ```
//!
//! Every reader id owns a latch word in the header. Appends set the latches
//! of the slot's readers; idle readers sleep on theirs (futex on Linux).
//!
//! # Usage
//!
//! ```ignore
//! use stream_buffer::{ReaderSet, StreamBuffer, StreamBufferConfig};
//!
//! let buffer = StreamBuffer::create("0", StreamBufferConfig::default())?;
//! let mut reader = buffer.open_reader(3)?;
//!
//! let readers: ReaderSet = [3].into_iter().collect();
//! buffer.append("clicks", 0, b"payload", readers)?;
//!
//! if let Some(event) = reader.next_blocking(Some(Duration::from_secs(1)))? {
//!     handle(event.stream(), event.payload());
//!     event.unpin();
//! }
//! ```
//!
//! See [`protocol`] for the memory layout and [`allocator`] for placement.

pub mod allocator;
pub mod error;
pub mod protocol;

#[cfg(unix)]
pub mod buffer;
#[cfg(unix)]
pub mod reader;
#[cfg(unix)]
pub mod unix;

pub use error::{StreamError, StreamResult};
pub use protocol::{ReaderSet, MAX_READERS};

#[cfg(unix)]
pub use buffer::{BufferStats, SlotInfo, StreamBuffer, StreamBufferConfig};
#[cfg(unix)]
pub use reader::{PinnedEvent, Reader, ReaderState, StreamEvent};

/// POSIX shm name backing the buffer with this id.
#[cfg(unix)]
pub fn shm_name_for_buffer(id: &str) -> String {
    unix::shm_name(buffer::SHM_PREFIX, id)
}
