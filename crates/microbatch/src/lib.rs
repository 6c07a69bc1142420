//! Micro-batches: groups of tuples moved between pipeline processes as one
//! message.
//!
//! - [`codec`] packs and unpacks micro-batches
//! - [`ack`] is the shared table writers use to learn when their tuples
//!   were received and processed
//! - [`reader`] pulls micro-batches from a [`reader::MessageSource`] and
//!   hands their tuples to each interested query
//! - [`router`] picks the worker or combiner a batch goes to and sends it
//!
//! ```text
//! writer ──(tuples + AckRef)──▶ worker ──(hashed tuples)──▶ combiner
//!    │                            │ wrecv, wacks, ctups         │ cacks
//!    └──────── waits on ─────────▶ AckTable ◀───────────────────┘
//! ```

pub mod ack;
pub mod codec;
pub mod error;
pub mod reader;
pub mod router;

pub use ack::{AckCounters, AckHandle, AckRef, AckTable, InsertLevel};
pub use codec::{Microbatch, MicrobatchBuilder, MicrobatchKind, QuerySet, ACK_RESERVE, MAX_QUERIES};
pub use error::{MicrobatchError, MicrobatchResult};
pub use reader::{BatchSummary, MessageSource, MicrobatchReader, ProcessRole, ReaderConfig};
pub use router::{MessageSink, MicrobatchSender, Route, SenderRole, Topology};
