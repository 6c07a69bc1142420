//! Pull side of the micro-batch transport.
//!
//! A worker or combiner pulls every micro-batch that arrived within a short
//! window, lets each interested query scan the tuples, then acknowledges
//! the whole pull once:
//!
//! ```text
//! pull() ──> next(q1)… rewind() next(q2)… ──> ack() ──> reset()
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_config_and_utils::Config;
use pipeline_ipc::IpcContext;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::ack::{AckRef, AckTable, InsertLevel};
use crate::codec::{Microbatch, MicrobatchBuilder, MicrobatchKind, QuerySet};
use crate::error::MicrobatchResult;

/// Where packed micro-batches come from.
#[async_trait]
pub trait MessageSource: Send {
    /// Next message, or `None` once `timeout` elapses.
    async fn recv(&mut self, timeout: Option<Duration>) -> MicrobatchResult<Option<Vec<u8>>>;
}

#[async_trait]
impl MessageSource for IpcContext {
    async fn recv(&mut self, timeout: Option<Duration>) -> MicrobatchResult<Option<Vec<u8>>> {
        Ok(IpcContext::recv(self, timeout).await?)
    }
}

/// Which acknowledgment counters this process advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Worker,
    Combiner,
}

/// Per-pull budgets.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Stop pulling after this many tuples.
    pub batch_size: usize,
    /// Stop pulling after this many tuple bytes.
    pub batch_mem: usize,
    /// Longest a pull waits for more batches.
    pub batch_wait: Duration,
    /// Acknowledge single-ack asynchronous batches on receipt.
    pub fast_path: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ReaderConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_mem: config.batch_mem(),
            batch_wait: config.batch_wait(),
            fast_path: config.ack_fast_path,
        }
    }
}

/// What one `pull` brought in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub ntups: usize,
    pub nbytes: usize,
    /// Union of the target queries of every tuple batch.
    pub queries: QuerySet,
    /// References still to be acknowledged.
    pub acks: Vec<AckRef>,
}

pub struct MicrobatchReader<S> {
    source: S,
    role: ProcessRole,
    config: ReaderConfig,
    table: Option<Arc<AckTable>>,
    batches: Vec<Microbatch>,
    flush_acks: Vec<AckRef>,
    /// Reference and increment applied by the next `ack`.
    pending: Vec<(AckRef, u32)>,
    batch_idx: usize,
    tuple_idx: usize,
    exhausted: bool,
}

impl<S: MessageSource> MicrobatchReader<S> {
    pub fn new(source: S, role: ProcessRole, config: ReaderConfig) -> Self {
        Self {
            source,
            role,
            config,
            table: None,
            batches: Vec::new(),
            flush_acks: Vec::new(),
            pending: Vec::new(),
            batch_idx: 0,
            tuple_idx: 0,
            exhausted: false,
        }
    }

    /// Resolve acknowledgment references against `table`. Without a table
    /// acks are dropped.
    pub fn with_ack_table(mut self, table: Arc<AckTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Receive micro-batches until a budget is used up or the pull window
    /// closes. Batches are added to the ones already held.
    pub async fn pull(&mut self) -> MicrobatchResult<BatchSummary> {
        let deadline = Instant::now() + self.config.batch_wait;
        let mut summary = BatchSummary::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(buf) = self.source.recv(Some(remaining)).await? else {
                break;
            };
            let batch = Microbatch::unpack(&buf)?;
            self.accept(batch, &mut summary);

            if summary.ntups >= self.config.batch_size
                || summary.nbytes >= self.config.batch_mem
                || Instant::now() >= deadline
            {
                break;
            }
        }

        if summary.ntups > 0 || !summary.acks.is_empty() {
            debug!(
                ntups = summary.ntups,
                nbytes = summary.nbytes,
                batches = self.batches.len(),
                acks = summary.acks.len(),
                "Pulled micro-batches"
            );
        }
        Ok(summary)
    }

    fn accept(&mut self, batch: Microbatch, summary: &mut BatchSummary) {
        match batch.kind() {
            MicrobatchKind::Flush => {
                // Decoding guarantees exactly one ack.
                let ack = batch.acks()[0];
                if self.role == ProcessRole::Worker {
                    if let Some(table) = &self.table {
                        table.inc_wrecv(&ack, 1);
                    }
                }
                trace!(tag = ack.tag, "Received flush");
                self.flush_acks.push(ack);
                self.pending.push((ack, 1));
                summary.acks.push(ack);
            }
            MicrobatchKind::Tuples => {
                let ntups = batch.ntups() as u32;
                if self.role == ProcessRole::Worker {
                    if let Some(table) = &self.table {
                        for ack in batch.acks() {
                            table.inc_wrecv(ack, ntups);
                        }
                    }
                }

                let fast = self.config.fast_path
                    && batch.acks().len() == 1
                    && batch.acks()[0].level() == InsertLevel::Asynchronous;
                if fast {
                    self.apply(&batch.acks()[0], ntups);
                } else {
                    for ack in batch.acks() {
                        self.pending.push((*ack, ntups));
                        summary.acks.push(*ack);
                    }
                }

                summary.ntups += batch.ntups();
                summary.nbytes += batch.nbytes();
                summary.queries.union_with(batch.queries());
                self.batches.push(batch);
            }
        }
    }

    fn apply(&self, ack: &AckRef, n: u32) -> bool {
        let Some(table) = &self.table else {
            return false;
        };
        match self.role {
            ProcessRole::Worker => table.inc_wacks(ack, n),
            ProcessRole::Combiner => table.inc_cacks(ack, n),
        }
    }

    /// Position of the next tuple for `query`, advancing the cursor.
    fn advance(&mut self, query: usize) -> Option<(usize, usize)> {
        if self.exhausted {
            return None;
        }
        while let Some(batch) = self.batches.get(self.batch_idx) {
            if batch.queries().contains(query) && self.tuple_idx < batch.ntups() {
                let position = (self.batch_idx, self.tuple_idx);
                self.tuple_idx += 1;
                return Some(position);
            }
            self.batch_idx += 1;
            self.tuple_idx = 0;
        }
        self.exhausted = true;
        None
    }

    /// Next tuple addressed to `query`. Once this returns `None` it keeps
    /// doing so until `rewind`.
    pub fn next(&mut self, query: usize) -> Option<&[u8]> {
        self.advance(query)
            .map(|(batch, tuple)| self.batches[batch].tuple(tuple))
    }

    /// Like [`next`](Self::next), with the tuple's group hash if the batch
    /// carries one.
    pub fn next_with_hash(&mut self, query: usize) -> Option<(&[u8], Option<u64>)> {
        self.advance(query).map(|(batch, tuple)| {
            let batch = &self.batches[batch];
            (batch.tuple(tuple), batch.hash(tuple))
        })
    }

    /// Restart the scan over the batches held.
    pub fn rewind(&mut self) {
        self.batch_idx = 0;
        self.tuple_idx = 0;
        self.exhausted = false;
    }

    /// Drop the pulled batches. Unapplied acks are kept for `ack`.
    pub fn reset(&mut self) {
        self.batches.clear();
        self.flush_acks.clear();
        self.rewind();
    }

    pub fn flush_acks(&self) -> &[AckRef] {
        &self.flush_acks
    }

    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Apply every pending acknowledgment once. Returns how many references
    /// were still live.
    pub fn ack(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        if self.table.is_none() {
            warn!(pending = self.pending.len(), "No acknowledgment table, dropping acks");
            self.pending.clear();
            return 0;
        }

        let pending = std::mem::take(&mut self.pending);
        let applied = pending.iter().filter(|(ack, n)| self.apply(ack, *n)).count();
        trace!(pending = pending.len(), applied = applied, "Applied acks");
        applied
    }

    /// Flush batches to send downstream for every live flush ack.
    ///
    /// Each returned batch goes to all `destinations`; the writer's record
    /// is told to expect that many combiner acknowledgments.
    pub fn forward_flush_acks(&self, destinations: usize) -> Vec<Vec<u8>> {
        let Some(table) = &self.table else {
            return Vec::new();
        };
        self.flush_acks
            .iter()
            .filter(|ack| table.inc_ctups(ack, destinations as u32))
            .map(|ack| MicrobatchBuilder::flush(*ack).pack())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use uuid::Uuid;

    struct QueueSource(VecDeque<Vec<u8>>);

    #[async_trait]
    impl MessageSource for QueueSource {
        async fn recv(&mut self, _timeout: Option<Duration>) -> MicrobatchResult<Option<Vec<u8>>> {
            Ok(self.0.pop_front())
        }
    }

    fn config() -> ReaderConfig {
        ReaderConfig {
            batch_size: 1000,
            batch_mem: 1 << 20,
            batch_wait: Duration::from_millis(20),
            fast_path: false,
        }
    }

    fn table() -> Arc<AckTable> {
        Arc::new(AckTable::create(&Uuid::new_v4().simple().to_string(), 16).unwrap())
    }

    fn batch(queries: &[usize], tuples: &[&[u8]], acks: &[AckRef]) -> Vec<u8> {
        let queries = QuerySet::from_ids(queries.iter().copied()).unwrap();
        let mut builder = MicrobatchBuilder::new(MicrobatchKind::Tuples, queries, 1 << 16, 64);
        for tuple in tuples {
            assert!(builder.add_tuple(tuple, None).unwrap());
        }
        for ack in acks {
            builder.add_ack(*ack);
        }
        builder.pack()
    }

    fn flush(ack: AckRef) -> Vec<u8> {
        MicrobatchBuilder::flush(ack).pack()
    }

    fn reader(messages: Vec<Vec<u8>>, role: ProcessRole) -> MicrobatchReader<QueueSource> {
        MicrobatchReader::new(QueueSource(messages.into()), role, config())
    }

    fn collect(reader: &mut MicrobatchReader<QueueSource>, query: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(tuple) = reader.next(query) {
            out.push(tuple.to_vec());
        }
        out
    }

    #[tokio::test]
    async fn test_pull_summarizes_batches() {
        let mut reader = reader(
            vec![batch(&[1], &[b"ab", b"c"], &[]), batch(&[3], &[b"defg"], &[])],
            ProcessRole::Worker,
        );
        let summary = reader.pull().await.unwrap();
        assert_eq!(summary.ntups, 3);
        assert_eq!(summary.nbytes, 7);
        assert_eq!(summary.queries, QuerySet::from_ids([1, 3]).unwrap());
        assert!(summary.acks.is_empty());

        // Nothing left to receive.
        assert_eq!(reader.pull().await.unwrap(), BatchSummary::default());
    }

    #[tokio::test]
    async fn test_next_skips_batches_for_other_queries() {
        let mut reader = reader(
            vec![
                batch(&[1], &[b"a1", b"a2"], &[]),
                batch(&[2], &[b"b1"], &[]),
                batch(&[1, 2], &[], &[]),
                batch(&[1, 2], &[b"c1"], &[]),
            ],
            ProcessRole::Worker,
        );
        reader.pull().await.unwrap();

        assert_eq!(collect(&mut reader, 1), vec![b"a1".to_vec(), b"a2".to_vec(), b"c1".to_vec()]);
        assert!(reader.next(1).is_none());
        // Exhaustion latches until rewind, whatever the query.
        assert!(reader.next(2).is_none());

        reader.rewind();
        assert_eq!(collect(&mut reader, 2), vec![b"b1".to_vec(), b"c1".to_vec()]);
        reader.rewind();
        assert_eq!(collect(&mut reader, 2), vec![b"b1".to_vec(), b"c1".to_vec()]);
        assert!(collect(&mut reader, 7).is_empty());
    }

    #[tokio::test]
    async fn test_next_with_hash() {
        let queries = QuerySet::from_ids([0]).unwrap();
        let mut builder = MicrobatchBuilder::new(MicrobatchKind::Tuples, queries, 4096, 64);
        builder.add_tuple(b"k", Some(42)).unwrap();
        let mut reader = reader(vec![builder.pack(), batch(&[0], &[b"u"], &[])], ProcessRole::Combiner);
        reader.pull().await.unwrap();

        assert_eq!(reader.next_with_hash(0), Some((&b"k"[..], Some(42))));
        assert_eq!(reader.next_with_hash(0), Some((&b"u"[..], None)));
        assert_eq!(reader.next_with_hash(0), None);
    }

    #[tokio::test]
    async fn test_ack_counts_tuples_once_per_pull() {
        let table = table();
        let handle = table.new_ack(InsertLevel::SynchronousCommit).unwrap();
        let ack = handle.ack_ref();
        handle.add_wtups(3);

        let mut reader = reader(
            vec![batch(&[1, 2], &[b"x", b"y"], &[ack]), batch(&[2], &[b"z"], &[ack])],
            ProcessRole::Worker,
        )
        .with_ack_table(table.clone());
        let summary = reader.pull().await.unwrap();
        assert_eq!(summary.acks, vec![ack, ack]);
        assert!(handle.is_received());
        assert!(!handle.is_acked());

        // Two queries scan the same batches.
        assert_eq!(collect(&mut reader, 1).len(), 2);
        reader.rewind();
        assert_eq!(collect(&mut reader, 2).len(), 3);
        reader.reset();

        assert_eq!(reader.ack(), 2);
        assert_eq!(reader.ack(), 0);
        let counters = handle.counters();
        assert_eq!(counters.wrecv, 3);
        assert_eq!(counters.wacks, 3);
        assert!(handle.is_acked());
    }

    #[tokio::test]
    async fn test_combiner_acks_with_combiner_counter() {
        let table = table();
        let handle = table.new_ack(InsertLevel::SynchronousCommit).unwrap();
        let ack = handle.ack_ref();

        let mut reader = reader(vec![batch(&[0], &[b"a", b"b"], &[ack])], ProcessRole::Combiner)
            .with_ack_table(table.clone());
        reader.pull().await.unwrap();
        reader.ack();

        let counters = handle.counters();
        assert_eq!(counters.wrecv, 0);
        assert_eq!(counters.wacks, 0);
        assert_eq!(counters.cacks, 2);
    }

    #[tokio::test]
    async fn test_fast_path_acks_on_receipt() {
        let table = table();
        let async_ack = table.new_ack(InsertLevel::Asynchronous).unwrap();
        let sync_ack = table.new_ack(InsertLevel::SynchronousReceive).unwrap();

        let mut reader = MicrobatchReader::new(
            QueueSource(
                vec![
                    batch(&[0], &[b"a", b"b"], &[async_ack.ack_ref()]),
                    batch(&[0], &[b"c"], &[sync_ack.ack_ref()]),
                ]
                .into(),
            ),
            ProcessRole::Worker,
            ReaderConfig {
                fast_path: true,
                ..config()
            },
        )
        .with_ack_table(table.clone());

        let summary = reader.pull().await.unwrap();
        assert_eq!(summary.ntups, 3);
        assert_eq!(summary.acks, vec![sync_ack.ack_ref()]);
        assert_eq!(async_ack.counters().wacks, 2);
        assert_eq!(sync_ack.counters().wacks, 0);
        assert_eq!(reader.pending_acks(), 1);
    }

    #[tokio::test]
    async fn test_flush_batches_are_diverted() {
        let table = table();
        let handle = table.new_ack(InsertLevel::Flush).unwrap();
        let ack = handle.ack_ref();
        handle.add_wtups(1);

        let mut reader =
            reader(vec![batch(&[0], &[b"t"], &[]), flush(ack)], ProcessRole::Worker).with_ack_table(table.clone());
        let summary = reader.pull().await.unwrap();
        assert_eq!(summary.ntups, 1);
        assert_eq!(summary.acks, vec![ack]);
        assert_eq!(reader.flush_acks(), &[ack]);
        assert_eq!(collect(&mut reader, 0), vec![b"t".to_vec()]);

        let forwarded = reader.forward_flush_acks(2);
        assert_eq!(forwarded.len(), 1);
        let decoded = Microbatch::unpack(&forwarded[0]).unwrap();
        assert_eq!(decoded.kind(), MicrobatchKind::Flush);
        assert_eq!(decoded.acks(), &[ack]);

        reader.ack();
        let counters = handle.counters();
        assert_eq!(counters.wrecv, 1);
        assert_eq!(counters.wacks, 1);
        assert_eq!(counters.ctups, 2);
        assert!(!handle.is_acked());

        table.inc_cacks(&ack, 2);
        assert!(handle.is_acked());
    }

    #[tokio::test]
    async fn test_pull_stops_at_tuple_budget() {
        let messages = (0..5u8)
            .map(|i| {
                let tuple = [i];
                batch(&[0], &[&tuple, &tuple], &[])
            })
            .collect();
        let mut reader = MicrobatchReader::new(
            QueueSource(messages),
            ProcessRole::Worker,
            ReaderConfig {
                batch_size: 3,
                ..config()
            },
        );

        assert_eq!(reader.pull().await.unwrap().ntups, 4);
        assert_eq!(reader.pull().await.unwrap().ntups, 4);
        assert_eq!(reader.pull().await.unwrap().ntups, 2);
        // Pulls accumulate until reset.
        assert_eq!(collect(&mut reader, 0).len(), 10);
        reader.reset();
        assert!(reader.next(0).is_none());
    }

    #[tokio::test]
    async fn test_stale_acks_are_ignored() {
        let table = table();
        let ack = table.new_ack(InsertLevel::SynchronousCommit).unwrap().ack_ref();

        let mut reader =
            reader(vec![batch(&[0], &[b"a"], &[ack])], ProcessRole::Worker).with_ack_table(table.clone());
        reader.pull().await.unwrap();
        assert_eq!(reader.ack(), 0);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_an_error() {
        let mut reader = reader(vec![vec![9, 0, 0]], ProcessRole::Worker);
        assert!(reader.pull().await.is_err());
    }
}
