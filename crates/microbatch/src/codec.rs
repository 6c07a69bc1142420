//! Micro-batch wire format.
//!
//! A micro-batch carries tuples for a set of continuous queries plus the
//! acknowledgment references of the writers that produced them.
//!
//! ```text
//! [1: kind][1: flags][4: bitmap words n][n × 8: query bitmap]
//! [4: tuple count] { [4: len][len bytes][8: hash, if HASHED] } × count
//! [4: ack count]   { [8: tag][4: index] } × count
//! ```
//!
//! All integers are little-endian. A flush batch has no tuples and exactly
//! one ack; it only tells the receiver that the writer wants confirmation.

use pipeline_config_and_utils::Config;

use crate::ack::{AckRef, AckTable};
use crate::error::{MicrobatchError, MicrobatchResult};

/// Bytes kept free in every batch for ack references.
pub const ACK_RESERVE: usize = 2048;

/// Query ids are below this bound.
pub const MAX_QUERIES: usize = 1 << 20;

const MAX_QUERY_WORDS: usize = MAX_QUERIES / 64;

const ACK_SIZE: usize = 12;
const TUPLE_HEADER_SIZE: usize = 4;
const HASH_SIZE: usize = 8;

/// Flag bits.
pub mod flags {
    /// Every tuple is followed by its 64-bit group hash.
    pub const HASHED: u8 = 1 << 0;

    pub const ALL: u8 = HASHED;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrobatchKind {
    Tuples = 0,
    Flush = 1,
}

impl TryFrom<u8> for MicrobatchKind {
    type Error = MicrobatchError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MicrobatchKind::Tuples),
            1 => Ok(MicrobatchKind::Flush),
            other => Err(MicrobatchError::Codec(format!(
                "unknown micro-batch kind {}",
                other
            ))),
        }
    }
}

/// Growable bitmap of query ids.
///
/// Trailing zero words are never stored, so equal sets compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySet {
    words: Vec<u64>,
}

impl QuerySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from query ids, rejecting any id at or above
    /// [`MAX_QUERIES`].
    pub fn from_ids<I: IntoIterator<Item = usize>>(ids: I) -> MicrobatchResult<Self> {
        let mut set = QuerySet::new();
        for query in ids {
            set.insert(query)?;
        }
        Ok(set)
    }

    pub fn from_words(mut words: Vec<u64>) -> MicrobatchResult<Self> {
        while words.last() == Some(&0) {
            words.pop();
        }
        if words.len() > MAX_QUERY_WORDS {
            return Err(MicrobatchError::Codec(format!(
                "query bitmap of {} words exceeds {}",
                words.len(),
                MAX_QUERY_WORDS
            )));
        }
        Ok(Self { words })
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn insert(&mut self, query: usize) -> MicrobatchResult<()> {
        if query >= MAX_QUERIES {
            return Err(MicrobatchError::Codec(format!(
                "query id {} out of range, max is {}",
                query,
                MAX_QUERIES - 1
            )));
        }
        let word = query / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (query % 64);
        Ok(())
    }

    pub fn contains(&self, query: usize) -> bool {
        self.words
            .get(query / 64)
            .is_some_and(|word| word & (1 << (query % 64)) != 0)
    }

    pub fn union_with(&mut self, other: &QuerySet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i * 64 + bit)
        })
    }
}

/// A decoded micro-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microbatch {
    kind: MicrobatchKind,
    queries: QuerySet,
    tuples: Vec<Vec<u8>>,
    /// One hash per tuple when the batch is hashed, otherwise empty.
    hashes: Vec<u64>,
    acks: Vec<AckRef>,
}

impl Microbatch {
    pub fn kind(&self) -> MicrobatchKind {
        self.kind
    }

    pub fn queries(&self) -> &QuerySet {
        &self.queries
    }

    pub fn ntups(&self) -> usize {
        self.tuples.len()
    }

    /// Total tuple payload bytes.
    pub fn nbytes(&self) -> usize {
        self.tuples.iter().map(Vec::len).sum()
    }

    pub fn is_hashed(&self) -> bool {
        !self.hashes.is_empty()
    }

    pub fn tuple(&self, index: usize) -> &[u8] {
        &self.tuples[index]
    }

    pub fn hash(&self, index: usize) -> Option<u64> {
        self.hashes.get(index).copied()
    }

    pub fn acks(&self) -> &[AckRef] {
        &self.acks
    }

    pub fn pack(&self) -> Vec<u8> {
        encode(self.kind, &self.queries, &self.tuples, &self.hashes, &self.acks)
    }

    /// Decode a packed batch. The input is only read.
    pub fn unpack(buf: &[u8]) -> MicrobatchResult<Self> {
        let mut dec = Decoder::new(buf);

        let kind = MicrobatchKind::try_from(dec.u8()?)?;
        let flag_bits = dec.u8()?;
        if flag_bits & !flags::ALL != 0 {
            return Err(MicrobatchError::Codec(format!(
                "unknown micro-batch flags {:#04x}",
                flag_bits
            )));
        }
        let hashed = flag_bits & flags::HASHED != 0;

        let nwords = dec.u32()? as usize;
        if nwords > MAX_QUERY_WORDS {
            return Err(MicrobatchError::Codec(format!(
                "query bitmap of {} words exceeds {}",
                nwords, MAX_QUERY_WORDS
            )));
        }
        let mut words = Vec::with_capacity(nwords.min(dec.remaining() / 8));
        for _ in 0..nwords {
            words.push(dec.u64()?);
        }
        let queries = QuerySet::from_words(words)?;

        let ntups = dec.u32()? as usize;
        let mut tuples = Vec::with_capacity(ntups.min(dec.remaining() / TUPLE_HEADER_SIZE));
        let mut hashes = Vec::new();
        for _ in 0..ntups {
            let len = dec.u32()? as usize;
            tuples.push(dec.bytes(len)?.to_vec());
            if hashed {
                hashes.push(dec.u64()?);
            }
        }

        let nacks = dec.u32()? as usize;
        let mut acks = Vec::with_capacity(nacks.min(dec.remaining() / ACK_SIZE));
        for _ in 0..nacks {
            let tag = dec.u64()?;
            let index = dec.u32()?;
            acks.push(AckRef { tag, index });
        }

        if dec.remaining() != 0 {
            return Err(MicrobatchError::Codec(format!(
                "{} trailing bytes after micro-batch",
                dec.remaining()
            )));
        }
        if kind == MicrobatchKind::Flush && (ntups != 0 || nacks != 1) {
            return Err(MicrobatchError::Codec(format!(
                "flush batch with {} tuples and {} acks",
                ntups, nacks
            )));
        }

        Ok(Self {
            kind,
            queries,
            tuples,
            hashes,
            acks,
        })
    }
}

fn encode(
    kind: MicrobatchKind,
    queries: &QuerySet,
    tuples: &[Vec<u8>],
    hashes: &[u64],
    acks: &[AckRef],
) -> Vec<u8> {
    let hashed = !hashes.is_empty();
    let mut buf = Vec::with_capacity(
        fixed_size(queries)
            + tuples
                .iter()
                .map(|t| tuple_size(t.len(), hashed))
                .sum::<usize>()
            + acks.len() * ACK_SIZE,
    );

    buf.push(kind as u8);
    buf.push(if hashed { flags::HASHED } else { 0 });
    buf.extend_from_slice(&(queries.words().len() as u32).to_le_bytes());
    for word in queries.words() {
        buf.extend_from_slice(&word.to_le_bytes());
    }

    buf.extend_from_slice(&(tuples.len() as u32).to_le_bytes());
    for (i, tuple) in tuples.iter().enumerate() {
        buf.extend_from_slice(&(tuple.len() as u32).to_le_bytes());
        buf.extend_from_slice(tuple);
        if hashed {
            buf.extend_from_slice(&hashes[i].to_le_bytes());
        }
    }

    buf.extend_from_slice(&(acks.len() as u32).to_le_bytes());
    for ack in acks {
        buf.extend_from_slice(&ack.tag.to_le_bytes());
        buf.extend_from_slice(&ack.index.to_le_bytes());
    }
    buf
}

/// Bytes of a batch with no tuples and no acks.
fn fixed_size(queries: &QuerySet) -> usize {
    1 + 1 + 4 + queries.words().len() * 8 + 4 + 4
}

fn tuple_size(len: usize, hashed: bool) -> usize {
    TUPLE_HEADER_SIZE + len + if hashed { HASH_SIZE } else { 0 }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> MicrobatchResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(MicrobatchError::Codec(format!(
                "truncated micro-batch: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> MicrobatchResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> MicrobatchResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> MicrobatchResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> MicrobatchResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Accumulates tuples for one destination until the batch is full.
#[derive(Debug)]
pub struct MicrobatchBuilder {
    kind: MicrobatchKind,
    queries: QuerySet,
    max_size: usize,
    max_tuples: usize,
    hashed: Option<bool>,
    tuples: Vec<Vec<u8>>,
    hashes: Vec<u64>,
    acks: Vec<AckRef>,
    packed_size: usize,
}

impl MicrobatchBuilder {
    /// A builder that is full at `max_size` packed bytes or `max_tuples`
    /// tuples, whichever comes first.
    pub fn new(
        kind: MicrobatchKind,
        queries: QuerySet,
        max_size: usize,
        max_tuples: usize,
    ) -> Self {
        let packed_size = fixed_size(&queries);
        Self {
            kind,
            queries,
            max_size,
            max_tuples,
            hashed: None,
            tuples: Vec::new(),
            hashes: Vec::new(),
            acks: Vec::new(),
            packed_size,
        }
    }

    /// Limits come from `max_message_size` and `batch_size`.
    pub fn from_config(kind: MicrobatchKind, queries: QuerySet, config: &Config) -> Self {
        Self::new(kind, queries, config.max_message_size, config.batch_size)
    }

    /// A flush batch carrying one ack.
    pub fn flush(ack: AckRef) -> Self {
        let mut builder = Self::new(MicrobatchKind::Flush, QuerySet::new(), 0, 0);
        builder.add_ack(ack);
        builder
    }

    pub fn kind(&self) -> MicrobatchKind {
        self.kind
    }

    pub fn queries(&self) -> &QuerySet {
        &self.queries
    }

    pub fn ntups(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty() && self.acks.is_empty()
    }

    /// Size of the packed batch so far.
    pub fn packed_size(&self) -> usize {
        self.packed_size
    }

    fn tuple_limit(&self) -> usize {
        self.max_size.saturating_sub(ACK_RESERVE)
    }

    /// Add a tuple with its group hash, if the batch is hashed.
    ///
    /// Returns `Ok(false)` without adding when the batch is full; the caller
    /// sends it and retries on an empty one.
    pub fn add_tuple(&mut self, tuple: &[u8], hash: Option<u64>) -> MicrobatchResult<bool> {
        if self.kind == MicrobatchKind::Flush {
            return Err(MicrobatchError::Codec(
                "flush batches carry no tuples".to_string(),
            ));
        }
        let hashed = hash.is_some();
        if *self.hashed.get_or_insert(hashed) != hashed {
            return Err(MicrobatchError::Codec(
                "cannot mix hashed and unhashed tuples".to_string(),
            ));
        }

        let size = tuple_size(tuple.len(), hashed);
        let room = self.tuple_limit().saturating_sub(fixed_size(&self.queries));
        if size > room {
            return Err(MicrobatchError::TupleTooLarge {
                size: tuple.len(),
                max: room.saturating_sub(tuple_size(0, hashed)),
            });
        }

        if self.tuples.len() >= self.max_tuples
            || self.packed_size - self.acks.len() * ACK_SIZE + size > self.tuple_limit()
        {
            if self.tuples.is_empty() {
                self.hashed = None;
            }
            return Ok(false);
        }

        self.tuples.push(tuple.to_vec());
        if let Some(hash) = hash {
            self.hashes.push(hash);
        }
        self.packed_size += size;
        Ok(true)
    }

    pub fn add_ack(&mut self, ack: AckRef) {
        self.acks.push(ack);
        self.packed_size += ACK_SIZE;
    }

    /// Attach every reference that is still live. Returns how many were
    /// added.
    pub fn add_acks<'a, I>(&mut self, table: &AckTable, acks: I) -> usize
    where
        I: IntoIterator<Item = &'a AckRef>,
    {
        let mut added = 0;
        for ack in acks {
            if table.is_valid(ack) {
                self.add_ack(*ack);
                added += 1;
            }
        }
        added
    }

    pub fn pack(&self) -> Vec<u8> {
        encode(self.kind, &self.queries, &self.tuples, &self.hashes, &self.acks)
    }

    /// Finish into a decoded batch without a wire round trip.
    pub fn build(self) -> Microbatch {
        Microbatch {
            kind: self.kind,
            queries: self.queries,
            tuples: self.tuples,
            hashes: self.hashes,
            acks: self.acks,
        }
    }

    /// Drop tuples and acks, keeping kind, queries and limits.
    pub fn clear(&mut self) {
        self.tuples.clear();
        self.hashes.clear();
        self.acks.clear();
        self.hashed = None;
        self.packed_size = fixed_size(&self.queries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queries(ids: &[usize]) -> QuerySet {
        QuerySet::from_ids(ids.iter().copied()).unwrap()
    }

    fn builder(queries: QuerySet, max_size: usize) -> MicrobatchBuilder {
        MicrobatchBuilder::new(MicrobatchKind::Tuples, queries, max_size, usize::MAX)
    }

    #[test]
    fn test_query_set() {
        let mut set = queries(&[1, 70]);
        assert!(set.contains(1));
        assert!(set.contains(70));
        assert!(!set.contains(2));
        assert!(!set.contains(1000));
        assert_eq!(set.len(), 2);

        set.union_with(&queries(&[3, 200]));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3, 70, 200]);
        assert_eq!(QuerySet::from_words(vec![2, 0, 0]).unwrap(), queries(&[1]));
        assert!(QuerySet::new().is_empty());
    }

    #[test]
    fn test_query_id_bound() {
        let mut set = QuerySet::new();
        assert!(set.insert(MAX_QUERIES - 1).is_ok());
        assert!(matches!(set.insert(MAX_QUERIES), Err(MicrobatchError::Codec(_))));
        assert!(QuerySet::from_ids([0, 5_000_000]).is_err());
        assert!(QuerySet::from_words(vec![1; MAX_QUERY_WORDS + 1]).is_err());
        assert_eq!(set.words().len(), MAX_QUERY_WORDS);
    }

    #[test]
    fn test_large_query_id_round_trips() {
        let ids = queries(&[3, 4_194_304, MAX_QUERIES - 1]);
        let mut builder = builder(ids.clone(), 1 << 20);
        assert!(builder.add_tuple(b"row", None).unwrap());

        let packed = builder.pack();
        assert_eq!(packed.len(), builder.packed_size());
        let batch = Microbatch::unpack(&packed).unwrap();
        assert_eq!(batch.queries(), &ids);
        assert_eq!(batch.tuple(0), b"row");
    }

    #[test]
    fn test_unpack_rejects_oversized_bitmap() {
        let mut packed = vec![0, 0];
        packed.extend_from_slice(&(MAX_QUERY_WORDS as u32 + 1).to_le_bytes());
        assert!(Microbatch::unpack(&packed).is_err());
    }

    #[test]
    fn test_pack_layout() {
        let mut builder = builder(queries(&[0]), 8192);
        assert!(builder.add_tuple(b"ab", None).unwrap());
        builder.add_ack(AckRef { tag: 9, index: 2 });

        let packed = builder.pack();
        assert_eq!(packed.len(), builder.packed_size());
        assert_eq!(
            packed,
            [
                vec![0, 0, 1, 0, 0, 0],
                1u64.to_le_bytes().to_vec(),
                vec![1, 0, 0, 0, 2, 0, 0, 0, b'a', b'b'],
                vec![1, 0, 0, 0],
                9u64.to_le_bytes().to_vec(),
                vec![2, 0, 0, 0],
            ]
            .concat()
        );
    }

    #[test]
    fn test_unpack_hashed_batch() {
        let mut builder = builder(queries(&[5, 64]), 8192);
        builder.add_tuple(b"first", Some(11)).unwrap();
        builder.add_tuple(b"", Some(12)).unwrap();

        let batch = Microbatch::unpack(&builder.pack()).unwrap();
        assert!(batch.is_hashed());
        assert_eq!(batch.ntups(), 2);
        assert_eq!(batch.nbytes(), 5);
        assert_eq!(batch.tuple(0), b"first");
        assert_eq!(batch.hash(1), Some(12));
        assert_eq!(batch.queries(), &queries(&[5, 64]));
        assert_eq!(batch, builder.build());
    }

    #[test]
    fn test_builder_reports_full() {
        let max_size = ACK_RESERVE + 100;
        let mut builder = builder(queries(&[0]), max_size);
        let tuple = [7u8; 30];

        let mut added = 0;
        while builder.add_tuple(&tuple, None).unwrap() {
            added += 1;
        }
        // 22 fixed bytes, 34 bytes per tuple.
        assert_eq!(added, 2);
        assert!(builder.packed_size() <= max_size - ACK_RESERVE);
    }

    #[test]
    fn test_batch_filled_to_max_size() {
        // Room for exactly three 30-byte tuples, then the ack reserve.
        let fixed = 22;
        let max_size = ACK_RESERVE + fixed + 3 * 34;
        let mut builder = builder(queries(&[0]), max_size);

        for i in 0..3 {
            assert!(builder.add_tuple(&[i; 30], None).unwrap());
        }
        assert_eq!(builder.packed_size(), max_size - ACK_RESERVE);
        assert!(!builder.add_tuple(b"", None).unwrap());
        assert_eq!(builder.ntups(), 3);

        for index in 0..(ACK_RESERVE / ACK_SIZE) as u32 {
            builder.add_ack(AckRef { tag: 1, index });
        }
        let packed = builder.pack();
        assert_eq!(packed.len(), builder.packed_size());
        assert!(packed.len() <= max_size);

        let batch = Microbatch::unpack(&packed).unwrap();
        assert_eq!(batch.ntups(), 3);
        assert_eq!(batch.tuple(2), &[2u8; 30]);
        assert_eq!(batch.acks().len(), ACK_RESERVE / ACK_SIZE);
    }

    #[test]
    fn test_batch_filled_to_tuple_cap() {
        let config = Config::default();
        let mut builder =
            MicrobatchBuilder::from_config(MicrobatchKind::Tuples, queries(&[0]), &config);

        let mut added = 0;
        while builder.add_tuple(b"", None).unwrap() {
            added += 1;
        }
        assert_eq!(added, config.batch_size);
        assert!(!builder.add_tuple(b"", None).unwrap());

        let batch = Microbatch::unpack(&builder.pack()).unwrap();
        assert_eq!(batch.ntups(), config.batch_size);

        builder.clear();
        assert!(builder.add_tuple(b"", None).unwrap());
    }

    #[test]
    fn test_oversized_tuple_is_an_error() {
        let mut builder = builder(queries(&[0]), ACK_RESERVE + 100);
        assert!(matches!(
            builder.add_tuple(&[0u8; 200], None),
            Err(MicrobatchError::TupleTooLarge { size: 200, max: 74 })
        ));
    }

    #[test]
    fn test_mixed_hashing_rejected() {
        let mut builder = builder(queries(&[0]), 8192);
        builder.add_tuple(b"a", Some(1)).unwrap();
        assert!(builder.add_tuple(b"b", None).is_err());

        builder.clear();
        assert!(builder.add_tuple(b"b", None).unwrap());
    }

    #[test]
    fn test_unpack_rejects_malformed_input() {
        let mut builder = builder(queries(&[1]), 8192);
        builder.add_tuple(b"payload", None).unwrap();
        let packed = builder.pack();

        for cut in [0, 3, 10, packed.len() - 1] {
            assert!(Microbatch::unpack(&packed[..cut]).is_err(), "cut at {}", cut);
        }

        let mut trailing = packed.clone();
        trailing.push(0);
        assert!(Microbatch::unpack(&trailing).is_err());

        let mut bad_kind = packed.clone();
        bad_kind[0] = 9;
        assert!(Microbatch::unpack(&bad_kind).is_err());

        let mut bad_flags = packed;
        bad_flags[1] = 0x80;
        assert!(Microbatch::unpack(&bad_flags).is_err());
    }

    #[test]
    fn test_flush_batch_shape() {
        let mut empty = MicrobatchBuilder::new(MicrobatchKind::Flush, QuerySet::new(), 8192, 0);
        assert!(empty.add_tuple(b"x", None).is_err());

        // No ack yet: not a valid flush on the wire.
        assert!(Microbatch::unpack(&empty.pack()).is_err());

        let flush = MicrobatchBuilder::flush(AckRef { tag: 1, index: 0 });
        let batch = Microbatch::unpack(&flush.pack()).unwrap();
        assert_eq!(batch.kind(), MicrobatchKind::Flush);
        assert_eq!(batch.acks(), &[AckRef { tag: 1, index: 0 }]);
    }

    #[test]
    fn test_unpack_empty_batch() {
        let builder = builder(QuerySet::new(), 8192);
        let batch = Microbatch::unpack(&builder.pack()).unwrap();
        assert_eq!(batch.ntups(), 0);
        assert!(batch.queries().is_empty());
        assert!(batch.acks().is_empty());
    }
}
