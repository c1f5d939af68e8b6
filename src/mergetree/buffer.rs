//! In-memory sort buffer for the merge-tree writer.

use std::cmp::Ordering;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::comparator::KeyComparator;
use crate::types::{KeyValue, ValueKind};
use crate::Result;

use super::merge::MergeFunction;

/// Sink receiving records during a buffer drain.
pub type RecordSink<'a> = &'a mut dyn FnMut(&KeyValue) -> Result<()>;

/// A writer-side buffer of unsequenced records.
///
/// Records accumulate keyed by (key, insertion ordinal). Draining walks key
/// groups in key order, assigns each input record the next sequence number
/// (dense per batch), offers it to the optional `raw` sink, and reduces each
/// group through the merge function exactly once; `Some` results go to the
/// `merged` sink.
pub trait SortBuffer: Send {
    /// Buffer one record. Returns `false` when the buffer is full and must be
    /// flushed first; an empty buffer always accepts.
    fn put(&mut self, key: Bytes, kind: ValueKind, value: Bytes) -> Result<bool>;

    /// Check if the buffer holds no records.
    fn is_empty(&self) -> bool;

    /// Approximate heap usage in bytes.
    fn memory_usage(&self) -> usize;

    /// Drain all records in key order, assigning sequence numbers from
    /// `next_sequence`.
    fn drain(
        &mut self,
        next_sequence: &mut u64,
        merge_function: &mut dyn MergeFunction,
        raw: Option<RecordSink<'_>>,
        merged: RecordSink<'_>,
    ) -> Result<()>;

    /// Discard all buffered records and reclaim resources.
    fn clear(&mut self);
}

/// Walk (key, ordinal)-ordered records, assign sequences, and reduce groups.
///
/// Shared by the in-memory and spillable buffers.
pub(crate) fn drain_grouped(
    records: &mut dyn Iterator<Item = Result<KeyValue>>,
    comparator: &KeyComparator,
    next_sequence: &mut u64,
    merge_function: &mut dyn MergeFunction,
    mut raw: Option<RecordSink<'_>>,
    merged: RecordSink<'_>,
) -> Result<()> {
    let mut current_key: Option<Bytes> = None;

    for record in records {
        let record = record?;
        let kv = KeyValue::new(
            record.key().clone(),
            *next_sequence,
            record.kind(),
            record.value().clone(),
        );
        *next_sequence += 1;

        let new_group = match &current_key {
            None => true,
            Some(key) => comparator.compare(key, kv.key()) != Ordering::Equal,
        };
        if new_group {
            if current_key.is_some() {
                if let Some(result) = merge_function.result() {
                    merged(&result)?;
                }
            }
            merge_function.reset();
            current_key = Some(kv.key().clone());
        }

        if let Some(raw) = raw.as_mut() {
            raw(&kv)?;
        }
        merge_function.add(kv);
    }

    if current_key.is_some() {
        if let Some(result) = merge_function.result() {
            merged(&result)?;
        }
    }
    Ok(())
}

/// Key of a buffered record: user key plus insertion ordinal.
///
/// The ordinal keeps equal keys in arrival order so sequence numbers assigned
/// at drain respect write order.
struct BufferKey {
    key: Bytes,
    ordinal: u64,
    comparator: KeyComparator,
}

impl PartialEq for BufferKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BufferKey {}

impl PartialOrd for BufferKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.comparator.compare(&self.key, &other.key) {
            Ordering::Equal => self.ordinal.cmp(&other.ordinal),
            ord => ord,
        }
    }
}

/// Non-spillable sort buffer backed by a skip list.
///
/// Reports itself full once the memory budget is reached; the writer then
/// flushes and retries.
pub struct MemSortBuffer {
    map: SkipMap<BufferKey, (ValueKind, Bytes)>,
    comparator: KeyComparator,
    capacity: usize,
    memory: usize,
    next_ordinal: u64,
}

impl MemSortBuffer {
    /// Create a buffer with the given memory budget.
    pub fn new(comparator: KeyComparator, capacity: usize) -> Self {
        Self {
            map: SkipMap::new(),
            comparator,
            capacity,
            memory: 0,
            next_ordinal: 0,
        }
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl SortBuffer for MemSortBuffer {
    fn put(&mut self, key: Bytes, kind: ValueKind, value: Bytes) -> Result<bool> {
        let record_size = key.len() + value.len() + 64;
        if !self.map.is_empty() && self.memory + record_size > self.capacity {
            return Ok(false);
        }

        self.map.insert(
            BufferKey {
                key,
                ordinal: self.next_ordinal,
                comparator: self.comparator.clone(),
            },
            (kind, value),
        );
        self.next_ordinal += 1;
        self.memory += record_size;
        Ok(true)
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn memory_usage(&self) -> usize {
        self.memory
    }

    fn drain(
        &mut self,
        next_sequence: &mut u64,
        merge_function: &mut dyn MergeFunction,
        raw: Option<RecordSink<'_>>,
        merged: RecordSink<'_>,
    ) -> Result<()> {
        let mut records = self.map.iter().map(|entry| {
            let (kind, value) = entry.value().clone();
            Ok(KeyValue::new(entry.key().key.clone(), 0, kind, value))
        });
        drain_grouped(
            &mut records,
            &self.comparator,
            next_sequence,
            merge_function,
            raw,
            merged,
        )
    }

    fn clear(&mut self) {
        self.map = SkipMap::new();
        self.memory = 0;
    }
}
