//! Merge functions: pluggable policies that collapse the records of one key
//! into zero or one output record.

use bytes::Bytes;

use crate::types::{KeyValue, ValueKind};

/// Reduces a sequence-ordered group of records sharing a key.
///
/// Callers `reset`, feed records in ascending sequence order with `add`, and
/// take the outcome with `result`. Implementations must be cloneable so that
/// concurrent readers never share reducer state.
pub trait MergeFunction: Send + Sync {
    /// Forget all accumulated state.
    fn reset(&mut self);

    /// Feed the next record of the current key group.
    fn add(&mut self, kv: KeyValue);

    /// The merged outcome for the group, or `None` to drop the key entirely.
    fn result(&self) -> Option<KeyValue>;

    /// Clone into a fresh boxed instance.
    fn clone_box(&self) -> Box<dyn MergeFunction>;
}

impl Clone for Box<dyn MergeFunction> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Last value wins: the record with the highest sequence number survives,
/// including DELETE markers.
#[derive(Debug, Clone, Default)]
pub struct DeduplicateMergeFunction {
    latest: Option<KeyValue>,
}

impl DeduplicateMergeFunction {
    /// Create a new deduplicating merge function.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeFunction for DeduplicateMergeFunction {
    fn reset(&mut self) {
        self.latest = None;
    }

    fn add(&mut self, kv: KeyValue) {
        self.latest = Some(kv);
    }

    fn result(&self) -> Option<KeyValue> {
        self.latest.clone()
    }

    fn clone_box(&self) -> Box<dyn MergeFunction> {
        Box::new(self.clone())
    }
}

/// Counts occurrences: values are big-endian `i64` deltas, ADD contributes
/// the delta and DELETE subtracts it; a zero total drops the key.
#[derive(Debug, Clone, Default)]
pub struct ValueCountMergeFunction {
    key: Option<Bytes>,
    sequence: u64,
    total: i64,
    saw_record: bool,
}

impl ValueCountMergeFunction {
    /// Create a new value-count merge function.
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_count(value: &Bytes) -> i64 {
        if value.len() == 8 {
            i64::from_be_bytes(value.as_ref().try_into().expect("length checked"))
        } else {
            // Records without a numeric payload count as one occurrence.
            1
        }
    }
}

impl MergeFunction for ValueCountMergeFunction {
    fn reset(&mut self) {
        self.key = None;
        self.sequence = 0;
        self.total = 0;
        self.saw_record = false;
    }

    fn add(&mut self, kv: KeyValue) {
        let delta = Self::decode_count(kv.value());
        self.total += match kv.kind() {
            ValueKind::Add => delta,
            ValueKind::Delete => -delta,
        };
        self.sequence = kv.sequence();
        self.key = Some(kv.key().clone());
        self.saw_record = true;
    }

    fn result(&self) -> Option<KeyValue> {
        if !self.saw_record || self.total == 0 {
            return None;
        }
        let key = self.key.clone().expect("saw_record implies key");
        Some(KeyValue::new(
            key,
            self.sequence,
            ValueKind::Add,
            Bytes::copy_from_slice(&self.total.to_be_bytes()),
        ))
    }

    fn clone_box(&self) -> Box<dyn MergeFunction> {
        Box::new(self.clone())
    }
}
