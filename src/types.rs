//! Core record types for tablestore.

use bytes::Bytes;

/// Kind of a key-value record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    /// Insert or update of a key.
    Add = 1,
    /// Deletion marker (tombstone).
    Delete = 2,
}

impl ValueKind {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ValueKind::Add),
            2 => Some(ValueKind::Delete),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Check if this is a deletion marker.
    pub fn is_delete(&self) -> bool {
        matches!(self, ValueKind::Delete)
    }
}

/// A single record flowing through the merge tree.
///
/// Sequence numbers are assigned by the owning writer and break ties between
/// equal keys: the record with the higher sequence number is newer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    key: Bytes,
    sequence: u64,
    kind: ValueKind,
    value: Bytes,
}

impl KeyValue {
    /// Create a new record.
    pub fn new(key: impl Into<Bytes>, sequence: u64, kind: ValueKind, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            sequence,
            kind,
            value: value.into(),
        }
    }

    /// Create an ADD record.
    pub fn add(key: impl Into<Bytes>, sequence: u64, value: impl Into<Bytes>) -> Self {
        Self::new(key, sequence, ValueKind::Add, value)
    }

    /// Create a DELETE record. Tombstones carry an empty value.
    pub fn delete(key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(key, sequence, ValueKind::Delete, Bytes::new())
    }

    /// Get the key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Get the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Get the record kind.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Get the value.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Check if this record is a deletion marker.
    pub fn is_delete(&self) -> bool {
        self.kind.is_delete()
    }

    /// Approximate in-memory size of the record.
    pub fn memory_size(&self) -> usize {
        self.key.len() + self.value.len() + 24
    }
}
