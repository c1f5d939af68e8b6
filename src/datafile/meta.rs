//! Metadata describing one immutable data file.

use bytes::Bytes;

use crate::comparator::KeyComparator;

/// Immutable descriptor of a written data file.
///
/// Carries everything the engine needs to place the file in the level
/// structure and to decide run overlap without opening it: key range,
/// sequence range, row count, size and level.
#[derive(Debug, Clone)]
pub struct DataFileMeta {
    /// File name, unique within its bucket directory.
    file_name: String,
    /// File size in bytes.
    file_size: u64,
    /// Number of records in the file.
    row_count: u64,
    /// Smallest key in the file.
    min_key: Bytes,
    /// Largest key in the file.
    max_key: Bytes,
    /// Smallest sequence number in the file.
    min_sequence: u64,
    /// Largest sequence number in the file.
    max_sequence: u64,
    /// Level the file resides at.
    level: usize,
}

impl DataFileMeta {
    /// Create new file metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        row_count: u64,
        min_key: Bytes,
        max_key: Bytes,
        min_sequence: u64,
        max_sequence: u64,
        level: usize,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            row_count,
            min_key,
            max_key,
            min_sequence,
            max_sequence,
            level,
        }
    }

    /// Get the file name.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Get the file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the number of records.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Get the smallest key.
    pub fn min_key(&self) -> &Bytes {
        &self.min_key
    }

    /// Get the largest key.
    pub fn max_key(&self) -> &Bytes {
        &self.max_key
    }

    /// Get the smallest sequence number.
    pub fn min_sequence(&self) -> u64 {
        self.min_sequence
    }

    /// Get the largest sequence number.
    pub fn max_sequence(&self) -> u64 {
        self.max_sequence
    }

    /// Get the level this file resides at.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The same file relabeled to a higher level, without rewriting it.
    pub fn upgrade(&self, level: usize) -> Self {
        debug_assert!(level >= self.level);
        let mut meta = self.clone();
        meta.level = level;
        meta
    }

    /// Check whether the key ranges of two files intersect.
    pub fn overlaps(&self, cmp: &KeyComparator, other: &DataFileMeta) -> bool {
        cmp.compare(&self.min_key, &other.max_key).is_le()
            && cmp.compare(&other.min_key, &self.max_key).is_le()
    }
}

impl PartialEq for DataFileMeta {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name
    }
}

impl Eq for DataFileMeta {}

/// Largest sequence number across a set of files, or 0 if empty.
pub fn max_sequence_number(files: &[DataFileMeta]) -> u64 {
    files.iter().map(DataFileMeta::max_sequence).max().unwrap_or(0)
}
