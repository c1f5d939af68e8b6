//! A sorted run: one logical key range made of non-overlapping files.

use crate::comparator::KeyComparator;
use crate::datafile::DataFileMeta;
use crate::{Error, Result};

/// An ordered, non-overlapping sequence of data files, sorted by minimum key.
///
/// Files inside a single sorted run never overlap. At level 0 each flushed
/// file forms its own run; levels above hold at most one run each.
#[derive(Debug, Clone, Default)]
pub struct SortedRun {
    files: Vec<DataFileMeta>,
}

impl SortedRun {
    /// An empty run.
    pub fn empty() -> Self {
        Self { files: Vec::new() }
    }

    /// A run holding a single file.
    pub fn from_single(file: DataFileMeta) -> Self {
        Self { files: vec![file] }
    }

    /// Build a run from files already sorted by minimum key.
    pub fn from_sorted(files: Vec<DataFileMeta>) -> Self {
        Self { files }
    }

    /// Build a run from files in arbitrary order.
    pub fn from_unsorted(mut files: Vec<DataFileMeta>, cmp: &KeyComparator) -> Self {
        files.sort_by(|a, b| cmp.compare(a.min_key(), b.min_key()));
        Self { files }
    }

    /// The files of this run, sorted by minimum key.
    pub fn files(&self) -> &[DataFileMeta] {
        &self.files
    }

    /// Consume the run, yielding its files.
    pub fn into_files(self) -> Vec<DataFileMeta> {
        self.files
    }

    /// Check if the run holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total byte size of the run.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(DataFileMeta::file_size).sum()
    }

    /// Verify ordering and non-overlap between consecutive files.
    pub fn validate(&self, cmp: &KeyComparator) -> Result<()> {
        for pair in self.files.windows(2) {
            if cmp.compare(pair[0].max_key(), pair[1].min_key()).is_ge() {
                return Err(Error::internal(format!(
                    "overlapping files in sorted run: {} and {}",
                    pair[0].file_name(),
                    pair[1].file_name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use bytes::Bytes;
    use std::sync::Arc;

    fn meta(name: &str, min: &str, max: &str, size: u64) -> DataFileMeta {
        DataFileMeta::new(
            name,
            size,
            1,
            Bytes::copy_from_slice(min.as_bytes()),
            Bytes::copy_from_slice(max.as_bytes()),
            0,
            0,
            0,
        )
    }

    fn cmp() -> KeyComparator {
        Arc::new(BytewiseComparator::new())
    }

    #[test]
    fn test_from_unsorted_orders_by_min_key() {
        let run = SortedRun::from_unsorted(
            vec![meta("b", "m", "p", 1), meta("a", "a", "c", 1)],
            &cmp(),
        );
        assert_eq!(run.files()[0].file_name(), "a");
        assert_eq!(run.files()[1].file_name(), "b");
    }

    #[test]
    fn test_total_size() {
        let run = SortedRun::from_sorted(vec![meta("a", "a", "c", 10), meta("b", "d", "f", 32)]);
        assert_eq!(run.total_size(), 42);
    }

    #[test]
    fn test_validate_accepts_disjoint() {
        let run = SortedRun::from_sorted(vec![meta("a", "a", "c", 1), meta("b", "d", "f", 1)]);
        assert!(run.validate(&cmp()).is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let run = SortedRun::from_sorted(vec![meta("a", "a", "d", 1), meta("b", "d", "f", 1)]);
        assert!(run.validate(&cmp()).is_err());
    }

    #[test]
    fn test_empty_run() {
        let run = SortedRun::empty();
        assert!(run.is_empty());
        assert_eq!(run.total_size(), 0);
        assert!(run.validate(&cmp()).is_ok());
    }
}
