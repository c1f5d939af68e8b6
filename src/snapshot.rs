//! The snapshot service: the latest committed file list per bucket.
//!
//! The engine only ever reads snapshots; committing a [`CommitIncrement`]
//! back is the manifest committer's job, modeled here so drivers and tests
//! can close the loop.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::datafile::DataFileMeta;
use crate::write::CommitIncrement;

/// One committed entry: a data file pinned to its partition and bucket.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Partition the file belongs to.
    pub partition: String,
    /// Bucket the file belongs to.
    pub bucket: u32,
    /// The file and its residing level.
    pub file: DataFileMeta,
}

/// An immutable committed view of the table's files.
#[derive(Debug)]
pub struct Snapshot {
    id: u64,
    entries: Vec<ManifestEntry>,
}

impl Snapshot {
    /// The snapshot id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Every entry in the snapshot.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
}

/// Filtered view over one snapshot's entries.
pub struct SnapshotScan {
    entries: Vec<ManifestEntry>,
}

impl SnapshotScan {
    /// Keep only entries of the given partition.
    pub fn with_partition(mut self, partition: &str) -> Self {
        self.entries.retain(|e| e.partition == partition);
        self
    }

    /// Keep only entries of the given bucket.
    pub fn with_bucket(mut self, bucket: u32) -> Self {
        self.entries.retain(|e| e.bucket == bucket);
        self
    }

    /// The file metas of the remaining entries.
    pub fn files(self) -> Vec<DataFileMeta> {
        self.entries.into_iter().map(|e| e.file).collect()
    }
}

/// Tracks committed snapshots and serves the latest one lock-free.
#[derive(Default)]
pub struct SnapshotManager {
    latest: ArcSwapOption<Snapshot>,
    history: Mutex<HashMap<u64, Arc<Snapshot>>>,
}

impl SnapshotManager {
    /// Create an empty manager (no snapshot committed yet).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Id of the latest committed snapshot, if any.
    pub fn latest_snapshot_id(&self) -> Option<u64> {
        self.latest.load().as_ref().map(|s| s.id())
    }

    /// The latest committed snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest.load_full()
    }

    /// Start a scan over the given snapshot. Unknown ids scan nothing.
    pub fn scan(&self, snapshot_id: u64) -> SnapshotScan {
        let entries = self
            .history
            .lock()
            .get(&snapshot_id)
            .map(|s| s.entries().to_vec())
            .unwrap_or_default();
        SnapshotScan { entries }
    }

    /// Commit one bucket's increment, producing the next snapshot.
    ///
    /// The new file set is the previous one minus `compacted_before` plus
    /// `new_files` and `compacted_after`. Changelog files are a side stream
    /// and do not enter table state.
    pub fn commit(&self, partition: &str, bucket: u32, increment: &CommitIncrement) -> u64 {
        let mut history = self.history.lock();

        let mut entries = self
            .latest
            .load()
            .as_ref()
            .map(|s| s.entries().to_vec())
            .unwrap_or_default();

        entries.retain(|e| {
            !(e.partition == partition
                && e.bucket == bucket
                && increment
                    .compacted_before
                    .iter()
                    .any(|f| f.file_name() == e.file.file_name()))
        });
        for file in increment.new_files.iter().chain(&increment.compacted_after) {
            entries.push(ManifestEntry {
                partition: partition.to_string(),
                bucket,
                file: file.clone(),
            });
        }

        let id = self.latest.load().as_ref().map(|s| s.id() + 1).unwrap_or(1);
        let snapshot = Arc::new(Snapshot { id, entries });
        history.insert(id, snapshot.clone());
        self.latest.store(Some(snapshot));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn meta(name: &str, level: usize) -> DataFileMeta {
        DataFileMeta::new(name, 10, 1, Bytes::from("a"), Bytes::from("z"), 0, 1, level)
    }

    fn increment(new: Vec<DataFileMeta>, before: Vec<DataFileMeta>, after: Vec<DataFileMeta>) -> CommitIncrement {
        CommitIncrement {
            new_files: new,
            compacted_before: before,
            compacted_after: after,
            changelog_files: Vec::new(),
        }
    }

    #[test]
    fn test_empty_manager() {
        let manager = SnapshotManager::new();
        assert!(manager.latest_snapshot_id().is_none());
        assert!(manager.scan(1).files().is_empty());
    }

    #[test]
    fn test_commit_and_scan() {
        let manager = SnapshotManager::new();
        let id = manager.commit("p", 0, &increment(vec![meta("a", 0)], vec![], vec![]));
        assert_eq!(id, 1);
        assert_eq!(manager.latest_snapshot_id(), Some(1));

        let files = manager.scan(1).with_partition("p").with_bucket(0).files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name(), "a");
    }

    #[test]
    fn test_scan_filters() {
        let manager = SnapshotManager::new();
        manager.commit("p1", 0, &increment(vec![meta("a", 0)], vec![], vec![]));
        manager.commit("p2", 1, &increment(vec![meta("b", 0)], vec![], vec![]));

        let latest = manager.latest_snapshot_id().unwrap();
        assert_eq!(manager.scan(latest).with_partition("p1").files().len(), 1);
        assert_eq!(
            manager
                .scan(latest)
                .with_partition("p2")
                .with_bucket(0)
                .files()
                .len(),
            0
        );
    }

    #[test]
    fn test_compaction_replaces_files() {
        let manager = SnapshotManager::new();
        manager.commit(
            "p",
            0,
            &increment(vec![meta("a", 0), meta("b", 0)], vec![], vec![]),
        );
        let id = manager.commit(
            "p",
            0,
            &increment(vec![], vec![meta("a", 0), meta("b", 0)], vec![meta("m", 5)]),
        );

        let files = manager.scan(id).with_partition("p").with_bucket(0).files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name(), "m");
        assert_eq!(files[0].level(), 5);
    }

    #[test]
    fn test_history_preserved() {
        let manager = SnapshotManager::new();
        let first = manager.commit("p", 0, &increment(vec![meta("a", 0)], vec![], vec![]));
        manager.commit("p", 0, &increment(vec![meta("b", 0)], vec![], vec![]));

        // The old snapshot is still readable.
        assert_eq!(manager.scan(first).files().len(), 1);
        assert_eq!(manager.scan(first + 1).files().len(), 2);
    }
}
