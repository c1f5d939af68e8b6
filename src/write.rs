//! The write coordinator: builds per-bucket writers and compact tasks.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::comparator::KeyComparator;
use crate::compact::manager::{CompactManager, MergeTreeCompactManager, NoopCompactManager};
use crate::compact::task::{CompactRewriter, MergeTreeCompactRewriter};
use crate::compact::{CompactExecutor, CompactTask, CompactUnit, UniversalCompaction};
use crate::datafile::{
    DataFileMeta, DataFilePathFactory, KeyValueFileReaderFactory, KeyValueFileWriterFactory,
};
use crate::mergetree::buffer::{MemSortBuffer, SortBuffer};
use crate::mergetree::levels::Levels;
use crate::mergetree::merge::MergeFunction;
use crate::mergetree::spill::SpillSortBuffer;
use crate::mergetree::writer::MergeTreeWriter;
use crate::options::{ChangelogProducer, CoreOptions};
use crate::snapshot::SnapshotManager;
use crate::types::ValueKind;
use crate::{datafile, Result};

/// The delta a writer hands to the manifest committer.
#[derive(Debug, Clone, Default)]
pub struct CommitIncrement {
    /// Files flushed since the last commit.
    pub new_files: Vec<DataFileMeta>,
    /// Previously committed files consumed by compaction.
    pub compacted_before: Vec<DataFileMeta>,
    /// Files produced by compaction.
    pub compacted_after: Vec<DataFileMeta>,
    /// Changelog files emitted, when a changelog producer is active.
    pub changelog_files: Vec<DataFileMeta>,
}

impl CommitIncrement {
    /// Whether the increment carries no file changes at all.
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.compacted_before.is_empty()
            && self.compacted_after.is_empty()
            && self.changelog_files.is_empty()
    }
}

/// The writer API consumed by task drivers.
pub trait RecordWriter: Send {
    /// Buffer one record.
    fn write(&mut self, key: Bytes, kind: ValueKind, value: Bytes) -> Result<()>;

    /// Join and apply any in-flight compaction.
    fn sync(&mut self) -> Result<()>;

    /// Flush and return the commit delta.
    fn prepare_commit(&mut self, wait_compaction: bool) -> Result<CommitIncrement>;

    /// Cancel pending work and release resources.
    fn close(&mut self) -> Result<()>;
}

impl RecordWriter for MergeTreeWriter {
    fn write(&mut self, key: Bytes, kind: ValueKind, value: Bytes) -> Result<()> {
        MergeTreeWriter::write(self, key, kind, value)
    }

    fn sync(&mut self) -> Result<()> {
        MergeTreeWriter::sync(self)
    }

    fn prepare_commit(&mut self, wait_compaction: bool) -> Result<CommitIncrement> {
        MergeTreeWriter::prepare_commit(self, wait_compaction)
    }

    fn close(&mut self) -> Result<()> {
        MergeTreeWriter::close(self)
    }
}

/// Builds writers and standalone compact tasks for (partition, bucket) pairs.
///
/// Writers restore from the latest committed snapshot; their outputs become
/// visible only once the manifest committer applies the returned increments.
pub struct FileStoreWrite {
    root: PathBuf,
    snapshots: Arc<SnapshotManager>,
    comparator: KeyComparator,
    merge_function: Box<dyn MergeFunction>,
    options: Arc<CoreOptions>,
}

impl FileStoreWrite {
    /// Create a coordinator writing under `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        snapshots: Arc<SnapshotManager>,
        comparator: KeyComparator,
        merge_function: Box<dyn MergeFunction>,
        options: CoreOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            root: root.into(),
            snapshots,
            comparator,
            merge_function,
            options: Arc::new(options),
        })
    }

    /// The configured options.
    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    /// The snapshot service this coordinator restores from.
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Create a writer restored from the latest snapshot.
    pub fn create_writer(
        &self,
        partition: &str,
        bucket: u32,
        executor: CompactExecutor,
    ) -> Result<MergeTreeWriter> {
        let restored = self.scan_existing_file_metas(partition, bucket);
        self.create_merge_tree_writer(partition, bucket, restored, executor)
    }

    /// Create a writer with no restore; the caller asserts the bucket is
    /// empty (bulk load).
    pub fn create_empty_writer(
        &self,
        partition: &str,
        bucket: u32,
        executor: CompactExecutor,
    ) -> Result<MergeTreeWriter> {
        self.create_merge_tree_writer(partition, bucket, Vec::new(), executor)
    }

    /// Create a one-shot task merging `files` (or the latest snapshot's
    /// files) into the top level, dropping deletes.
    ///
    /// Callers must pass the bucket's full file set; the task assumes nothing
    /// older survives below its output.
    pub fn create_compact_writer(
        &self,
        partition: &str,
        bucket: u32,
        files: Option<Vec<DataFileMeta>>,
    ) -> Result<CompactTask> {
        let files = match files {
            Some(files) => files,
            None => self.scan_existing_file_metas(partition, bucket),
        };

        let rewriter = self.compact_rewriter(partition, bucket)?;
        let levels = Levels::new(self.comparator.clone(), files, self.options.num_levels)?;
        let unit = CompactUnit::from_level_runs(
            levels.max_level(),
            &levels.level_sorted_runs(),
            true,
        );
        Ok(CompactTask::new(
            self.comparator.clone(),
            self.options.target_file_size,
            rewriter,
            &unit,
            false,
        ))
    }

    fn scan_existing_file_metas(&self, partition: &str, bucket: u32) -> Vec<DataFileMeta> {
        match self.snapshots.latest_snapshot_id() {
            Some(id) => self
                .snapshots
                .scan(id)
                .with_partition(partition)
                .with_bucket(bucket)
                .files(),
            None => Vec::new(),
        }
    }

    fn bucket_path_factory(&self, partition: &str, bucket: u32) -> Result<Arc<DataFilePathFactory>> {
        let dir = self.root.join(partition).join(format!("bucket-{}", bucket));
        Ok(Arc::new(DataFilePathFactory::new(dir)?))
    }

    fn compact_rewriter(&self, partition: &str, bucket: u32) -> Result<Arc<dyn CompactRewriter>> {
        let paths = self.bucket_path_factory(partition, bucket)?;
        Ok(Arc::new(MergeTreeCompactRewriter::new(
            KeyValueFileReaderFactory::new(paths.clone()),
            KeyValueFileWriterFactory::new(paths, self.options.target_file_size),
            self.comparator.clone(),
            self.merge_function.clone(),
        )))
    }

    fn create_merge_tree_writer(
        &self,
        partition: &str,
        bucket: u32,
        restored: Vec<DataFileMeta>,
        executor: CompactExecutor,
    ) -> Result<MergeTreeWriter> {
        let paths = self.bucket_path_factory(partition, bucket)?;
        let writer_factory =
            KeyValueFileWriterFactory::new(paths.clone(), self.options.target_file_size);
        let max_sequence = datafile::max_sequence_number(&restored);

        let buffer: Box<dyn SortBuffer> = if self.options.write_buffer_spillable {
            Box::new(SpillSortBuffer::new(
                self.comparator.clone(),
                paths.clone(),
                self.options.write_buffer_size,
                self.options.local_sort_max_num_file_handles,
            ))
        } else {
            Box::new(MemSortBuffer::new(
                self.comparator.clone(),
                self.options.write_buffer_size,
            ))
        };

        let levels = Levels::new(self.comparator.clone(), restored, self.options.num_levels)?;
        let compact_manager: Box<dyn CompactManager> = if self.options.write_compaction_skip {
            Box::new(NoopCompactManager::new(levels))
        } else {
            let rewriter = Arc::new(MergeTreeCompactRewriter::new(
                KeyValueFileReaderFactory::new(paths),
                writer_factory.clone(),
                self.comparator.clone(),
                self.merge_function.clone(),
            ));
            Box::new(MergeTreeCompactManager::new(
                executor,
                levels,
                Box::new(UniversalCompaction::new(
                    self.options.max_size_amplification_percent,
                    self.options.sorted_run_size_ratio,
                    self.options.num_sorted_run_compaction_trigger,
                    self.options.max_sorted_run_num,
                )),
                self.comparator.clone(),
                self.options.target_file_size,
                self.options.num_sorted_run_stop_trigger,
                rewriter,
                self.options.changelog_producer == ChangelogProducer::FullCompaction,
            ))
        };

        info!(partition, bucket, max_sequence, "created merge tree writer");
        Ok(MergeTreeWriter::new(
            buffer,
            self.merge_function.clone(),
            writer_factory,
            compact_manager,
            max_sequence,
            self.options.commit_force_compact,
            self.options.changelog_producer,
        ))
    }
}
