//! The per-bucket merge-tree writer.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::compact::manager::CompactManager;
use crate::compact::CompactResult;
use crate::datafile::{DataFileMeta, KeyValueFileWriterFactory};
use crate::metrics::WriterMetrics;
use crate::options::ChangelogProducer;
use crate::types::{KeyValue, ValueKind};
use crate::write::CommitIncrement;
use crate::{Error, Result};

use super::buffer::SortBuffer;
use super::levels::Levels;
use super::merge::MergeFunction;

/// Single-threaded writer for one (partition, bucket) pair.
///
/// Records are buffered, flushed as level-0 runs through a rolling writer,
/// and compacted in the background via the compact manager. `prepare_commit`
/// yields the delta of files added and compacted away since the last commit.
///
/// A fatal flush failure poisons the writer: subsequent operations fail with
/// [`Error::WriterPoisoned`] and `close` reports the original error.
pub struct MergeTreeWriter {
    buffer: Box<dyn SortBuffer>,
    merge_function: Box<dyn MergeFunction>,
    writer_factory: KeyValueFileWriterFactory,
    compact_manager: Box<dyn CompactManager>,
    next_sequence: u64,
    commit_force_compact: bool,
    changelog_producer: ChangelogProducer,
    new_files: Vec<DataFileMeta>,
    compact_before: Vec<DataFileMeta>,
    compact_after: Vec<DataFileMeta>,
    changelog_files: Vec<DataFileMeta>,
    metrics: Arc<WriterMetrics>,
    poison: Option<Error>,
}

impl MergeTreeWriter {
    /// Create a writer restored to `max_sequence` (0 for an empty bucket).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Box<dyn SortBuffer>,
        merge_function: Box<dyn MergeFunction>,
        writer_factory: KeyValueFileWriterFactory,
        compact_manager: Box<dyn CompactManager>,
        max_sequence: u64,
        commit_force_compact: bool,
        changelog_producer: ChangelogProducer,
    ) -> Self {
        Self {
            buffer,
            merge_function,
            writer_factory,
            compact_manager,
            next_sequence: max_sequence + 1,
            commit_force_compact,
            changelog_producer,
            new_files: Vec::new(),
            compact_before: Vec::new(),
            compact_after: Vec::new(),
            changelog_files: Vec::new(),
            metrics: WriterMetrics::new(),
            poison: None,
        }
    }

    /// The writer's level structure.
    pub fn levels(&self) -> &Levels {
        self.compact_manager.levels()
    }

    /// The writer's metrics.
    pub fn metrics(&self) -> Arc<WriterMetrics> {
        self.metrics.clone()
    }

    /// Next sequence number to be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Buffer one record, flushing and applying backpressure as needed.
    pub fn write(&mut self, key: Bytes, kind: ValueKind, value: Bytes) -> Result<()> {
        self.check_poisoned()?;
        self.ensure_capacity()?;

        if !self.buffer.put(key.clone(), kind, value.clone())? {
            self.flush_write_buffer(false, false)?;
            if !self.buffer.put(key, kind, value)? {
                return Err(Error::internal(
                    "record does not fit into an empty write buffer",
                ));
            }
        }
        self.metrics.records_written.inc();
        Ok(())
    }

    /// Join and apply any in-flight compaction.
    pub fn sync(&mut self) -> Result<()> {
        self.check_poisoned()?;
        while self.compact_manager.is_compacting() {
            self.try_sync_compaction(true)?;
        }
        Ok(())
    }

    /// Flush, optionally join compaction, and return the commit delta.
    ///
    /// Returns either a complete delta or an error, never a partial one. With
    /// `wait_compaction` (or `commit_force_compact`, or a FULL_COMPACTION
    /// changelog producer) no compaction is in flight on return.
    pub fn prepare_commit(&mut self, wait_compaction: bool) -> Result<CommitIncrement> {
        self.check_poisoned()?;

        let forced_full = self.changelog_producer == ChangelogProducer::FullCompaction;
        let wait = wait_compaction || self.commit_force_compact || forced_full;

        self.flush_write_buffer(wait, forced_full)?;
        if wait {
            while self.compact_manager.is_compacting() {
                self.try_sync_compaction(true)?;
            }
        }
        Ok(self.drain_increment())
    }

    /// Cancel pending compaction, release resources, and report any stored
    /// fatal error.
    pub fn close(&mut self) -> Result<()> {
        self.compact_manager.cancel();
        let close_result = self.compact_manager.close();
        self.buffer.clear();
        close_result?;

        match self.poison.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poison.is_some() {
            return Err(Error::WriterPoisoned);
        }
        Ok(())
    }

    /// Block while the level-0 run count sits at the stop trigger.
    ///
    /// Breaks out if the strategy finds no work, so a misconfigured trigger
    /// cannot wedge the write path.
    fn ensure_capacity(&mut self) -> Result<()> {
        while self.compact_manager.should_wait_compaction() {
            if !self.compact_manager.is_compacting() {
                self.compact_manager.trigger_compaction(false)?;
                if !self.compact_manager.is_compacting() {
                    warn!("write stop trigger reached but no compaction eligible");
                    break;
                }
            }
            debug!(
                level0_runs = self.levels().number_of_level0_runs(),
                "write path waiting for compaction"
            );
            self.try_sync_compaction(true)?;
        }
        Ok(())
    }

    fn flush_write_buffer(&mut self, wait: bool, forced_full: bool) -> Result<()> {
        if !self.buffer.is_empty() {
            if let Err(e) = self.do_flush() {
                if e.is_fatal() {
                    self.poison = Some(e.clone());
                }
                return Err(e);
            }
        }

        let wait = wait || self.compact_manager.should_wait_compaction();
        self.try_sync_compaction(wait)?;
        self.compact_manager.trigger_compaction(forced_full)?;
        self.ensure_capacity()
    }

    fn do_flush(&mut self) -> Result<()> {
        let mut rolling = self.writer_factory.create_rolling_writer(0);
        let mut changelog = match self.changelog_producer {
            ChangelogProducer::Input => {
                Some(self.writer_factory.create_rolling_changelog_writer(0))
            }
            _ => None,
        };

        let mut sequence = self.next_sequence;
        let drained = {
            let mut merged = |kv: &KeyValue| rolling.write(kv);
            match changelog.as_mut() {
                Some(writer) => {
                    let mut raw = |kv: &KeyValue| writer.write(kv);
                    self.buffer.drain(
                        &mut sequence,
                        self.merge_function.as_mut(),
                        Some(&mut raw),
                        &mut merged,
                    )
                }
                None => self.buffer.drain(
                    &mut sequence,
                    self.merge_function.as_mut(),
                    None,
                    &mut merged,
                ),
            }
        };

        if let Err(e) = drained {
            rolling.abort();
            if let Some(writer) = changelog {
                writer.abort();
            }
            return Err(e);
        }

        let files = match rolling.close() {
            Ok(files) => files,
            Err(e) => {
                if let Some(writer) = changelog {
                    writer.abort();
                }
                return Err(e);
            }
        };
        let changelog_files = match changelog {
            Some(writer) => writer.close()?,
            None => Vec::new(),
        };

        self.next_sequence = sequence;
        if !files.is_empty() {
            self.metrics.flushes.inc();
        }
        info!(
            files = files.len(),
            next_sequence = sequence,
            "flushed write buffer"
        );
        for meta in files {
            self.metrics.files_flushed.inc();
            self.metrics.bytes_flushed.add(meta.file_size());
            self.new_files.push(meta.clone());
            self.compact_manager.add_new_file(meta);
        }
        self.changelog_files.extend(changelog_files);
        self.buffer.clear();
        self.metrics
            .level0_runs
            .set(self.levels().number_of_level0_runs() as u64);
        Ok(())
    }

    fn try_sync_compaction(&mut self, blocking: bool) -> Result<()> {
        match self.compact_manager.get_compaction_result(blocking) {
            Ok(Some(result)) => {
                self.update_compact_result(result);
                self.metrics.compactions_applied.inc();
                self.metrics
                    .level0_runs
                    .set(self.levels().number_of_level0_runs() as u64);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.metrics.compactions_failed.inc();
                Err(e)
            }
        }
    }

    /// Fold a compaction result into the pending delta.
    ///
    /// Files created and consumed within the same delta cancel out and their
    /// physical files are removed; nothing committed ever referenced them.
    fn update_compact_result(&mut self, result: CompactResult) {
        let after_names: HashSet<&str> =
            result.after.iter().map(DataFileMeta::file_name).collect();

        for file in &result.before {
            let name = file.file_name();
            if let Some(pos) = self.new_files.iter().position(|f| f.file_name() == name) {
                self.new_files.remove(pos);
                if !after_names.contains(name) {
                    self.writer_factory.delete_file(name);
                }
            } else if let Some(pos) = self
                .compact_after
                .iter()
                .position(|f| f.file_name() == name)
            {
                self.compact_after.remove(pos);
                let still_referenced = after_names.contains(name)
                    || self.compact_before.iter().any(|f| f.file_name() == name);
                if !still_referenced {
                    self.writer_factory.delete_file(name);
                }
            } else {
                self.compact_before.push(file.clone());
            }
        }
        self.compact_after.extend(result.after);
        self.changelog_files.extend(result.changelog);
    }

    fn drain_increment(&mut self) -> CommitIncrement {
        CommitIncrement {
            new_files: std::mem::take(&mut self.new_files),
            compacted_before: std::mem::take(&mut self.compact_before),
            compacted_after: std::mem::take(&mut self.compact_after),
            changelog_files: std::mem::take(&mut self.changelog_files),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, KeyComparator};
    use crate::compact::manager::{MergeTreeCompactManager, NoopCompactManager};
    use crate::compact::{CompactExecutor, MergeTreeCompactRewriter, UniversalCompaction};
    use crate::datafile::{DataFilePathFactory, KeyValueFileReaderFactory};
    use crate::mergetree::buffer::MemSortBuffer;
    use crate::mergetree::merge::DeduplicateMergeFunction;
    use tempfile::tempdir;

    fn cmp() -> KeyComparator {
        Arc::new(BytewiseComparator::new())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: Arc<DataFilePathFactory>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let paths = Arc::new(DataFilePathFactory::new(dir.path().join("bucket-0")).unwrap());
        Fixture { _dir: dir, paths }
    }

    fn noop_writer(fx: &Fixture, buffer_capacity: usize) -> MergeTreeWriter {
        let levels = Levels::new(cmp(), vec![], 6).unwrap();
        MergeTreeWriter::new(
            Box::new(MemSortBuffer::new(cmp(), buffer_capacity)),
            Box::new(DeduplicateMergeFunction::new()),
            KeyValueFileWriterFactory::new(fx.paths.clone(), 1 << 20),
            Box::new(NoopCompactManager::new(levels)),
            0,
            false,
            ChangelogProducer::None,
        )
    }

    fn compacting_writer(fx: &Fixture, stop_trigger: usize) -> MergeTreeWriter {
        let writer_factory = KeyValueFileWriterFactory::new(fx.paths.clone(), 1 << 20);
        let reader_factory = KeyValueFileReaderFactory::new(fx.paths.clone());
        let rewriter = Arc::new(MergeTreeCompactRewriter::new(
            reader_factory,
            writer_factory.clone(),
            cmp(),
            Box::new(DeduplicateMergeFunction::new()),
        ));
        let levels = Levels::new(cmp(), vec![], 6).unwrap();
        let manager = MergeTreeCompactManager::new(
            CompactExecutor::new(1),
            levels,
            Box::new(UniversalCompaction::new(200, 1, 2, usize::MAX)),
            cmp(),
            1 << 20,
            stop_trigger,
            rewriter,
            false,
        );
        MergeTreeWriter::new(
            Box::new(MemSortBuffer::new(cmp(), 1 << 20)),
            Box::new(DeduplicateMergeFunction::new()),
            writer_factory,
            Box::new(manager),
            0,
            false,
            ChangelogProducer::None,
        )
    }

    fn put(writer: &mut MergeTreeWriter, key: &str, value: &str) {
        writer
            .write(
                Bytes::copy_from_slice(key.as_bytes()),
                ValueKind::Add,
                Bytes::copy_from_slice(value.as_bytes()),
            )
            .unwrap();
    }

    #[test]
    fn test_empty_prepare_commit() {
        let fx = fixture();
        let mut writer = noop_writer(&fx, 1 << 20);

        let increment = writer.prepare_commit(false).unwrap();
        assert!(increment.new_files.is_empty());
        assert!(increment.compacted_before.is_empty());
        assert!(increment.compacted_after.is_empty());
        writer.close().unwrap();
    }

    #[test]
    fn test_write_flush_commit() {
        let fx = fixture();
        let mut writer = noop_writer(&fx, 1 << 20);

        put(&mut writer, "b", "2");
        put(&mut writer, "a", "1");

        let increment = writer.prepare_commit(false).unwrap();
        assert_eq!(increment.new_files.len(), 1);
        let meta = &increment.new_files[0];
        assert_eq!(meta.row_count(), 2);
        assert_eq!(meta.min_key().as_ref(), b"a");
        assert_eq!(meta.max_key().as_ref(), b"b");
        assert_eq!(meta.level(), 0);

        // Delta is cleared after the commit.
        let next = writer.prepare_commit(false).unwrap();
        assert!(next.new_files.is_empty());
        writer.close().unwrap();
    }

    #[test]
    fn test_sequences_dense_across_batches() {
        let fx = fixture();
        let mut writer = noop_writer(&fx, 1 << 20);

        put(&mut writer, "a", "1");
        put(&mut writer, "b", "2");
        let first = writer.prepare_commit(false).unwrap();
        assert_eq!(first.new_files[0].min_sequence(), 1);
        assert_eq!(first.new_files[0].max_sequence(), 2);

        put(&mut writer, "c", "3");
        let second = writer.prepare_commit(false).unwrap();
        assert_eq!(second.new_files[0].min_sequence(), 3);
        assert_eq!(second.new_files[0].max_sequence(), 3);
        writer.close().unwrap();
    }

    #[test]
    fn test_buffer_full_triggers_flush() {
        let fx = fixture();
        let mut writer = noop_writer(&fx, 256);

        for i in 0..64 {
            put(&mut writer, &format!("key-{:03}", i), "some-value-payload");
        }
        let increment = writer.prepare_commit(false).unwrap();
        // The tiny buffer forced intermediate flushes.
        assert!(increment.new_files.len() > 1);
        assert_eq!(writer.levels().number_of_level0_runs(), 0);
        writer.close().unwrap();
    }

    #[test]
    fn test_compaction_folds_into_delta() {
        let fx = fixture();
        let mut writer = compacting_writer(&fx, 100);

        // Two flushes produce two overlapping level-0 runs, which the
        // universal strategy merges.
        put(&mut writer, "a", "1");
        writer.prepare_commit(false).unwrap();
        put(&mut writer, "a", "2");

        let increment = writer.prepare_commit(true).unwrap();
        // The second flush's file was consumed by the same delta's
        // compaction: it cancels out of new_files.
        assert!(increment.new_files.is_empty());
        // The first flush's file was committed earlier, so it shows up as
        // compacted away.
        assert_eq!(increment.compacted_before.len(), 1);
        assert_eq!(increment.compacted_after.len(), 1);

        let outputs = increment.compacted_after;
        assert_eq!(outputs[0].level(), 5);
        writer.close().unwrap();
    }

    #[test]
    fn test_force_compact_leaves_nothing_in_flight() {
        let fx = fixture();
        let mut writer = compacting_writer(&fx, 100);

        put(&mut writer, "a", "1");
        writer.prepare_commit(false).unwrap();
        put(&mut writer, "b", "2");
        writer.prepare_commit(true).unwrap();

        assert!(!writer.compact_manager.is_compacting());
        writer.close().unwrap();
    }

    #[test]
    fn test_poisoned_writer_rejects_operations() {
        let fx = fixture();
        let mut writer = noop_writer(&fx, 1 << 20);
        writer.poison = Some(Error::Io("disk failed".into()));

        assert!(matches!(
            writer.write(Bytes::from("k"), ValueKind::Add, Bytes::from("v")),
            Err(Error::WriterPoisoned)
        ));
        assert!(matches!(
            writer.prepare_commit(false),
            Err(Error::WriterPoisoned)
        ));
        // close reports the original fatal error.
        assert!(matches!(writer.close(), Err(Error::Io(_))));
        // And a second close is clean.
        assert!(writer.close().is_ok());
    }

    #[test]
    fn test_metrics_track_writes() {
        let fx = fixture();
        let mut writer = noop_writer(&fx, 1 << 20);
        put(&mut writer, "a", "1");
        put(&mut writer, "b", "2");
        writer.prepare_commit(false).unwrap();

        let snap = writer.metrics().snapshot();
        assert_eq!(snap.records_written, 2);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.files_flushed, 1);
        writer.close().unwrap();
    }
}
