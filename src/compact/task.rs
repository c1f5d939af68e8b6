//! The compaction task: rewrite overlapping sections, upgrade what can move
//! as-is.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::comparator::KeyComparator;
use crate::datafile::{DataFileMeta, KeyValueFileReaderFactory, KeyValueFileWriterFactory};
use crate::mergetree::merge::MergeFunction;
use crate::mergetree::reader::MergeTreeReader;
use crate::mergetree::sorted_run::SortedRun;
use crate::{Error, Result};

use super::interval::IntervalPartition;
use super::{CompactResult, CompactUnit};

/// Output of one rewrite call.
#[derive(Debug, Default)]
pub struct RewriteResult {
    /// Data files written at the output level.
    pub files: Vec<DataFileMeta>,
    /// Changelog files written alongside, when requested.
    pub changelog: Vec<DataFileMeta>,
}

/// Rewrites sections of sorted runs into fresh files at an output level.
///
/// Shared between the online compaction path and the standalone compact
/// writer.
pub trait CompactRewriter: Send + Sync {
    /// Merge `sections` and write the result at `output_level`.
    fn rewrite(
        &self,
        output_level: usize,
        drop_delete: bool,
        sections: Vec<Vec<SortedRun>>,
        emit_changelog: bool,
    ) -> Result<RewriteResult>;

    /// Delete a produced file by name (cleanup of aborted work).
    fn delete_file(&self, file_name: &str);
}

/// The standard rewriter: a [`MergeTreeReader`] driving a rolling writer.
pub struct MergeTreeCompactRewriter {
    reader_factory: KeyValueFileReaderFactory,
    writer_factory: KeyValueFileWriterFactory,
    comparator: KeyComparator,
    merge_function: Box<dyn MergeFunction>,
}

impl MergeTreeCompactRewriter {
    /// Create a rewriter over the bucket's factories.
    pub fn new(
        reader_factory: KeyValueFileReaderFactory,
        writer_factory: KeyValueFileWriterFactory,
        comparator: KeyComparator,
        merge_function: Box<dyn MergeFunction>,
    ) -> Self {
        Self {
            reader_factory,
            writer_factory,
            comparator,
            merge_function,
        }
    }
}

impl CompactRewriter for MergeTreeCompactRewriter {
    fn rewrite(
        &self,
        output_level: usize,
        drop_delete: bool,
        sections: Vec<Vec<SortedRun>>,
        emit_changelog: bool,
    ) -> Result<RewriteResult> {
        let mut reader = MergeTreeReader::new(
            sections,
            drop_delete,
            self.reader_factory.clone(),
            self.comparator.clone(),
            self.merge_function.clone(),
        );

        let changelog_writer = if emit_changelog {
            let writer = self
                .writer_factory
                .create_rolling_changelog_writer(output_level);
            let shared = Arc::new(Mutex::new(Some(writer)));
            let sink = shared.clone();
            reader = reader.with_changelog(Box::new(move |kv| {
                match sink.lock().as_mut() {
                    Some(writer) => writer.write(kv),
                    None => Err(Error::internal("changelog writer already closed")),
                }
            }));
            Some(shared)
        } else {
            None
        };

        let mut rolling = self.writer_factory.create_rolling_writer(output_level);
        let drive = (|| -> Result<()> {
            while let Some(kv) = reader.read_next()? {
                rolling.write(&kv)?;
            }
            Ok(())
        })();
        drop(reader);

        match drive {
            Ok(()) => {
                let files = rolling.close()?;
                let changelog = match changelog_writer {
                    Some(shared) => {
                        let writer = shared
                            .lock()
                            .take()
                            .ok_or_else(|| Error::internal("changelog writer already closed"))?;
                        writer.close()?
                    }
                    None => Vec::new(),
                };
                Ok(RewriteResult { files, changelog })
            }
            Err(e) => {
                rolling.abort();
                if let Some(shared) = changelog_writer {
                    if let Some(writer) = shared.lock().take() {
                        writer.abort();
                    }
                }
                Err(e)
            }
        }
    }

    fn delete_file(&self, file_name: &str) {
        self.writer_factory.delete_file(file_name);
    }
}

/// One compaction: merges the unit's runs into its output level.
///
/// Input files are partitioned into maximal sections of overlapping runs.
/// Multi-run sections are rewritten; a single-run section's files move to the
/// output level without rewrite when they are at least `min_file_size` large,
/// while smaller files join the rewrite to keep file counts down. When
/// changelog emission is required every section is rewritten.
pub struct CompactTask {
    min_file_size: u64,
    rewriter: Arc<dyn CompactRewriter>,
    output_level: usize,
    drop_delete: bool,
    partitioned: Vec<Vec<SortedRun>>,
    emit_changelog: bool,
    cancelled: Arc<AtomicBool>,
}

impl CompactTask {
    /// Build a task from a compact unit.
    pub fn new(
        comparator: KeyComparator,
        min_file_size: u64,
        rewriter: Arc<dyn CompactRewriter>,
        unit: &CompactUnit,
        emit_changelog: bool,
    ) -> Self {
        let partitioned = IntervalPartition::new(unit.files().to_vec(), comparator).partition();
        Self {
            min_file_size,
            rewriter,
            output_level: unit.output_level(),
            drop_delete: unit.drop_delete(),
            partitioned,
            emit_changelog,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed between sections; setting it aborts the task with
    /// [`Error::Cancelled`].
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// The level this task writes to.
    pub fn output_level(&self) -> usize {
        self.output_level
    }

    /// Execute the compaction.
    ///
    /// On error or cancellation every file written so far is deleted; the
    /// level structure is untouched either way (the caller applies the
    /// result).
    pub fn run(&self) -> Result<CompactResult> {
        let mut result = CompactResult::default();
        match self.execute(&mut result) {
            Ok(()) => {
                debug!(
                    before = result.before.len(),
                    after = result.after.len(),
                    output_level = self.output_level,
                    "compaction task finished"
                );
                Ok(result)
            }
            Err(e) => {
                self.cleanup(&result);
                Err(e)
            }
        }
    }

    fn execute(&self, result: &mut CompactResult) -> Result<()> {
        let mut candidate: Vec<Vec<SortedRun>> = Vec::new();

        for section in &self.partitioned {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            if section.len() > 1 || self.emit_changelog {
                candidate.push(section.clone());
                continue;
            }

            // A lone run does not overlap anything else in the unit. Large
            // files move by relabeling; small ones are worth rewriting into
            // their neighbors.
            let run = &section[0];
            for file in run.files() {
                if file.file_size() < self.min_file_size {
                    candidate.push(vec![SortedRun::from_single(file.clone())]);
                } else {
                    self.rewrite_candidate(&mut candidate, result)?;
                    self.upgrade(file, result);
                }
            }
        }

        self.rewrite_candidate(&mut candidate, result)?;

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn upgrade(&self, file: &DataFileMeta, result: &mut CompactResult) {
        if file.level() == self.output_level {
            return;
        }
        result.before.push(file.clone());
        result.after.push(file.upgrade(self.output_level));
    }

    fn rewrite_candidate(
        &self,
        candidate: &mut Vec<Vec<SortedRun>>,
        result: &mut CompactResult,
    ) -> Result<()> {
        if candidate.is_empty() {
            return Ok(());
        }

        for section in candidate.iter() {
            for run in section {
                result.before.extend(run.files().iter().cloned());
            }
        }

        let rewritten = self.rewriter.rewrite(
            self.output_level,
            self.drop_delete,
            std::mem::take(candidate),
            self.emit_changelog,
        )?;
        result.after.extend(rewritten.files);
        result.changelog.extend(rewritten.changelog);
        Ok(())
    }

    /// Delete files this task created. Upgraded files (present on both sides
    /// of the result) are pre-existing inputs and are kept.
    fn cleanup(&self, result: &CompactResult) {
        let inputs: HashSet<&str> = result.before.iter().map(DataFileMeta::file_name).collect();
        for file in &result.after {
            if !inputs.contains(file.file_name()) {
                self.rewriter.delete_file(file.file_name());
            }
        }
        for file in &result.changelog {
            self.rewriter.delete_file(file.file_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::datafile::DataFilePathFactory;
    use crate::mergetree::levels::LevelSortedRun;
    use crate::mergetree::merge::DeduplicateMergeFunction;
    use crate::types::{KeyValue, ValueKind};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn cmp() -> KeyComparator {
        Arc::new(BytewiseComparator::new())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        readers: KeyValueFileReaderFactory,
        writers: KeyValueFileWriterFactory,
    }

    fn fixture(target_file_size: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let paths = Arc::new(DataFilePathFactory::new(dir.path().join("bucket-0")).unwrap());
        Fixture {
            _dir: dir,
            readers: KeyValueFileReaderFactory::new(paths.clone()),
            writers: KeyValueFileWriterFactory::new(paths, target_file_size),
        }
    }

    fn write_file(fx: &Fixture, level: usize, records: &[(&str, u64, Option<&str>)]) -> DataFileMeta {
        let mut writer = fx.writers.create_rolling_writer(level);
        for (key, seq, value) in records {
            let kv = match value {
                Some(v) => KeyValue::new(
                    Bytes::copy_from_slice(key.as_bytes()),
                    *seq,
                    ValueKind::Add,
                    Bytes::copy_from_slice(v.as_bytes()),
                ),
                None => KeyValue::delete(Bytes::copy_from_slice(key.as_bytes()), *seq),
            };
            writer.write(&kv).unwrap();
        }
        let mut metas = writer.close().unwrap();
        assert_eq!(metas.len(), 1);
        metas.remove(0)
    }

    fn rewriter(fx: &Fixture) -> Arc<dyn CompactRewriter> {
        Arc::new(MergeTreeCompactRewriter::new(
            fx.readers.clone(),
            fx.writers.clone(),
            cmp(),
            Box::new(DeduplicateMergeFunction::new()),
        ))
    }

    fn read_all(fx: &Fixture, files: &[DataFileMeta]) -> Vec<KeyValue> {
        let mut out = Vec::new();
        for meta in files {
            let mut reader = fx.readers.open(meta.file_name()).unwrap();
            while let Some(kv) = reader.read_next().unwrap() {
                out.push(kv);
            }
        }
        out
    }

    #[test]
    fn test_overlapping_runs_are_merged() {
        let fx = fixture(1 << 20);
        let a = write_file(&fx, 0, &[("a", 1, Some("1")), ("c", 2, Some("2"))]);
        let b = write_file(&fx, 0, &[("b", 3, Some("3")), ("c", 4, Some("4"))]);

        let runs = vec![
            LevelSortedRun::new(0, SortedRun::from_single(a.clone())),
            LevelSortedRun::new(0, SortedRun::from_single(b.clone())),
        ];
        let unit = CompactUnit::from_level_runs(3, &runs, true);
        let task = CompactTask::new(cmp(), 1 << 20, rewriter(&fx), &unit, false);

        let result = task.run().unwrap();
        assert_eq!(result.before.len(), 2);
        assert_eq!(result.after.len(), 1);
        assert_eq!(result.after[0].level(), 3);

        let records = read_all(&fx, &result.after);
        let keys: Vec<_> = records.iter().map(|kv| kv.key().clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        // "c" resolved to the newer value.
        assert_eq!(records[2].value().as_ref(), b"4");
    }

    #[test]
    fn test_large_lone_file_is_upgraded() {
        let fx = fixture(1 << 20);
        let file = write_file(&fx, 1, &[("a", 1, Some("1")), ("b", 2, Some("2"))]);

        let runs = vec![LevelSortedRun::new(1, SortedRun::from_single(file.clone()))];
        let unit = CompactUnit::from_level_runs(4, &runs, true);
        // min_file_size of zero: everything counts as large.
        let task = CompactTask::new(cmp(), 0, rewriter(&fx), &unit, false);

        let result = task.run().unwrap();
        assert_eq!(result.before, vec![file.clone()]);
        assert_eq!(result.after.len(), 1);
        assert_eq!(result.after[0].level(), 4);
        // Same physical file, only relabeled.
        assert_eq!(result.after[0].file_name(), file.file_name());
    }

    #[test]
    fn test_file_already_at_output_level_untouched() {
        let fx = fixture(1 << 20);
        let file = write_file(&fx, 4, &[("a", 1, Some("1"))]);

        let runs = vec![LevelSortedRun::new(4, SortedRun::from_single(file))];
        let unit = CompactUnit::from_level_runs(4, &runs, true);
        let task = CompactTask::new(cmp(), 0, rewriter(&fx), &unit, false);

        let result = task.run().unwrap();
        assert!(result.before.is_empty());
        assert!(result.after.is_empty());
    }

    #[test]
    fn test_small_lone_file_joins_rewrite() {
        let fx = fixture(1 << 20);
        let small = write_file(&fx, 0, &[("a", 1, Some("1"))]);

        let runs = vec![LevelSortedRun::new(0, SortedRun::from_single(small.clone()))];
        let unit = CompactUnit::from_level_runs(2, &runs, false);
        // Huge min_file_size: the lone file is rewritten, not upgraded.
        let task = CompactTask::new(cmp(), u64::MAX, rewriter(&fx), &unit, false);

        let result = task.run().unwrap();
        assert_eq!(result.before, vec![small.clone()]);
        assert_eq!(result.after.len(), 1);
        assert_ne!(result.after[0].file_name(), small.file_name());
    }

    #[test]
    fn test_drop_delete_discards_tombstones() {
        let fx = fixture(1 << 20);
        let a = write_file(&fx, 0, &[("k", 1, Some("v"))]);
        let b = write_file(&fx, 0, &[("k", 2, None)]);

        let runs = vec![
            LevelSortedRun::new(0, SortedRun::from_single(b)),
            LevelSortedRun::new(0, SortedRun::from_single(a)),
        ];
        let unit = CompactUnit::from_level_runs(3, &runs, true);
        let task = CompactTask::new(cmp(), 1 << 20, rewriter(&fx), &unit, false);

        let result = task.run().unwrap();
        // Everything merged away: no output files at all.
        assert!(result.after.is_empty());
        assert_eq!(result.before.len(), 2);
    }

    #[test]
    fn test_intermediate_level_keeps_tombstones() {
        let fx = fixture(1 << 20);
        let a = write_file(&fx, 0, &[("k", 1, Some("v"))]);
        let b = write_file(&fx, 0, &[("k", 2, None)]);

        let runs = vec![
            LevelSortedRun::new(0, SortedRun::from_single(b)),
            LevelSortedRun::new(0, SortedRun::from_single(a)),
        ];
        let unit = CompactUnit::from_level_runs(2, &runs, false);
        let task = CompactTask::new(cmp(), 1 << 20, rewriter(&fx), &unit, false);

        let result = task.run().unwrap();
        let records = read_all(&fx, &result.after);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_delete());
    }

    #[test]
    fn test_cancelled_task_aborts() {
        let fx = fixture(1 << 20);
        let a = write_file(&fx, 0, &[("a", 1, Some("1"))]);
        let b = write_file(&fx, 0, &[("a", 2, Some("2"))]);

        let runs = vec![
            LevelSortedRun::new(0, SortedRun::from_single(b)),
            LevelSortedRun::new(0, SortedRun::from_single(a)),
        ];
        let unit = CompactUnit::from_level_runs(3, &runs, true);
        let task = CompactTask::new(cmp(), 1 << 20, rewriter(&fx), &unit, false);

        task.cancellation_flag().store(true, Ordering::SeqCst);
        let err = task.run().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_changelog_emission_rewrites_everything() {
        let fx = fixture(1 << 20);
        let file = write_file(&fx, 1, &[("a", 1, Some("1")), ("b", 2, None)]);

        let runs = vec![LevelSortedRun::new(1, SortedRun::from_single(file))];
        let unit = CompactUnit::from_level_runs(4, &runs, true);
        // min_file_size 0 would normally upgrade, but changelog forces merge.
        let task = CompactTask::new(cmp(), 0, rewriter(&fx), &unit, true);

        let result = task.run().unwrap();
        assert_eq!(result.after.len(), 1);
        assert_ne!(result.after[0].file_name(), result.before[0].file_name());
        assert_eq!(result.changelog.len(), 1);
        assert!(result.changelog[0].file_name().starts_with("changelog-"));

        // The changelog kept the delete the data output dropped.
        let changelog = read_all(&fx, &result.changelog);
        assert_eq!(changelog.len(), 2);
        let data = read_all(&fx, &result.after);
        assert_eq!(data.len(), 1);
    }
}
