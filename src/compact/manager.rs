//! Compaction scheduling and result application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::comparator::KeyComparator;
use crate::datafile::DataFileMeta;
use crate::mergetree::levels::Levels;
use crate::{Error, Result};

use super::executor::{CompactExecutor, TaskHandle};
use super::task::{CompactRewriter, CompactTask};
use super::{CompactResult, CompactStrategy, CompactUnit};

/// Owns a writer's level structure and schedules its compactions.
///
/// At most one compaction is in flight per manager. Results are applied to
/// the levels only through [`CompactManager::get_compaction_result`], which
/// the writer drives from its own thread.
pub trait CompactManager: Send {
    /// Whether the write path must block until compaction catches up.
    fn should_wait_compaction(&self) -> bool;

    /// Record a freshly flushed level-0 file.
    fn add_new_file(&mut self, file: DataFileMeta);

    /// Start a compaction if none is running and the strategy finds work.
    ///
    /// With `full`, every run is merged into the top level.
    fn trigger_compaction(&mut self, full: bool) -> Result<()>;

    /// Fetch the in-flight compaction's result, applying it to the levels.
    ///
    /// Non-blocking unless `blocking`; returns `None` when idle or not yet
    /// finished. A failed task surfaces its error here and leaves the levels
    /// unchanged.
    fn get_compaction_result(&mut self, blocking: bool) -> Result<Option<CompactResult>>;

    /// Whether a compaction is currently in flight.
    fn is_compacting(&self) -> bool;

    /// The level structure.
    fn levels(&self) -> &Levels;

    /// Ask the in-flight task to stop at its next checkpoint.
    fn cancel(&mut self);

    /// Cancel, wait for the worker to observe it, and discard orphan outputs.
    fn close(&mut self) -> Result<()>;
}

struct InFlight {
    handle: TaskHandle<Result<CompactResult>>,
    output_level: usize,
    cancel: Arc<AtomicBool>,
}

/// The real manager: universal strategy, shared executor, one task at a time.
pub struct MergeTreeCompactManager {
    executor: CompactExecutor,
    levels: Levels,
    strategy: Box<dyn CompactStrategy>,
    comparator: KeyComparator,
    target_file_size: u64,
    stop_trigger: usize,
    rewriter: Arc<dyn CompactRewriter>,
    changelog_on_full_compaction: bool,
    in_flight: Option<InFlight>,
}

impl MergeTreeCompactManager {
    /// Create a manager over restored levels.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: CompactExecutor,
        levels: Levels,
        strategy: Box<dyn CompactStrategy>,
        comparator: KeyComparator,
        target_file_size: u64,
        stop_trigger: usize,
        rewriter: Arc<dyn CompactRewriter>,
        changelog_on_full_compaction: bool,
    ) -> Self {
        Self {
            executor,
            levels,
            strategy,
            comparator,
            target_file_size,
            stop_trigger,
            rewriter,
            changelog_on_full_compaction,
            in_flight: None,
        }
    }

    fn pick_unit(&self, full: bool) -> Option<CompactUnit> {
        let runs = self.levels.level_sorted_runs();
        if full {
            if runs.is_empty() {
                return None;
            }
            // A single run already at the top is a full compaction's fixed
            // point, unless a changelog must still be produced.
            if !self.changelog_on_full_compaction
                && runs.len() == 1
                && runs[0].level() == self.levels.max_level()
            {
                return None;
            }
            Some(CompactUnit::from_level_runs(
                self.levels.max_level(),
                &runs,
                true,
            ))
        } else {
            self.strategy.pick(self.levels.number_of_levels(), &runs)
        }
    }
}

impl CompactManager for MergeTreeCompactManager {
    fn should_wait_compaction(&self) -> bool {
        self.levels.number_of_level0_runs() >= self.stop_trigger
    }

    fn add_new_file(&mut self, file: DataFileMeta) {
        self.levels.add_level0_file(file);
    }

    fn trigger_compaction(&mut self, full: bool) -> Result<()> {
        if self.in_flight.is_some() {
            return Ok(());
        }

        let unit = match self.pick_unit(full) {
            Some(unit) if !unit.files().is_empty() => unit,
            _ => return Ok(()),
        };

        let emit_changelog = full && self.changelog_on_full_compaction;
        let task = CompactTask::new(
            self.comparator.clone(),
            self.target_file_size,
            self.rewriter.clone(),
            &unit,
            emit_changelog,
        );
        let cancel = task.cancellation_flag();
        let output_level = task.output_level();

        debug!(
            files = unit.files().len(),
            output_level,
            drop_delete = unit.drop_delete(),
            "submitting compaction task"
        );
        let handle = self.executor.submit(move || task.run());
        self.in_flight = Some(InFlight {
            handle,
            output_level,
            cancel,
        });
        Ok(())
    }

    fn get_compaction_result(&mut self, blocking: bool) -> Result<Option<CompactResult>> {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) => in_flight,
            None => return Ok(None),
        };

        let outcome = if blocking {
            Some(in_flight.handle.take())
        } else {
            in_flight.handle.try_take()
        };

        match outcome {
            None => {
                self.in_flight = Some(in_flight);
                Ok(None)
            }
            Some(Ok(result)) => {
                self.levels
                    .update(&result.before, &result.after, in_flight.output_level)?;
                info!(
                    before = result.before.len(),
                    after = result.after.len(),
                    output_level = in_flight.output_level,
                    sorted_runs = self.levels.number_of_sorted_runs(),
                    "compaction applied"
                );
                Ok(Some(result))
            }
            Some(Err(Error::Cancelled)) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "background compaction failed");
                Err(Error::compaction(e.to_string()))
            }
        }
    }

    fn is_compacting(&self) -> bool {
        self.in_flight.is_some()
    }

    fn levels(&self) -> &Levels {
        &self.levels
    }

    fn cancel(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.cancel.store(true, Ordering::SeqCst);
        }
    }

    fn close(&mut self) -> Result<()> {
        self.cancel();
        if let Some(in_flight) = self.in_flight.take() {
            // The task either observed the flag and cleaned up after itself,
            // or finished; a finished result was never applied, so its
            // outputs are orphans.
            if let Ok(result) = in_flight.handle.take() {
                let inputs: std::collections::HashSet<&str> =
                    result.before.iter().map(DataFileMeta::file_name).collect();
                for file in result.after.iter().filter(|f| !inputs.contains(f.file_name())) {
                    self.rewriter.delete_file(file.file_name());
                }
                for file in &result.changelog {
                    self.rewriter.delete_file(file.file_name());
                }
            }
        }
        Ok(())
    }
}

/// A manager that never compacts; level-0 appends still land in the levels.
///
/// Used by bulk-load writers (`write_compaction_skip`).
pub struct NoopCompactManager {
    levels: Levels,
}

impl NoopCompactManager {
    /// Create a no-op manager over restored levels.
    pub fn new(levels: Levels) -> Self {
        Self { levels }
    }
}

impl CompactManager for NoopCompactManager {
    fn should_wait_compaction(&self) -> bool {
        false
    }

    fn add_new_file(&mut self, file: DataFileMeta) {
        self.levels.add_level0_file(file);
    }

    fn trigger_compaction(&mut self, _full: bool) -> Result<()> {
        Ok(())
    }

    fn get_compaction_result(&mut self, _blocking: bool) -> Result<Option<CompactResult>> {
        Ok(None)
    }

    fn is_compacting(&self) -> bool {
        false
    }

    fn levels(&self) -> &Levels {
        &self.levels
    }

    fn cancel(&mut self) {}

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::compact::strategy::UniversalCompaction;
    use crate::compact::task::RewriteResult;
    use crate::mergetree::sorted_run::SortedRun;
    use bytes::Bytes;

    fn cmp() -> KeyComparator {
        Arc::new(BytewiseComparator::new())
    }

    fn meta(name: &str, min: &str, max: &str, max_seq: u64, level: usize, size: u64) -> DataFileMeta {
        DataFileMeta::new(
            name,
            size,
            1,
            Bytes::copy_from_slice(min.as_bytes()),
            Bytes::copy_from_slice(max.as_bytes()),
            0,
            max_seq,
            level,
        )
    }

    /// Rewriter that fabricates one output meta per rewrite, no I/O.
    struct FakeRewriter {
        counter: std::sync::atomic::AtomicU64,
    }

    impl FakeRewriter {
        fn new() -> Self {
            Self {
                counter: std::sync::atomic::AtomicU64::new(0),
            }
        }
    }

    impl CompactRewriter for FakeRewriter {
        fn rewrite(
            &self,
            output_level: usize,
            _drop_delete: bool,
            sections: Vec<Vec<SortedRun>>,
            _emit_changelog: bool,
        ) -> crate::Result<RewriteResult> {
            let files: Vec<&DataFileMeta> = sections
                .iter()
                .flat_map(|s| s.iter().flat_map(|r| r.files()))
                .collect();
            let min = files
                .iter()
                .map(|f| f.min_key().clone())
                .min()
                .expect("non-empty rewrite");
            let max = files
                .iter()
                .map(|f| f.max_key().clone())
                .max()
                .expect("non-empty rewrite");
            let max_seq = files.iter().map(|f| f.max_sequence()).max().unwrap_or(0);
            let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(RewriteResult {
                files: vec![DataFileMeta::new(
                    format!("merged-{}", n),
                    files.iter().map(|f| f.file_size()).sum(),
                    files.iter().map(|f| f.row_count()).sum(),
                    min,
                    max,
                    0,
                    max_seq,
                    output_level,
                )],
                changelog: Vec::new(),
            })
        }

        fn delete_file(&self, _file_name: &str) {}
    }

    fn manager(files: Vec<DataFileMeta>, stop_trigger: usize) -> MergeTreeCompactManager {
        let levels = Levels::new(cmp(), files, 6).unwrap();
        MergeTreeCompactManager::new(
            CompactExecutor::new(1),
            levels,
            Box::new(UniversalCompaction::new(200, 1, 2, usize::MAX)),
            cmp(),
            1 << 20,
            stop_trigger,
            Arc::new(FakeRewriter::new()),
            false,
        )
    }

    #[test]
    fn test_trigger_and_apply() {
        let files = vec![
            meta("a", "a", "m", 1, 0, 100),
            meta("b", "c", "z", 2, 0, 100),
        ];
        let mut mgr = manager(files, 100);

        mgr.trigger_compaction(false).unwrap();
        assert!(mgr.is_compacting());

        let result = mgr.get_compaction_result(true).unwrap().unwrap();
        assert_eq!(result.before.len(), 2);
        assert_eq!(result.after.len(), 1);
        assert!(!mgr.is_compacting());
        assert_eq!(mgr.levels().number_of_level0_runs(), 0);
        assert_eq!(mgr.levels().number_of_sorted_runs(), 1);
    }

    #[test]
    fn test_no_double_trigger() {
        let files = vec![
            meta("a", "a", "m", 1, 0, 100),
            meta("b", "c", "z", 2, 0, 100),
        ];
        let mut mgr = manager(files, 100);

        mgr.trigger_compaction(false).unwrap();
        // Second trigger is a no-op while one is in flight.
        mgr.trigger_compaction(false).unwrap();
        mgr.get_compaction_result(true).unwrap().unwrap();
        assert!(mgr.get_compaction_result(true).unwrap().is_none());
    }

    #[test]
    fn test_should_wait_tracks_level0() {
        let files = vec![
            meta("a", "a", "b", 1, 0, 100),
            meta("b", "c", "d", 2, 0, 100),
        ];
        let mgr = manager(files, 2);
        assert!(mgr.should_wait_compaction());

        let mgr = manager(vec![meta("a", "a", "b", 1, 0, 100)], 2);
        assert!(!mgr.should_wait_compaction());
    }

    #[test]
    fn test_full_compaction_targets_top_level() {
        let files = vec![
            meta("a", "a", "m", 1, 0, 100),
            meta("c", "a", "z", 0, 3, 100),
        ];
        let mut mgr = manager(files, 100);

        mgr.trigger_compaction(true).unwrap();
        let result = mgr.get_compaction_result(true).unwrap().unwrap();
        assert_eq!(result.after[0].level(), 5);
    }

    #[test]
    fn test_full_compaction_fixed_point_is_quiet() {
        let files = vec![meta("top", "a", "z", 1, 5, 100)];
        let mut mgr = manager(files, 100);

        mgr.trigger_compaction(true).unwrap();
        assert!(!mgr.is_compacting());
    }

    #[test]
    fn test_noop_manager_accepts_files_never_compacts() {
        let levels = Levels::new(cmp(), vec![], 6).unwrap();
        let mut mgr = NoopCompactManager::new(levels);

        for i in 0..10 {
            mgr.add_new_file(meta(&format!("f{}", i), "a", "z", i as u64, 0, 100));
        }
        mgr.trigger_compaction(false).unwrap();
        assert!(!mgr.is_compacting());
        assert!(!mgr.should_wait_compaction());
        assert_eq!(mgr.levels().number_of_level0_runs(), 10);
        assert!(mgr.get_compaction_result(true).unwrap().is_none());
    }

    #[test]
    fn test_empty_levels_no_trigger() {
        let mut mgr = manager(vec![], 100);
        mgr.trigger_compaction(false).unwrap();
        assert!(!mgr.is_compacting());
        mgr.trigger_compaction(true).unwrap();
        assert!(!mgr.is_compacting());
    }
}
