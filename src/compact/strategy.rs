//! Compaction strategies: which sorted runs to merge, and where to.

use tracing::debug;

use crate::mergetree::levels::LevelSortedRun;

use super::CompactUnit;

/// Decides which runs to compact, given the current run list.
///
/// `runs` is ordered newest first: level-0 runs in recency order, then each
/// populated level ascending.
pub trait CompactStrategy: Send {
    /// Pick a unit to compact, or `None` when nothing needs to happen.
    fn pick(&self, num_levels: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit>;
}

/// Universal compaction: bounds space amplification and run count.
///
/// Rules are evaluated in order; the size-amplification trigger wins when
/// several fire.
pub struct UniversalCompaction {
    max_size_amplification_percent: u64,
    size_ratio: u64,
    num_run_compaction_trigger: usize,
    max_sorted_run_num: usize,
}

impl UniversalCompaction {
    /// Create a strategy from the universal-compaction knobs.
    pub fn new(
        max_size_amplification_percent: u64,
        size_ratio: u64,
        num_run_compaction_trigger: usize,
        max_sorted_run_num: usize,
    ) -> Self {
        Self {
            max_size_amplification_percent,
            size_ratio,
            num_run_compaction_trigger,
            max_sorted_run_num,
        }
    }

    /// Rule 1: total size of younger runs versus the oldest run.
    fn pick_for_size_amp(&self, max_level: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit> {
        if runs.len() < 2 {
            return None;
        }

        let candidate_size: u64 = runs[..runs.len() - 1]
            .iter()
            .map(|r| r.run().total_size())
            .sum();
        let earliest_size = runs[runs.len() - 1].run().total_size();
        if earliest_size == 0 {
            return None;
        }

        if candidate_size as u128 * 100
            >= self.max_size_amplification_percent as u128 * earliest_size as u128
        {
            debug!(
                candidate_size,
                earliest_size, "size amplification trigger fired, full compaction"
            );
            return Some(CompactUnit::from_level_runs(max_level, runs, true));
        }
        None
    }

    /// Rule 2: extend a newest-first prefix while the next run stays within
    /// the size ratio of the prefix sum.
    fn pick_for_size_ratio(&self, max_level: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit> {
        let mut candidate_count = 1;
        let mut candidate_size = runs.first()?.run().total_size();

        for next in &runs[1..] {
            if candidate_size as u128 * (100 + self.size_ratio as u128)
                < next.run().total_size() as u128 * 100
            {
                break;
            }
            candidate_size += next.run().total_size();
            candidate_count += 1;
        }

        if candidate_count >= self.num_run_compaction_trigger {
            return Some(Self::create_unit(runs, max_level, candidate_count));
        }
        None
    }

    /// Rule 3: hard cap on the total run count.
    fn pick_for_run_count(&self, max_level: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit> {
        if runs.len() >= self.max_sorted_run_num {
            let candidate_count = runs.len() - self.max_sorted_run_num + 1;
            return Some(Self::create_unit(runs, max_level, candidate_count));
        }
        None
    }

    /// Choose the output level for the first `run_count` runs and build the
    /// unit.
    ///
    /// All runs merge to the top level. Otherwise the output sits just below
    /// the next remaining run; the candidate extends over further level-0
    /// runs so the output level is never 0 unless every run is included.
    fn create_unit(runs: &[LevelSortedRun], max_level: usize, run_count: usize) -> CompactUnit {
        let mut run_count = run_count;
        let mut output_level;
        if run_count == runs.len() {
            output_level = max_level;
        } else {
            output_level = runs[run_count].level().saturating_sub(1);
        }

        if output_level == 0 {
            for next in &runs[run_count..] {
                run_count += 1;
                if next.level() != 0 {
                    output_level = next.level();
                    break;
                }
            }
        }

        if run_count == runs.len() {
            output_level = max_level;
        }

        let drop_delete = output_level == max_level;
        CompactUnit::from_level_runs(output_level, &runs[..run_count], drop_delete)
    }
}

impl CompactStrategy for UniversalCompaction {
    fn pick(&self, num_levels: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit> {
        let max_level = num_levels - 1;
        if runs.is_empty() {
            return None;
        }

        self.pick_for_size_amp(max_level, runs)
            .or_else(|| self.pick_for_size_ratio(max_level, runs))
            .or_else(|| self.pick_for_run_count(max_level, runs))
    }
}
