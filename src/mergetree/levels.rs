//! The level structure of a bucket: level 0 runs plus one run per level above.

use std::collections::HashSet;

use crate::comparator::KeyComparator;
use crate::datafile::DataFileMeta;
use crate::{Error, Result};

use super::sorted_run::SortedRun;

/// A sorted run tagged with the level it resides at.
#[derive(Debug, Clone)]
pub struct LevelSortedRun {
    level: usize,
    run: SortedRun,
}

impl LevelSortedRun {
    /// Create a tagged run.
    pub fn new(level: usize, run: SortedRun) -> Self {
        Self { level, run }
    }

    /// The level this run resides at.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The run itself.
    pub fn run(&self) -> &SortedRun {
        &self.run
    }
}

/// The multi-level structure holding a bucket's data files.
///
/// Level 0 holds a list of single-file runs, newest first; each level above
/// holds at most one sorted run. Invariants — one run per level ≥ 1, no key
/// overlap inside a run, every file in exactly one place — are checked on
/// every mutation.
pub struct Levels {
    comparator: KeyComparator,
    /// Level-0 files, newest (highest max sequence) first.
    level0: Vec<DataFileMeta>,
    /// Runs for levels `1..num_levels`; index `i` holds level `i + 1`.
    runs: Vec<SortedRun>,
}

impl Levels {
    /// Assemble the structure from restored file metas.
    ///
    /// Files are slotted by their stored level.
    pub fn new(comparator: KeyComparator, files: Vec<DataFileMeta>, num_levels: usize) -> Result<Self> {
        if num_levels < 2 {
            return Err(Error::internal("levels require at least two slots"));
        }

        let mut level0 = Vec::new();
        let mut upper: Vec<Vec<DataFileMeta>> = vec![Vec::new(); num_levels - 1];
        for file in files {
            if file.level() == 0 {
                level0.push(file);
            } else if file.level() < num_levels {
                upper[file.level() - 1].push(file);
            } else {
                return Err(Error::internal(format!(
                    "file {} at level {} exceeds num_levels {}",
                    file.file_name(),
                    file.level(),
                    num_levels
                )));
            }
        }

        level0.sort_by(|a, b| b.max_sequence().cmp(&a.max_sequence()));
        let runs = upper
            .into_iter()
            .map(|files| SortedRun::from_unsorted(files, &comparator))
            .collect();

        let levels = Self {
            comparator,
            level0,
            runs,
        };
        levels.validate()?;
        Ok(levels)
    }

    /// Number of level slots.
    pub fn number_of_levels(&self) -> usize {
        self.runs.len() + 1
    }

    /// Index of the top-most level.
    pub fn max_level(&self) -> usize {
        self.runs.len()
    }

    /// Number of level-0 runs (one per level-0 file).
    pub fn number_of_level0_runs(&self) -> usize {
        self.level0.len()
    }

    /// Total number of sorted runs across all levels.
    pub fn number_of_sorted_runs(&self) -> usize {
        self.level0.len() + self.runs.iter().filter(|r| !r.is_empty()).count()
    }

    /// Insert a file at the level stored in its meta.
    pub fn add(&mut self, file: DataFileMeta) -> Result<()> {
        if file.level() == 0 {
            self.add_level0_file(file);
            return Ok(());
        }

        let level = file.level();
        if level >= self.number_of_levels() {
            return Err(Error::internal(format!(
                "level {} out of range",
                level
            )));
        }
        let run = &mut self.runs[level - 1];
        let mut files = std::mem::take(run).into_files();
        files.push(file);
        *run = SortedRun::from_unsorted(files, &self.comparator);
        self.validate()
    }

    /// Append a freshly flushed file as the newest level-0 run.
    pub fn add_level0_file(&mut self, file: DataFileMeta) {
        debug_assert_eq!(file.level(), 0);
        self.level0.insert(0, file);
    }

    /// Atomically remove `before` from whichever levels hold them and insert
    /// `after` at `output_level`.
    ///
    /// Every file in `before` must currently be present.
    pub fn update(
        &mut self,
        before: &[DataFileMeta],
        after: &[DataFileMeta],
        output_level: usize,
    ) -> Result<()> {
        if output_level >= self.number_of_levels() {
            return Err(Error::internal(format!(
                "output level {} out of range",
                output_level
            )));
        }

        let mut remove: HashSet<&str> = before.iter().map(DataFileMeta::file_name).collect();
        self.level0.retain(|f| !remove.remove(f.file_name()));
        for run in &mut self.runs {
            let files = std::mem::take(run).into_files();
            let kept = files
                .into_iter()
                .filter(|f| !remove.remove(f.file_name()))
                .collect();
            *run = SortedRun::from_sorted(kept);
        }
        if !remove.is_empty() {
            return Err(Error::internal(format!(
                "compaction inputs no longer present: {:?}",
                remove
            )));
        }

        if output_level == 0 {
            for file in after {
                self.level0.insert(0, file.upgrade(0));
            }
            self.level0
                .sort_by(|a, b| b.max_sequence().cmp(&a.max_sequence()));
        } else {
            let run = &mut self.runs[output_level - 1];
            let mut files = std::mem::take(run).into_files();
            files.extend(after.iter().map(|f| f.upgrade(output_level)));
            *run = SortedRun::from_unsorted(files, &self.comparator);
        }

        self.validate()
    }

    /// Enumerate all runs, newest first: level-0 runs in recency order, then
    /// each populated level in ascending order.
    pub fn level_sorted_runs(&self) -> Vec<LevelSortedRun> {
        let mut runs = Vec::with_capacity(self.level0.len() + self.runs.len());
        for file in &self.level0 {
            runs.push(LevelSortedRun::new(0, SortedRun::from_single(file.clone())));
        }
        for (i, run) in self.runs.iter().enumerate() {
            if !run.is_empty() {
                runs.push(LevelSortedRun::new(i + 1, run.clone()));
            }
        }
        runs
    }

    /// Every file currently in the structure.
    pub fn all_files(&self) -> Vec<DataFileMeta> {
        let mut files = self.level0.clone();
        for run in &self.runs {
            files.extend(run.files().iter().cloned());
        }
        files
    }

    fn validate(&self) -> Result<()> {
        for run in &self.runs {
            run.validate(&self.comparator)?;
        }

        let mut seen = HashSet::new();
        for file in self
            .level0
            .iter()
            .chain(self.runs.iter().flat_map(|r| r.files()))
        {
            if !seen.insert(file.file_name()) {
                return Err(Error::internal(format!(
                    "file {} present in more than one place",
                    file.file_name()
                )));
            }
        }
        Ok(())
    }
}
