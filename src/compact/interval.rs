//! Partitioning of compaction inputs into sections of overlapping runs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::comparator::KeyComparator;
use crate::datafile::DataFileMeta;
use crate::mergetree::sorted_run::SortedRun;

/// Splits a set of files into maximal *sections*: groups whose combined key
/// ranges overlap, while distinct sections are disjoint. Each section is then
/// packed into as few sorted runs as possible.
///
/// Disjoint sections let the merge stream one section at a time, and a
/// single-run section can skip merging entirely.
pub struct IntervalPartition {
    files: Vec<DataFileMeta>,
    comparator: KeyComparator,
}

impl IntervalPartition {
    /// Create a partitioner over the given files.
    pub fn new(mut files: Vec<DataFileMeta>, comparator: KeyComparator) -> Self {
        files.sort_by(|a, b| match comparator.compare(a.min_key(), b.min_key()) {
            Ordering::Equal => comparator.compare(a.max_key(), b.max_key()),
            ord => ord,
        });
        Self { files, comparator }
    }

    /// Produce the sections, each as a list of sorted runs.
    pub fn partition(&self) -> Vec<Vec<SortedRun>> {
        let mut sections = Vec::new();
        let mut current: Vec<DataFileMeta> = Vec::new();
        let mut bound: Option<Bytes> = None;

        for file in &self.files {
            let starts_new = match &bound {
                None => false,
                Some(bound) => self.comparator.compare(file.min_key(), bound) == Ordering::Greater,
            };
            if starts_new && !current.is_empty() {
                sections.push(self.pack_runs(std::mem::take(&mut current)));
                bound = None;
            }

            bound = Some(match bound {
                None => file.max_key().clone(),
                Some(bound) => {
                    if self.comparator.compare(file.max_key(), &bound) == Ordering::Greater {
                        file.max_key().clone()
                    } else {
                        bound
                    }
                }
            });
            current.push(file.clone());
        }

        if !current.is_empty() {
            sections.push(self.pack_runs(current));
        }
        sections
    }

    /// Greedily pack one section's files into non-overlapping runs.
    ///
    /// Files arrive sorted by min key; a heap ordered by run end key always
    /// offers the run most likely to accept the next file.
    fn pack_runs(&self, files: Vec<DataFileMeta>) -> Vec<SortedRun> {
        let mut heap: BinaryHeap<RunEnd> = BinaryHeap::new();
        let mut runs: Vec<Vec<DataFileMeta>> = Vec::new();

        for file in files {
            let fits = heap
                .peek()
                .map(|end| self.comparator.compare(&end.max_key, file.min_key()) == Ordering::Less)
                .unwrap_or(false);

            if fits {
                let end = heap.pop().expect("peeked entry");
                runs[end.index].push(file.clone());
                heap.push(RunEnd {
                    max_key: file.max_key().clone(),
                    index: end.index,
                    comparator: self.comparator.clone(),
                });
            } else {
                let index = runs.len();
                runs.push(vec![file.clone()]);
                heap.push(RunEnd {
                    max_key: file.max_key().clone(),
                    index,
                    comparator: self.comparator.clone(),
                });
            }
        }

        runs.into_iter().map(SortedRun::from_sorted).collect()
    }
}

/// Heap entry: the current end key of one packed run.
struct RunEnd {
    max_key: Bytes,
    index: usize,
    comparator: KeyComparator,
}

impl PartialEq for RunEnd {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunEnd {}

impl PartialOrd for RunEnd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunEnd {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the run with the smallest end key pops first.
        self.comparator.compare(&other.max_key, &self.max_key)
    }
}
