//! Merging readers over sorted runs.
//!
//! A [`RunReader`] streams one sorted run file by file. A [`SortMergeReader`]
//! k-way merges several runs with a heap and applies the merge function once
//! per distinct key. A [`MergeTreeReader`] strings disjoint sections of
//! overlapping runs together into one ordered, forward-only record stream.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use bytes::Bytes;

use crate::comparator::KeyComparator;
use crate::datafile::{DataFileReader, KeyValueFileReaderFactory};
use crate::types::KeyValue;
use crate::Result;

use super::merge::MergeFunction;
use super::sorted_run::SortedRun;

/// A primed, forward-only source of key-ordered records.
pub trait KeyValueSource {
    /// The record the source is positioned at, or `None` when exhausted.
    fn current(&self) -> Option<&KeyValue>;

    /// Move to the next record.
    fn advance(&mut self) -> Result<()>;
}

/// Streams the files of one sorted run in order.
///
/// Files are opened lazily, one at a time, so a run holds at most one file
/// handle open.
pub struct RunReader {
    factory: KeyValueFileReaderFactory,
    pending: VecDeque<String>,
    reader: Option<DataFileReader>,
    current: Option<KeyValue>,
}

impl RunReader {
    /// Open a reader over the run, positioned at its first record.
    pub fn new(factory: KeyValueFileReaderFactory, run: &SortedRun) -> Result<Self> {
        let pending = run
            .files()
            .iter()
            .map(|f| f.file_name().to_string())
            .collect();
        let mut reader = Self {
            factory,
            pending,
            reader: None,
            current: None,
        };
        reader.advance()?;
        Ok(reader)
    }
}

impl KeyValueSource for RunReader {
    fn current(&self) -> Option<&KeyValue> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            if self.reader.is_none() {
                match self.pending.pop_front() {
                    Some(name) => self.reader = Some(self.factory.open(&name)?),
                    None => {
                        self.current = None;
                        return Ok(());
                    }
                }
            }

            let reader = self.reader.as_mut().expect("reader just installed");
            match reader.read_next()? {
                Some(kv) => {
                    self.current = Some(kv);
                    return Ok(());
                }
                None => {
                    // End of this file; release the handle and move on.
                    self.reader = None;
                }
            }
        }
    }
}

/// An in-memory source, used by tests and the spill merge.
pub struct VecSource {
    entries: Vec<KeyValue>,
    position: usize,
}

impl VecSource {
    /// Create a source over pre-sorted records.
    pub fn new(entries: Vec<KeyValue>) -> Self {
        Self {
            entries,
            position: 0,
        }
    }
}

impl KeyValueSource for VecSource {
    fn current(&self) -> Option<&KeyValue> {
        self.entries.get(self.position)
    }

    fn advance(&mut self) -> Result<()> {
        if self.position < self.entries.len() {
            self.position += 1;
        }
        Ok(())
    }
}

/// Heap entry tracking the head of one source.
struct HeapEntry {
    key: Bytes,
    sequence: u64,
    index: usize,
    comparator: KeyComparator,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops first.
        // For equal keys the lowest sequence pops first, so the merge
        // function sees each group in ascending sequence order.
        match self.comparator.compare(&other.key, &self.key) {
            Ordering::Equal => match other.sequence.cmp(&self.sequence) {
                Ordering::Equal => other.index.cmp(&self.index),
                ord => ord,
            },
            ord => ord,
        }
    }
}

/// K-way merge over overlapping runs of one section.
///
/// Yields zero or one record per distinct key: the heap orders heads by
/// (key, sequence), equal-key records are fed to the merge function in
/// ascending sequence order, and the function's result is the output.
pub struct SortMergeReader<S: KeyValueSource> {
    sources: Vec<S>,
    heap: BinaryHeap<HeapEntry>,
    comparator: KeyComparator,
    merge_function: Box<dyn MergeFunction>,
}

impl<S: KeyValueSource> SortMergeReader<S> {
    /// Create a merge reader over primed sources.
    pub fn new(
        sources: Vec<S>,
        comparator: KeyComparator,
        merge_function: Box<dyn MergeFunction>,
    ) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            if let Some(kv) = source.current() {
                heap.push(HeapEntry {
                    key: kv.key().clone(),
                    sequence: kv.sequence(),
                    index,
                    comparator: comparator.clone(),
                });
            }
        }
        Self {
            sources,
            heap,
            comparator,
            merge_function,
        }
    }

    /// Produce the next merged record, skipping keys the merge function drops.
    pub fn read_next(&mut self) -> Result<Option<KeyValue>> {
        loop {
            let group_key = match self.heap.peek() {
                Some(entry) => entry.key.clone(),
                None => return Ok(None),
            };

            self.merge_function.reset();
            while let Some(entry) = self.heap.peek() {
                if self.comparator.compare(&entry.key, &group_key) != Ordering::Equal {
                    break;
                }
                let index = self.heap.pop().expect("peeked entry").index;
                let source = &mut self.sources[index];
                let kv = source.current().expect("heap entry implies record").clone();
                self.merge_function.add(kv);

                source.advance()?;
                if let Some(next) = source.current() {
                    self.heap.push(HeapEntry {
                        key: next.key().clone(),
                        sequence: next.sequence(),
                        index,
                        comparator: self.comparator.clone(),
                    });
                }
            }

            if let Some(result) = self.merge_function.result() {
                return Ok(Some(result));
            }
            // Group annihilated; move on to the next key.
        }
    }
}

/// Changelog side sink observing every merged record.
pub type ChangelogSink = Box<dyn FnMut(&KeyValue) -> Result<()> + Send>;

/// Lazy, ordered, forward-only reader over sections of overlapping runs.
///
/// Each section's combined key range is disjoint from the others, so sections
/// are consumed strictly in order; file handles of a section are released
/// when it is exhausted, and on drop otherwise.
pub struct MergeTreeReader {
    sections: VecDeque<Vec<SortedRun>>,
    current: Option<SortMergeReader<RunReader>>,
    drop_delete: bool,
    reader_factory: KeyValueFileReaderFactory,
    comparator: KeyComparator,
    merge_function: Box<dyn MergeFunction>,
    changelog: Option<ChangelogSink>,
}

impl MergeTreeReader {
    /// Create a reader over disjoint sections.
    ///
    /// With `drop_delete`, merged DELETE records are skipped; set it only
    /// when writing into the top-most level.
    pub fn new(
        sections: Vec<Vec<SortedRun>>,
        drop_delete: bool,
        reader_factory: KeyValueFileReaderFactory,
        comparator: KeyComparator,
        merge_function: Box<dyn MergeFunction>,
    ) -> Self {
        Self {
            sections: sections.into(),
            current: None,
            drop_delete,
            reader_factory,
            comparator,
            merge_function,
            changelog: None,
        }
    }

    /// Attach a changelog sink that observes every merged record before the
    /// delete filter.
    pub fn with_changelog(mut self, sink: ChangelogSink) -> Self {
        self.changelog = Some(sink);
        self
    }

    /// Produce the next merged record.
    pub fn read_next(&mut self) -> Result<Option<KeyValue>> {
        loop {
            if self.current.is_none() {
                match self.sections.pop_front() {
                    Some(section) => {
                        let mut sources = Vec::with_capacity(section.len());
                        for run in &section {
                            sources.push(RunReader::new(self.reader_factory.clone(), run)?);
                        }
                        self.current = Some(SortMergeReader::new(
                            sources,
                            self.comparator.clone(),
                            self.merge_function.clone(),
                        ));
                    }
                    None => return Ok(None),
                }
            }

            let reader = self.current.as_mut().expect("section reader installed");
            match reader.read_next()? {
                Some(kv) => {
                    if let Some(sink) = self.changelog.as_mut() {
                        sink(&kv)?;
                    }
                    if self.drop_delete && kv.is_delete() {
                        continue;
                    }
                    return Ok(Some(kv));
                }
                None => {
                    // Section exhausted; drop its file handles.
                    self.current = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::mergetree::merge::DeduplicateMergeFunction;
    use std::sync::Arc;

    fn cmp() -> KeyComparator {
        Arc::new(BytewiseComparator::new())
    }

    fn add(key: &str, seq: u64, value: &str) -> KeyValue {
        KeyValue::add(
            Bytes::copy_from_slice(key.as_bytes()),
            seq,
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    fn collect<S: KeyValueSource>(mut reader: SortMergeReader<S>) -> Vec<KeyValue> {
        let mut out = Vec::new();
        while let Some(kv) = reader.read_next().unwrap() {
            out.push(kv);
        }
        out
    }

    #[test]
    fn test_single_source_passthrough() {
        let source = VecSource::new(vec![add("a", 1, "1"), add("b", 2, "2"), add("c", 3, "3")]);
        let reader = SortMergeReader::new(
            vec![source],
            cmp(),
            Box::new(DeduplicateMergeFunction::new()),
        );

        let out = collect(reader);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].key().as_ref(), b"a");
        assert_eq!(out[2].key().as_ref(), b"c");
    }

    #[test]
    fn test_interleaved_sources() {
        let s1 = VecSource::new(vec![add("a", 1, "1"), add("c", 2, "2")]);
        let s2 = VecSource::new(vec![add("b", 3, "3"), add("d", 4, "4")]);
        let reader = SortMergeReader::new(
            vec![s1, s2],
            cmp(),
            Box::new(DeduplicateMergeFunction::new()),
        );

        let keys: Vec<_> = collect(reader)
            .into_iter()
            .map(|kv| kv.key().clone())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_duplicate_keys_resolved_by_sequence() {
        let s1 = VecSource::new(vec![add("k", 5, "new")]);
        let s2 = VecSource::new(vec![add("k", 2, "old")]);
        let reader = SortMergeReader::new(
            vec![s1, s2],
            cmp(),
            Box::new(DeduplicateMergeFunction::new()),
        );

        let out = collect(reader);
        assert_eq!(out.len(), 1);
        // Merge function sees ascending sequences; last value wins.
        assert_eq!(out[0].value().as_ref(), b"new");
        assert_eq!(out[0].sequence(), 5);
    }

    #[test]
    fn test_empty_sources() {
        let reader: SortMergeReader<VecSource> = SortMergeReader::new(
            vec![VecSource::new(vec![]), VecSource::new(vec![])],
            cmp(),
            Box::new(DeduplicateMergeFunction::new()),
        );
        assert!(collect(reader).is_empty());
    }

    #[test]
    fn test_annihilated_group_is_skipped() {
        use crate::mergetree::merge::ValueCountMergeFunction;
        use crate::types::ValueKind;

        fn count(key: &str, seq: u64, kind: ValueKind, n: i64) -> KeyValue {
            KeyValue::new(
                Bytes::copy_from_slice(key.as_bytes()),
                seq,
                kind,
                Bytes::copy_from_slice(&n.to_be_bytes()),
            )
        }

        let s1 = VecSource::new(vec![
            count("a", 1, ValueKind::Add, 2),
            count("b", 3, ValueKind::Add, 1),
        ]);
        let s2 = VecSource::new(vec![count("a", 2, ValueKind::Delete, 2)]);
        let reader = SortMergeReader::new(
            vec![s1, s2],
            cmp(),
            Box::new(ValueCountMergeFunction::new()),
        );

        let out = collect(reader);
        // Key "a" sums to zero and disappears; "b" survives.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key().as_ref(), b"b");
    }

    mod file_backed {
        use super::*;
        use crate::datafile::{DataFilePathFactory, KeyValueFileWriterFactory};
        use tempfile::tempdir;

        fn write_run(writers: &KeyValueFileWriterFactory, records: &[KeyValue]) -> SortedRun {
            let mut writer = writers.create_rolling_writer(0);
            for kv in records {
                writer.write(kv).unwrap();
            }
            SortedRun::from_sorted(writer.close().unwrap())
        }

        #[test]
        fn test_merge_tree_reader_sections_and_drop_delete() {
            let dir = tempdir().unwrap();
            let paths = Arc::new(DataFilePathFactory::new(dir.path()).unwrap());
            let writers = KeyValueFileWriterFactory::new(paths.clone(), 1 << 20);
            let readers = KeyValueFileReaderFactory::new(paths);

            // Section 1: two overlapping runs over a..c, with a delete for b.
            let run_a = write_run(&writers, &[add("a", 1, "1"), add("b", 2, "2")]);
            let run_b = write_run(
                &writers,
                &[KeyValue::delete(Bytes::from("b"), 5), add("c", 6, "6")],
            );
            // Section 2: a single run beyond the first section's range.
            let run_c = write_run(&writers, &[add("x", 3, "3"), add("y", 4, "4")]);

            let mut reader = MergeTreeReader::new(
                vec![vec![run_a, run_b], vec![run_c]],
                true,
                readers,
                cmp(),
                Box::new(DeduplicateMergeFunction::new()),
            );

            let mut out = Vec::new();
            while let Some(kv) = reader.read_next().unwrap() {
                out.push(kv);
            }
            let keys: Vec<_> = out.iter().map(|kv| kv.key().clone()).collect();
            // "b" merged to a delete and was dropped.
            assert_eq!(keys, vec!["a", "c", "x", "y"]);
        }

        #[test]
        fn test_changelog_sink_sees_deletes() {
            let dir = tempdir().unwrap();
            let paths = Arc::new(DataFilePathFactory::new(dir.path()).unwrap());
            let writers = KeyValueFileWriterFactory::new(paths.clone(), 1 << 20);
            let readers = KeyValueFileReaderFactory::new(paths);

            let run = write_run(
                &writers,
                &[add("a", 1, "1"), KeyValue::delete(Bytes::from("b"), 2)],
            );

            let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let sink_seen = seen.clone();
            let mut reader = MergeTreeReader::new(
                vec![vec![run]],
                true,
                readers,
                cmp(),
                Box::new(DeduplicateMergeFunction::new()),
            )
            .with_changelog(Box::new(move |kv| {
                sink_seen.lock().push(kv.key().clone());
                Ok(())
            }));

            let mut out = Vec::new();
            while let Some(kv) = reader.read_next().unwrap() {
                out.push(kv);
            }
            // Output drops the delete, but the changelog observed it.
            assert_eq!(out.len(), 1);
            assert_eq!(seen.lock().len(), 2);
        }
    }
}
