//! Spillable sort buffer: an external sort over temporary runs.
//!
//! Records accumulate in an in-memory chunk; when the chunk reaches the
//! memory budget it is sorted and spilled as one temporary run. Draining
//! k-way merges all spill runs plus the final chunk, with the merge fan-in
//! capped by intermediate passes.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::comparator::KeyComparator;
use crate::datafile::format;
use crate::datafile::{DataFilePathFactory, DataFileReader};
use crate::types::{KeyValue, ValueKind};
use crate::Result;

use super::buffer::{drain_grouped, RecordSink, SortBuffer};
use super::merge::MergeFunction;

/// One record awaiting spill or drain; the ordinal keeps arrival order.
struct ChunkEntry {
    key: Bytes,
    ordinal: u64,
    kind: ValueKind,
    value: Bytes,
}

impl ChunkEntry {
    /// Spill runs carry the ordinal in the record's sequence field.
    fn to_key_value(&self) -> KeyValue {
        KeyValue::new(self.key.clone(), self.ordinal, self.kind, self.value.clone())
    }
}

/// External-sort buffer used when `write_buffer_spillable` is set.
///
/// `put` never reports full: chunks spill to disk and the buffer keeps
/// accepting until the writer drains it.
pub struct SpillSortBuffer {
    comparator: KeyComparator,
    path_factory: Arc<DataFilePathFactory>,
    chunk: Vec<ChunkEntry>,
    chunk_memory: usize,
    chunk_capacity: usize,
    max_fan_in: usize,
    spills: Vec<PathBuf>,
    next_ordinal: u64,
}

impl SpillSortBuffer {
    /// Create a buffer spilling through the given path factory.
    pub fn new(
        comparator: KeyComparator,
        path_factory: Arc<DataFilePathFactory>,
        chunk_capacity: usize,
        max_fan_in: usize,
    ) -> Self {
        Self {
            comparator,
            path_factory,
            chunk: Vec::new(),
            chunk_memory: 0,
            chunk_capacity,
            max_fan_in: max_fan_in.max(2),
            spills: Vec::new(),
            next_ordinal: 0,
        }
    }

    /// Number of spill runs currently on disk.
    pub fn spill_count(&self) -> usize {
        self.spills.len()
    }

    fn sort_chunk(&mut self) {
        let cmp = self.comparator.clone();
        self.chunk.sort_by(|a, b| match cmp.compare(&a.key, &b.key) {
            Ordering::Equal => a.ordinal.cmp(&b.ordinal),
            ord => ord,
        });
    }

    fn spill_chunk(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        self.sort_chunk();

        let path = self.path_factory.new_spill_path();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        format::write_header(&mut writer)?;
        for entry in &self.chunk {
            format::write_record(&mut writer, &entry.to_key_value())?;
        }
        std::io::Write::flush(&mut writer)?;

        self.spills.push(path);
        self.chunk.clear();
        self.chunk_memory = 0;
        Ok(())
    }

    /// Merge up to `max_fan_in` spill runs into one until the remaining run
    /// count (plus the in-memory chunk) fits under the fan-in cap.
    fn reduce_fan_in(&mut self) -> Result<()> {
        while self.spills.len() + 1 > self.max_fan_in {
            let batch: Vec<PathBuf> = self
                .spills
                .drain(..self.max_fan_in.min(self.spills.len()))
                .collect();

            let path = self.path_factory.new_spill_path();
            let file = File::create(&path)?;
            let mut writer = BufWriter::new(file);
            format::write_header(&mut writer)?;

            let mut merge = SpillMerge::open(&batch, self.comparator.clone())?;
            while let Some(kv) = merge.read_next()? {
                format::write_record(&mut writer, &kv)?;
            }
            std::io::Write::flush(&mut writer)?;
            drop(merge);

            for old in batch {
                let _ = std::fs::remove_file(old);
            }
            self.spills.push(path);
        }
        Ok(())
    }
}

impl SortBuffer for SpillSortBuffer {
    fn put(&mut self, key: Bytes, kind: ValueKind, value: Bytes) -> Result<bool> {
        let record_size = key.len() + value.len() + 48;
        self.chunk.push(ChunkEntry {
            key,
            ordinal: self.next_ordinal,
            kind,
            value,
        });
        self.next_ordinal += 1;
        self.chunk_memory += record_size;

        if self.chunk_memory >= self.chunk_capacity {
            self.spill_chunk()?;
        }
        Ok(true)
    }

    fn is_empty(&self) -> bool {
        self.chunk.is_empty() && self.spills.is_empty()
    }

    fn memory_usage(&self) -> usize {
        self.chunk_memory
    }

    fn drain(
        &mut self,
        next_sequence: &mut u64,
        merge_function: &mut dyn MergeFunction,
        raw: Option<RecordSink<'_>>,
        merged: RecordSink<'_>,
    ) -> Result<()> {
        self.reduce_fan_in()?;
        self.sort_chunk();

        let chunk: Vec<KeyValue> = self.chunk.iter().map(ChunkEntry::to_key_value).collect();
        let mut merge = SpillMerge::open(&self.spills, self.comparator.clone())?;
        merge.push_memory_source(chunk);

        let mut records = std::iter::from_fn(|| merge.read_next().transpose());
        drain_grouped(
            &mut records,
            &self.comparator,
            next_sequence,
            merge_function,
            raw,
            merged,
        )
    }

    fn clear(&mut self) {
        self.chunk.clear();
        self.chunk_memory = 0;
        for path in self.spills.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for SpillSortBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Head of one source inside the spill merge.
struct SpillHeapEntry {
    key: Bytes,
    ordinal: u64,
    index: usize,
    comparator: KeyComparator,
}

impl PartialEq for SpillHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SpillHeapEntry {}

impl PartialOrd for SpillHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpillHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for the max-heap: (key asc, ordinal asc) pops first.
        match self.comparator.compare(&other.key, &self.key) {
            Ordering::Equal => other.ordinal.cmp(&self.ordinal),
            ord => ord,
        }
    }
}

enum SpillSource {
    File(DataFileReader),
    Memory(std::vec::IntoIter<KeyValue>),
}

impl SpillSource {
    fn next_record(&mut self) -> Result<Option<KeyValue>> {
        match self {
            SpillSource::File(reader) => reader.read_next(),
            SpillSource::Memory(iter) => Ok(iter.next()),
        }
    }
}

/// K-way merge over spill runs ordered by (key, ordinal).
struct SpillMerge {
    sources: Vec<SpillSource>,
    heap: BinaryHeap<SpillHeapEntry>,
    pending: Vec<Option<KeyValue>>,
    comparator: KeyComparator,
}

impl SpillMerge {
    fn open(paths: &[PathBuf], comparator: KeyComparator) -> Result<Self> {
        let mut merge = Self {
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            pending: Vec::new(),
            comparator,
        };
        for path in paths {
            let source = SpillSource::File(DataFileReader::open(path.clone())?);
            merge.add_source(source)?;
        }
        Ok(merge)
    }

    fn push_memory_source(&mut self, records: Vec<KeyValue>) {
        // Sorted-chunk source can't fail to open.
        self.add_source(SpillSource::Memory(records.into_iter()))
            .expect("memory source");
    }

    fn add_source(&mut self, mut source: SpillSource) -> Result<()> {
        let index = self.sources.len();
        if let Some(kv) = source.next_record()? {
            self.heap.push(SpillHeapEntry {
                key: kv.key().clone(),
                ordinal: kv.sequence(),
                index,
                comparator: self.comparator.clone(),
            });
            self.pending.push(Some(kv));
        } else {
            self.pending.push(None);
        }
        self.sources.push(source);
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<KeyValue>> {
        let entry = match self.heap.pop() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let record = self.pending[entry.index]
            .take()
            .expect("heap entry implies pending record");

        if let Some(next) = self.sources[entry.index].next_record()? {
            self.heap.push(SpillHeapEntry {
                key: next.key().clone(),
                ordinal: next.sequence(),
                index: entry.index,
                comparator: self.comparator.clone(),
            });
            self.pending[entry.index] = Some(next);
        }
        Ok(Some(record))
    }
}
