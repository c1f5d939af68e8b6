//! # tablestore
//!
//! The write path of a partitioned, bucketed LSM-style table storage engine.
//!
//! For a given (partition, bucket) pair the engine accepts a stream of
//! key-value records, buffers them in memory, flushes sorted runs to
//! immutable data files, and asynchronously compacts those runs into a
//! multi-level structure.
//!
//! ## Features
//!
//! - **Merge-tree writer**: in-memory sort buffer with optional disk spill,
//!   rolling data-file output, level-0 appends
//! - **Universal compaction**: size-amplification, size-ratio and run-count
//!   triggers over sorted runs
//! - **Pluggable merge functions**: deduplicate (last value wins), value
//!   count, or user-supplied reducers
//! - **Background compaction**: shared executor, at most one task in flight
//!   per writer, atomic result application
//! - **Commit increments**: each `prepare_commit` yields the delta of new and
//!   compacted files for an external manifest committer
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tablestore::{CompactExecutor, CoreOptions, FileStoreWrite, ValueKind};
//!
//! let store = FileStoreWrite::new(root, snapshots, options)?;
//! let executor = CompactExecutor::new(4);
//!
//! let mut writer = store.create_writer("dt=2024-01-01", 0, executor)?;
//! writer.write(key, ValueKind::Add, value)?;
//! let increment = writer.prepare_commit(false)?;
//! writer.close()?;
//! ```

// Public modules
pub mod error;
pub mod options;
pub mod types;

// Core engine modules
pub mod comparator;
pub mod compact;
pub mod datafile;
pub mod mergetree;
pub mod metrics;
pub mod snapshot;
pub mod write;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{ChangelogProducer, CoreOptions, OptionsBuilder};
pub use types::{KeyValue, ValueKind};

pub use comparator::{BytewiseComparator, Comparator, KeyComparator};

// Write engine API
pub use write::{CommitIncrement, FileStoreWrite, RecordWriter};

// Merge tree (re-export useful types)
pub use mergetree::{
    DeduplicateMergeFunction, Levels, MergeFunction, MergeTreeReader, MergeTreeWriter, SortedRun,
    ValueCountMergeFunction,
};

// Compaction
pub use compact::{
    CompactExecutor, CompactResult, CompactStrategy, CompactTask, CompactUnit, UniversalCompaction,
};

// Snapshot service
pub use snapshot::{ManifestEntry, Snapshot, SnapshotManager};

// Metrics
pub use metrics::{Counter, Gauge, WriterMetrics, WriterMetricsSnapshot};

// Data files
pub use datafile::{DataFileMeta, DataFilePathFactory};
