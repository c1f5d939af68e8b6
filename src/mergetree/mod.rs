//! Merge tree: levels of sorted runs, sort buffers, merging readers and the
//! per-bucket writer.

pub mod buffer;
pub mod levels;
pub mod merge;
pub mod reader;
pub mod sorted_run;
pub mod spill;
pub mod writer;

pub use buffer::{MemSortBuffer, SortBuffer};
pub use levels::{LevelSortedRun, Levels};
pub use merge::{DeduplicateMergeFunction, MergeFunction, ValueCountMergeFunction};
pub use reader::{KeyValueSource, MergeTreeReader, RunReader, SortMergeReader};
pub use sorted_run::SortedRun;
pub use spill::SpillSortBuffer;
pub use writer::MergeTreeWriter;
