//! Immutable data files: metadata, record codec, readers and writers.

pub mod format;
pub mod meta;
pub mod path;
pub mod reader;
pub mod writer;

pub use meta::{max_sequence_number, DataFileMeta};
pub use path::DataFilePathFactory;
pub use reader::{DataFileReader, KeyValueFileReaderFactory};
pub use writer::{KeyValueFileWriter, KeyValueFileWriterFactory, RollingFileWriter};
