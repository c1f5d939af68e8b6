//! Data file writers: single-file writer and size-capped rolling writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::types::KeyValue;
use crate::{Error, Result};

use super::format;
use super::meta::DataFileMeta;
use super::path::DataFilePathFactory;

/// Writer for one immutable data file.
///
/// Records must arrive in key order; the writer tracks the key range,
/// sequence range and row count for the resulting [`DataFileMeta`].
/// The file is fsynced before its meta is produced.
pub struct KeyValueFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    level: usize,
    bytes_written: u64,
    row_count: u64,
    min_key: Option<Bytes>,
    max_key: Option<Bytes>,
    min_sequence: u64,
    max_sequence: u64,
}

impl KeyValueFileWriter {
    /// Create a writer for a fresh file at `path`.
    pub fn create(path: PathBuf, level: usize) -> Result<Self> {
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        format::write_header(&mut writer)?;

        Ok(Self {
            path,
            writer,
            level,
            bytes_written: 8, // file header
            row_count: 0,
            min_key: None,
            max_key: None,
            min_sequence: u64::MAX,
            max_sequence: 0,
        })
    }

    /// Append one record.
    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        format::write_record(&mut self.writer, kv)?;
        self.bytes_written += format::encoded_len(kv);
        self.row_count += 1;

        if self.min_key.is_none() {
            self.min_key = Some(kv.key().clone());
        }
        self.max_key = Some(kv.key().clone());
        self.min_sequence = self.min_sequence.min(kv.sequence());
        self.max_sequence = self.max_sequence.max(kv.sequence());
        Ok(())
    }

    /// Bytes written so far, including the file header.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Records written so far.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Flush, fsync and produce the file's metadata.
    pub fn close(mut self) -> Result<DataFileMeta> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::internal("data file path has no name"))?
            .to_string();
        let min_key = self
            .min_key
            .ok_or_else(|| Error::internal("closing an empty data file"))?;
        let max_key = self
            .max_key
            .ok_or_else(|| Error::internal("closing an empty data file"))?;

        Ok(DataFileMeta::new(
            file_name,
            self.bytes_written,
            self.row_count,
            min_key,
            max_key,
            self.min_sequence,
            self.max_sequence,
            self.level,
        ))
    }

    /// Drop the writer and delete the partially written file.
    pub fn abort(self) {
        let path = self.path.clone();
        drop(self);
        let _ = std::fs::remove_file(path);
    }
}

/// Builds rolling writers for one (partition, bucket) pair.
#[derive(Clone)]
pub struct KeyValueFileWriterFactory {
    path_factory: Arc<DataFilePathFactory>,
    target_file_size: u64,
}

impl KeyValueFileWriterFactory {
    /// Create a factory over the bucket's path factory.
    pub fn new(path_factory: Arc<DataFilePathFactory>, target_file_size: u64) -> Self {
        Self {
            path_factory,
            target_file_size,
        }
    }

    /// The rotation threshold in bytes.
    pub fn target_file_size(&self) -> u64 {
        self.target_file_size
    }

    /// Create a rolling writer producing data files at `level`.
    pub fn create_rolling_writer(&self, level: usize) -> RollingFileWriter {
        RollingFileWriter::new(self.path_factory.clone(), self.target_file_size, level, false)
    }

    /// Create a rolling writer producing changelog files at `level`.
    pub fn create_rolling_changelog_writer(&self, level: usize) -> RollingFileWriter {
        RollingFileWriter::new(self.path_factory.clone(), self.target_file_size, level, true)
    }

    /// Delete a produced file by name.
    pub fn delete_file(&self, file_name: &str) {
        self.path_factory.delete_file(file_name);
    }
}

/// Writer that rotates to a fresh file whenever the current one reaches the
/// target size.
///
/// A single record larger than the threshold still lands in exactly one file;
/// rotation is checked after each append.
pub struct RollingFileWriter {
    path_factory: Arc<DataFilePathFactory>,
    target_file_size: u64,
    level: usize,
    changelog: bool,
    current: Option<KeyValueFileWriter>,
    results: Vec<DataFileMeta>,
}

impl RollingFileWriter {
    fn new(
        path_factory: Arc<DataFilePathFactory>,
        target_file_size: u64,
        level: usize,
        changelog: bool,
    ) -> Self {
        Self {
            path_factory,
            target_file_size,
            level,
            changelog,
            current: None,
            results: Vec::new(),
        }
    }

    /// Append one record, rotating first if the current file is full.
    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        if self.current.is_none() {
            let path = if self.changelog {
                self.path_factory.new_changelog_path()
            } else {
                self.path_factory.new_data_path()
            };
            self.current = Some(KeyValueFileWriter::create(path, self.level)?);
        }

        let writer = self.current.as_mut().expect("writer just installed");
        writer.write(kv)?;

        if writer.bytes_written() >= self.target_file_size {
            self.roll()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            if writer.row_count() > 0 {
                self.results.push(writer.close()?);
            } else {
                writer.abort();
            }
        }
        Ok(())
    }

    /// Total records written across all files so far.
    pub fn row_count(&self) -> u64 {
        self.results.iter().map(DataFileMeta::row_count).sum::<u64>()
            + self.current.as_ref().map_or(0, KeyValueFileWriter::row_count)
    }

    /// Finish the current file and return the metas of every file produced.
    ///
    /// An empty writer produces no files.
    pub fn close(mut self) -> Result<Vec<DataFileMeta>> {
        self.roll()?;
        Ok(std::mem::take(&mut self.results))
    }

    /// Delete everything written so far, including the in-progress file.
    pub fn abort(mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort();
        }
        for meta in self.results.drain(..) {
            self.path_factory.delete_file(meta.file_name());
        }
    }
}
