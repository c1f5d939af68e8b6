//! Sequential data file reader.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use crate::types::KeyValue;
use crate::Result;

use super::format;
use super::path::DataFilePathFactory;

/// Forward-only reader over one data file.
///
/// Records come back in the order they were written, which for data files is
/// key order.
pub struct DataFileReader {
    reader: BufReader<File>,
}

impl DataFileReader {
    /// Open a data file and validate its header.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        format::read_header(&mut reader)?;
        Ok(Self { reader })
    }

    /// Read the next record, or `None` at end of file.
    pub fn read_next(&mut self) -> Result<Option<KeyValue>> {
        format::read_record(&mut self.reader)
    }
}

/// Opens data files of one (partition, bucket) pair by name.
#[derive(Clone)]
pub struct KeyValueFileReaderFactory {
    path_factory: Arc<DataFilePathFactory>,
}

impl KeyValueFileReaderFactory {
    /// Create a factory over the bucket's path factory.
    pub fn new(path_factory: Arc<DataFilePathFactory>) -> Self {
        Self { path_factory }
    }

    /// Open a reader for the named file.
    pub fn open(&self, file_name: &str) -> Result<DataFileReader> {
        DataFileReader::open(self.path_factory.to_path(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::writer::KeyValueFileWriterFactory;
    use crate::types::ValueKind;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_back() {
        let dir = tempdir().unwrap();
        let paths = Arc::new(DataFilePathFactory::new(dir.path()).unwrap());
        let writers = KeyValueFileWriterFactory::new(paths.clone(), 1 << 20);
        let readers = KeyValueFileReaderFactory::new(paths);

        let mut writer = writers.create_rolling_writer(2);
        for i in 0..100u64 {
            let kv = KeyValue::new(
                Bytes::from(format!("key-{:04}", i)),
                i,
                if i % 10 == 0 { ValueKind::Delete } else { ValueKind::Add },
                Bytes::from(format!("value-{}", i)),
            );
            writer.write(&kv).unwrap();
        }
        let metas = writer.close().unwrap();
        assert_eq!(metas.len(), 1);

        let mut reader = readers.open(metas[0].file_name()).unwrap();
        let mut count = 0u64;
        while let Some(kv) = reader.read_next().unwrap() {
            assert_eq!(kv.key().as_ref(), format!("key-{:04}", count).as_bytes());
            assert_eq!(kv.sequence(), count);
            assert_eq!(kv.is_delete(), count % 10 == 0);
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let paths = Arc::new(DataFilePathFactory::new(dir.path()).unwrap());
        let readers = KeyValueFileReaderFactory::new(paths);
        assert!(readers.open("data-000042").is_err());
    }
}
