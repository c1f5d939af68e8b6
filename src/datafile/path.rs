//! File naming for one (partition, bucket) directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

/// Generates fresh, unique file paths within one bucket directory.
///
/// Names are `data-NNNNNN`, `changelog-NNNNNN` and `spill-NNNNNN.tmp`,
/// numbered from a shared counter. The counter resumes past any file already
/// present in the directory, so a factory opened over a restored bucket never
/// reuses a name.
#[derive(Debug)]
pub struct DataFilePathFactory {
    /// Bucket directory, e.g. `<root>/<partition>/bucket-<n>`.
    bucket_dir: PathBuf,
    /// Next file number.
    next: AtomicU64,
}

/// Parse the number out of a factory-produced file name.
fn parse_file_number(name: &str) -> Option<u64> {
    let rest = name
        .strip_prefix("data-")
        .or_else(|| name.strip_prefix("changelog-"))
        .or_else(|| name.strip_prefix("spill-"))?;
    let digits = rest.strip_suffix(".tmp").unwrap_or(rest);
    digits.parse().ok()
}

impl DataFilePathFactory {
    /// Create a factory rooted at the given bucket directory.
    ///
    /// The directory is created if missing; numbering continues after the
    /// highest-numbered file already present.
    pub fn new(bucket_dir: impl Into<PathBuf>) -> Result<Self> {
        let bucket_dir = bucket_dir.into();
        std::fs::create_dir_all(&bucket_dir)?;

        let mut next = 0;
        for entry in std::fs::read_dir(&bucket_dir)? {
            let entry = entry?;
            if let Some(number) = entry.file_name().to_str().and_then(parse_file_number) {
                next = next.max(number + 1);
            }
        }

        Ok(Self {
            bucket_dir,
            next: AtomicU64::new(next),
        })
    }

    /// Get the bucket directory.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// Generate a fresh data file path.
    pub fn new_data_path(&self) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.bucket_dir.join(format!("data-{:06}", n))
    }

    /// Generate a fresh changelog file path.
    pub fn new_changelog_path(&self) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.bucket_dir.join(format!("changelog-{:06}", n))
    }

    /// Generate a fresh spill file path.
    pub fn new_spill_path(&self) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.bucket_dir.join(format!("spill-{:06}.tmp", n))
    }

    /// Resolve a file name produced by this factory to its full path.
    pub fn to_path(&self, file_name: &str) -> PathBuf {
        self.bucket_dir.join(file_name)
    }

    /// Delete a file by name, ignoring files that are already gone.
    pub fn delete_file(&self, file_name: &str) {
        let _ = std::fs::remove_file(self.to_path(file_name));
    }
}
