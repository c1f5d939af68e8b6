//! Configuration options for the write engine.

/// Default number of LSM levels.
pub const DEFAULT_NUM_LEVELS: usize = 6;

/// Default rolling-writer rotation threshold (128MB).
pub const DEFAULT_TARGET_FILE_SIZE: u64 = 128 * 1024 * 1024;

/// Default in-memory sort buffer capacity (64MB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Default fan-in cap for merging spilled sort runs.
pub const DEFAULT_LOCAL_SORT_MAX_NUM_FILE_HANDLES: usize = 128;

/// Default size-amplification trigger, in percent.
pub const DEFAULT_MAX_SIZE_AMPLIFICATION_PERCENT: u64 = 200;

/// Default size ratio for the universal-compaction prefix scan, in percent.
pub const DEFAULT_SORTED_RUN_SIZE_RATIO: u64 = 1;

/// Default number of sorted runs that triggers a compaction.
pub const DEFAULT_NUM_SORTED_RUN_COMPACTION_TRIGGER: usize = 5;

/// Default number of level-0 runs that stops writes.
pub const DEFAULT_NUM_SORTED_RUN_STOP_TRIGGER: usize = 10;

/// Controls whether and how change records are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangelogProducer {
    /// No change records.
    #[default]
    None,
    /// Emit the pre-merge input records as a side stream at flush time.
    Input,
    /// Force a full merge at commit boundaries and emit the merged view.
    FullCompaction,
}

/// Write-engine configuration.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    // === Levels ===
    /// Number of LSM levels.
    pub num_levels: usize,

    // === Files ===
    /// Rolling-writer rotation threshold in bytes.
    pub target_file_size: u64,

    // === Write buffer ===
    /// In-memory sort buffer capacity in bytes before flush (or spill).
    pub write_buffer_size: usize,

    /// Whether the sort buffer spills to disk when full instead of flushing.
    pub write_buffer_spillable: bool,

    /// Fan-in cap for the external-sort spill merge.
    pub local_sort_max_num_file_handles: usize,

    // === Universal compaction ===
    /// Size-amplification trigger, in percent.
    pub max_size_amplification_percent: u64,

    /// Size ratio for extending the candidate prefix, in percent.
    pub sorted_run_size_ratio: u64,

    /// Number of sorted runs in the candidate prefix that triggers compaction.
    pub num_sorted_run_compaction_trigger: usize,

    /// Hard cap on the total number of sorted runs.
    pub max_sorted_run_num: usize,

    // === Write path ===
    /// Number of level-0 runs at which writes block until compaction catches up.
    pub num_sorted_run_stop_trigger: usize,

    /// If true, `prepare_commit` joins any pending compaction.
    pub commit_force_compact: bool,

    /// Change-record production mode.
    pub changelog_producer: ChangelogProducer,

    /// If true, the writer never compacts (bulk-load mode).
    pub write_compaction_skip: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            num_levels: DEFAULT_NUM_LEVELS,
            target_file_size: DEFAULT_TARGET_FILE_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            write_buffer_spillable: false,
            local_sort_max_num_file_handles: DEFAULT_LOCAL_SORT_MAX_NUM_FILE_HANDLES,
            max_size_amplification_percent: DEFAULT_MAX_SIZE_AMPLIFICATION_PERCENT,
            sorted_run_size_ratio: DEFAULT_SORTED_RUN_SIZE_RATIO,
            num_sorted_run_compaction_trigger: DEFAULT_NUM_SORTED_RUN_COMPACTION_TRIGGER,
            max_sorted_run_num: usize::MAX,
            num_sorted_run_stop_trigger: DEFAULT_NUM_SORTED_RUN_STOP_TRIGGER,
            commit_force_compact: false,
            changelog_producer: ChangelogProducer::default(),
            write_compaction_skip: false,
        }
    }
}

impl CoreOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.num_levels < 2 {
            return Err(crate::Error::InvalidConfiguration(
                "num_levels must be at least 2".into(),
            ));
        }

        if self.target_file_size == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "target_file_size must be positive".into(),
            ));
        }

        if self.write_buffer_size < 1024 {
            return Err(crate::Error::InvalidConfiguration(
                "write_buffer_size must be at least 1KB".into(),
            ));
        }

        if self.local_sort_max_num_file_handles < 2 {
            return Err(crate::Error::InvalidConfiguration(
                "local_sort_max_num_file_handles must be at least 2".into(),
            ));
        }

        if self.num_sorted_run_compaction_trigger < 2 {
            return Err(crate::Error::InvalidConfiguration(
                "num_sorted_run_compaction_trigger must be at least 2".into(),
            ));
        }

        if self.num_sorted_run_stop_trigger < 1 {
            return Err(crate::Error::InvalidConfiguration(
                "num_sorted_run_stop_trigger must be at least 1".into(),
            ));
        }

        if self.max_sorted_run_num < 2 {
            return Err(crate::Error::InvalidConfiguration(
                "max_sorted_run_num must be at least 2".into(),
            ));
        }

        if self.write_compaction_skip
            && self.changelog_producer == ChangelogProducer::FullCompaction
        {
            return Err(crate::Error::InvalidConfiguration(
                "write_compaction_skip cannot produce a full-compaction changelog".into(),
            ));
        }

        Ok(())
    }

    /// Index of the top-most level.
    pub fn max_level(&self) -> usize {
        self.num_levels - 1
    }
}

/// Builder for CoreOptions.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: CoreOptions,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of LSM levels.
    pub fn num_levels(mut self, n: usize) -> Self {
        self.options.num_levels = n;
        self
    }

    /// Set the rolling-writer rotation threshold.
    pub fn target_file_size(mut self, bytes: u64) -> Self {
        self.options.target_file_size = bytes;
        self
    }

    /// Set the write buffer capacity.
    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.options.write_buffer_size = bytes;
        self
    }

    /// Enable or disable buffer spilling.
    pub fn write_buffer_spillable(mut self, value: bool) -> Self {
        self.options.write_buffer_spillable = value;
        self
    }

    /// Set the spill-merge fan-in cap.
    pub fn local_sort_max_num_file_handles(mut self, n: usize) -> Self {
        self.options.local_sort_max_num_file_handles = n;
        self
    }

    /// Set the size-amplification trigger.
    pub fn max_size_amplification_percent(mut self, percent: u64) -> Self {
        self.options.max_size_amplification_percent = percent;
        self
    }

    /// Set the size-ratio trigger.
    pub fn sorted_run_size_ratio(mut self, percent: u64) -> Self {
        self.options.sorted_run_size_ratio = percent;
        self
    }

    /// Set the run-count compaction trigger.
    pub fn num_sorted_run_compaction_trigger(mut self, n: usize) -> Self {
        self.options.num_sorted_run_compaction_trigger = n;
        self
    }

    /// Set the hard cap on sorted runs.
    pub fn max_sorted_run_num(mut self, n: usize) -> Self {
        self.options.max_sorted_run_num = n;
        self
    }

    /// Set the write-stop trigger.
    pub fn num_sorted_run_stop_trigger(mut self, n: usize) -> Self {
        self.options.num_sorted_run_stop_trigger = n;
        self
    }

    /// Set whether `prepare_commit` joins pending compaction.
    pub fn commit_force_compact(mut self, value: bool) -> Self {
        self.options.commit_force_compact = value;
        self
    }

    /// Set the changelog producer mode.
    pub fn changelog_producer(mut self, producer: ChangelogProducer) -> Self {
        self.options.changelog_producer = producer;
        self
    }

    /// Set whether the writer skips compaction entirely.
    pub fn write_compaction_skip(mut self, value: bool) -> Self {
        self.options.write_compaction_skip = value;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<CoreOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
