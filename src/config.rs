use std::time::Duration;

/// Block compression applied to table data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory if it does not exist (default: false)
    pub create_if_missing: bool,

    /// Fail open() if the database already exists (default: false)
    pub error_if_exists: bool,

    /// Memtable size that triggers a flush (default: 4MB)
    pub write_buffer_size: usize,

    /// Capacity of the table cache, counted in open tables (default: 1000)
    pub max_open_files: usize,

    /// Target uncompressed size of a table data block (default: 4KB)
    pub block_size: usize,

    /// Number of entries between prefix-compression restart points (default: 16)
    pub block_restart_interval: usize,

    /// Compression applied to data blocks (default: Snappy)
    pub compression: Compression,

    /// Maximum size of a table file produced by flush or compaction (default: 2MB)
    pub max_file_size: u64,

    /// Bloom filter bits per key; None disables the filter block (default: Some(10))
    pub filter_bits_per_key: Option<u32>,

    /// Background scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for flush opportunities (default: 1s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: Compression::Snappy,
            max_file_size: 2 * 1024 * 1024,
            filter_bits_per_key: Some(10),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
        }
    }
}

impl Options {
    /// Set whether to create the database if missing
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set whether to fail when the database already exists
    pub fn error_if_exists(mut self, error: bool) -> Self {
        self.error_if_exists = error;
        self
    }

    /// Set the memtable flush threshold
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the table cache capacity
    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the prefix-compression restart interval
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Set the data block compression
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the maximum table file size
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set bloom filter bits per key, or disable the filter with None
    pub fn filter_bits_per_key(mut self, bits: Option<u32>) -> Self {
        self.filter_bits_per_key = bits;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set flush check interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set compaction check interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}

/// Per-write durability options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the write-ahead log before acknowledging the write. Without it,
    /// durability is bounded by the group-commit flush cadence.
    pub sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert!(!options.create_if_missing);
        assert!(!options.error_if_exists);
        assert_eq!(options.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(options.max_open_files, 1000);
        assert_eq!(options.block_size, 4 * 1024);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.max_file_size, 2 * 1024 * 1024);
        assert_eq!(options.filter_bits_per_key, Some(10));
    }

    #[test]
    fn test_options_builder() {
        let options = Options::default()
            .create_if_missing(true)
            .write_buffer_size(64 * 1024)
            .compression(Compression::None)
            .scheduler(
                SchedulerConfig::default()
                    .flush_interval(Duration::from_millis(500))
                    .compaction_interval(Duration::from_secs(5)),
            );

        assert!(options.create_if_missing);
        assert_eq!(options.write_buffer_size, 64 * 1024);
        assert_eq!(options.compression, Compression::None);
        assert_eq!(options.scheduler.flush_interval, Duration::from_millis(500));
        assert_eq!(options.scheduler.compaction_interval, Duration::from_secs(5));
    }
}
