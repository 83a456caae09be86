use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::log::address::LOG_BLOCK_ALIGNMENT;
use crate::Error;

/// Configuration for an environment
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Directory holding the log files
    pub dir: PathBuf,

    /// Log layout settings
    pub log: LogConfig,

    /// Garbage collector settings
    pub gc: GcConfig,

    /// Maximum number of entries in a tree page before it splits (default: 32)
    pub tree_max_page_size: usize,

    /// Number of decoded tree pages kept in the shared cache, 0 disables it (default: 1024)
    pub page_cache_size: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Upper bound of a single log file in bytes, a multiple of 1024 (default: 8MB)
    pub file_length: u64,

    /// Buffer size of the tail writer (default: 64KB)
    pub write_buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Master switch (default: true)
    pub enabled: bool,

    /// Delay of the first cycle after the environment was created (default: 10s)
    pub start_in: Duration,

    /// Minimum spacing between cycles while free space stays high (default: 30s)
    pub run_period: Duration,

    /// Number of new files before a cycle is considered (default: 3)
    pub files_interval: usize,

    /// The newest `file_min_age` files are never cleaned (default: 2)
    pub file_min_age: usize,

    /// Target minimum percentage of live data (default: 50)
    pub min_utilization: u8,

    /// Rename reclaimed files to `*.del` instead of deleting them (default: false)
    pub rename_files: bool,

    /// Grace period before a cleaned file is queued for deletion (default: 5s)
    pub files_deletion_delay: Duration,

    /// Use the utilization profile as a liveness fast path (default: true)
    pub use_expiration_checker: bool,

    /// Attempts made on a recently created file before the cycle moves on (default: 4)
    pub fresh_file_retries: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_length: 8 * 1024 * 1024, // 8MB
            write_buffer_size: 64 * 1024, // 64KB
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_in: Duration::from_secs(10),
            run_period: Duration::from_secs(30),
            files_interval: 3,
            file_min_age: 2,
            min_utilization: 50,
            rename_files: false,
            files_deletion_delay: Duration::from_secs(5),
            use_expiration_checker: true,
            fresh_file_retries: 4,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ashlog"),
            log: LogConfig::default(),
            gc: GcConfig::default(),
            tree_max_page_size: 32,
            page_cache_size: 1024,
        }
    }
}

impl EnvironmentConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Configure log settings
    pub fn log(mut self, config: LogConfig) -> Self {
        self.log = config;
        self
    }

    /// Configure garbage collector settings
    pub fn gc(mut self, config: GcConfig) -> Self {
        self.gc = config;
        self
    }

    /// Set the page split threshold
    pub fn tree_max_page_size(mut self, size: usize) -> Self {
        self.tree_max_page_size = size;
        self
    }

    /// Set the page cache capacity
    pub fn page_cache_size(mut self, size: usize) -> Self {
        self.page_cache_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let file_length = self.log.file_length;
        if file_length == 0 || file_length % LOG_BLOCK_ALIGNMENT != 0 {
            return Err(Error::InvalidInput(format!(
                "Log file length must be a positive multiple of {}: {}",
                LOG_BLOCK_ALIGNMENT, file_length
            )));
        }
        if self.gc.min_utilization > 100 {
            return Err(Error::InvalidInput(format!(
                "Minimum utilization is a percentage: {}",
                self.gc.min_utilization
            )));
        }
        if self.tree_max_page_size < 4 {
            return Err(Error::InvalidInput(format!(
                "Tree pages must hold at least 4 entries: {}",
                self.tree_max_page_size
            )));
        }
        Ok(())
    }
}

impl LogConfig {
    /// Set the file length bound
    pub fn file_length(mut self, length: u64) -> Self {
        self.file_length = length;
        self
    }

    /// Set the tail writer buffer size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }
}

impl GcConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn start_in(mut self, delay: Duration) -> Self {
        self.start_in = delay;
        self
    }

    pub fn run_period(mut self, period: Duration) -> Self {
        self.run_period = period;
        self
    }

    pub fn files_interval(mut self, files: usize) -> Self {
        self.files_interval = files;
        self
    }

    pub fn file_min_age(mut self, age: usize) -> Self {
        self.file_min_age = age;
        self
    }

    pub fn min_utilization(mut self, percent: u8) -> Self {
        self.min_utilization = percent;
        self
    }

    pub fn rename_files(mut self, rename: bool) -> Self {
        self.rename_files = rename;
        self
    }

    pub fn files_deletion_delay(mut self, delay: Duration) -> Self {
        self.files_deletion_delay = delay;
        self
    }

    pub fn use_expiration_checker(mut self, enabled: bool) -> Self {
        self.use_expiration_checker = enabled;
        self
    }

    pub fn fresh_file_retries(mut self, retries: usize) -> Self {
        self.fresh_file_retries = retries;
        self
    }

    /// Free space percentage above which cleaning is worthwhile
    pub fn max_free_space_percent(&self) -> u8 {
        100 - self.min_utilization.min(100)
    }
}
