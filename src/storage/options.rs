use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::primitives::pager::{PagerOptions, Synchronous, DEFAULT_MIN_GROWTH_BYTES};
use crate::primitives::wal::JournalOptions;
use crate::types::{
    page::{is_valid_page_size, DEFAULT_PAGE_SIZE},
    Result, StorageError,
};

/// Smallest journal file accepted, in pages.
pub const MIN_JOURNAL_FILE_PAGES: u64 = 8;

/// Configuration supplied when opening an [`super::Environment`].
///
/// Every field has a default, so a TOML document only needs the keys it
/// wants to change:
///
/// ```toml
/// page_size = 8192
/// synchronous = "normal"
/// flush_interval_ms = 250
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EnvOptions {
    /// Page size in bytes; a power of two between 1 KiB and 64 KiB.
    pub page_size: u32,
    /// Nominal journal file size in pages.
    pub journal_file_pages: u64,
    /// Lower bound for a single data file growth step, in bytes.
    pub min_growth_bytes: u64,
    /// Durability mode for commits and header writes.
    pub synchronous: Synchronous,
    /// Background flush period; `None` disables the flush thread.
    pub flush_interval_ms: Option<u64>,
    /// Keep journal files until an incremental backup copied them.
    pub incremental_backup: bool,
    /// Transactions open longer than this are reported as slow.
    pub reader_warn_threshold_ms: u64,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            journal_file_pages: 1024,
            min_growth_bytes: DEFAULT_MIN_GROWTH_BYTES,
            synchronous: Synchronous::Full,
            flush_interval_ms: Some(1000),
            incremental_backup: false,
            reader_warn_threshold_ms: 30_000,
        }
    }
}

impl EnvOptions {
    /// Parses options from a TOML document and validates them.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text)
            .map_err(|err| StorageError::InvalidOwned(format!("environment options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Rejects option combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_page_size(self.page_size) {
            return Err(StorageError::InvalidOwned(format!(
                "page size {} must be a power of two between 1024 and 65536",
                self.page_size
            )));
        }
        if self.journal_file_pages < MIN_JOURNAL_FILE_PAGES {
            return Err(StorageError::InvalidOwned(format!(
                "journal files need at least {MIN_JOURNAL_FILE_PAGES} pages, got {}",
                self.journal_file_pages
            )));
        }
        if self.flush_interval_ms == Some(0) {
            return Err(StorageError::Invalid("flush interval must be positive"));
        }
        Ok(())
    }

    /// Sets the page size.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the journal file size in pages.
    pub fn journal_file_pages(mut self, pages: u64) -> Self {
        self.journal_file_pages = pages;
        self
    }

    /// Sets the durability mode.
    pub fn synchronous(mut self, synchronous: Synchronous) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Sets or disables the background flush period.
    pub fn flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval_ms = interval.map(|d| d.as_millis().max(1) as u64);
        self
    }

    /// Enables journal retention for incremental backups.
    pub fn incremental_backup(mut self, enabled: bool) -> Self {
        self.incremental_backup = enabled;
        self
    }

    pub(crate) fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            min_growth_bytes: self.min_growth_bytes,
            synchronous: self.synchronous,
        }
    }

    pub(crate) fn journal_options(&self) -> JournalOptions {
        JournalOptions {
            page_size: self.page_size,
            file_pages: self.journal_file_pages,
            synchronous: self.synchronous,
            retain_for_backup: self.incremental_backup,
        }
    }

    pub(crate) fn reader_warn_threshold(&self) -> Duration {
        Duration::from_millis(self.reader_warn_threshold_ms)
    }
}
