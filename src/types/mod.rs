#![forbid(unsafe_code)]
//! Identifiers, the engine error type and on-disk page metadata.

use std::fmt;

/// Checksum helpers shared by the journal, header and free-space code.
pub mod checksum;
/// Page header layout shared by every page in the data and journal files.
pub mod page;

pub use checksum::{crc32_of, Checksum, Crc32Fast};

/// Logical page number inside the virtual address space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageNumber(pub u64);

/// Identifier of a write transaction; strictly increasing across commits.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

/// Sequence number of a journal file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct JournalNumber(pub u64);

impl PageNumber {
    /// Returns the page `n` pages after this one.
    pub const fn offset(self, n: u64) -> PageNumber {
        PageNumber(self.0 + n)
    }
}

impl TxId {
    /// Returns the id following this one.
    pub const fn next(self) -> TxId {
        TxId(self.0 + 1)
    }

    /// Buffer parity used by the free-space allocator.
    pub const fn parity(self) -> usize {
        (self.0 & 1) as usize
    }
}

impl JournalNumber {
    /// Returns the journal number following this one.
    pub const fn next(self) -> JournalNumber {
        JournalNumber(self.0 + 1)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JournalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:019}", self.0)
    }
}

impl From<u64> for PageNumber {
    fn from(value: u64) -> Self {
        PageNumber(value)
    }
}

impl From<u64> for TxId {
    fn from(value: u64) -> Self {
        TxId(value)
    }
}

/// Errors raised by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Operating system I/O failure; fatal to the in-flight transaction.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Persisted state failed validation (with context).
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// API misuse rejected synchronously.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// API misuse rejected synchronously (with context).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Optimistic concurrency conflict reported by a tree layer; retryable.
    #[error("concurrency conflict: {0}")]
    Conflict(String),
    /// Requested object does not exist.
    #[error("not found")]
    NotFound,
}

impl StorageError {
    /// Returns true for errors that invalidate persisted state.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corruption(_) | StorageError::CorruptionOwned(_)
        )
    }

    /// Returns true when the caller may retry the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Reads a big-endian `u64` at `off`; the caller guarantees the bounds.
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}

/// Reads a big-endian `u32` at `off`; the caller guarantees the bounds.
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(raw)
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}
