//! Low-level building blocks of the storage engine.
//!
//! Byte codecs, positioned I/O, the writer semaphore, the virtual pager and
//! the journal.

/// Varint and cursor helpers used by on-page encodings.
pub mod bytes;

/// Writer semaphore and permit.
pub mod concurrency;

/// Positioned file I/O over real files or memory.
pub mod io;

/// Virtual pager and data file headers.
///
/// Maps logical page numbers onto the data file and grows it on demand.
pub mod pager;

/// Journal files, recovery and log shipping.
pub mod wal;
