//! Stratum: an embedded transactional page store.
//!
//! A virtual pager maps page numbers onto a growable data file, a journal
//! makes every write transaction durable before it reaches that file, a
//! double-buffered bitmap tracks free pages, and MVCC transactions give
//! readers a stable snapshot while a single writer commits.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{
    backup, restore, Environment, EnvOptions, EnvStats, PageInventory, Transaction, TreeHeader,
};
pub use types::{JournalNumber, PageNumber, Result, StorageError, TxId};
