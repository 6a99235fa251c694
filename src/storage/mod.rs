//! Transactional storage built on the pager and the journal.
//!
//! An [`Environment`] owns one data file and its journal, hands out
//! [`Transaction`]s and runs the background flush that moves committed
//! pages from the journal into the data file.

/// Full and incremental backups.
///
/// Streams a consistent copy of an environment and restores it elsewhere.
pub mod backup;

/// Double-buffered free-space bitmap and deferred page release.
pub mod freespace;

mod catalog;
mod env;
mod options;
mod registry;
mod transaction;

pub use backup::{restore, BackupSummary};
pub use catalog::{Catalog, TreeHeader};
pub use env::{EnvStats, Environment, PageInventory, DATA_FILE_NAME};
pub use options::{EnvOptions, MIN_JOURNAL_FILE_PAGES};
pub use registry::{ReaderId, RegistrySnapshot, SlowReader};
pub use transaction::{PageMut, Transaction};
