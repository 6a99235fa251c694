use std::fmt;
use std::fs;
use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, MemoryIo, StdFileIo};
use crate::types::{JournalNumber, Result, StorageError};

const JOURNAL_EXTENSION: &str = "journal";

/// File name of journal `number`.
pub fn journal_file_name(number: JournalNumber) -> String {
    format!("{number}.{JOURNAL_EXTENSION}")
}

/// Parses a `<19 digits>.journal` file name.
pub fn parse_journal_name(name: &str) -> Option<JournalNumber> {
    let stem = name.strip_suffix(".journal")?;
    if stem.len() != 19 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok().map(JournalNumber)
}

/// One journal file, addressed in whole pages.
///
/// A retired file is removed from disk when the last holder drops it, so
/// snapshots that still translate pages into it keep reading safely.
pub struct JournalFile {
    number: JournalNumber,
    io: Arc<dyn FileIo>,
    path: Option<PathBuf>,
    page_size: usize,
    capacity: AtomicU64,
    retired: AtomicBool,
}

impl JournalFile {
    fn new(
        number: JournalNumber,
        io: Arc<dyn FileIo>,
        path: Option<PathBuf>,
        page_size: usize,
    ) -> Result<Self> {
        let capacity = io.len()? / page_size as u64;
        Ok(Self {
            number,
            io,
            path,
            page_size,
            capacity: AtomicU64::new(capacity),
            retired: AtomicBool::new(false),
        })
    }

    /// Journal sequence number.
    pub fn number(&self) -> JournalNumber {
        self.number
    }

    /// Capacity in pages.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Enlarges the file so it holds at least `pages` pages.
    pub fn ensure_capacity(&self, pages: u64) -> Result<()> {
        if pages <= self.capacity() {
            return Ok(());
        }
        self.io.truncate(pages * self.page_size as u64)?;
        self.capacity.store(pages, Ordering::Release);
        debug!(journal = %self.number, pages, "journal.file.enlarge");
        Ok(())
    }

    /// Reads `count` pages starting at page `position`.
    pub fn read_pages(&self, position: u64, count: u64) -> Result<Vec<u8>> {
        if position + count > self.capacity() {
            return Err(StorageError::Corruption("journal read past end of file"));
        }
        let mut buf = vec![0u8; (count as usize) * self.page_size];
        self.io
            .read_at(position * self.page_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Writes consecutive page buffers starting at page `position`.
    pub fn write_pages(&self, position: u64, pages: &[&[u8]]) -> Result<()> {
        let total: usize = pages.iter().map(|p| p.len()).sum();
        let count = (total / self.page_size) as u64;
        self.ensure_capacity(position + count)?;
        let slices: Vec<IoSlice<'_>> = pages.iter().map(|p| IoSlice::new(p)).collect();
        self.io
            .writev_at(position * self.page_size as u64, &slices)
    }

    /// Syncs file contents.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Marks the file for deletion once the last reference drops.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        info!(journal = %self.number, "journal.file.retired");
    }

    /// Returns true once the file has been retired.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl Drop for JournalFile {
    fn drop(&mut self) {
        if !self.is_retired() {
            return;
        }
        if let Some(path) = &self.path {
            match fs::remove_file(path) {
                Ok(()) => debug!(journal = %self.number, "journal.file.deleted"),
                Err(err) => warn!(journal = %self.number, error = %err, "journal.file.delete_failed"),
            }
        }
    }
}

impl fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalFile")
            .field("number", &self.number)
            .field("capacity", &self.capacity())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Where journal files live.
#[derive(Clone, Debug)]
pub enum JournalStore {
    /// `<dir>/<number>.journal` files.
    Directory(PathBuf),
    /// Memory-only files that vanish with the environment.
    Memory,
}

impl JournalStore {
    /// Journal numbers present in the store, ascending.
    pub fn list(&self) -> Result<Vec<JournalNumber>> {
        let dir = match self {
            JournalStore::Directory(dir) => dir,
            JournalStore::Memory => return Ok(Vec::new()),
        };
        let mut numbers = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(number) = entry.file_name().to_str().and_then(parse_journal_name) {
                numbers.push(number);
            }
        }
        numbers.sort();
        Ok(numbers)
    }

    /// Opens (creating when missing) journal `number`, sized to at least
    /// `min_pages` pages.
    pub fn open(
        &self,
        number: JournalNumber,
        page_size: usize,
        min_pages: u64,
    ) -> Result<Arc<JournalFile>> {
        let (io, path): (Arc<dyn FileIo>, Option<PathBuf>) = match self {
            JournalStore::Directory(dir) => {
                let path = dir.join(journal_file_name(number));
                (Arc::new(StdFileIo::open(&path)?), Some(path))
            }
            JournalStore::Memory => (Arc::new(MemoryIo::new()), None),
        };
        let file = JournalFile::new(number, io, path, page_size)?;
        file.ensure_capacity(min_pages)?;
        Ok(Arc::new(file))
    }

    /// Opens an existing journal without resizing it.
    pub fn open_existing(&self, number: JournalNumber, page_size: usize) -> Result<Arc<JournalFile>> {
        self.open(number, page_size, 0)
    }

    /// Directory backing the store, if any.
    pub fn directory(&self) -> Option<&Path> {
        match self {
            JournalStore::Directory(dir) => Some(dir),
            JournalStore::Memory => None,
        }
    }
}
