use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info, trace};

use super::header::{load_header, store_header, FileHeader, FIRST_DATA_PAGE, HEADER_SLOTS};
use crate::primitives::io::FileIo;
use crate::types::{
    page::{is_valid_page_size, PageHeader, DEFAULT_PAGE_SIZE, PAGE_HDR_LEN},
    PageNumber, Result, StorageError,
};

/// Pages added by the very first growth of a file, at minimum.
pub const FIRST_GROWTH_PAGES: u64 = 256;
/// Growths closer together than this double the increment.
pub const FAST_GROWTH_WINDOW: Duration = Duration::from_secs(30);
/// Growths further apart than this halve the increment.
pub const SLOW_GROWTH_WINDOW: Duration = Duration::from_secs(120);
/// Default lower bound for a single growth step.
pub const DEFAULT_MIN_GROWTH_BYTES: u64 = 1024 * 1024;

/// Durability mode applied to journal commits and header writes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync after every journal segment and every header write (most durable).
    #[default]
    Full,
    /// Sync once per commit.
    Normal,
    /// No explicit syncs (fastest but least durable).
    Off,
}

/// Configuration options for the pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes (e.g., 4096).
    pub page_size: u32,
    /// Lower bound for a single growth step, in bytes.
    pub min_growth_bytes: u64,
    /// Durability mode for header writes.
    pub synchronous: Synchronous,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_growth_bytes: DEFAULT_MIN_GROWTH_BYTES,
            synchronous: Synchronous::Full,
        }
    }
}

/// Computes the next growth increment in pages.
///
/// `previous` is the time since the last growth together with the increment
/// used then. Fast successive growths double the step (never past a quarter
/// of the current size), slow ones halve it back toward `floor`.
pub fn growth_increment(previous: Option<(Duration, u64)>, current_pages: u64, floor: u64) -> u64 {
    let floor = floor.max(1);
    match previous {
        None => floor.max(FIRST_GROWTH_PAGES),
        Some((elapsed, last)) if elapsed < FAST_GROWTH_WINDOW => {
            let cap = (current_pages / 4).max(floor);
            last.saturating_mul(2).min(cap).max(floor)
        }
        Some((elapsed, last)) if elapsed > SLOW_GROWTH_WINDOW => (last / 2).max(floor),
        Some((_, last)) => last.max(floor),
    }
}

/// Remembers the last growth so the next increment can adapt.
#[derive(Debug)]
pub struct GrowthPolicy {
    floor_pages: u64,
    last: Option<(Instant, u64)>,
}

impl GrowthPolicy {
    /// Policy whose smallest step is `min_growth_bytes`.
    pub fn new(min_growth_bytes: u64, page_size: u32) -> Self {
        Self {
            floor_pages: (min_growth_bytes / page_size as u64).max(1),
            last: None,
        }
    }

    /// New capacity covering at least `required` pages, recording the step.
    pub fn grow(&mut self, now: Instant, current: u64, required: u64) -> u64 {
        let previous = self
            .last
            .map(|(at, step)| (now.saturating_duration_since(at), step));
        let step = growth_increment(previous, current, self.floor_pages)
            .max(required.saturating_sub(current));
        self.last = Some((now, step));
        current + step
    }
}

/// One mapping of the backing store.
///
/// A generation never shrinks; growing the file publishes a new generation
/// while transactions keep reading through the one they pinned.
pub struct PagerState {
    generation: u64,
    capacity: u64,
    page_size: usize,
    io: Arc<dyn FileIo>,
}

/// Bounds-checked handle to a page run inside a generation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PagePointer {
    /// Generation the pointer was acquired from.
    pub generation: u64,
    /// First page of the run.
    pub page: PageNumber,
    /// Pages in the run.
    pub count: u32,
}

impl PagerState {
    /// Generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Pages addressable through this generation.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn check_range(&self, page: PageNumber, count: u32) -> Result<()> {
        let end = page
            .0
            .checked_add(count as u64)
            .ok_or(StorageError::Invalid("page range overflow"))?;
        if page.0 < HEADER_SLOTS || end > self.capacity {
            return Err(StorageError::InvalidOwned(format!(
                "page {page} (+{count}) outside generation {} of {} pages",
                self.generation, self.capacity
            )));
        }
        Ok(())
    }

    /// Acquires a handle for a run of `count` pages starting at `page`.
    pub fn pointer(&self, page: PageNumber, count: u32) -> Result<PagePointer> {
        self.check_range(page, count)?;
        Ok(PagePointer {
            generation: self.generation,
            page,
            count,
        })
    }

    /// Reads the run behind `ptr`.
    pub fn read_pointer(&self, ptr: PagePointer) -> Result<Vec<u8>> {
        if ptr.generation > self.generation {
            return Err(StorageError::Invalid("page pointer from a newer generation"));
        }
        self.check_range(ptr.page, ptr.count)?;
        let mut buf = vec![0u8; ptr.count as usize * self.page_size];
        self.io
            .read_at(ptr.page.0 * self.page_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Reads a page, following its header to the full overflow run.
    pub fn read(&self, page: PageNumber) -> Result<Vec<u8>> {
        let first = self.read_pointer(self.pointer(page, 1)?)?;
        let header = PageHeader::decode(&first[..PAGE_HDR_LEN])?;
        let count = header.page_count(self.page_size);
        if count <= 1 {
            return Ok(first);
        }
        self.read_pointer(self.pointer(page, count)?)
    }
}

impl Drop for PagerState {
    fn drop(&mut self) {
        trace!(generation = self.generation, "pager.generation.released");
    }
}

impl fmt::Debug for PagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagerState")
            .field("generation", &self.generation)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Virtual pager over a data file or memory backing.
pub struct Pager {
    io: Arc<dyn FileIo>,
    options: PagerOptions,
    state: RwLock<Arc<PagerState>>,
    growth: Mutex<GrowthPolicy>,
    next_generation: AtomicU64,
    header_revision: AtomicU64,
}

impl Pager {
    /// Initializes a fresh data file and writes its first header.
    pub fn create(io: Arc<dyn FileIo>, options: PagerOptions) -> Result<(Self, FileHeader)> {
        if !is_valid_page_size(options.page_size) {
            return Err(StorageError::InvalidOwned(format!(
                "unsupported page size {}",
                options.page_size
            )));
        }
        io.truncate(0)?;
        let mut header = FileHeader::new(options.page_size);
        let pager = Self::with_capacity(io, options, 0, 0);
        pager.write_header(&mut header)?;
        info!(page_size = pager.page_size(), "pager.create");
        Ok((pager, header))
    }

    /// Opens an existing data file.
    pub fn open(io: Arc<dyn FileIo>, options: PagerOptions) -> Result<(Self, FileHeader)> {
        let header = load_header(io.as_ref(), options.page_size)?;
        if header.page_size != options.page_size {
            return Err(StorageError::InvalidOwned(format!(
                "file page size {} differs from configured {}",
                header.page_size, options.page_size
            )));
        }
        let capacity = io.len()? / options.page_size as u64;
        let revision = header.revision;
        let pager = Self::with_capacity(io, options, capacity, revision);
        debug!(capacity, revision, "pager.open");
        Ok((pager, header))
    }

    fn with_capacity(
        io: Arc<dyn FileIo>,
        options: PagerOptions,
        capacity: u64,
        revision: u64,
    ) -> Self {
        let growth = GrowthPolicy::new(options.min_growth_bytes, options.page_size);
        let state = Arc::new(PagerState {
            generation: 0,
            capacity,
            page_size: options.page_size as usize,
            io: Arc::clone(&io),
        });
        Self {
            io,
            options,
            state: RwLock::new(state),
            growth: Mutex::new(growth),
            next_generation: AtomicU64::new(1),
            header_revision: AtomicU64::new(revision),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    /// Pins the current generation.
    pub fn state(&self) -> Arc<PagerState> {
        Arc::clone(&self.state.read())
    }

    /// Pages addressable in the current generation.
    pub fn capacity(&self) -> u64 {
        self.state.read().capacity
    }

    /// Reads a page (or overflow run) through the current generation.
    pub fn read(&self, page: PageNumber) -> Result<Vec<u8>> {
        self.state().read(page)
    }

    /// Acquires a single-page handle in the current generation.
    pub fn acquire_page_pointer(&self, page: PageNumber) -> Result<PagePointer> {
        self.state().pointer(page, 1)
    }

    /// Makes sure `count` pages starting at `requested` are addressable,
    /// growing the file when they are not.
    pub fn ensure_continuous(&self, requested: PageNumber, count: u32) -> Result<Arc<PagerState>> {
        let required = requested
            .0
            .checked_add(count as u64)
            .ok_or(StorageError::Invalid("page range overflow"))?;
        let current = self.state();
        if required <= current.capacity {
            return Ok(current);
        }
        let new_len = self
            .growth
            .lock()
            .grow(Instant::now(), current.capacity, required);
        self.allocate_more_pages(new_len)
    }

    /// Grows the backing store to `new_len` pages and publishes a new generation.
    pub fn allocate_more_pages(&self, new_len: u64) -> Result<Arc<PagerState>> {
        let mut slot = self.state.write();
        if new_len <= slot.capacity {
            return Ok(Arc::clone(&slot));
        }
        self.io.truncate(new_len * self.options.page_size as u64)?;
        let generation = self.next_generation.fetch_add(1, AtomicOrdering::Relaxed);
        let state = Arc::new(PagerState {
            generation,
            capacity: new_len,
            page_size: self.page_size(),
            io: Arc::clone(&self.io),
        });
        info!(
            generation,
            old_pages = slot.capacity,
            new_pages = new_len,
            "pager.grow"
        );
        *slot = Arc::clone(&state);
        Ok(state)
    }

    /// Writes a page image (one page or a whole run) into the data file.
    pub fn write(&self, page: PageNumber, image: &[u8]) -> Result<()> {
        if image.is_empty() || image.len() % self.page_size() != 0 {
            return Err(StorageError::Invalid("page image is not page aligned"));
        }
        let count = (image.len() / self.page_size()) as u32;
        self.state().check_range(page, count)?;
        self.io.write_at(page.0 * self.page_size() as u64, image)
    }

    /// Forces data file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        if self.options.synchronous == Synchronous::Off {
            return Ok(());
        }
        self.io.sync_all()
    }

    /// Reads the newest valid header slot.
    pub fn read_header(&self) -> Result<FileHeader> {
        load_header(self.io.as_ref(), self.options.page_size)
    }

    /// Writes `header` into the next slot, bumping its revision.
    pub fn write_header(&self, header: &mut FileHeader) -> Result<()> {
        header.revision = self.header_revision.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        header.page_size = self.options.page_size;
        if self.capacity() < HEADER_SLOTS {
            self.allocate_more_pages(FIRST_DATA_PAGE.0)?;
        }
        store_header(self.io.as_ref(), header)?;
        if self.options.synchronous != Synchronous::Off {
            self.io.sync_all()?;
        }
        debug!(revision = header.revision, "pager.header.write");
        Ok(())
    }
}
