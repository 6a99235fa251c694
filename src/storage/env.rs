//! Storage environment: owns the pager, journal, allocator and registry and
//! hands out transactions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{WriterPermit, WriterSemaphore};
use crate::primitives::io::{FileIo, MemoryIo, StdFileIo};
use crate::primitives::pager::{
    CatalogHeader, FileHeader, FreeSpaceHeader, Pager, PagerState, FIRST_DATA_PAGE, HEADER_SLOTS,
};
use crate::primitives::wal::{
    BackupBookmark, Journal, JournalCursor, JournalSnapshot, JournalStore, ReceivedLog, Recovery,
    RecoveryStart, ShippedTransaction,
};
use crate::types::{PageNumber, Result, StorageError, TxId};

use super::catalog::{Catalog, TreeHeader};
use super::freespace::{bitmap_pages_for, encode_bitmap_page, BitmapBuffer, DeferredFrees, FreeSpace};
use super::options::EnvOptions;
use super::registry::{RegistrySnapshot, TransactionRegistry};
use super::transaction::Transaction;

/// Name of the data file inside an environment directory.
pub const DATA_FILE_NAME: &str = "stratum.data";

/// Committed state a transaction starts from.
#[derive(Clone, Debug)]
pub(crate) struct EnvState {
    pub(crate) last_tx: TxId,
    pub(crate) next_page: PageNumber,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) catalog_header: CatalogHeader,
    pub(crate) free_space_header: FreeSpaceHeader,
    pub(crate) journal: JournalSnapshot,
}

pub(crate) struct EnvInner {
    pub(crate) options: EnvOptions,
    pub(crate) pager: Pager,
    pub(crate) journal: Journal,
    pub(crate) writer: WriterSemaphore,
    pub(crate) registry: TransactionRegistry<EnvState>,
    pub(crate) free_space: Mutex<FreeSpace>,
    pub(crate) deferred: Mutex<DeferredFrees>,
    pub(crate) header: Mutex<FileHeader>,
    pub(crate) shipping_crc: Mutex<Option<u32>>,
    flush_signal: Mutex<Option<Sender<FlushMessage>>>,
    path: Option<PathBuf>,
}

enum FlushMessage {
    Trigger,
    Shutdown,
}

struct FlushTask {
    sender: Sender<FlushMessage>,
    handle: Option<JoinHandle<()>>,
}

/// Point-in-time counters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvStats {
    /// Pages marked free in the committed bitmap.
    pub free_pages: u64,
    /// Header slots plus bitmap and catalog pages.
    pub overhead_pages: u64,
    /// Trees in the catalog, one root page each.
    pub root_pages: u64,
    /// Pages allocated in the data file beyond the next page number.
    pub unallocated_tail_pages: u64,
    /// First page never handed out.
    pub next_page: PageNumber,
    /// Last committed transaction.
    pub last_tx: TxId,
    /// Live journal files.
    pub journal_files: usize,
    /// Transactions not yet flushed into the data file.
    pub unflushed_transactions: usize,
    /// Open transactions, the writer included.
    pub active_transactions: usize,
    /// Oldest transaction an open reader may still observe.
    pub oldest_active: TxId,
    /// Freed pages waiting for older readers to finish.
    pub pending_free_pages: u64,
    /// Whether a write transaction or a flush holds the writer slot.
    pub writer_active: bool,
}

/// Page inventory used by diagnostics.
#[derive(Clone, Debug, Default)]
pub struct PageInventory {
    /// File header slots.
    pub header_pages: Vec<PageNumber>,
    /// Free-space bitmap run.
    pub free_space_pages: Vec<PageNumber>,
    /// Catalog run.
    pub catalog_pages: Vec<PageNumber>,
    /// Trees and their headers, ordered by name.
    pub trees: Vec<(String, TreeHeader)>,
    /// Pages free in the committed bitmap.
    pub free_pages: Vec<PageNumber>,
    /// Freed pages not yet returned to the bitmap.
    pub pending_free: Vec<PageNumber>,
}

/// Reads the committed image of `page`: journal first, data file second.
pub(crate) fn read_committed(
    journal: &JournalSnapshot,
    pager: &PagerState,
    page: PageNumber,
) -> Result<Vec<u8>> {
    match journal.read_page(page)? {
        Some(image) => Ok(image),
        None => pager.read(page),
    }
}

pub(crate) fn load_catalog(
    read: impl Fn(PageNumber) -> Result<Vec<u8>>,
    header: &CatalogHeader,
) -> Result<Catalog> {
    let catalog = Catalog::from_pages(&read(header.root_page)?)?;
    if catalog.len() != header.tree_count as usize {
        return Err(StorageError::Corruption("catalog tree count mismatch"));
    }
    Ok(catalog)
}

pub(crate) fn load_free_space(
    read: impl Fn(PageNumber) -> Result<Vec<u8>>,
    header: &FreeSpaceHeader,
    last_tx: TxId,
    page_size: usize,
) -> Result<FreeSpace> {
    let images = header.pages().map(read).collect::<Result<Vec<_>>>()?;
    FreeSpace::load(&images, header, last_tx, page_size)
}

impl EnvInner {
    pub(crate) fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    /// Copies every transaction no reader still needs from the journal into
    /// the data file. The caller holds the writer permit.
    pub(crate) fn flush_locked(&self, _permit: &WriterPermit) -> Result<Option<TxId>> {
        let current = self.registry.current();
        let mut limit = self.registry.oldest_snapshot().unwrap_or(current.last_tx);
        if let Some(pending) = self.deferred.lock().first_pending() {
            limit = limit.min(TxId(pending.0.saturating_sub(1)));
        }
        let Some(plan) = self.journal.plan_flush(limit) else {
            return Ok(None);
        };
        self.journal.copy_to_data(&plan, &self.pager)?;
        {
            let mut header = self.header.lock();
            header.last_tx_id = plan.through;
            header.next_page = plan.header.next_page_number;
            header.last_synced_tx = plan.through;
            header.last_synced_journal = plan.replay_from;
            header.previous_tx_crc = plan.crc;
            header.frees_released_through = plan.header.frees_released_through;
            header.catalog = plan.header.catalog;
            header.free_space = plan.header.free_space;
            header.current_journal = self.journal.cursor().journal;
            header.journal_count = self.journal.stats().files as u64;
            self.pager.write_header(&mut header)?;
        }
        self.journal.finish_flush(&plan);
        let current = self.registry.current();
        self.registry.republish(Arc::new(EnvState {
            journal: self.journal.snapshot(),
            ..(*current).clone()
        }));
        info!(
            through = plan.through.0,
            pages = plan.pages.len(),
            "env.flush"
        );
        Ok(Some(plan.through))
    }

    pub(crate) fn signal_flush(&self) {
        if let Some(sender) = self.flush_signal.lock().as_ref() {
            let _ = sender.send(FlushMessage::Trigger);
        }
    }

    pub(crate) fn persist_bookmark(&self, bookmark: BackupBookmark) -> Result<()> {
        self.journal
            .set_backup_bookmark(bookmark, self.journal.replay_start());
        let mut header = self.header.lock();
        header.last_backed_up_journal = bookmark.journal;
        header.last_backed_up_tx = bookmark.tx_id;
        header.last_backed_up_crc = bookmark.crc;
        header.journal_count = self.journal.stats().files as u64;
        self.pager.write_header(&mut header)
    }
}

/// A storage environment: one data file plus its journal files.
pub struct Environment {
    inner: Arc<EnvInner>,
    flusher: Option<FlushTask>,
}

impl Environment {
    /// Opens the environment stored in `dir`, creating it when the directory
    /// holds no data file.
    pub fn open(dir: impl AsRef<Path>, options: EnvOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let data_path = dir.join(DATA_FILE_NAME);
        let exists = fs::metadata(&data_path).map(|m| m.len() > 0).unwrap_or(false);
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&data_path)?);
        let store = JournalStore::Directory(dir.to_path_buf());
        let inner = if exists {
            Self::open_existing(io, store, options, Some(dir.to_path_buf()))?
        } else {
            Self::create_new(io, store, options, Some(dir.to_path_buf()))?
        };
        Ok(Self::start(inner))
    }

    /// Memory-only environment; nothing survives the value.
    pub fn open_in_memory(options: EnvOptions) -> Result<Self> {
        options.validate()?;
        let io: Arc<dyn FileIo> = Arc::new(MemoryIo::new());
        let inner = Self::create_new(io, JournalStore::Memory, options, None)?;
        Ok(Self::start(inner))
    }

    fn create_new(
        io: Arc<dyn FileIo>,
        store: JournalStore,
        options: EnvOptions,
        path: Option<PathBuf>,
    ) -> Result<EnvInner> {
        if !store.list()?.is_empty() {
            return Err(StorageError::Invalid(
                "journal files exist without a data file",
            ));
        }
        let (pager, mut header) = Pager::create(io, options.pager_options())?;
        let page_size = pager.page_size();
        let bitmap_page = FIRST_DATA_PAGE;
        let catalog_page = FIRST_DATA_PAGE.offset(1);
        let next_page = FIRST_DATA_PAGE.offset(2);

        let bitmap = BitmapBuffer::new(next_page.0);
        let free_space_header = FreeSpaceHeader {
            first_page: bitmap_page,
            page_count: bitmap_pages_for(next_page.0, page_size),
            tracked: next_page.0,
            search_position: next_page.0,
            checksum: bitmap.checksum(),
        };
        let catalog = Catalog::default();
        let catalog_header = CatalogHeader {
            root_page: catalog_page,
            page_count: 1,
            tree_count: 0,
        };
        pager.ensure_continuous(bitmap_page, 2)?;
        pager.write(
            bitmap_page,
            &encode_bitmap_page(bitmap.words(), 0, bitmap_page, page_size)?,
        )?;
        pager.write(catalog_page, &catalog.to_pages(catalog_page, 1, page_size)?)?;
        pager.sync()?;

        header.next_page = next_page;
        header.free_space = free_space_header;
        header.catalog = catalog_header;
        pager.write_header(&mut header)?;

        let journal = Journal::create(
            store,
            options.journal_options(),
            JournalCursor::default(),
            TxId(0),
            0,
        );
        let state = EnvState {
            last_tx: TxId(0),
            next_page,
            catalog: Arc::new(catalog),
            catalog_header,
            free_space_header,
            journal: journal.snapshot(),
        };
        let free_space = FreeSpace::new(bitmap, TxId(0), next_page.0, page_size);
        info!(page_size, path = ?path, "env.create");
        Ok(Self::assemble(
            options,
            pager,
            journal,
            state,
            free_space,
            DeferredFrees::new(TxId(0)),
            header,
            path,
        ))
    }

    fn open_existing(
        io: Arc<dyn FileIo>,
        store: JournalStore,
        options: EnvOptions,
        path: Option<PathBuf>,
    ) -> Result<EnvInner> {
        let (pager, header) = Pager::open(io, options.pager_options())?;
        let journal_options = options.journal_options();
        let start = RecoveryStart {
            journal: header.last_synced_journal,
            after_tx: header.last_synced_tx,
            previous_crc: header.previous_tx_crc,
        };
        let recovery = Recovery::run(&store, &journal_options, start)?;
        let bookmark = BackupBookmark {
            journal: header.last_backed_up_journal,
            tx_id: header.last_backed_up_tx,
            crc: header.last_backed_up_crc,
        };
        let journal = Journal::from_recovery(store, journal_options, &recovery, bookmark);

        let (last_tx, next_page, catalog_header, free_space_header, released) =
            match recovery.last_header() {
                Some(last) => (
                    last.tx_id,
                    last.next_page_number,
                    last.catalog,
                    last.free_space,
                    last.frees_released_through,
                ),
                None => (
                    header.last_tx_id,
                    header.next_page,
                    header.catalog,
                    header.free_space,
                    header.frees_released_through,
                ),
            };
        let snapshot = journal.snapshot();
        let pager_state = pager.state();
        let read = |page| read_committed(&snapshot, &pager_state, page);
        let catalog = load_catalog(read, &catalog_header)?;
        let free_space = load_free_space(read, &free_space_header, last_tx, pager.page_size())?;
        let mut deferred = DeferredFrees::new(released);
        for (tx, pages) in recovery.pending_frees() {
            deferred.register(tx, pages);
        }
        info!(
            last_tx = last_tx.0,
            next_page = next_page.0,
            replayed = recovery.entries.len(),
            pending_frees = deferred.page_count(),
            "env.open"
        );
        let state = EnvState {
            last_tx,
            next_page,
            catalog: Arc::new(catalog),
            catalog_header,
            free_space_header,
            journal: snapshot,
        };
        Ok(Self::assemble(
            options, pager, journal, state, free_space, deferred, header, path,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        options: EnvOptions,
        pager: Pager,
        journal: Journal,
        state: EnvState,
        free_space: FreeSpace,
        deferred: DeferredFrees,
        header: FileHeader,
        path: Option<PathBuf>,
    ) -> EnvInner {
        let last_tx = state.last_tx;
        let threshold = options.reader_warn_threshold();
        EnvInner {
            options,
            pager,
            journal,
            writer: WriterSemaphore::new(),
            registry: TransactionRegistry::new(Arc::new(state), last_tx, threshold),
            free_space: Mutex::new(free_space),
            deferred: Mutex::new(deferred),
            header: Mutex::new(header),
            shipping_crc: Mutex::new(None),
            flush_signal: Mutex::new(None),
            path,
        }
    }

    fn start(inner: EnvInner) -> Self {
        let inner = Arc::new(inner);
        let flusher = inner.options.flush_interval_ms.map(|ms| {
            let (sender, receiver) = mpsc::channel();
            *inner.flush_signal.lock() = Some(sender.clone());
            let weak = Arc::downgrade(&inner);
            let interval = Duration::from_millis(ms);
            let handle = thread::Builder::new()
                .name("stratum-flush".into())
                .spawn(move || flush_loop(weak, receiver, interval))
                .map_err(|err| warn!(error = %err, "env.flush_thread.spawn_failed"))
                .ok();
            FlushTask { sender, handle }
        });
        Self { inner, flusher }
    }

    /// Starts a read transaction on the latest committed state.
    pub fn begin_read(&self) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner), None)
    }

    /// Starts the write transaction, blocking while another one is open.
    pub fn begin_write(&self) -> Result<Transaction> {
        let permit = self.inner.writer.acquire();
        Transaction::begin(Arc::clone(&self.inner), Some(permit))
    }

    /// Like [`Environment::begin_write`] but gives up after `timeout`,
    /// returning `None` while another writer still holds the slot.
    pub fn begin_write_timeout(&self, timeout: Duration) -> Result<Option<Transaction>> {
        match self.inner.writer.acquire_timeout(timeout) {
            Some(permit) => Transaction::begin(Arc::clone(&self.inner), Some(permit)).map(Some),
            None => {
                debug!(timeout_ms = timeout.as_millis() as u64, "env.begin_write.timeout");
                Ok(None)
            }
        }
    }

    /// Flushes committed transactions into the data file and retires the
    /// journal files nothing needs anymore. Returns the last flushed
    /// transaction, or `None` when there was nothing to flush.
    pub fn flush(&self) -> Result<Option<TxId>> {
        let permit = self.inner.writer.acquire();
        self.inner.flush_locked(&permit)
    }

    /// Last committed transaction.
    pub fn last_tx(&self) -> TxId {
        self.inner.registry.current().last_tx
    }

    /// Directory the environment lives in; `None` for memory-only ones.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Options the environment was opened with.
    pub fn options(&self) -> &EnvOptions {
        &self.inner.options
    }

    /// Current root catalog.
    pub fn root(&self) -> Arc<Catalog> {
        Arc::clone(&self.inner.registry.current().catalog)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> EnvStats {
        let state = self.inner.registry.current();
        let free_pages = self.inner.free_space.lock().committed().free_count();
        let pending_free_pages = self.inner.deferred.lock().page_count() as u64;
        let journal = self.inner.journal.stats();
        EnvStats {
            free_pages,
            overhead_pages: HEADER_SLOTS
                + state.free_space_header.page_count as u64
                + state.catalog_header.page_count as u64,
            root_pages: state.catalog.len() as u64,
            unallocated_tail_pages: self.inner.pager.capacity().saturating_sub(state.next_page.0),
            next_page: state.next_page,
            last_tx: state.last_tx,
            journal_files: journal.files,
            unflushed_transactions: journal.unflushed_transactions,
            active_transactions: self.inner.registry.active(),
            oldest_active: self.inner.registry.oldest_active(),
            pending_free_pages,
            writer_active: self.inner.writer.snapshot().writer,
        }
    }

    /// Summary of open transactions, oldest first.
    pub fn readers(&self) -> RegistrySnapshot {
        self.inner.registry.snapshot(Instant::now())
    }

    /// Every page the engine accounts for.
    pub fn all_pages(&self) -> PageInventory {
        let state = self.inner.registry.current();
        let free_pages = self.inner.free_space.lock().committed().free_pages();
        let mut pending_free: Vec<PageNumber> = self.inner.deferred.lock().pages().collect();
        pending_free.sort();
        let catalog = &state.catalog_header;
        PageInventory {
            header_pages: (0..HEADER_SLOTS).map(PageNumber).collect(),
            free_space_pages: state.free_space_header.pages().collect(),
            catalog_pages: (0..catalog.page_count as u64)
                .map(|offset| catalog.root_page.offset(offset))
                .collect(),
            trees: state
                .catalog
                .iter()
                .map(|(name, header)| (name.to_owned(), *header))
                .collect(),
            free_pages,
            pending_free,
        }
    }

    /// Committed transactions after `after_tx` in shipping form.
    ///
    /// `previous_crc` is the chain value the receiver holds for `after_tx`.
    pub fn read_shipped(&self, after_tx: TxId, previous_crc: u32) -> Result<Vec<ShippedTransaction>> {
        self.inner.journal.read_shipped(after_tx, previous_crc)
    }

    /// Journal chain value of the last committed transaction.
    pub fn last_crc(&self) -> u32 {
        self.inner.journal.last_committed().1
    }

    /// Applies transactions validated by a shipping receiver as local
    /// commits with the same ids. Returns the last applied transaction.
    pub fn apply_shipped(&self, log: &ReceivedLog) -> Result<TxId> {
        let mut applied = self.last_tx();
        for received in &log.transactions {
            let tx = self.begin_write()?;
            applied = tx.commit_shipped(log, received)?;
            *self.inner.shipping_crc.lock() = Some(received.header.crc);
        }
        debug!(
            transactions = log.transactions.len(),
            last_tx = applied.0,
            "env.shipped.applied"
        );
        Ok(applied)
    }

    /// Shipping chain value of the last applied transaction, when this
    /// environment is a replica.
    pub fn shipping_crc(&self) -> Option<u32> {
        *self.inner.shipping_crc.lock()
    }

    /// Current incremental backup bookmark.
    pub fn backup_bookmark(&self) -> BackupBookmark {
        self.inner.journal.backup_bookmark()
    }

    pub(crate) fn inner(&self) -> &Arc<EnvInner> {
        &self.inner
    }

    fn stop_flusher(&mut self) {
        if let Some(mut task) = self.flusher.take() {
            self.inner.flush_signal.lock().take();
            let _ = task.sender.send(FlushMessage::Shutdown);
            if let Some(handle) = task.handle.take() {
                if handle.join().is_err() {
                    warn!("env.flush_thread.panicked");
                }
            }
        }
    }

    /// Stops the background flush and flushes what readers allow.
    pub fn close(mut self) -> Result<()> {
        self.stop_flusher();
        let permit = self.inner.writer.acquire();
        self.inner.flush_locked(&permit)?;
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.stop_flusher();
        if let Some(permit) = self.inner.writer.try_acquire() {
            if let Err(err) = self.inner.flush_locked(&permit) {
                warn!(error = %err, "env.close.flush_failed");
            }
        }
    }
}

fn flush_loop(inner: Weak<EnvInner>, receiver: Receiver<FlushMessage>, interval: Duration) {
    loop {
        match receiver.recv_timeout(interval) {
            Ok(FlushMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(FlushMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if let Some(permit) = inner.writer.try_acquire() {
                    if let Err(err) = inner.flush_locked(&permit) {
                        warn!(error = %err, "env.flush.failed");
                    }
                }
                inner.registry.report_slow_readers(Instant::now());
            }
        }
    }
    debug!("env.flush_thread.exit");
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.registry.current();
        f.debug_struct("Environment")
            .field("path", &self.inner.path)
            .field("last_tx", &state.last_tx)
            .field("next_page", &state.next_page)
            .finish()
    }
}
