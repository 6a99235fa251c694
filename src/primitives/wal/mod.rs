#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::primitives::pager::{CatalogHeader, FreeSpaceHeader, Pager, Synchronous};
use crate::types::{
    page::PageHeader,
    JournalNumber, PageNumber, Result, StorageError, TxId,
};

mod file;
mod header;
mod recovery;
mod shipping;

pub use file::{journal_file_name, parse_journal_name, JournalFile, JournalStore};
pub use header::{
    decode_freed, encode_freed, entry_crc, freed_list_pages, freed_per_page, Marker,
    TransactionHeader, TX_HEADER_LEN,
};
pub use recovery::{RecoveredEntry, Recovery, RecoveryStart};
pub use shipping::{
    decode_shipped_stream, encode_shipped_stream, ReceivedLog, ReceivedTransaction,
    ShippedTransaction, ShippingReceiver,
};

/// Configuration options for the journal.
#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// Page size shared with the data file.
    pub page_size: u32,
    /// Nominal size of a journal file, in pages.
    pub file_pages: u64,
    /// Durability mode for commits.
    pub synchronous: Synchronous,
    /// Keep flushed files until an incremental backup copied them.
    pub retain_for_backup: bool,
}

/// Location of a page image inside the journal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JournalPage {
    /// File holding the image.
    pub journal: JournalNumber,
    /// Page offset inside the file.
    pub position: u64,
    /// Transaction that wrote the image.
    pub tx_id: TxId,
    /// Pages in the image (more than one for overflow runs).
    pub pages: u32,
}

/// Maps logical pages to their newest journaled image.
pub type TranslationTable = HashMap<PageNumber, JournalPage>;

/// Immutable view of the committed journal.
///
/// Holding a snapshot keeps every file it translates into alive, even after
/// the journal retired it.
#[derive(Clone)]
pub struct JournalSnapshot {
    table: Arc<TranslationTable>,
    files: Arc<BTreeMap<JournalNumber, Arc<JournalFile>>>,
    last_tx: TxId,
}

impl JournalSnapshot {
    /// Newest journaled location of `page`, if it has not been flushed.
    pub fn lookup(&self, page: PageNumber) -> Option<JournalPage> {
        self.table.get(&page).copied()
    }

    /// Reads the journaled image of `page`; `None` means the data file holds it.
    pub fn read_page(&self, page: PageNumber) -> Result<Option<Vec<u8>>> {
        let Some(slot) = self.lookup(page) else {
            return Ok(None);
        };
        let file = self
            .files
            .get(&slot.journal)
            .ok_or(StorageError::Corruption("translation points at a missing journal"))?;
        Ok(Some(file.read_pages(slot.position, slot.pages as u64)?))
    }

    /// Last transaction visible through this snapshot.
    pub fn last_tx(&self) -> TxId {
        self.last_tx
    }

    /// Pages currently translated.
    pub fn page_count(&self) -> usize {
        self.table.len()
    }

    /// Translated pages, unordered.
    pub fn pages(&self) -> impl Iterator<Item = (&PageNumber, &JournalPage)> {
        self.table.iter()
    }
}

impl fmt::Debug for JournalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalSnapshot")
            .field("last_tx", &self.last_tx)
            .field("pages", &self.table.len())
            .field("files", &self.files.len())
            .finish()
    }
}

/// Next write position in the journal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JournalCursor {
    /// File receiving the next entry.
    pub journal: JournalNumber,
    /// Page offset of the next header.
    pub position: u64,
}

/// A committed transaction that has not been flushed yet.
#[derive(Clone, Debug)]
pub struct EntryRecord {
    /// Transaction id.
    pub tx_id: TxId,
    /// Header of the last segment.
    pub header: TransactionHeader,
    /// CRC of the last segment.
    pub crc: u32,
    /// File holding the first segment.
    pub first_journal: JournalNumber,
}

/// Bookmark of the last incremental backup.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackupBookmark {
    /// Last journal copied.
    pub journal: JournalNumber,
    /// Last transaction copied.
    pub tx_id: TxId,
    /// Shipping CRC of the last copied entry.
    pub crc: u32,
}

#[derive(Debug)]
struct PendingSegment {
    journal: JournalNumber,
    header_pos: u64,
    used: u64,
    capacity: u64,
}

impl PendingSegment {
    fn next_free(&self) -> u64 {
        self.header_pos + 1 + self.used
    }
}

/// Journal space reserved by the in-flight write transaction.
///
/// Images are only written at commit; dropping the reservation leaves the
/// committed cursor untouched, so the next transaction rewinds over it.
#[derive(Debug)]
pub struct JournalTx {
    tx_id: TxId,
    segments: Vec<PendingSegment>,
}

impl JournalTx {
    /// Transaction the reservation belongs to.
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Number of segments the entry will be split into.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// Everything a commit persists besides page images.
pub struct CommitRequest<'a> {
    /// First unallocated page after the transaction.
    pub next_page: PageNumber,
    /// Highest transaction whose frees are back in the bitmap.
    pub frees_released_through: TxId,
    /// Root object tree location.
    pub catalog: CatalogHeader,
    /// Free-space bitmap state.
    pub free_space: FreeSpaceHeader,
    /// Page images with their reserved slots.
    pub pages: Vec<(JournalPage, &'a [u8])>,
    /// Pages freed by the transaction.
    pub freed: &'a [PageNumber],
}

/// Result of a successful journal commit.
#[derive(Clone, Copy, Debug)]
pub struct CommittedEntry {
    /// Header of the last segment.
    pub header: TransactionHeader,
    /// Segments written.
    pub segments: usize,
}

/// Pages to copy into the data file and the state that results.
#[derive(Debug)]
pub struct FlushPlan {
    /// Last transaction included.
    pub through: TxId,
    /// End header of that transaction.
    pub header: TransactionHeader,
    /// Journal CRC of that transaction.
    pub crc: u32,
    /// Images to copy, ascending by page number.
    pub pages: Vec<(PageNumber, JournalPage)>,
    /// First journal replay will need after the flush.
    pub replay_from: JournalNumber,
}

/// Journal counters for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct JournalStats {
    /// Live journal files.
    pub files: usize,
    /// Committed transactions not yet flushed.
    pub unflushed_transactions: usize,
    /// Pages in the translation table.
    pub translated_pages: usize,
    /// Last committed transaction.
    pub last_tx: TxId,
    /// Last flushed transaction.
    pub flushed_through: TxId,
    /// Write cursor.
    pub cursor: JournalCursor,
}

struct JournalState {
    files: BTreeMap<JournalNumber, Arc<JournalFile>>,
    files_view: Arc<BTreeMap<JournalNumber, Arc<JournalFile>>>,
    file_last_tx: BTreeMap<JournalNumber, TxId>,
    table: Arc<TranslationTable>,
    cursor: JournalCursor,
    last_tx: TxId,
    last_crc: u32,
    entries: VecDeque<EntryRecord>,
    flushed_through: TxId,
    bookmark: BackupBookmark,
}

impl JournalState {
    fn publish_files(&mut self) {
        self.files_view = Arc::new(self.files.clone());
    }
}

/// Ordered, append-only journal spread across numbered files.
pub struct Journal {
    store: JournalStore,
    options: JournalOptions,
    state: RwLock<JournalState>,
}

impl Journal {
    /// Empty journal that continues after `last_tx` with chain value `last_crc`.
    pub fn create(
        store: JournalStore,
        options: JournalOptions,
        cursor: JournalCursor,
        last_tx: TxId,
        last_crc: u32,
    ) -> Self {
        let state = JournalState {
            files: BTreeMap::new(),
            files_view: Arc::new(BTreeMap::new()),
            file_last_tx: BTreeMap::new(),
            table: Arc::new(TranslationTable::new()),
            cursor,
            last_tx,
            last_crc,
            entries: VecDeque::new(),
            flushed_through: last_tx,
            bookmark: BackupBookmark::default(),
        };
        Self {
            store,
            options,
            state: RwLock::new(state),
        }
    }

    pub(crate) fn from_recovery(
        store: JournalStore,
        options: JournalOptions,
        recovery: &Recovery,
        bookmark: BackupBookmark,
    ) -> Self {
        let mut state = JournalState {
            files: recovery.files.clone(),
            files_view: Arc::new(BTreeMap::new()),
            file_last_tx: recovery.file_last_tx.clone(),
            table: Arc::new(recovery.table.clone()),
            cursor: recovery.cursor,
            last_tx: recovery.last_tx,
            last_crc: recovery.last_crc,
            entries: recovery
                .entries
                .iter()
                .map(|entry| EntryRecord {
                    tx_id: entry.header.tx_id,
                    header: entry.header,
                    crc: entry.crc,
                    first_journal: entry.first_journal,
                })
                .collect(),
            flushed_through: recovery.start.after_tx,
            bookmark,
        };
        state.publish_files();
        Self {
            store,
            options,
            state: RwLock::new(state),
        }
    }

    /// Journal configuration.
    pub fn options(&self) -> &JournalOptions {
        &self.options
    }

    fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    /// Captures an immutable view of the committed journal.
    pub fn snapshot(&self) -> JournalSnapshot {
        let state = self.state.read();
        JournalSnapshot {
            table: Arc::clone(&state.table),
            files: Arc::clone(&state.files_view),
            last_tx: state.last_tx,
        }
    }

    /// Last committed transaction and its chain CRC.
    pub fn last_committed(&self) -> (TxId, u32) {
        let state = self.state.read();
        (state.last_tx, state.last_crc)
    }

    /// Starts a reservation for transaction `tx_id` at the committed cursor.
    pub fn transaction_begin(&self, tx_id: TxId) -> JournalTx {
        let state = self.state.read();
        let cursor = state.cursor;
        let capacity = state
            .files
            .get(&cursor.journal)
            .map(|file| file.capacity())
            .unwrap_or(self.options.file_pages)
            .max(self.options.file_pages);
        let segment = if cursor.position + 2 > capacity {
            PendingSegment {
                journal: cursor.journal.next(),
                header_pos: 0,
                used: 0,
                capacity: self.options.file_pages,
            }
        } else {
            PendingSegment {
                journal: cursor.journal,
                header_pos: cursor.position,
                used: 0,
                capacity,
            }
        };
        trace!(tx_id = tx_id.0, journal = %segment.journal, position = segment.header_pos, "journal.begin");
        JournalTx {
            tx_id,
            segments: vec![segment],
        }
    }

    /// Reserves journal space for `count` pages of `page`.
    ///
    /// A run that does not fit the current file starts a new segment in the
    /// next file. An empty segment is moved to the next file instead of being
    /// split; only a run larger than a whole file enlarges a file.
    pub fn allocate(&self, tx: &mut JournalTx, page: PageNumber, count: u32) -> Result<JournalPage> {
        if count == 0 {
            return Err(StorageError::Invalid("journal allocation of zero pages"));
        }
        let count64 = count as u64;
        let file_pages = self.options.file_pages;
        let segment = tx
            .segments
            .last_mut()
            .ok_or(StorageError::Invalid("journal reservation without segment"))?;
        if segment.next_free() + count64 > segment.capacity {
            if segment.used == 0 && segment.header_pos == 0 {
                segment.capacity = segment.next_free() + count64;
            } else if segment.used == 0 {
                segment.journal = segment.journal.next();
                segment.header_pos = 0;
                segment.capacity = file_pages.max(1 + count64);
                debug!(tx_id = tx.tx_id.0, journal = %segment.journal, "journal.allocate.rollover");
            } else {
                let journal = segment.journal.next();
                tx.segments.push(PendingSegment {
                    journal,
                    header_pos: 0,
                    used: 0,
                    capacity: file_pages.max(1 + count64),
                });
                debug!(tx_id = tx.tx_id.0, journal = %journal, "journal.allocate.split");
            }
        }
        let segment = tx
            .segments
            .last_mut()
            .ok_or(StorageError::Invalid("journal reservation without segment"))?;
        let slot = JournalPage {
            journal: segment.journal,
            position: segment.next_free(),
            tx_id: tx.tx_id,
            pages: count,
        };
        segment.used += count64;
        trace!(page = page.0, count, journal = %slot.journal, position = slot.position, "journal.allocate");
        Ok(slot)
    }

    fn file_for(&self, state: &JournalState, journal: JournalNumber, min_pages: u64) -> Result<Arc<JournalFile>> {
        if let Some(file) = state.files.get(&journal) {
            file.ensure_capacity(min_pages)?;
            return Ok(Arc::clone(file));
        }
        self.store.open(journal, self.page_size(), min_pages)
    }

    /// Persists the reserved entry and publishes its pages.
    pub fn transaction_commit(&self, tx: JournalTx, request: CommitRequest<'_>) -> Result<CommittedEntry> {
        let page_size = self.page_size();
        let mut state = self.state.write();
        if tx.tx_id != state.last_tx.next() {
            return Err(StorageError::InvalidOwned(format!(
                "transaction {} commits out of order after {}",
                tx.tx_id, state.last_tx
            )));
        }

        let mut per_segment: Vec<Vec<(JournalPage, &[u8])>> = vec![Vec::new(); tx.segments.len()];
        let mut numbered = Vec::with_capacity(request.pages.len());
        for (slot, image) in &request.pages {
            if image.len() != slot.pages as usize * page_size {
                return Err(StorageError::Invalid("page image does not match reservation"));
            }
            let index = tx
                .segments
                .iter()
                .position(|seg| {
                    seg.journal == slot.journal
                        && slot.position > seg.header_pos
                        && slot.position < seg.next_free()
                })
                .ok_or(StorageError::Invalid("page image outside the reservation"))?;
            numbered.push((PageHeader::decode(image)?.page_number, *slot));
            per_segment[index].push((*slot, *image));
        }

        let freed_bytes = encode_freed(request.freed, page_size);
        let last_page_number = PageNumber(request.next_page.0.saturating_sub(1));
        let segment_count = tx.segments.len();
        let mut previous_crc = state.last_crc;
        let mut touched = Vec::with_capacity(segment_count);
        let mut end_header = None;

        for (index, segment) in tx.segments.iter().enumerate() {
            let is_last = index + 1 == segment_count;
            let images = &mut per_segment[index];
            images.sort_by_key(|(slot, _)| slot.position);

            let mut payload: Vec<u8> = vec![0u8; segment.used as usize * page_size];
            for (slot, image) in images.iter() {
                let offset = (slot.position - segment.header_pos - 1) as usize * page_size;
                payload[offset..offset + image.len()].copy_from_slice(image);
            }
            let freed_count = if is_last { request.freed.len() as u32 } else { 0 };
            let mut header = TransactionHeader {
                tx_id: tx.tx_id,
                next_page_number: request.next_page,
                last_page_number,
                page_count: segment.used as u32,
                freed_count,
                crc: 0,
                previous_crc,
                marker: Marker::for_segment(index, segment_count),
                segment: index as u32,
                frees_released_through: request.frees_released_through,
                catalog: request.catalog,
                free_space: request.free_space,
            };
            let freed_slice: &[u8] = if is_last { &freed_bytes } else { &[] };
            let mut header_page = vec![0u8; page_size];
            header.encode(&mut header_page)?;
            header.crc = entry_crc(&header_page, &[payload.as_slice(), freed_slice]);
            header.encode(&mut header_page)?;

            let total = 1 + header.payload_pages(page_size);
            let file = self.file_for(&state, segment.journal, segment.capacity.max(segment.header_pos + total))?;
            file.write_pages(segment.header_pos + 1, &[payload.as_slice(), freed_slice])?;
            file.write_pages(segment.header_pos, &[&header_page])?;
            if self.options.synchronous == Synchronous::Full {
                file.sync()?;
            }
            previous_crc = header.crc;
            touched.push((file, segment.header_pos + total));
            end_header = Some(header);
        }

        if self.options.synchronous == Synchronous::Normal {
            for (file, _) in &touched {
                file.sync()?;
            }
        }

        let header = end_header.ok_or(StorageError::Invalid("journal entry without segments"))?;
        let table = Arc::make_mut(&mut state.table);
        for (page, slot) in numbered {
            table.insert(page, slot);
        }
        let mut files_changed = false;
        for (file, _) in &touched {
            if !state.files.contains_key(&file.number()) {
                state.files.insert(file.number(), Arc::clone(file));
                files_changed = true;
            }
            state.file_last_tx.insert(file.number(), tx.tx_id);
        }
        if files_changed {
            state.publish_files();
        }
        if let Some((file, end)) = touched.last() {
            state.cursor = JournalCursor {
                journal: file.number(),
                position: *end,
            };
        }
        state.last_tx = tx.tx_id;
        state.last_crc = header.crc;
        state.entries.push_back(EntryRecord {
            tx_id: tx.tx_id,
            header,
            crc: header.crc,
            first_journal: tx.segments[0].journal,
        });
        debug!(
            tx_id = tx.tx_id.0,
            pages = request.pages.len(),
            freed = request.freed.len(),
            segments = segment_count,
            "journal.commit.appended"
        );
        Ok(CommittedEntry {
            header,
            segments: segment_count,
        })
    }

    /// Picks every committed transaction up to `limit` for flushing.
    pub fn plan_flush(&self, limit: TxId) -> Option<FlushPlan> {
        let state = self.state.read();
        let last = state.entries.iter().take_while(|e| e.tx_id <= limit).last()?;
        let mut pages: Vec<(PageNumber, JournalPage)> = state
            .table
            .iter()
            .filter(|(_, slot)| slot.tx_id <= last.tx_id)
            .map(|(page, slot)| (*page, *slot))
            .collect();
        // Older runs first so a page reused inside a newer run is not
        // overwritten by a stale image.
        pages.sort_by_key(|(page, slot)| (slot.tx_id, *page));
        let replay_from = state
            .entries
            .iter()
            .find(|e| e.tx_id > last.tx_id)
            .map(|e| e.first_journal)
            .unwrap_or(state.cursor.journal);
        Some(FlushPlan {
            through: last.tx_id,
            header: last.header,
            crc: last.crc,
            pages,
            replay_from,
        })
    }

    /// Copies the planned images into the data file and syncs it.
    pub fn copy_to_data(&self, plan: &FlushPlan, pager: &Pager) -> Result<()> {
        let files = Arc::clone(&self.state.read().files_view);
        for (page, slot) in &plan.pages {
            let file = files
                .get(&slot.journal)
                .ok_or(StorageError::Corruption("flush source journal missing"))?;
            let image = file.read_pages(slot.position, slot.pages as u64)?;
            pager.ensure_continuous(*page, slot.pages)?;
            pager.write(*page, &image)?;
        }
        pager.sync()?;
        Ok(())
    }

    /// Drops flushed translations and retires files nothing needs anymore.
    pub fn finish_flush(&self, plan: &FlushPlan) {
        let mut state = self.state.write();
        while state
            .entries
            .front()
            .is_some_and(|entry| entry.tx_id <= plan.through)
        {
            state.entries.pop_front();
        }
        Arc::make_mut(&mut state.table).retain(|_, slot| slot.tx_id > plan.through);
        state.flushed_through = plan.through;
        self.retire_files(&mut state, plan.replay_from);
        info!(
            through = plan.through.0,
            pages = plan.pages.len(),
            "journal.flush.complete"
        );
    }

    fn retire_files(&self, state: &mut JournalState, replay_from: JournalNumber) {
        let bookmark = state.bookmark.tx_id;
        let flushed = state.flushed_through;
        let retain = self.options.retain_for_backup;
        let retired: Vec<JournalNumber> = state
            .files
            .keys()
            .copied()
            .filter(|number| *number < replay_from && *number < state.cursor.journal)
            .filter(|number| {
                let last = state.file_last_tx.get(number).copied().unwrap_or_default();
                last <= flushed && (!retain || last <= bookmark)
            })
            .collect();
        if retired.is_empty() {
            return;
        }
        for number in &retired {
            if let Some(file) = state.files.remove(number) {
                file.retire();
            }
            state.file_last_tx.remove(number);
        }
        state.publish_files();
    }

    /// Current incremental backup bookmark.
    pub fn backup_bookmark(&self) -> BackupBookmark {
        self.state.read().bookmark
    }

    /// Advances the incremental backup bookmark, retiring copied files.
    pub fn set_backup_bookmark(&self, bookmark: BackupBookmark, replay_from: JournalNumber) {
        let mut state = self.state.write();
        state.bookmark = bookmark;
        self.retire_files(&mut state, replay_from);
    }

    /// File the next replay would start from.
    pub fn replay_start(&self) -> JournalNumber {
        let state = self.state.read();
        state
            .entries
            .front()
            .map(|e| e.first_journal)
            .unwrap_or(state.cursor.journal)
    }

    /// Write cursor after the last committed entry.
    pub fn cursor(&self) -> JournalCursor {
        self.state.read().cursor
    }

    /// Live files, ascending.
    pub fn files(&self) -> Vec<Arc<JournalFile>> {
        self.state.read().files.values().cloned().collect()
    }

    /// Counters for diagnostics.
    pub fn stats(&self) -> JournalStats {
        let state = self.state.read();
        JournalStats {
            files: state.files.len(),
            unflushed_transactions: state.entries.len(),
            translated_pages: state.table.len(),
            last_tx: state.last_tx,
            flushed_through: state.flushed_through,
            cursor: state.cursor,
        }
    }

    /// Store the journal files live in.
    pub fn store(&self) -> &JournalStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{FileIo, MemoryIo};
    use crate::primitives::pager::PagerOptions;
    use crate::types::page::PageFlags;
    use tempfile::tempdir;

    const PAGE: usize = 1024;

    fn options(file_pages: u64) -> JournalOptions {
        JournalOptions {
            page_size: PAGE as u32,
            file_pages,
            synchronous: Synchronous::Full,
            retain_for_backup: false,
        }
    }

    fn image(page: u64, fill: u8) -> Vec<u8> {
        let mut buf = vec![fill; PAGE];
        PageHeader::single(PageNumber(page), PageFlags::default())
            .encode(&mut buf)
            .unwrap();
        buf
    }

    fn commit_pages(journal: &Journal, tx: u64, pages: &[(u64, u8)]) -> Result<CommittedEntry> {
        let mut jtx = journal.transaction_begin(TxId(tx));
        let mut owned = Vec::new();
        for (page, fill) in pages {
            let slot = journal.allocate(&mut jtx, PageNumber(*page), 1)?;
            owned.push((slot, image(*page, *fill)));
        }
        let request = CommitRequest {
            next_page: PageNumber(100),
            frees_released_through: TxId(0),
            catalog: CatalogHeader::default(),
            free_space: FreeSpaceHeader::default(),
            pages: owned.iter().map(|(s, i)| (*s, i.as_slice())).collect(),
            freed: &[],
        };
        journal.transaction_commit(jtx, request)
    }

    #[test]
    fn commit_publishes_translations() -> Result<()> {
        let journal = Journal::create(JournalStore::Memory, options(16), JournalCursor::default(), TxId(0), 0);
        let before = journal.snapshot();
        commit_pages(&journal, 1, &[(5, 1), (6, 2)])?;
        let after = journal.snapshot();
        assert!(before.lookup(PageNumber(5)).is_none());
        assert_eq!(after.read_page(PageNumber(6))?.unwrap()[PAGE - 1], 2);
        assert_eq!(after.last_tx(), TxId(1));
        Ok(())
    }

    #[test]
    fn disposed_reservation_is_rewound() -> Result<()> {
        let journal = Journal::create(JournalStore::Memory, options(16), JournalCursor::default(), TxId(0), 0);
        commit_pages(&journal, 1, &[(5, 1)])?;
        let cursor = journal.cursor();
        let mut abandoned = journal.transaction_begin(TxId(2));
        journal.allocate(&mut abandoned, PageNumber(7), 3)?;
        drop(abandoned);
        let retry = journal.transaction_begin(TxId(2));
        assert_eq!(retry.segments[0].header_pos, cursor.position);
        Ok(())
    }

    #[test]
    fn out_of_order_commit_is_rejected() -> Result<()> {
        let journal = Journal::create(JournalStore::Memory, options(16), JournalCursor::default(), TxId(0), 0);
        let err = commit_pages(&journal, 3, &[(5, 1)]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidOwned(_)));
        Ok(())
    }

    #[test]
    fn oversized_entry_splits_across_files() -> Result<()> {
        let journal = Journal::create(JournalStore::Memory, options(8), JournalCursor::default(), TxId(0), 0);
        let pages: Vec<(u64, u8)> = (10..22).map(|p| (p, p as u8)).collect();
        let entry = commit_pages(&journal, 1, &pages)?;
        assert!(entry.segments >= 2);
        assert_eq!(entry.header.marker, Marker::End);
        let snapshot = journal.snapshot();
        for (page, fill) in pages {
            assert_eq!(snapshot.read_page(PageNumber(page))?.unwrap()[PAGE - 1], fill);
        }
        assert!(journal.stats().files >= 2);
        Ok(())
    }

    #[test]
    fn flush_copies_and_retires() -> Result<()> {
        let dir = tempdir().unwrap();
        let journal = Journal::create(
            JournalStore::Directory(dir.path().to_path_buf()),
            options(8),
            JournalCursor::default(),
            TxId(0),
            0,
        );
        for tx in 1..=6u64 {
            commit_pages(&journal, tx, &[(10 + tx, tx as u8), (30, tx as u8)])?;
        }
        let files_before = journal.stats().files;
        assert!(files_before > 1);
        let reader = journal.snapshot();

        let io: Arc<dyn FileIo> = Arc::new(MemoryIo::new());
        let (pager, _) = Pager::create(io, PagerOptions {
            page_size: PAGE as u32,
            ..PagerOptions::default()
        })?;
        let plan = journal.plan_flush(TxId(6)).expect("entries to flush");
        assert_eq!(plan.through, TxId(6));
        journal.copy_to_data(&plan, &pager)?;
        journal.finish_flush(&plan);

        assert_eq!(pager.read(PageNumber(30))?[PAGE - 1], 6);
        assert!(journal.snapshot().lookup(PageNumber(30)).is_none());
        assert!(journal.stats().files < files_before);
        // The old snapshot still reads through its retired files.
        assert_eq!(reader.read_page(PageNumber(11))?.unwrap()[PAGE - 1], 1);
        Ok(())
    }
}
