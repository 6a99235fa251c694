//! MVCC transactions over the page store.
//!
//! A read transaction pins the committed state published at its start: the
//! journal snapshot, the pager generation and the catalog. The single write
//! transaction additionally owns the writer permit, the allocator buffer of
//! its parity and a journal reservation; its page images stay private until
//! [`Transaction::commit`] appends them to the journal.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::concurrency::WriterPermit;
use crate::primitives::pager::{CatalogHeader, FreeSpaceHeader, PagerState, FIRST_DATA_PAGE};
use crate::primitives::wal::{CommitRequest, JournalPage, JournalTx, ReceivedLog, ReceivedTransaction};
use crate::types::{
    page::{PageFlags, PageHeader, PAGE_HDR_LEN},
    PageNumber, Result, StorageError, TxId,
};

use super::catalog::{Catalog, TreeHeader};
use super::env::{load_catalog, load_free_space, read_committed, EnvInner, EnvState};
use super::freespace::{bitmap_pages_for, encode_bitmap_page};
use super::registry::ReaderToken;

struct WriteState {
    permit: WriterPermit,
    tx_id: TxId,
    journal_tx: JournalTx,
    dirty: BTreeMap<PageNumber, (JournalPage, Vec<u8>)>,
    freed: Vec<PageNumber>,
    next_page: PageNumber,
    catalog: Catalog,
    catalog_dirty: bool,
}

/// Writable view of a page inside the write transaction.
///
/// The page header is owned by the engine; callers write through
/// [`PageMut::payload_mut`].
pub struct PageMut<'t> {
    page: PageNumber,
    image: &'t mut Vec<u8>,
}

impl PageMut<'_> {
    /// Page number (first page of the run).
    pub fn number(&self) -> PageNumber {
        self.page
    }

    /// Whole image, header included.
    pub fn data(&self) -> &[u8] {
        &self.image[..]
    }

    /// Bytes after the page header.
    pub fn payload(&self) -> &[u8] {
        &self.image[PAGE_HDR_LEN..]
    }

    /// Mutable bytes after the page header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.image[PAGE_HDR_LEN..]
    }

    /// Pages in the run.
    pub fn page_count(&self, page_size: usize) -> usize {
        self.image.len() / page_size
    }
}

/// A read or write transaction.
///
/// Dropping a transaction without committing disposes it: nothing it did
/// becomes visible, and the pages it allocated return to the allocator.
pub struct Transaction {
    inner: Arc<EnvInner>,
    state: Arc<EnvState>,
    pager: Arc<PagerState>,
    token: Option<ReaderToken>,
    write: Option<WriteState>,
}

impl Transaction {
    pub(crate) fn begin(inner: Arc<EnvInner>, permit: Option<WriterPermit>) -> Result<Self> {
        let (token, state) = inner.registry.register(permit.is_some());
        let pager = inner.pager.state();
        let mut tx = Self {
            inner,
            state,
            pager,
            token: Some(token),
            write: None,
        };
        if let Some(permit) = permit {
            let tx_id = tx.state.last_tx.next();
            let (journal_last, _) = tx.inner.journal.last_committed();
            if journal_last != tx.state.last_tx {
                return Err(StorageError::InvalidOwned(format!(
                    "journal is at transaction {journal_last}, published state at {}",
                    tx.state.last_tx
                )));
            }
            tx.inner
                .free_space
                .lock()
                .set_buffer_for_transaction(tx_id)?;
            let journal_tx = tx.inner.journal.transaction_begin(tx_id);
            tx.write = Some(WriteState {
                permit,
                tx_id,
                journal_tx,
                dirty: BTreeMap::new(),
                freed: Vec::new(),
                next_page: tx.state.next_page,
                catalog: (*tx.state.catalog).clone(),
                catalog_dirty: false,
            });
            debug!(tx_id = tx_id.0, "transaction.begin_write");
        } else {
            trace!(snapshot = tx.state.last_tx.0, "transaction.begin_read");
        }
        Ok(tx)
    }

    /// Returns true for the write transaction.
    pub fn is_write(&self) -> bool {
        self.write.is_some()
    }

    /// Last committed transaction this one observes.
    pub fn snapshot(&self) -> TxId {
        self.state.last_tx
    }

    /// Id the write transaction commits as; `None` for readers.
    pub fn tx_id(&self) -> Option<TxId> {
        self.write.as_ref().map(|ws| ws.tx_id)
    }

    /// First page never handed out, as seen by this transaction.
    pub fn next_page(&self) -> PageNumber {
        self.write
            .as_ref()
            .map_or(self.state.next_page, |ws| ws.next_page)
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn write_state(&mut self) -> Result<&mut WriteState> {
        self.write
            .as_mut()
            .ok_or(StorageError::Invalid("write operation on a read transaction"))
    }

    fn check_page(&self, page: PageNumber) -> Result<()> {
        if page < FIRST_DATA_PAGE || page >= self.next_page() {
            return Err(StorageError::InvalidOwned(format!(
                "page {page} outside allocated range {FIRST_DATA_PAGE}..{}",
                self.next_page()
            )));
        }
        Ok(())
    }

    fn check_user_page(&self, page: PageNumber) -> Result<()> {
        self.check_page(page)?;
        let free_space = &self.state.free_space_header;
        let catalog = &self.state.catalog_header;
        let in_run = |first: PageNumber, count: u32| page >= first && page.0 < first.0 + count as u64;
        if in_run(free_space.first_page, free_space.page_count)
            || in_run(catalog.root_page, catalog.page_count)
        {
            return Err(StorageError::InvalidOwned(format!(
                "page {page} is managed by the engine"
            )));
        }
        Ok(())
    }

    /// First page of the live run `page` lies inside, when `page` is not a
    /// run start itself.
    fn enclosing_run(&self, page: PageNumber) -> Option<PageNumber> {
        let covers = |first: PageNumber, count: u32| first < page && page.0 < first.0 + count as u64;
        if let Some(ws) = &self.write {
            let staged = ws
                .dirty
                .iter()
                .find(|(first, (slot, _))| covers(**first, slot.pages));
            if let Some((first, _)) = staged {
                return Some(*first);
            }
        }
        let journaled = self
            .state
            .journal
            .pages()
            .find(|(first, slot)| covers(**first, slot.pages));
        if let Some((first, _)) = journaled {
            return Some(*first);
        }
        // Flushed runs: walk back to the nearest page carrying its own number.
        let mut candidate = page;
        while candidate > FIRST_DATA_PAGE {
            candidate = PageNumber(candidate.0 - 1);
            if self.state.journal.lookup(candidate).is_some() {
                return None;
            }
            let Ok(image) = self
                .pager
                .pointer(candidate, 1)
                .and_then(|ptr| self.pager.read_pointer(ptr))
            else {
                return None;
            };
            match PageHeader::decode(&image) {
                Ok(header) if header.page_number == candidate => {
                    let count = header.page_count(self.pager.page_size());
                    return covers(candidate, count).then_some(candidate);
                }
                _ => continue,
            }
        }
        None
    }

    fn read_image(&self, page: PageNumber) -> Result<Vec<u8>> {
        let image = read_committed(&self.state.journal, &self.pager, page);
        let numbered = image.as_ref().is_ok_and(|image| {
            PageHeader::decode(image).is_ok_and(|header| header.page_number == page)
        });
        if !numbered {
            if let Some(first) = self.enclosing_run(page) {
                return Err(StorageError::InvalidOwned(format!(
                    "page {page} is inside the overflow run starting at {first}"
                )));
            }
        }
        let image = image?;
        let header = PageHeader::decode(&image)?;
        if header.page_number != page {
            return Err(StorageError::CorruptionOwned(format!(
                "page {page} carries number {}",
                header.page_number
            )));
        }
        Ok(image)
    }

    /// Reads `page` (or its whole overflow run) as this transaction sees it.
    pub fn read_page(&self, page: PageNumber) -> Result<Vec<u8>> {
        self.check_page(page)?;
        if let Some(ws) = &self.write {
            if ws.freed.contains(&page) {
                return Err(StorageError::InvalidOwned(format!(
                    "page {page} was freed by this transaction"
                )));
            }
            if let Some((_, image)) = ws.dirty.get(&page) {
                return Ok(image.clone());
            }
        }
        self.read_image(page)
    }

    /// Shadow copy of `page` for modification.
    ///
    /// The first call copies the committed image and reserves its journal
    /// slot; later calls return the same copy.
    pub fn modify_page(&mut self, page: PageNumber) -> Result<PageMut<'_>> {
        self.check_user_page(page)?;
        let ws = self.write_state()?;
        if ws.freed.contains(&page) {
            return Err(StorageError::InvalidOwned(format!(
                "page {page} was freed by this transaction"
            )));
        }
        let copied = if ws.dirty.contains_key(&page) {
            None
        } else {
            Some(self.read_image(page)?)
        };
        let page_size = self.inner.page_size();
        let inner = Arc::clone(&self.inner);
        let ws = self.write_state()?;
        if let Some(image) = copied {
            let count = PageHeader::decode(&image)?.page_count(page_size);
            let slot = inner.journal.allocate(&mut ws.journal_tx, page, count)?;
            ws.dirty.insert(page, (slot, image));
            trace!(page = page.0, count, "transaction.page.shadowed");
        }
        let (_, image) = ws
            .dirty
            .get_mut(&page)
            .ok_or(StorageError::Invalid("shadow copy missing"))?;
        Ok(PageMut { page, image })
    }

    fn reserve_run(&mut self, count: u32) -> Result<PageNumber> {
        let inner = Arc::clone(&self.inner);
        let ws = self.write_state()?;
        let mut free_space = inner.free_space.lock();
        if let Some(page) = free_space.allocate(ws.tx_id, count as u64)? {
            return Ok(page);
        }
        let page = ws.next_page;
        ws.next_page = page.offset(count as u64);
        free_space.current(ws.tx_id).resize(ws.next_page.0);
        Ok(page)
    }

    /// Allocates a run of `count` pages, reusing free pages first and
    /// growing the address space otherwise. The run starts zeroed.
    pub fn allocate_page(&mut self, count: u32) -> Result<PageMut<'_>> {
        if count == 0 {
            return Err(StorageError::Invalid("allocation of zero pages"));
        }
        self.write_state()?;
        let page = self.reserve_run(count)?;
        let page_size = self.inner.page_size();
        let header = if count == 1 {
            PageHeader::single(page, PageFlags::default())
        } else {
            PageHeader::overflow(page, count, page_size)
        };
        let mut image = vec![0u8; count as usize * page_size];
        header.encode(&mut image)?;
        let inner = Arc::clone(&self.inner);
        let ws = self.write_state()?;
        let slot = inner.journal.allocate(&mut ws.journal_tx, page, count)?;
        ws.dirty.insert(page, (slot, image));
        trace!(page = page.0, count, "transaction.page.allocated");
        let (_, image) = ws
            .dirty
            .get_mut(&page)
            .ok_or(StorageError::Invalid("allocated page missing"))?;
        Ok(PageMut { page, image })
    }

    /// Frees `page` and the rest of its run.
    ///
    /// The pages return to the allocator once no reader that could still
    /// see them remains.
    pub fn free_page(&mut self, page: PageNumber) -> Result<()> {
        self.check_user_page(page)?;
        let page_size = self.inner.page_size();
        let ws = self.write_state()?;
        if ws.freed.contains(&page) {
            return Err(StorageError::InvalidOwned(format!("page {page} freed twice")));
        }
        let staged = match ws.dirty.get(&page) {
            Some((_, image)) => Some(PageHeader::decode(image)?.page_count(page_size)),
            None => None,
        };
        let count = match staged {
            Some(count) => count,
            None => PageHeader::decode(&self.read_image(page)?)?.page_count(page_size),
        };
        let inner = Arc::clone(&self.inner);
        let ws = self.write_state()?;
        {
            let mut free_space = inner.free_space.lock();
            let deferred = inner.deferred.lock();
            let buffer = free_space.current(ws.tx_id);
            for offset in 0..count as u64 {
                let candidate = page.offset(offset);
                if buffer.is_free(candidate)
                    || deferred.contains(candidate)
                    || ws.freed.contains(&candidate)
                {
                    return Err(StorageError::InvalidOwned(format!(
                        "page {candidate} is already free"
                    )));
                }
            }
        }
        ws.dirty.remove(&page);
        ws.freed.extend((0..count as u64).map(|offset| page.offset(offset)));
        trace!(page = page.0, count, "transaction.page.freed");
        Ok(())
    }

    fn catalog(&self) -> &Catalog {
        match &self.write {
            Some(ws) => &ws.catalog,
            None => &self.state.catalog,
        }
    }

    /// Root catalog as this transaction sees it.
    pub fn root(&self) -> &Catalog {
        self.catalog()
    }

    /// Header of tree `name`.
    pub fn get_tree(&self, name: &str) -> Result<TreeHeader> {
        self.catalog().get(name).copied().ok_or(StorageError::NotFound)
    }

    /// Trees ordered by name.
    pub fn trees(&self) -> Vec<(String, TreeHeader)> {
        self.catalog()
            .iter()
            .map(|(name, header)| (name.to_owned(), *header))
            .collect()
    }

    /// Creates tree `name` with a freshly allocated root page.
    pub fn create_tree(&mut self, name: &str) -> Result<TreeHeader> {
        if name.is_empty() {
            return Err(StorageError::Invalid("tree name is empty"));
        }
        if self.write_state()?.catalog.get(name).is_some() {
            return Err(StorageError::InvalidOwned(format!("tree {name} already exists")));
        }
        let root_page = self.allocate_page(1)?.number();
        let header = TreeHeader {
            root_page,
            leaf_pages: 1,
            ..TreeHeader::default()
        };
        let ws = self.write_state()?;
        ws.catalog.insert(name, header);
        ws.catalog_dirty = true;
        debug!(tree = name, root = root_page.0, "transaction.tree.created");
        Ok(header)
    }

    /// Replaces the header of an existing tree.
    pub fn set_tree_header(&mut self, name: &str, header: TreeHeader) -> Result<()> {
        let ws = self.write_state()?;
        if ws.catalog.get(name).is_none() {
            return Err(StorageError::NotFound);
        }
        ws.catalog.insert(name, header);
        ws.catalog_dirty = true;
        Ok(())
    }

    /// Removes tree `name` from the catalog and returns its last header.
    /// The pages of the tree, root included, remain the caller's to free.
    pub fn delete_tree(&mut self, name: &str) -> Result<TreeHeader> {
        let ws = self.write_state()?;
        let header = ws.catalog.remove(name).ok_or(StorageError::NotFound)?;
        ws.catalog_dirty = true;
        debug!(tree = name, "transaction.tree.deleted");
        Ok(header)
    }

    fn stage(
        ws: &mut WriteState,
        inner: &EnvInner,
        page: PageNumber,
        count: u32,
        image: Vec<u8>,
    ) -> Result<()> {
        let slot = match ws.dirty.get(&page) {
            Some((slot, _)) if slot.pages == count => *slot,
            _ => inner.journal.allocate(&mut ws.journal_tx, page, count)?,
        };
        ws.dirty.insert(page, (slot, image));
        Ok(())
    }

    fn stage_catalog(&mut self) -> Result<CatalogHeader> {
        let mut header = self.state.catalog_header;
        let page_size = self.inner.page_size();
        let (dirty, needed) = {
            let ws = self.write_state()?;
            (ws.catalog_dirty, ws.catalog.pages_needed(page_size))
        };
        if !dirty {
            return Ok(header);
        }
        if needed > header.page_count {
            let old = header;
            header.root_page = self.reserve_run(needed)?;
            header.page_count = needed;
            let ws = self.write_state()?;
            ws.freed
                .extend((0..old.page_count as u64).map(|offset| old.root_page.offset(offset)));
            debug!(
                from = old.root_page.0,
                to = header.root_page.0,
                pages = needed,
                "transaction.catalog.relocated"
            );
        }
        let inner = Arc::clone(&self.inner);
        let ws = self.write_state()?;
        header.tree_count = ws.catalog.len() as u32;
        let image = ws.catalog.to_pages(header.root_page, header.page_count, page_size)?;
        Self::stage(ws, &inner, header.root_page, header.page_count, image)?;
        Ok(header)
    }

    /// Returns released pages to the bitmap, relocates the bitmap when the
    /// address space outgrew it and stages the touched bitmap pages.
    fn stage_free_space(&mut self) -> Result<(FreeSpaceHeader, Option<TxId>, TxId)> {
        let page_size = self.inner.page_size();
        let inner = Arc::clone(&self.inner);
        let oldest = inner.registry.oldest_snapshot();
        let mut run = self.state.free_space_header;

        let (released_upto, released_through) = {
            let ws = self.write_state()?;
            let mut free_space = inner.free_space.lock();
            let deferred = inner.deferred.lock();
            let releasable = deferred.releasable(oldest);
            let buffer = free_space.current(ws.tx_id);
            for (_, pages) in &releasable {
                for page in pages.iter() {
                    buffer.set_free(*page)?;
                }
            }
            let upto = releasable.last().map(|(tx, _)| *tx);
            let previous = deferred.released_through();
            if let Some(tx) = upto {
                let released: usize = releasable.iter().map(|(_, pages)| pages.len()).sum();
                debug!(through = tx.0, released, "transaction.frees.released");
            }
            (upto, upto.map_or(previous, |tx| tx.max(previous)))
        };

        let tracked = self.write_state()?.next_page.0;
        let relocate = bitmap_pages_for(tracked, page_size) > run.page_count;
        if relocate {
            let old = run;
            let count = bitmap_pages_for(tracked, page_size) * 2;
            run.first_page = self.reserve_run(count)?;
            run.page_count = count;
            let ws = self.write_state()?;
            ws.freed
                .extend((0..old.page_count as u64).map(|offset| old.first_page.offset(offset)));
            debug!(
                from = old.first_page.0,
                to = run.first_page.0,
                pages = count,
                "transaction.free_space.relocated"
            );
        }

        let ws = self.write_state()?;
        let mut images = Vec::new();
        let header = {
            let mut free_space = inner.free_space.lock();
            free_space.current(ws.tx_id).resize(ws.next_page.0);
            let indexes: Vec<u32> = if relocate {
                (0..run.page_count).collect()
            } else {
                free_space.touched_pages(ws.tx_id)
            };
            for index in indexes {
                let page = run.first_page.offset(index as u64);
                let words = free_space.current(ws.tx_id).words();
                images.push((page, encode_bitmap_page(words, index, page, page_size)?));
            }
            let mut header = free_space.header_for(ws.tx_id, run.first_page);
            header.page_count = run.page_count;
            header
        };
        for (page, image) in images {
            Self::stage(ws, &inner, page, 1, image)?;
        }
        Ok((header, released_upto, released_through))
    }

    fn publish(
        &self,
        tx_id: TxId,
        next_page: PageNumber,
        catalog: Arc<Catalog>,
        catalog_header: CatalogHeader,
        free_space_header: FreeSpaceHeader,
    ) {
        let state = EnvState {
            last_tx: tx_id,
            next_page,
            catalog,
            catalog_header,
            free_space_header,
            journal: self.inner.journal.snapshot(),
        };
        self.inner.registry.publish(Arc::new(state), tx_id);
    }

    /// Makes every change durable and visible, then releases the writer.
    pub fn commit(mut self) -> Result<TxId> {
        if self.write.is_none() {
            return Err(StorageError::Invalid("commit on a read transaction"));
        }
        let catalog_header = self.stage_catalog()?;
        let (free_space_header, released_upto, released_through) = self.stage_free_space()?;

        let ws = self
            .write
            .take()
            .ok_or(StorageError::Invalid("commit on a read transaction"))?;
        let WriteState {
            permit,
            tx_id,
            journal_tx,
            dirty,
            freed,
            next_page,
            catalog,
            catalog_dirty,
        } = ws;
        let journal_before = self.inner.journal.cursor().journal;
        let pages: Vec<(JournalPage, &[u8])> = dirty
            .values()
            .map(|(slot, image)| (*slot, image.as_slice()))
            .collect();
        self.inner.journal.transaction_commit(
            journal_tx,
            CommitRequest {
                next_page,
                frees_released_through: released_through,
                catalog: catalog_header,
                free_space: free_space_header,
                pages,
                freed: &freed,
            },
        )?;

        {
            let mut free_space = self.inner.free_space.lock();
            let mut deferred = self.inner.deferred.lock();
            if let Some(tx) = released_upto {
                deferred.release_through(tx);
            }
            deferred.register(tx_id, freed.clone());
            free_space.finish_commit(tx_id);
        }
        let catalog = if catalog_dirty {
            Arc::new(catalog)
        } else {
            Arc::clone(&self.state.catalog)
        };
        self.publish(
            tx_id,
            next_page,
            catalog,
            catalog_header,
            free_space_header,
        );
        drop(permit);
        debug!(
            tx_id = tx_id.0,
            pages = dirty.len(),
            freed = freed.len(),
            next_page = next_page.0,
            "transaction.commit"
        );
        if self.inner.journal.cursor().journal != journal_before {
            self.inner.signal_flush();
        }
        Ok(tx_id)
    }

    /// Commits a transaction received from a primary, reproducing its page
    /// images, frees and header values under the same id.
    pub(crate) fn commit_shipped(
        mut self,
        log: &ReceivedLog,
        received: &ReceivedTransaction,
    ) -> Result<TxId> {
        let inner = Arc::clone(&self.inner);
        let ws = self.write_state()?;
        let header = received.header;
        if header.tx_id != ws.tx_id {
            return Err(StorageError::InvalidOwned(format!(
                "replica expects transaction {}, received {}",
                ws.tx_id, header.tx_id
            )));
        }
        for (page, slot) in &received.pages {
            let image = log.read_image(slot)?;
            Self::stage(ws, &inner, *page, slot.pages, image)?;
        }
        let ws = self
            .write
            .take()
            .ok_or(StorageError::Invalid("commit on a read transaction"))?;
        // Everything that can reject the entry runs before it becomes
        // durable, so a bad entry leaves the replica at its last state.
        let (catalog, free_space) = {
            let read = |page: PageNumber| match ws.dirty.get(&page) {
                Some((_, image)) => Ok(image.clone()),
                None => read_committed(&self.state.journal, &self.pager, page),
            };
            (
                load_catalog(read, &header.catalog)?,
                load_free_space(read, &header.free_space, header.tx_id, inner.page_size())?,
            )
        };
        let pages: Vec<(JournalPage, &[u8])> = ws
            .dirty
            .values()
            .map(|(slot, image)| (*slot, image.as_slice()))
            .collect();
        inner.journal.transaction_commit(
            ws.journal_tx,
            CommitRequest {
                next_page: header.next_page_number,
                frees_released_through: header.frees_released_through,
                catalog: header.catalog,
                free_space: header.free_space,
                pages,
                freed: &received.freed,
            },
        )?;

        {
            let mut current = inner.free_space.lock();
            let mut deferred = inner.deferred.lock();
            deferred.release_through(header.frees_released_through);
            deferred.register(header.tx_id, received.freed.clone());
            *current = free_space;
        }
        self.pager = inner.pager.state();
        self.publish(
            header.tx_id,
            header.next_page_number,
            Arc::new(catalog),
            header.catalog,
            header.free_space,
        );
        drop(ws.permit);
        debug!(tx_id = header.tx_id.0, pages = received.pages.len(), "transaction.commit_shipped");
        Ok(header.tx_id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(ws) = self.write.take() {
            debug!(
                tx_id = ws.tx_id.0,
                dirty = ws.dirty.len(),
                freed = ws.freed.len(),
                "transaction.disposed"
            );
        }
        if let Some(token) = self.token.take() {
            self.inner.registry.release(token);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("snapshot", &self.state.last_tx)
            .field("write", &self.tx_id())
            .finish()
    }
}
