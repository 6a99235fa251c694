//! Double-buffered free-space bitmap.
//!
//! Bit `p` is set when page `p` is free. Two buffers alternate by writer
//! parity: the writer of transaction `t` mutates `buffers[t % 2]` while the
//! other buffer still holds the state committed by `t - 1`. Each buffer
//! records which 64-bit words it changed so the next writer only has to copy
//! those words across.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::primitives::pager::FreeSpaceHeader;
use crate::types::{
    crc32_of, page::PageFlags, page::PageHeader, page::PAGE_HDR_LEN, read_u64, write_u64,
    PageNumber, Result, StorageError, TxId,
};

const WORD_BITS: u64 = 64;

fn word_count(tracked: u64) -> usize {
    tracked.div_ceil(WORD_BITS) as usize
}

/// Words of bitmap stored in one page.
pub fn words_per_page(page_size: usize) -> usize {
    (page_size - PAGE_HDR_LEN) / 8
}

/// Pages tracked by one bitmap page.
pub fn bits_per_page(page_size: usize) -> u64 {
    words_per_page(page_size) as u64 * WORD_BITS
}

/// Bitmap pages needed to track `tracked` pages.
pub fn bitmap_pages_for(tracked: u64, page_size: usize) -> u32 {
    tracked.div_ceil(bits_per_page(page_size)).max(1) as u32
}

/// Checksum persisted with the bitmap.
pub fn checksum_words(words: &[u64]) -> u32 {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    crc32_of(&[&bytes])
}

/// One of the two bitmaps.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BitmapBuffer {
    words: Vec<u64>,
    modified: Vec<u64>,
    tracked: u64,
    dirty: bool,
}

impl BitmapBuffer {
    /// Bitmap tracking `tracked` pages, all busy.
    pub fn new(tracked: u64) -> Self {
        let mut buffer = Self::default();
        buffer.resize(tracked);
        buffer
    }

    /// Bitmap over existing words. Bits at or past `tracked` are cleared.
    pub fn from_words(mut words: Vec<u64>, tracked: u64) -> Self {
        words.resize(word_count(tracked), 0);
        if tracked % WORD_BITS != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << (tracked % WORD_BITS)) - 1;
            }
        }
        let modified = vec![0; words.len().div_ceil(WORD_BITS as usize)];
        Self {
            words,
            modified,
            tracked,
            dirty: false,
        }
    }

    /// Pages covered by the bitmap.
    pub fn tracked(&self) -> u64 {
        self.tracked
    }

    /// Raw words.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Returns true while a writer owns uncommitted changes in this buffer.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Extends tracking to `tracked` pages; new pages are busy.
    pub fn resize(&mut self, tracked: u64) {
        if tracked <= self.tracked {
            return;
        }
        self.tracked = tracked;
        self.words.resize(word_count(tracked), 0);
        self.modified
            .resize(self.words.len().div_ceil(WORD_BITS as usize), 0);
    }

    fn touch(&mut self, word: usize) {
        self.modified[word / WORD_BITS as usize] |= 1u64 << (word % WORD_BITS as usize);
    }

    fn check(&self, page: PageNumber) -> Result<(usize, u64)> {
        if page.0 >= self.tracked {
            return Err(StorageError::InvalidOwned(format!(
                "page {page} outside tracked range of {} pages",
                self.tracked
            )));
        }
        Ok(((page.0 / WORD_BITS) as usize, 1u64 << (page.0 % WORD_BITS)))
    }

    /// Returns true when `page` is free.
    pub fn is_free(&self, page: PageNumber) -> bool {
        match self.check(page) {
            Ok((word, mask)) => self.words[word] & mask != 0,
            Err(_) => false,
        }
    }

    /// Marks `page` free.
    pub fn set_free(&mut self, page: PageNumber) -> Result<()> {
        let (word, mask) = self.check(page)?;
        self.words[word] |= mask;
        self.touch(word);
        Ok(())
    }

    /// Marks `count` pages starting at `page` busy.
    pub fn set_busy(&mut self, page: PageNumber, count: u64) -> Result<()> {
        for offset in 0..count {
            let (word, mask) = self.check(page.offset(offset))?;
            self.words[word] &= !mask;
            self.touch(word);
        }
        Ok(())
    }

    /// Free pages.
    pub fn free_count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Free pages, ascending.
    pub fn free_pages(&self) -> Vec<PageNumber> {
        (0..self.tracked)
            .map(PageNumber)
            .filter(|page| self.is_free(*page))
            .collect()
    }

    /// Checksum over the words.
    pub fn checksum(&self) -> u32 {
        checksum_words(&self.words)
    }

    /// Indexes of words changed since the buffer was handed to its writer.
    pub fn modified_words(&self) -> impl Iterator<Item = usize> + '_ {
        self.modified
            .iter()
            .enumerate()
            .flat_map(|(idx, bits)| {
                (0..WORD_BITS as usize)
                    .filter(move |bit| bits & (1u64 << bit) != 0)
                    .map(move |bit| idx * WORD_BITS as usize + bit)
            })
            .filter(|word| *word < self.words.len())
    }

    fn clear_modified(&mut self) {
        self.modified.iter_mut().for_each(|bits| *bits = 0);
    }

    fn scan(&self, from: u64, start_limit: u64, count: u64) -> Option<u64> {
        let mut run_start = from;
        let mut run_len = 0u64;
        let mut page = from;
        while page < self.tracked {
            if run_len == 0 && page >= start_limit {
                return None;
            }
            let word = self.words[(page / WORD_BITS) as usize];
            if word == 0 && page % WORD_BITS == 0 {
                run_len = 0;
                page += WORD_BITS;
                continue;
            }
            if word & (1u64 << (page % WORD_BITS)) != 0 {
                if run_len == 0 {
                    run_start = page;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
            page += 1;
        }
        None
    }

    /// First run of `count` free pages at or after `position`, else the
    /// first run starting before it. Runs never wrap past the tracked end.
    pub fn find(&self, count: u64, position: u64) -> Option<PageNumber> {
        if count == 0 {
            return None;
        }
        let position = position.min(self.tracked);
        self.scan(position, self.tracked, count)
            .or_else(|| self.scan(0, position, count))
            .map(PageNumber)
    }
}

/// Both bitmaps plus the allocation cursor.
#[derive(Debug)]
pub struct FreeSpace {
    buffers: [BitmapBuffer; 2],
    last_tx: TxId,
    search_position: u64,
    page_size: usize,
}

impl FreeSpace {
    /// Allocator whose two buffers both hold `committed`.
    pub fn new(committed: BitmapBuffer, last_tx: TxId, search_position: u64, page_size: usize) -> Self {
        Self {
            buffers: [committed.clone(), committed],
            last_tx,
            search_position,
            page_size,
        }
    }

    /// Rebuilds the allocator from persisted bitmap page images.
    pub fn load(
        images: &[Vec<u8>],
        header: &FreeSpaceHeader,
        last_tx: TxId,
        page_size: usize,
    ) -> Result<Self> {
        let words = decode_bitmap_pages(images, header.tracked, page_size)?;
        if checksum_words(&words) != header.checksum {
            return Err(StorageError::Corruption("free-space bitmap checksum mismatch"));
        }
        let buffer = BitmapBuffer::from_words(words, header.tracked);
        debug!(
            tracked = header.tracked,
            free = buffer.free_count(),
            "free_space.load"
        );
        Ok(Self::new(buffer, last_tx, header.search_position, page_size))
    }

    /// Prepares the buffer of `tx`'s parity for its writer.
    ///
    /// A clean buffer catches up by copying the words the other buffer
    /// changed; a buffer left dirty by an abandoned writer is rebuilt from
    /// the other one.
    pub fn set_buffer_for_transaction(&mut self, tx: TxId) -> Result<()> {
        let selected = tx.parity();
        let other = 1 - selected;
        if self.buffers[selected].dirty && self.buffers[other].dirty {
            return Err(StorageError::Corruption("both free-space buffers are dirty"));
        }
        let (first, second) = self.buffers.split_at_mut(1);
        let (target, source) = if selected == 0 {
            (&mut first[0], &second[0])
        } else {
            (&mut second[0], &first[0])
        };
        if target.dirty {
            target.words = source.words.clone();
            target.modified = vec![0; source.modified.len()];
            target.tracked = source.tracked;
            info!(tx_id = tx.0, "free_space.buffer.rebuilt");
        } else {
            target.resize(source.tracked);
            let changed: Vec<usize> = source.modified_words().collect();
            for word in &changed {
                target.words[*word] = source.words[*word];
            }
            debug!(tx_id = tx.0, words = changed.len(), "free_space.buffer.merged");
        }
        target.clear_modified();
        target.dirty = true;
        Ok(())
    }

    /// Buffer owned by the writer of `tx`.
    pub fn current(&mut self, tx: TxId) -> &mut BitmapBuffer {
        &mut self.buffers[tx.parity()]
    }

    /// Buffer holding the last committed state.
    pub fn committed(&self) -> &BitmapBuffer {
        &self.buffers[self.last_tx.parity()]
    }

    /// Marks the writer's buffer committed.
    pub fn finish_commit(&mut self, tx: TxId) {
        self.buffers[tx.parity()].dirty = false;
        self.last_tx = tx;
    }

    /// Last committed transaction.
    pub fn last_tx(&self) -> TxId {
        self.last_tx
    }

    /// Allocation cursor.
    pub fn search_position(&self) -> u64 {
        self.search_position
    }

    /// Finds and marks busy `count` free pages in the writer's buffer.
    pub fn allocate(&mut self, tx: TxId, count: u64) -> Result<Option<PageNumber>> {
        let position = self.search_position;
        let buffer = &mut self.buffers[tx.parity()];
        let Some(page) = buffer.find(count, position) else {
            return Ok(None);
        };
        buffer.set_busy(page, count)?;
        self.search_position = page.0 + count;
        Ok(Some(page))
    }

    /// Header describing the writer's buffer stored at `first_page`.
    pub fn header_for(&self, tx: TxId, first_page: PageNumber) -> FreeSpaceHeader {
        let buffer = &self.buffers[tx.parity()];
        FreeSpaceHeader {
            first_page,
            page_count: bitmap_pages_for(buffer.tracked, self.page_size),
            tracked: buffer.tracked,
            search_position: self.search_position,
            checksum: buffer.checksum(),
        }
    }

    /// Bitmap pages the writer of `tx` changed, as indexes into the run.
    pub fn touched_pages(&self, tx: TxId) -> Vec<u32> {
        let per_page = words_per_page(self.page_size);
        let mut pages: Vec<u32> = self.buffers[tx.parity()]
            .modified_words()
            .map(|word| (word / per_page) as u32)
            .collect();
        pages.dedup();
        pages
    }
}

/// Page image of bitmap page `index`.
pub fn encode_bitmap_page(words: &[u64], index: u32, page: PageNumber, page_size: usize) -> Result<Vec<u8>> {
    let per_page = words_per_page(page_size);
    let mut image = vec![0u8; page_size];
    PageHeader::single(page, PageFlags::FREE_SPACE).encode(&mut image)?;
    let start = index as usize * per_page;
    let end = (start + per_page).min(words.len());
    for (slot, word) in words.get(start..end).unwrap_or(&[]).iter().enumerate() {
        write_u64(&mut image, PAGE_HDR_LEN + slot * 8, *word);
    }
    Ok(image)
}

/// Words stored in consecutive bitmap page images.
pub fn decode_bitmap_pages(images: &[Vec<u8>], tracked: u64, page_size: usize) -> Result<Vec<u64>> {
    let needed = word_count(tracked);
    let per_page = words_per_page(page_size);
    if images.len() * per_page < needed {
        return Err(StorageError::Corruption("free-space bitmap shorter than tracked range"));
    }
    let mut words = Vec::with_capacity(needed);
    for image in images {
        let header = PageHeader::decode(image)?;
        if !header.flags.contains(PageFlags::FREE_SPACE) {
            return Err(StorageError::Corruption("free-space page has wrong flags"));
        }
        for slot in 0..per_page {
            if words.len() == needed {
                break;
            }
            words.push(read_u64(image, PAGE_HDR_LEN + slot * 8));
        }
    }
    Ok(words)
}

/// Pages freed by committed transactions that readers may still see.
///
/// Pages freed by transaction `t` return to the bitmap only once no reader
/// holds a snapshot older than `t`, and always in transaction order.
#[derive(Clone, Debug, Default)]
pub struct DeferredFrees {
    pending: BTreeMap<TxId, Vec<PageNumber>>,
    released_through: TxId,
}

impl DeferredFrees {
    /// Empty set continuing after `released_through`.
    pub fn new(released_through: TxId) -> Self {
        Self {
            pending: BTreeMap::new(),
            released_through,
        }
    }

    /// Records the pages freed by `tx`.
    pub fn register(&mut self, tx: TxId, pages: Vec<PageNumber>) {
        if !pages.is_empty() {
            self.pending.insert(tx, pages);
        }
    }

    /// Transactions whose frees may be released given the oldest reader
    /// snapshot, ascending.
    pub fn releasable(&self, oldest_snapshot: Option<TxId>) -> Vec<(TxId, &[PageNumber])> {
        self.pending
            .iter()
            .take_while(|(tx, _)| oldest_snapshot.map_or(true, |oldest| **tx <= oldest))
            .map(|(tx, pages)| (*tx, pages.as_slice()))
            .collect()
    }

    /// Forgets every transaction up to `tx`.
    pub fn release_through(&mut self, tx: TxId) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > tx {
                break;
            }
            entry.remove();
        }
        self.released_through = self.released_through.max(tx);
    }

    /// Highest transaction whose frees were released.
    pub fn released_through(&self) -> TxId {
        self.released_through
    }

    /// Oldest transaction with unreleased frees.
    pub fn first_pending(&self) -> Option<TxId> {
        self.pending.keys().next().copied()
    }

    /// Returns true when `page` waits for release.
    pub fn contains(&self, page: PageNumber) -> bool {
        self.pending.values().any(|pages| pages.contains(&page))
    }

    /// Pages waiting for release.
    pub fn pages(&self) -> impl Iterator<Item = PageNumber> + '_ {
        self.pending.values().flatten().copied()
    }

    /// Number of pages waiting for release.
    pub fn page_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
