use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::file::{JournalFile, JournalStore};
use super::header::{decode_freed, entry_crc, TransactionHeader};
use super::{JournalCursor, JournalOptions, JournalPage, TranslationTable};
use crate::primitives::pager::HEADER_SLOTS;
use crate::types::{
    page::PageHeader, JournalNumber, PageNumber, Result, StorageError, TxId,
};

/// Where replay starts, taken from the data file header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryStart {
    /// First journal that may hold unflushed entries.
    pub journal: JournalNumber,
    /// Last transaction already in the data file.
    pub after_tx: TxId,
    /// Journal CRC of that transaction.
    pub previous_crc: u32,
}

/// A transaction rebuilt from the journal.
#[derive(Clone, Debug)]
pub struct RecoveredEntry {
    /// Header of the last segment.
    pub header: TransactionHeader,
    /// CRC of the last segment.
    pub crc: u32,
    /// File holding the first segment.
    pub first_journal: JournalNumber,
    /// Pages the transaction freed.
    pub freed: Vec<PageNumber>,
}

/// Outcome of replaying the journal on open.
#[derive(Debug)]
pub struct Recovery {
    /// Starting point used.
    pub start: RecoveryStart,
    /// Live files, including ones kept only for backup.
    pub files: BTreeMap<JournalNumber, Arc<JournalFile>>,
    /// Highest transaction with a segment in each file.
    pub file_last_tx: BTreeMap<JournalNumber, TxId>,
    /// Rebuilt translation table.
    pub table: TranslationTable,
    /// Position after the last valid entry.
    pub cursor: JournalCursor,
    /// Last replayed transaction (or `start.after_tx`).
    pub last_tx: TxId,
    /// Chain CRC after the last replayed transaction.
    pub last_crc: u32,
    /// Replayed transactions, ascending.
    pub entries: Vec<RecoveredEntry>,
    /// Whether an incomplete tail entry was discarded.
    pub discarded_tail: bool,
}

pub(crate) struct RawSegment {
    pub(crate) index: usize,
    pub(crate) journal: JournalNumber,
    pub(crate) position: u64,
    pub(crate) header: TransactionHeader,
    pub(crate) payload: Vec<u8>,
    pub(crate) crc_ok: bool,
}

impl RawSegment {
    pub(crate) fn end_position(&self, page_size: usize) -> u64 {
        self.position + 1 + self.header.payload_pages(page_size)
    }
}

pub(crate) enum Step {
    Segment(RawSegment),
    Invalid { index: usize, position: u64 },
    Done,
}

/// Walks segments in file order without validating the chain.
///
/// An all-zero header page or the end of a file moves on to the next file;
/// a non-End segment always continues at the start of the next file.
pub(crate) struct SegmentWalker {
    files: Vec<Arc<JournalFile>>,
    index: usize,
    position: u64,
    page_size: usize,
}

impl SegmentWalker {
    pub(crate) fn new(files: Vec<Arc<JournalFile>>, page_size: usize) -> Self {
        Self {
            files,
            index: 0,
            position: 0,
            page_size,
        }
    }

    fn next_file(&mut self) {
        self.index += 1;
        self.position = 0;
    }

    pub(crate) fn next(&mut self) -> Result<Step> {
        loop {
            let Some(file) = self.files.get(self.index).cloned() else {
                return Ok(Step::Done);
            };
            if self.position + 1 > file.capacity() {
                self.next_file();
                continue;
            }
            let header_page = file.read_pages(self.position, 1)?;
            if header_page.iter().all(|b| *b == 0) {
                self.next_file();
                continue;
            }
            let header = match TransactionHeader::decode(&header_page) {
                Ok(header) => header,
                Err(err) if err.is_corruption() => {
                    return Ok(Step::Invalid {
                        index: self.index,
                        position: self.position,
                    })
                }
                Err(err) => return Err(err),
            };
            let count = header.payload_pages(self.page_size);
            if self.position + 1 + count > file.capacity() {
                return Ok(Step::Invalid {
                    index: self.index,
                    position: self.position,
                });
            }
            let payload = file.read_pages(self.position + 1, count)?;
            let crc_ok = entry_crc(&header_page, &[&payload]) == header.crc;
            let segment = RawSegment {
                index: self.index,
                journal: file.number(),
                position: self.position,
                header,
                payload,
                crc_ok,
            };
            if header.is_end() {
                self.position += 1 + count;
            } else {
                self.next_file();
            }
            return Ok(Step::Segment(segment));
        }
    }

    /// Looks for any intact segment of a transaction `>= min_tx` after the
    /// given position.
    pub(crate) fn has_valid_entry_after(&self, index: usize, position: u64, min_tx: TxId) -> Result<bool> {
        for (file_index, file) in self.files.iter().enumerate().skip(index) {
            let start = if file_index == index { position + 1 } else { 0 };
            let capacity = file.capacity();
            let mut pos = start;
            while pos < capacity {
                let page = file.read_pages(pos, 1)?;
                if let Ok(header) = TransactionHeader::decode(&page) {
                    let count = header.payload_pages(self.page_size);
                    if header.tx_id >= min_tx && pos + 1 + count <= capacity {
                        let payload = file.read_pages(pos + 1, count)?;
                        if entry_crc(&page, &[&payload]) == header.crc {
                            return Ok(true);
                        }
                    }
                }
                pos += 1;
            }
        }
        Ok(false)
    }
}

/// Splits a segment payload into data page slots and freed page numbers.
pub(crate) fn parse_payload(
    segment: &RawSegment,
    page_size: usize,
) -> Result<(Vec<(PageNumber, JournalPage)>, Vec<PageNumber>)> {
    let header = &segment.header;
    let data_pages = header.page_count as usize;
    let mut pages = Vec::new();
    let mut i = 0usize;
    while i < data_pages {
        let image = &segment.payload[i * page_size..(i + 1) * page_size];
        let page_header = PageHeader::decode(image)?;
        if page_header.page_number.0 < HEADER_SLOTS {
            i += 1;
            continue;
        }
        let count = page_header.page_count(page_size).max(1) as usize;
        if i + count > data_pages {
            return Err(StorageError::Corruption("journal page run exceeds segment"));
        }
        pages.push((
            page_header.page_number,
            JournalPage {
                journal: segment.journal,
                position: segment.position + 1 + i as u64,
                tx_id: header.tx_id,
                pages: count as u32,
            },
        ));
        i += count;
    }
    let freed = decode_freed(&segment.payload[data_pages * page_size..], header.freed_count as usize)?;
    Ok((pages, freed))
}

impl Recovery {
    /// Replays every journal entry newer than `start`.
    pub fn run(store: &JournalStore, options: &JournalOptions, start: RecoveryStart) -> Result<Self> {
        let page_size = options.page_size as usize;
        let mut files = BTreeMap::new();
        let mut retained = Vec::new();
        for number in store.list()? {
            let file = store.open_existing(number, page_size)?;
            if number < start.journal {
                if options.retain_for_backup {
                    retained.push(Arc::clone(&file));
                    files.insert(number, file);
                } else {
                    debug!(journal = %number, "journal.recovery.stale_file");
                    file.retire();
                }
                continue;
            }
            files.insert(number, file);
        }

        let mut recovery = Recovery {
            start,
            file_last_tx: BTreeMap::new(),
            table: TranslationTable::new(),
            cursor: JournalCursor {
                journal: start.journal,
                position: 0,
            },
            last_tx: start.after_tx,
            last_crc: start.previous_crc,
            entries: Vec::new(),
            discarded_tail: false,
            files: BTreeMap::new(),
        };
        recovery.scan_retained(retained, page_size)?;

        let replay: Vec<Arc<JournalFile>> = files.range(start.journal..).map(|(_, f)| Arc::clone(f)).collect();
        let mut walker = SegmentWalker::new(replay, page_size);
        let mut pending: Vec<RawSegment> = Vec::new();
        let mut chain = start.previous_crc;
        loop {
            let segment = match walker.next()? {
                Step::Done => break,
                Step::Invalid { index, position } => {
                    recovery.handle_tail(&walker, index, position)?;
                    break;
                }
                Step::Segment(segment) => segment,
            };
            let header = segment.header;
            recovery
                .file_last_tx
                .entry(segment.journal)
                .and_modify(|tx| *tx = (*tx).max(header.tx_id))
                .or_insert(header.tx_id);
            if header.tx_id <= start.after_tx {
                if header.is_end() {
                    recovery.cursor = JournalCursor {
                        journal: segment.journal,
                        position: segment.end_position(page_size),
                    };
                }
                continue;
            }
            let follows = match pending.first() {
                Some(first) => {
                    header.tx_id == first.header.tx_id
                        && header.segment as usize == pending.len()
                        && segment.position == 0
                }
                None => header.tx_id == recovery.last_tx.next() && header.segment == 0,
            };
            if !segment.crc_ok || header.previous_crc != chain || !follows {
                debug!(
                    tx_id = header.tx_id.0,
                    crc_ok = segment.crc_ok,
                    follows,
                    "journal.recovery.invalid_entry"
                );
                recovery.handle_tail(&walker, segment.index, segment.position)?;
                break;
            }
            chain = header.crc;
            pending.push(segment);
            if header.is_end() {
                recovery.apply(std::mem::take(&mut pending), page_size)?;
            }
        }
        if !pending.is_empty() {
            recovery.discarded_tail = true;
            info!(
                tx_id = pending[0].header.tx_id.0,
                segments = pending.len(),
                "journal.recovery.incomplete_tail"
            );
        }
        recovery.files = files;
        info!(
            replayed = recovery.entries.len(),
            last_tx = recovery.last_tx.0,
            discarded_tail = recovery.discarded_tail,
            "journal.recovery.complete"
        );
        Ok(recovery)
    }

    fn scan_retained(&mut self, retained: Vec<Arc<JournalFile>>, page_size: usize) -> Result<()> {
        for file in retained {
            let number = file.number();
            let mut walker = SegmentWalker::new(vec![file], page_size);
            while let Step::Segment(segment) = walker.next()? {
                self.file_last_tx
                    .entry(number)
                    .and_modify(|tx| *tx = (*tx).max(segment.header.tx_id))
                    .or_insert(segment.header.tx_id);
            }
        }
        Ok(())
    }

    fn handle_tail(&mut self, walker: &SegmentWalker, index: usize, position: u64) -> Result<()> {
        // Segments of the torn transaction itself may survive; only a later
        // transaction proves the invalid entry was once committed.
        if walker.has_valid_entry_after(index, position, self.last_tx.next().next())? {
            warn!(position, "journal.recovery.corrupt_entry");
            return Err(StorageError::Corruption(
                "journal entry invalid before later valid entries",
            ));
        }
        self.discarded_tail = true;
        info!(position, last_tx = self.last_tx.0, "journal.recovery.truncated_tail");
        Ok(())
    }

    fn apply(&mut self, segments: Vec<RawSegment>, page_size: usize) -> Result<()> {
        let Some(last) = segments.last() else {
            return Ok(());
        };
        let header = last.header;
        let cursor = JournalCursor {
            journal: last.journal,
            position: last.end_position(page_size),
        };
        let first_journal = segments[0].journal;
        let mut freed = Vec::new();
        for segment in &segments {
            let (pages, segment_freed) = parse_payload(segment, page_size)?;
            for (page, slot) in pages {
                self.table.insert(page, slot);
            }
            freed.extend(segment_freed);
        }
        self.entries.push(RecoveredEntry {
            header,
            crc: header.crc,
            first_journal,
            freed,
        });
        self.cursor = cursor;
        self.last_tx = header.tx_id;
        self.last_crc = header.crc;
        Ok(())
    }

    /// Header of the last replayed transaction.
    pub fn last_header(&self) -> Option<&TransactionHeader> {
        self.entries.last().map(|entry| &entry.header)
    }

    /// Frees recorded by replayed transactions that were not yet released.
    pub fn pending_frees(&self) -> Vec<(TxId, Vec<PageNumber>)> {
        let released = self
            .last_header()
            .map(|h| h.frees_released_through)
            .unwrap_or_default();
        self.entries
            .iter()
            .filter(|entry| entry.header.tx_id > released && !entry.freed.is_empty())
            .map(|entry| (entry.header.tx_id, entry.freed.clone()))
            .collect()
    }
}
