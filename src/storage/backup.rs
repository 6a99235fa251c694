//! Full and incremental backups.
//!
//! A full backup stream is self-describing:
//!
//! ```text
//! "STRBAK\0\0" | version u32 | page_size u32 | page_count u64 | last_tx u64
//! page 0 (zeroed) | page 1 (file header, revision 1) | pages 2..page_count
//! ```
//!
//! Restoring it only needs a pager: the pages are written back in order and
//! the header slot points at a state with no journal to replay.
//!
//! An incremental stream carries the shipped form of every transaction
//! committed since the previous backup:
//!
//! ```text
//! "STRINC\0\0" | page_size u32 | after_tx u64 | after_crc u32 | shipped stream
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::{load_header, FileHeader, FreeSpaceHeader, FIRST_DATA_PAGE};
use crate::primitives::wal::{
    decode_shipped_stream, encode_shipped_stream, BackupBookmark, JournalPage, JournalStore,
    ShippingReceiver,
};
use crate::types::{page::is_valid_page_size, JournalNumber, PageNumber, Result, StorageError, TxId};

use super::env::{Environment, DATA_FILE_NAME};
use super::freespace::encode_bitmap_page;

/// Magic prefix of a full backup stream.
pub const BACKUP_MAGIC: [u8; 8] = *b"STRBAK\0\0";
/// Magic prefix of an incremental backup stream.
pub const INCREMENTAL_MAGIC: [u8; 8] = *b"STRINC\0\0";
/// Full backup stream version.
pub const BACKUP_VERSION: u32 = 1;

/// What a backup wrote.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackupSummary {
    /// Last transaction contained in the backup.
    pub last_tx: TxId,
    /// Pages written (full) or shipped segments (incremental).
    pub units: u64,
}

fn read_array<const N: usize, R: Read>(input: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    input.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn truncated(err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::UnexpectedEof {
        StorageError::Corruption("backup stream truncated")
    } else {
        StorageError::Io(err)
    }
}

impl Environment {
    /// Streams a consistent copy of the committed state into `out`.
    ///
    /// The writer permit is held only while the snapshot is pinned, so
    /// writers resume while the pages are copied.
    pub fn backup<W: Write>(&self, out: &mut W) -> Result<BackupSummary> {
        let inner = Arc::clone(self.inner());
        let page_size = inner.page_size();
        let permit = inner.writer.acquire();
        let reader = self.begin_read()?;
        let state = inner.registry.current();
        if state.last_tx != reader.snapshot() {
            return Err(StorageError::Invalid("backup snapshot moved under the writer permit"));
        }
        let (_, last_crc) = inner.journal.last_committed();
        let mut bitmap = inner.free_space.lock().committed().clone();
        for page in inner.deferred.lock().pages() {
            bitmap.set_free(page)?;
        }
        let bookmark = BackupBookmark {
            journal: inner.journal.cursor().journal,
            tx_id: state.last_tx,
            crc: last_crc,
        };
        if inner.options.incremental_backup {
            inner.persist_bookmark(bookmark)?;
        }
        drop(permit);

        let run = state.free_space_header;
        let free_space = FreeSpaceHeader {
            checksum: bitmap.checksum(),
            ..run
        };
        let mut header = FileHeader::new(page_size as u32);
        header.revision = 1;
        header.last_tx_id = state.last_tx;
        header.next_page = state.next_page;
        header.last_synced_tx = state.last_tx;
        header.previous_tx_crc = last_crc;
        header.frees_released_through = state.last_tx;
        header.catalog = state.catalog_header;
        header.free_space = free_space;
        if inner.options.incremental_backup {
            header.last_backed_up_tx = bookmark.tx_id;
            header.last_backed_up_crc = bookmark.crc;
        }

        let page_count = state.next_page.0;
        out.write_all(&BACKUP_MAGIC)?;
        out.write_all(&BACKUP_VERSION.to_be_bytes())?;
        out.write_all(&(page_size as u32).to_be_bytes())?;
        out.write_all(&page_count.to_be_bytes())?;
        out.write_all(&state.last_tx.0.to_be_bytes())?;
        out.write_all(&vec![0u8; page_size])?;
        out.write_all(&header.to_page()?)?;

        // Newest journaled image covering each page; older runs lose to
        // newer single pages carved out of them.
        let mut covering: HashMap<PageNumber, (PageNumber, JournalPage)> = HashMap::new();
        for (first, slot) in state.journal.pages() {
            for offset in 0..slot.pages as u64 {
                let page = first.offset(offset);
                match covering.get(&page) {
                    Some((_, existing)) if existing.tx_id >= slot.tx_id => {}
                    _ => {
                        covering.insert(page, (*first, *slot));
                    }
                }
            }
        }
        let pager = inner.pager.state();
        let zeros = vec![0u8; page_size];
        let mut cached: Option<(PageNumber, Vec<u8>)> = None;
        for number in FIRST_DATA_PAGE.0..page_count {
            let page = PageNumber(number);
            if page >= run.first_page && number < run.first_page.0 + run.page_count as u64 {
                let index = (number - run.first_page.0) as u32;
                out.write_all(&encode_bitmap_page(bitmap.words(), index, page, page_size)?)?;
                continue;
            }
            if let Some((first, _)) = covering.get(&page) {
                if cached.as_ref().map(|(cached_first, _)| cached_first) != Some(first) {
                    let image = state
                        .journal
                        .read_page(*first)?
                        .ok_or(StorageError::Corruption("journaled page vanished from snapshot"))?;
                    cached = Some((*first, image));
                }
                if let Some((_, image)) = &cached {
                    let offset = (number - first.0) as usize * page_size;
                    out.write_all(&image[offset..offset + page_size])?;
                }
                continue;
            }
            if number < pager.capacity() {
                out.write_all(&pager.read_pointer(pager.pointer(page, 1)?)?)?;
            } else {
                out.write_all(&zeros)?;
            }
        }
        out.flush()?;
        drop(reader);
        info!(last_tx = state.last_tx.0, pages = page_count, "backup.full.complete");
        Ok(BackupSummary {
            last_tx: state.last_tx,
            units: page_count,
        })
    }

    /// Streams every transaction committed since the last backup and moves
    /// the bookmark past them.
    pub fn backup_incremental<W: Write>(&self, out: &mut W) -> Result<BackupSummary> {
        let inner = Arc::clone(self.inner());
        if !inner.options.incremental_backup {
            return Err(StorageError::Invalid("incremental backup is not enabled"));
        }
        let _permit = inner.writer.acquire();
        let bookmark = inner.journal.backup_bookmark();
        let (last_tx, last_crc) = inner.journal.last_committed();
        let shipped = inner.journal.read_shipped(bookmark.tx_id, bookmark.crc)?;

        out.write_all(&INCREMENTAL_MAGIC)?;
        out.write_all(&(inner.page_size() as u32).to_be_bytes())?;
        out.write_all(&bookmark.tx_id.0.to_be_bytes())?;
        out.write_all(&bookmark.crc.to_be_bytes())?;
        encode_shipped_stream(out, &shipped)?;
        out.flush()?;

        inner.persist_bookmark(BackupBookmark {
            journal: inner.journal.cursor().journal,
            tx_id: last_tx,
            crc: last_crc,
        })?;
        info!(
            after_tx = bookmark.tx_id.0,
            last_tx = last_tx.0,
            segments = shipped.len(),
            "backup.incremental.complete"
        );
        Ok(BackupSummary {
            last_tx,
            units: shipped.len() as u64,
        })
    }

    /// Applies an incremental backup stream on top of this environment.
    ///
    /// Entries are validated in order; the first invalid one stops the
    /// stream. Entries accepted before it are applied and the error is
    /// returned afterwards.
    pub fn apply_incremental<R: Read>(&self, input: &mut R) -> Result<TxId> {
        let magic: [u8; 8] = read_array(input)?;
        if magic != INCREMENTAL_MAGIC {
            return Err(StorageError::Corruption("incremental backup magic mismatch"));
        }
        let page_size = u32::from_be_bytes(read_array(input)?);
        let after_tx = TxId(u64::from_be_bytes(read_array(input)?));
        let after_crc = u32::from_be_bytes(read_array(input)?);
        if page_size as usize != self.inner().page_size() {
            return Err(StorageError::InvalidOwned(format!(
                "incremental backup page size {page_size} differs from {}",
                self.inner().page_size()
            )));
        }
        let last_tx = self.last_tx();
        if after_tx != last_tx {
            return Err(StorageError::InvalidOwned(format!(
                "incremental backup continues after transaction {after_tx}, environment is at {last_tx}"
            )));
        }
        if let Some(known) = self.shipping_crc() {
            if known != after_crc {
                return Err(StorageError::Invalid("incremental backup breaks the shipping chain"));
            }
        }
        let entries = decode_shipped_stream(input)?;
        let mut receiver = ShippingReceiver::new(page_size, after_tx, Some(after_crc));
        let mut rejected = None;
        for entry in &entries {
            if let Err(err) = receiver.receive(entry) {
                warn!(error = %err, tx_id = entry.header.tx_id.0, "backup.incremental.rejected");
                rejected = Some(err);
                break;
            }
        }
        let log = receiver.finish();
        let applied = self.apply_shipped(&log)?;
        match rejected {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    }
}

/// Writes the data file described by a full backup stream into `dir`.
///
/// `dir` must not already hold an environment.
pub fn restore<R: Read>(input: &mut R, dir: impl AsRef<Path>) -> Result<TxId> {
    let magic: [u8; 8] = read_array(input)?;
    if magic != BACKUP_MAGIC {
        return Err(StorageError::Corruption("backup magic mismatch"));
    }
    let version = u32::from_be_bytes(read_array(input)?);
    if version != BACKUP_VERSION {
        return Err(StorageError::CorruptionOwned(format!(
            "unsupported backup version {version}"
        )));
    }
    let page_size = u32::from_be_bytes(read_array(input)?);
    if !is_valid_page_size(page_size) {
        return Err(StorageError::Corruption("backup page size is invalid"));
    }
    let page_count = u64::from_be_bytes(read_array(input)?);
    let last_tx = TxId(u64::from_be_bytes(read_array(input)?));
    if page_count < FIRST_DATA_PAGE.0 {
        return Err(StorageError::Corruption("backup holds no data pages"));
    }

    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let data_path = dir.join(DATA_FILE_NAME);
    if fs::metadata(&data_path).map(|m| m.len() > 0).unwrap_or(false) {
        return Err(StorageError::Invalid("restore target already holds a data file"));
    }
    if !JournalStore::Directory(dir.to_path_buf()).list()?.is_empty() {
        return Err(StorageError::Invalid("restore target holds journal files"));
    }

    let io = StdFileIo::open(&data_path)?;
    let page_size = page_size as usize;
    io.truncate(page_count * page_size as u64)?;
    // Page 0 stays zeroed; the header lives in slot 1.
    let mut page = vec![0u8; page_size];
    input.read_exact(&mut page).map_err(truncated)?;
    for number in 1..page_count {
        input.read_exact(&mut page).map_err(truncated)?;
        io.write_at(number * page_size as u64, &page)?;
    }
    io.sync_all()?;

    let header = load_header(&io, page_size as u32)?;
    if header.last_tx_id != last_tx || header.next_page.0 != page_count {
        return Err(StorageError::Corruption("backup header disagrees with its preamble"));
    }
    if header.current_journal != JournalNumber(0) {
        warn!(journal = %header.current_journal, "backup.restore.unexpected_journal");
    }
    info!(last_tx = last_tx.0, pages = page_count, path = %dir.display(), "backup.restore.complete");
    Ok(last_tx)
}
