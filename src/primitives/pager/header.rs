use std::fmt;
use std::io::ErrorKind;
use std::ops::Range;

use crate::primitives::io::FileIo;
use crate::types::{
    crc32_of, read_u32, read_u64, write_u32, write_u64, JournalNumber, PageNumber, Result,
    StorageError, TxId,
};

/// Magic bytes opening every file header slot.
pub const FILE_MAGIC: [u8; 8] = *b"STRATUM\0";
/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;
/// Number of header slots at the start of the data file.
pub const HEADER_SLOTS: u64 = 2;
/// First page available for data.
pub const FIRST_DATA_PAGE: PageNumber = PageNumber(HEADER_SLOTS);

/// Persisted description of the free-space bitmap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FreeSpaceHeader {
    /// First page of the bitmap run.
    pub first_page: PageNumber,
    /// Number of consecutive bitmap pages.
    pub page_count: u32,
    /// Number of pages tracked by the bitmap.
    pub tracked: u64,
    /// Where the next allocation scan starts.
    pub search_position: u64,
    /// CRC32 of the serialized bitmap words.
    pub checksum: u32,
}

impl FreeSpaceHeader {
    /// Encoded length in bytes.
    pub const LEN: usize = 32;

    /// Encodes into `dst[..LEN]`.
    pub fn encode_into(&self, dst: &mut [u8]) {
        write_u64(dst, 0, self.first_page.0);
        write_u32(dst, 8, self.page_count);
        write_u64(dst, 12, self.tracked);
        write_u64(dst, 20, self.search_position);
        write_u32(dst, 28, self.checksum);
    }

    /// Decodes from `src[..LEN]`.
    pub fn decode(src: &[u8]) -> Self {
        Self {
            first_page: PageNumber(read_u64(src, 0)),
            page_count: read_u32(src, 8),
            tracked: read_u64(src, 12),
            search_position: read_u64(src, 20),
            checksum: read_u32(src, 28),
        }
    }

    /// Pages occupied by the bitmap run.
    pub fn pages(&self) -> impl Iterator<Item = PageNumber> {
        let first = self.first_page.0;
        (first..first + self.page_count as u64).map(PageNumber)
    }
}

/// Persisted location of the root object tree catalog.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CatalogHeader {
    /// First page of the catalog overflow run.
    pub root_page: PageNumber,
    /// Pages in the run.
    pub page_count: u32,
    /// Number of trees registered.
    pub tree_count: u32,
}

impl CatalogHeader {
    /// Encoded length in bytes.
    pub const LEN: usize = 16;

    /// Encodes into `dst[..LEN]`.
    pub fn encode_into(&self, dst: &mut [u8]) {
        write_u64(dst, 0, self.root_page.0);
        write_u32(dst, 8, self.page_count);
        write_u32(dst, 12, self.tree_count);
    }

    /// Decodes from `src[..LEN]`.
    pub fn decode(src: &[u8]) -> Self {
        Self {
            root_page: PageNumber(read_u64(src, 0)),
            page_count: read_u32(src, 8),
            tree_count: read_u32(src, 12),
        }
    }
}

const HDR_MAGIC: Range<usize> = 0..8;
const HDR_VERSION: usize = 8;
const HDR_PAGE_SIZE: usize = 12;
const HDR_REVISION: usize = 16;
const HDR_LAST_TX: usize = 24;
const HDR_NEXT_PAGE: usize = 32;
const HDR_CURRENT_JOURNAL: usize = 40;
const HDR_JOURNAL_COUNT: usize = 48;
const HDR_LAST_SYNCED_JOURNAL: usize = 56;
const HDR_LAST_SYNCED_TX: usize = 64;
const HDR_BACKUP_JOURNAL: usize = 72;
const HDR_BACKUP_TX: usize = 80;
const HDR_BACKUP_CRC: usize = 88;
const HDR_PREVIOUS_CRC: usize = 92;
const HDR_FREES_RELEASED: usize = 96;
const HDR_CATALOG: Range<usize> = 104..120;
const HDR_FREE_SPACE: Range<usize> = 120..152;
const HDR_CRC: usize = 152;
/// Encoded length of a [`FileHeader`].
pub const FILE_HEADER_LEN: usize = 156;

/// Header stored in the two slots at the start of the data file.
///
/// It describes the state of the data file after the last flush; journal
/// entries newer than `last_synced_tx` are replayed on open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Page size the file was created with.
    pub page_size: u32,
    /// Monotonic revision; the valid slot with the highest one wins.
    pub revision: u64,
    /// Last committed transaction known when the header was written.
    pub last_tx_id: TxId,
    /// First unallocated page.
    pub next_page: PageNumber,
    /// Journal file receiving new entries.
    pub current_journal: JournalNumber,
    /// Number of live journal files.
    pub journal_count: u64,
    /// First journal file replay has to visit.
    pub last_synced_journal: JournalNumber,
    /// Last transaction whose pages are in the data file.
    pub last_synced_tx: TxId,
    /// Last journal copied by an incremental backup.
    pub last_backed_up_journal: JournalNumber,
    /// Last transaction copied by an incremental backup.
    pub last_backed_up_tx: TxId,
    /// Shipping CRC of the last backed-up entry.
    pub last_backed_up_crc: u32,
    /// Journal CRC of the last synced entry.
    pub previous_tx_crc: u32,
    /// Highest transaction whose freed pages were returned to the bitmap.
    pub frees_released_through: TxId,
    /// Root object tree location.
    pub catalog: CatalogHeader,
    /// Free-space bitmap location and checksum.
    pub free_space: FreeSpaceHeader,
}

impl FileHeader {
    /// Header for a freshly created file.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            revision: 0,
            last_tx_id: TxId(0),
            next_page: FIRST_DATA_PAGE,
            current_journal: JournalNumber(0),
            journal_count: 0,
            last_synced_journal: JournalNumber(0),
            last_synced_tx: TxId(0),
            last_backed_up_journal: JournalNumber(0),
            last_backed_up_tx: TxId(0),
            last_backed_up_crc: 0,
            previous_tx_crc: 0,
            frees_released_through: TxId(0),
            catalog: CatalogHeader::default(),
            free_space: FreeSpaceHeader::default(),
        }
    }

    /// Slot the given revision is written to.
    pub fn slot_for(revision: u64) -> u64 {
        revision % HEADER_SLOTS
    }

    /// Encodes the header into `dst`, which must hold [`FILE_HEADER_LEN`] bytes.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < FILE_HEADER_LEN {
            return Err(StorageError::Invalid("file header buffer too small"));
        }
        dst[..FILE_HEADER_LEN].fill(0);
        dst[HDR_MAGIC].copy_from_slice(&FILE_MAGIC);
        write_u32(dst, HDR_VERSION, FORMAT_VERSION);
        write_u32(dst, HDR_PAGE_SIZE, self.page_size);
        write_u64(dst, HDR_REVISION, self.revision);
        write_u64(dst, HDR_LAST_TX, self.last_tx_id.0);
        write_u64(dst, HDR_NEXT_PAGE, self.next_page.0);
        write_u64(dst, HDR_CURRENT_JOURNAL, self.current_journal.0);
        write_u64(dst, HDR_JOURNAL_COUNT, self.journal_count);
        write_u64(dst, HDR_LAST_SYNCED_JOURNAL, self.last_synced_journal.0);
        write_u64(dst, HDR_LAST_SYNCED_TX, self.last_synced_tx.0);
        write_u64(dst, HDR_BACKUP_JOURNAL, self.last_backed_up_journal.0);
        write_u64(dst, HDR_BACKUP_TX, self.last_backed_up_tx.0);
        write_u32(dst, HDR_BACKUP_CRC, self.last_backed_up_crc);
        write_u32(dst, HDR_PREVIOUS_CRC, self.previous_tx_crc);
        write_u64(dst, HDR_FREES_RELEASED, self.frees_released_through.0);
        self.catalog.encode_into(&mut dst[HDR_CATALOG]);
        self.free_space.encode_into(&mut dst[HDR_FREE_SPACE]);
        let crc = crc32_of(&[&dst[..HDR_CRC]]);
        write_u32(dst, HDR_CRC, crc);
        Ok(())
    }

    /// Decodes and validates a header slot.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(StorageError::Corruption("file header truncated"));
        }
        if src[HDR_MAGIC] != FILE_MAGIC {
            return Err(StorageError::Corruption("file header magic mismatch"));
        }
        let version = read_u32(src, HDR_VERSION);
        if version != FORMAT_VERSION {
            return Err(StorageError::CorruptionOwned(format!(
                "unsupported file format version {version}"
            )));
        }
        let stored = read_u32(src, HDR_CRC);
        if crc32_of(&[&src[..HDR_CRC]]) != stored {
            return Err(StorageError::Corruption("file header crc mismatch"));
        }
        Ok(Self {
            page_size: read_u32(src, HDR_PAGE_SIZE),
            revision: read_u64(src, HDR_REVISION),
            last_tx_id: TxId(read_u64(src, HDR_LAST_TX)),
            next_page: PageNumber(read_u64(src, HDR_NEXT_PAGE)),
            current_journal: JournalNumber(read_u64(src, HDR_CURRENT_JOURNAL)),
            journal_count: read_u64(src, HDR_JOURNAL_COUNT),
            last_synced_journal: JournalNumber(read_u64(src, HDR_LAST_SYNCED_JOURNAL)),
            last_synced_tx: TxId(read_u64(src, HDR_LAST_SYNCED_TX)),
            last_backed_up_journal: JournalNumber(read_u64(src, HDR_BACKUP_JOURNAL)),
            last_backed_up_tx: TxId(read_u64(src, HDR_BACKUP_TX)),
            last_backed_up_crc: read_u32(src, HDR_BACKUP_CRC),
            previous_tx_crc: read_u32(src, HDR_PREVIOUS_CRC),
            frees_released_through: TxId(read_u64(src, HDR_FREES_RELEASED)),
            catalog: CatalogHeader::decode(&src[HDR_CATALOG]),
            free_space: FreeSpaceHeader::decode(&src[HDR_FREE_SPACE]),
        })
    }

    /// Encodes the header into a full zero-padded page.
    pub fn to_page(&self) -> Result<Vec<u8>> {
        let mut page = vec![0u8; self.page_size as usize];
        self.encode(&mut page)?;
        Ok(page)
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileHeader(rev={}, last_tx={}, next_page={}, synced_tx={}, synced_journal={})",
            self.revision,
            self.last_tx_id,
            self.next_page,
            self.last_synced_tx,
            self.last_synced_journal
        )
    }
}

fn read_slot(io: &dyn FileIo, offset: u64) -> Result<Option<FileHeader>> {
    let mut buf = [0u8; FILE_HEADER_LEN];
    match io.read_at(offset, &mut buf) {
        Ok(()) => {}
        Err(StorageError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    match FileHeader::decode(&buf) {
        Ok(header) => Ok(Some(header)),
        Err(err) if err.is_corruption() => {
            tracing::debug!(offset, error = %err, "pager.header.slot_invalid");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Loads the newest valid header slot.
///
/// Slot 0 is read first to learn the page size; when it is torn the
/// caller-provided page size locates slot 1.
pub fn load_header(io: &dyn FileIo, fallback_page_size: u32) -> Result<FileHeader> {
    let first = read_slot(io, 0)?;
    let page_size = first
        .as_ref()
        .map(|h| h.page_size)
        .unwrap_or(fallback_page_size);
    let second = read_slot(io, page_size as u64)?;
    match (first, second) {
        (Some(a), Some(b)) => Ok(if b.revision > a.revision { b } else { a }),
        (Some(a), None) => Ok(a),
        (None, Some(b)) => Ok(b),
        (None, None) => Err(StorageError::Corruption("no valid file header slot")),
    }
}

/// Writes `header` into the slot its revision selects.
pub fn store_header(io: &dyn FileIo, header: &FileHeader) -> Result<()> {
    let page = header.to_page()?;
    let offset = FileHeader::slot_for(header.revision) * header.page_size as u64;
    io.write_at(offset, &page)
}
