use std::fmt;
use std::ops::Range;

use crate::primitives::pager::{CatalogHeader, FreeSpaceHeader};
use crate::types::{
    read_u32, read_u64, write_u32, write_u64, Checksum, Crc32Fast, PageNumber, Result,
    StorageError, TxId,
};

const TX_MAGIC: [u8; 8] = *b"STRTXHDR";
const TX_FORMAT_VERSION: u32 = 1;

const TX_MAGIC_RANGE: Range<usize> = 0..8;
const TX_VERSION: usize = 8;
const TX_MARKER: usize = 12;
const TX_ID: usize = 16;
const TX_NEXT_PAGE: usize = 24;
const TX_LAST_PAGE: usize = 32;
const TX_PAGE_COUNT: usize = 40;
const TX_FREED_COUNT: usize = 44;
const TX_CRC: Range<usize> = 48..52;
const TX_PREVIOUS_CRC: usize = 52;
const TX_FREES_RELEASED: usize = 56;
const TX_SEGMENT: usize = 64;
const TX_CATALOG: Range<usize> = 72..88;
const TX_FREE_SPACE: Range<usize> = 88..120;
/// Encoded length of a [`TransactionHeader`].
pub const TX_HEADER_LEN: usize = 128;

/// Position of a segment inside a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Marker {
    /// First segment of a transaction that continues in a later file.
    Start,
    /// Middle segment of a split transaction.
    Split,
    /// Last (or only) segment; the transaction is complete.
    End,
}

impl Marker {
    fn to_u32(self) -> u32 {
        match self {
            Marker::Start => 1,
            Marker::Split => 2,
            Marker::End => 3,
        }
    }

    fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Marker::Start),
            2 => Ok(Marker::Split),
            3 => Ok(Marker::End),
            _ => Err(StorageError::Corruption("unknown transaction marker")),
        }
    }

    /// Marker for segment `index` of `count`.
    pub fn for_segment(index: usize, count: usize) -> Self {
        if index + 1 == count {
            Marker::End
        } else if index == 0 {
            Marker::Start
        } else {
            Marker::Split
        }
    }
}

/// Header page preceding every journal segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransactionHeader {
    /// Transaction id.
    pub tx_id: TxId,
    /// First unallocated page after the transaction.
    pub next_page_number: PageNumber,
    /// Highest page written by the transaction.
    pub last_page_number: PageNumber,
    /// Data pages stored in this segment.
    pub page_count: u32,
    /// Freed page numbers stored in this segment.
    pub freed_count: u32,
    /// CRC over this header (CRC field zeroed) and the segment payload.
    pub crc: u32,
    /// CRC of the segment written before this one.
    pub previous_crc: u32,
    /// Segment position.
    pub marker: Marker,
    /// Index of the segment within its transaction.
    pub segment: u32,
    /// Highest transaction whose freed pages are back in the bitmap.
    pub frees_released_through: TxId,
    /// Root object tree location after the transaction.
    pub catalog: CatalogHeader,
    /// Free-space bitmap state after the transaction.
    pub free_space: FreeSpaceHeader,
}

impl TransactionHeader {
    /// Writes the header into the first [`TX_HEADER_LEN`] bytes of `dst`,
    /// zeroing the rest of the page.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < TX_HEADER_LEN {
            return Err(StorageError::Invalid("transaction header buffer too small"));
        }
        dst.fill(0);
        dst[TX_MAGIC_RANGE].copy_from_slice(&TX_MAGIC);
        write_u32(dst, TX_VERSION, TX_FORMAT_VERSION);
        write_u32(dst, TX_MARKER, self.marker.to_u32());
        write_u64(dst, TX_ID, self.tx_id.0);
        write_u64(dst, TX_NEXT_PAGE, self.next_page_number.0);
        write_u64(dst, TX_LAST_PAGE, self.last_page_number.0);
        write_u32(dst, TX_PAGE_COUNT, self.page_count);
        write_u32(dst, TX_FREED_COUNT, self.freed_count);
        write_u32(dst, TX_CRC.start, self.crc);
        write_u32(dst, TX_PREVIOUS_CRC, self.previous_crc);
        write_u64(dst, TX_FREES_RELEASED, self.frees_released_through.0);
        write_u32(dst, TX_SEGMENT, self.segment);
        self.catalog.encode_into(&mut dst[TX_CATALOG]);
        self.free_space.encode_into(&mut dst[TX_FREE_SPACE]);
        Ok(())
    }

    /// Decodes a header page. The CRC is not verified here; see [`entry_crc`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TX_HEADER_LEN {
            return Err(StorageError::Corruption("transaction header truncated"));
        }
        if src[TX_MAGIC_RANGE] != TX_MAGIC {
            return Err(StorageError::Corruption("transaction header magic mismatch"));
        }
        if read_u32(src, TX_VERSION) != TX_FORMAT_VERSION {
            return Err(StorageError::Corruption(
                "transaction header version mismatch",
            ));
        }
        Ok(Self {
            tx_id: TxId(read_u64(src, TX_ID)),
            next_page_number: PageNumber(read_u64(src, TX_NEXT_PAGE)),
            last_page_number: PageNumber(read_u64(src, TX_LAST_PAGE)),
            page_count: read_u32(src, TX_PAGE_COUNT),
            freed_count: read_u32(src, TX_FREED_COUNT),
            crc: read_u32(src, TX_CRC.start),
            previous_crc: read_u32(src, TX_PREVIOUS_CRC),
            marker: Marker::from_u32(read_u32(src, TX_MARKER))?,
            segment: read_u32(src, TX_SEGMENT),
            frees_released_through: TxId(read_u64(src, TX_FREES_RELEASED)),
            catalog: CatalogHeader::decode(&src[TX_CATALOG]),
            free_space: FreeSpaceHeader::decode(&src[TX_FREE_SPACE]),
        })
    }

    /// Journal pages holding the freed-page list of this segment.
    pub fn freed_pages(&self, page_size: usize) -> u32 {
        freed_list_pages(self.freed_count as usize, page_size)
    }

    /// Journal pages following the header page.
    pub fn payload_pages(&self, page_size: usize) -> u64 {
        self.page_count as u64 + self.freed_pages(page_size) as u64
    }

    /// Returns true for the last segment of a transaction.
    pub fn is_end(&self) -> bool {
        self.marker == Marker::End
    }
}

impl fmt::Display for TransactionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransactionHeader(tx={}, {:?}#{}, pages={}, freed={}, crc={:#010x}, prev={:#010x})",
            self.tx_id,
            self.marker,
            self.segment,
            self.page_count,
            self.freed_count,
            self.crc,
            self.previous_crc
        )
    }
}

/// CRC of a segment: the header page with its CRC field zeroed, then the payload.
pub fn entry_crc(header_page: &[u8], payload: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&header_page[..TX_CRC.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&header_page[TX_CRC.end..]);
    for chunk in payload {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// Page numbers per freed-list page.
pub fn freed_per_page(page_size: usize) -> usize {
    page_size / 8
}

/// Journal pages needed for `count` freed page numbers.
pub fn freed_list_pages(count: usize, page_size: usize) -> u32 {
    count.div_ceil(freed_per_page(page_size)) as u32
}

/// Serializes freed page numbers into whole pages.
pub fn encode_freed(freed: &[PageNumber], page_size: usize) -> Vec<u8> {
    let pages = freed_list_pages(freed.len(), page_size) as usize;
    let mut out = vec![0u8; pages * page_size];
    for (idx, page) in freed.iter().enumerate() {
        write_u64(&mut out, idx * 8, page.0);
    }
    out
}

/// Parses `count` freed page numbers from freed-list pages.
pub fn decode_freed(src: &[u8], count: usize) -> Result<Vec<PageNumber>> {
    if src.len() < count * 8 {
        return Err(StorageError::Corruption("freed page list truncated"));
    }
    Ok((0..count).map(|idx| PageNumber(read_u64(src, idx * 8))).collect())
}
