//! Shared on-disk page metadata used by pager components.

use core::ops::Range;
use std::fmt;

use super::{read_u32, read_u64, write_u32, write_u64, PageNumber, Result, StorageError};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Length of the header that prefixes every page.
pub const PAGE_HDR_LEN: usize = 16;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Number of the page, or of the first page of its run.
    pub const PAGE_NO: Range<usize> = 0..8;
    /// Bytes the run holds past the first page header; zero for single pages.
    pub const OVERFLOW_SIZE: Range<usize> = 8..12;
    /// [`PageFlags`](super::PageFlags) bits.
    pub const FLAGS: Range<usize> = 12..16;
}

/// Page flag bits stored in the page header.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Ordinary single page.
    pub const SINGLE: PageFlags = PageFlags(1);
    /// First page of a run holding a value larger than one page.
    pub const OVERFLOW: PageFlags = PageFlags(1 << 1);
    /// Page belongs to the persisted free-space bitmap.
    pub const FREE_SPACE: PageFlags = PageFlags(1 << 2);
    /// Page belongs to the root object tree catalog.
    pub const CATALOG: PageFlags = PageFlags(1 << 3);

    const KNOWN: u32 = 0b1111;

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from raw bits, rejecting unknown bits.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(StorageError::Corruption("unknown page flag bits"));
        }
        Ok(PageFlags(bits))
    }

    /// Returns true when every bit of `other` is set.
    pub const fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    pub const fn union(self, other: PageFlags) -> PageFlags {
        PageFlags(self.0 | other.0)
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(PageFlags::SINGLE) {
            names.push("single");
        }
        if self.contains(PageFlags::OVERFLOW) {
            names.push("overflow");
        }
        if self.contains(PageFlags::FREE_SPACE) {
            names.push("free_space");
        }
        if self.contains(PageFlags::CATALOG) {
            names.push("catalog");
        }
        write!(f, "PageFlags({})", names.join("|"))
    }
}

/// Header prefixing every data page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Logical number of the page (first page for overflow runs).
    pub page_number: PageNumber,
    /// Payload bytes stored in an overflow run; zero for single pages.
    pub overflow_size: u32,
    /// Page flags.
    pub flags: PageFlags,
}

impl PageHeader {
    /// Header for a single page.
    pub fn single(page_number: PageNumber, flags: PageFlags) -> Self {
        Self {
            page_number,
            overflow_size: 0,
            flags: flags.union(PageFlags::SINGLE),
        }
    }

    /// Header for the first page of an overflow run of `count` pages.
    pub fn overflow(page_number: PageNumber, count: u32, page_size: usize) -> Self {
        let overflow_size = (count as usize * page_size).saturating_sub(PAGE_HDR_LEN);
        Self {
            page_number,
            overflow_size: overflow_size as u32,
            flags: PageFlags::OVERFLOW,
        }
    }

    /// Number of pages this header spans.
    pub fn page_count(&self, page_size: usize) -> u32 {
        if self.flags.contains(PageFlags::OVERFLOW) {
            overflow_page_count(self.overflow_size as usize, page_size)
        } else {
            1
        }
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(StorageError::Invalid("page header buffer too small"));
        }
        write_u64(dst, header::PAGE_NO.start, self.page_number.0);
        write_u32(dst, header::OVERFLOW_SIZE.start, self.overflow_size);
        write_u32(dst, header::FLAGS.start, self.flags.bits());
        Ok(())
    }

    /// Reads a header from the first [`PAGE_HDR_LEN`] bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(StorageError::Corruption("page header truncated"));
        }
        let page_number = PageNumber(read_u64(src, header::PAGE_NO.start));
        let overflow_size = read_u32(src, header::OVERFLOW_SIZE.start);
        let flags = PageFlags::from_bits(read_u32(src, header::FLAGS.start))?;
        Ok(Self {
            page_number,
            overflow_size,
            flags,
        })
    }
}

/// Number of pages needed to hold an overflow payload of `overflow_size` bytes.
pub fn overflow_page_count(overflow_size: usize, page_size: usize) -> u32 {
    let total = PAGE_HDR_LEN + overflow_size;
    total.div_ceil(page_size).max(1) as u32
}

/// Payload range (after the header) of a page buffer.
pub fn payload_range(page_size: usize) -> Range<usize> {
    PAGE_HDR_LEN..page_size
}

/// Returns true for page sizes the engine accepts.
pub fn is_valid_page_size(page_size: u32) -> bool {
    page_size.is_power_of_two() && (1024..=65536).contains(&page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; PAGE_HDR_LEN];
        let header = PageHeader::overflow(PageNumber(42), 3, 4096);
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.page_count(4096), 3);
    }

    #[test]
    fn single_page_spans_one_page() {
        let header = PageHeader::single(PageNumber(7), PageFlags::FREE_SPACE);
        assert!(header.flags.contains(PageFlags::SINGLE));
        assert!(header.flags.contains(PageFlags::FREE_SPACE));
        assert_eq!(header.page_count(4096), 1);
    }

    #[test]
    fn header_fields_cover_the_page_header() {
        assert_eq!(header::PAGE_NO.start, 0);
        assert_eq!(header::PAGE_NO.end, header::OVERFLOW_SIZE.start);
        assert_eq!(header::OVERFLOW_SIZE.end, header::FLAGS.start);
        assert_eq!(header::FLAGS.end, PAGE_HDR_LEN);
    }

    #[test]
    fn unknown_flags_rejected() {
        let mut buf = [0u8; PAGE_HDR_LEN];
        buf[header::FLAGS].copy_from_slice(&0x100u32.to_be_bytes());
        assert!(PageHeader::decode(&buf).is_err());
    }

    #[test]
    fn overflow_count_rounds_up() {
        assert_eq!(overflow_page_count(4096 - PAGE_HDR_LEN, 4096), 1);
        assert_eq!(overflow_page_count(4096, 4096), 2);
    }

    #[test]
    fn page_size_validation() {
        assert!(is_valid_page_size(4096));
        assert!(!is_valid_page_size(4000));
        assert!(!is_valid_page_size(512));
    }
}
