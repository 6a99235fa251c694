//! Root object tree: the name → tree header catalog.

use std::collections::BTreeMap;

use crate::primitives::bytes::{buf, var};
use crate::types::{
    page::{PageFlags, PageHeader, PAGE_HDR_LEN},
    PageNumber, Result, StorageError,
};

/// Persistent description of one tree owned by the tree layer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeHeader {
    /// Root page of the tree.
    pub root_page: PageNumber,
    /// Branch pages in use.
    pub branch_pages: u64,
    /// Leaf pages in use.
    pub leaf_pages: u64,
    /// Overflow pages in use.
    pub overflow_pages: u64,
    /// Stored entries.
    pub entries: u64,
    /// Tree-layer flags, opaque to the engine.
    pub flags: u32,
}

impl TreeHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        var::encode_u64(self.root_page.0, out);
        var::encode_u64(self.branch_pages, out);
        var::encode_u64(self.leaf_pages, out);
        var::encode_u64(self.overflow_pages, out);
        var::encode_u64(self.entries, out);
        var::encode_u64(self.flags as u64, out);
    }

    fn decode_from(cursor: &mut buf::Cursor<'_>) -> Result<Self> {
        let root_page = PageNumber(cursor.varint()?);
        let branch_pages = cursor.varint()?;
        let leaf_pages = cursor.varint()?;
        let overflow_pages = cursor.varint()?;
        let entries = cursor.varint()?;
        let flags = u32::try_from(cursor.varint()?)
            .map_err(|_| StorageError::Corruption("tree flags out of range"))?;
        Ok(Self {
            root_page,
            branch_pages,
            leaf_pages,
            overflow_pages,
            entries,
            flags,
        })
    }
}

/// Name → [`TreeHeader`] map stored in an overflow page run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Catalog {
    trees: BTreeMap<String, TreeHeader>,
}

impl Catalog {
    /// Looks up a tree.
    pub fn get(&self, name: &str) -> Option<&TreeHeader> {
        self.trees.get(name)
    }

    /// Inserts or replaces a tree header.
    pub fn insert(&mut self, name: &str, header: TreeHeader) -> Option<TreeHeader> {
        self.trees.insert(name.to_owned(), header)
    }

    /// Removes a tree.
    pub fn remove(&mut self, name: &str) -> Option<TreeHeader> {
        self.trees.remove(name)
    }

    /// Trees ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TreeHeader)> {
        self.trees.iter().map(|(name, header)| (name.as_str(), header))
    }

    /// Number of trees.
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    /// Returns true when no tree exists.
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Serializes the catalog body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        var::encode_u64(self.trees.len() as u64, &mut out);
        for (name, header) in &self.trees {
            buf::put_string(&mut out, name);
            header.encode_into(&mut out);
        }
        out
    }

    /// Parses a catalog body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = buf::Cursor::new(bytes);
        let count = cursor.varint()?;
        let mut trees = BTreeMap::new();
        for _ in 0..count {
            let name = cursor.string()?.to_owned();
            let header = TreeHeader::decode_from(&mut cursor)?;
            trees.insert(name, header);
        }
        Ok(Self { trees })
    }

    /// Pages an overflow run needs to hold this catalog.
    pub fn pages_needed(&self, page_size: usize) -> u32 {
        let body = self.encode();
        let total = PAGE_HDR_LEN + var::encoded_len(body.len() as u64) + body.len();
        total.div_ceil(page_size).max(1) as u32
    }

    /// Image of a `count`-page run starting at `first`.
    pub fn to_pages(&self, first: PageNumber, count: u32, page_size: usize) -> Result<Vec<u8>> {
        let body = self.encode();
        let mut framed = Vec::with_capacity(body.len() + var::MAX_LEN);
        var::encode_u64(body.len() as u64, &mut framed);
        framed.extend_from_slice(&body);
        let mut image = vec![0u8; count as usize * page_size];
        if PAGE_HDR_LEN + framed.len() > image.len() {
            return Err(StorageError::Invalid("catalog does not fit its page run"));
        }
        let mut header = PageHeader::overflow(first, count, page_size);
        header.flags = header.flags.union(PageFlags::CATALOG);
        header.encode(&mut image)?;
        image[PAGE_HDR_LEN..PAGE_HDR_LEN + framed.len()].copy_from_slice(&framed);
        Ok(image)
    }

    /// Parses the image of a catalog run.
    pub fn from_pages(image: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(image)?;
        if !header.flags.contains(PageFlags::CATALOG) {
            return Err(StorageError::Corruption("catalog page has wrong flags"));
        }
        let mut cursor = buf::Cursor::new(&image[PAGE_HDR_LEN..]);
        let len = cursor.varint()? as usize;
        Self::decode(cursor.take(len)?)
    }
}
