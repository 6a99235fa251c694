#![forbid(unsafe_code)]
//! Varint and cursor helpers used by the catalog and freed-page lists.

use crate::types::{Result, StorageError};

pub mod var {
    //! Unsigned LEB128-style varints.

    use super::{Result, StorageError};

    /// Longest encoding of a `u64`.
    pub const MAX_LEN: usize = 10;

    /// Appends `v` as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a varint at `*off`, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_LEN {
            let byte = *src
                .get(*off)
                .ok_or(StorageError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == MAX_LEN - 1 && payload > 1 {
                return Err(StorageError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StorageError::Corruption("varint longer than 10 bytes"))
    }

    /// Number of bytes `encode_u64` emits for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - v.leading_zeros() as usize;
        bits.div_ceil(7).max(1)
    }
}

pub mod buf {
    //! Slice-backed cursor for fallible parsing.

    use core::fmt;

    use super::{var, Result, StorageError};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(StorageError::Corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(StorageError::Corruption("cursor read past end"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint length followed by that many UTF-8 bytes.
        pub fn string(&mut self) -> Result<&'a str> {
            let len = self.varint()? as usize;
            let bytes = self.take(len)?;
            core::str::from_utf8(bytes).map_err(|_| StorageError::Corruption("string not utf-8"))
        }

        /// Current read offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl fmt::Debug for Cursor<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }

    /// Appends a varint length and the bytes of `s`.
    pub fn put_string(out: &mut Vec<u8>, s: &str) {
        var::encode_u64(s.len() as u64, out);
        out.extend_from_slice(s.as_bytes());
    }
}
