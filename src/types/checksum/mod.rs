#![forbid(unsafe_code)]

/// Incremental checksum over a sequence of byte chunks.
pub trait Checksum {
    /// Clears the running state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far without consuming the state.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
#[derive(Clone)]
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Crc32Fast {
    /// Starts a checksum seeded with a previous CRC value, so chained
    /// checksums can be computed across separate buffers.
    pub fn with_initial(crc: u32) -> Self {
        Self {
            inner: crc32fast::Hasher::new_with_initial(crc),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 of several chunks as if they were contiguous.
pub fn crc32_of(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
