#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, IoSlice},
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::trace;

use crate::types::{Result, StorageError};

/// Positioned access to a backing store.
///
/// Pagers and journal files only ever talk to their backing store through
/// this capability, so memory-only environments and fault-injecting tests
/// can substitute their own implementation.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`; a short store is `UnexpectedEof`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the store when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes `bufs` back to back starting at `off`.
    fn writev_at(&self, off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        let mut cursor = off;
        for slice in bufs.iter().filter(|slice| !slice.is_empty()) {
            self.write_at(cursor, slice)?;
            cursor = cursor
                .checked_add(slice.len() as u64)
                .ok_or(StorageError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Makes everything written so far durable.
    fn sync_all(&self) -> Result<()>;
    /// Current size in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the store holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Shrinks or zero-extends the store to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// One positioned syscall per platform; the retry loops live above.
mod sys {
    use std::{fs::File, io};

    #[cfg(unix)]
    pub fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(file, dst, off)
    }

    #[cfg(unix)]
    pub fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(file, src, off)
    }

    #[cfg(windows)]
    pub fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(file, dst, off)
    }

    #[cfg(windows)]
    pub fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(file, src, off)
    }

    #[cfg(not(any(unix, windows)))]
    pub fn read_once(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    pub fn write_once(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned writes unsupported on this platform",
        ))
    }
}

/// A data or journal file on disk, shared by clones.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened handle.
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating it empty if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn fill(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            match sys::read_once(&self.file, dst, off) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "positioned read hit end of file",
                    ))
                }
                Ok(read) => {
                    dst = &mut std::mem::take(&mut dst)[read..];
                    off += read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn drain(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            match sys::write_once(&self.file, src, off) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "positioned write made no progress",
                    ))
                }
                Ok(written) => {
                    src = &src[written..];
                    off += written as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        Ok(self.fill(off, dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        Ok(self.drain(off, src)?)
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all().map_err(|err| {
            trace!(error = %err, "io.sync_all.error");
            StorageError::from(err)
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}

/// Memory-only backing store.
///
/// Behaves like a sparse file: writes past the end extend it with zeroes,
/// reads past the end fail with `UnexpectedEof`.
#[derive(Clone, Default)]
pub struct MemoryIo {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemoryIo {
    /// Creates an empty memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl FileIo for MemoryIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(StorageError::Invalid("read offset overflow"))?;
        if end > bytes.len() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "memory read past end",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = off as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(StorageError::Invalid("write offset overflow"))?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.write().resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("pages.bin");
        {
            let io = StdFileIo::open(&path)?;
            io.write_at(4096, &[42u8; 4096])?;
            io.write_at(3, b"head")?;
            io.sync_all()?;
            assert_eq!(io.len()?, 8192);
        }
        let io = StdFileIo::open(&path)?;
        let mut page = vec![0u8; 4096];
        io.read_at(4096, &mut page)?;
        assert!(page.iter().all(|&b| b == 42));
        let mut head = [0u8; 7];
        io.read_at(0, &mut head)?;
        assert_eq!(&head, b"\0\0\0head");
        Ok(())
    }

    #[test]
    fn short_file_reads_are_eof() -> Result<()> {
        let dir = tempdir()?;
        let io = StdFileIo::open(dir.path().join("short.bin"))?;
        assert!(io.is_empty()?);
        io.write_at(0, b"abc")?;
        let mut buf = [0u8; 8];
        match io.read_at(0, &mut buf) {
            Err(StorageError::Io(inner)) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {other:?}"),
        }
        io.truncate(1)?;
        assert_eq!(io.len()?, 1);
        Ok(())
    }

    #[test]
    fn memory_io_behaves_like_sparse_file() -> Result<()> {
        let io = MemoryIo::new();
        io.write_at(8, b"tail")?;
        assert_eq!(io.len()?, 12);
        let mut head = [1u8; 8];
        io.read_at(0, &mut head)?;
        assert_eq!(head, [0u8; 8]);
        let mut past = [0u8; 4];
        assert!(io.read_at(10, &mut past).is_err());
        io.truncate(4)?;
        assert_eq!(io.len()?, 4);
        Ok(())
    }

    #[test]
    fn writev_concatenates_slices() -> Result<()> {
        let io = MemoryIo::new();
        io.writev_at(1, &[IoSlice::new(&[1u8; 3]), IoSlice::new(&[]), IoSlice::new(&[2u8; 2])])?;
        assert_eq!(io.to_vec(), vec![0, 1, 1, 1, 2, 2]);
        Ok(())
    }
}
