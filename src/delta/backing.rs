//! Backing store abstraction
//!
//! The engine needs only four things from the layer below it: read a range
//! into a buffer, write a buffer to a range, make everything written so far
//! durable, and query/set the file length. Everything else — page cache,
//! request queues, device registration — stays on the other side of this
//! trait.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Positional I/O over one backing file.
///
/// `flush` is the durability barrier: when it returns, every write issued
/// before it is on stable storage.
pub trait BackingStore: Send + Sync {
    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Durability barrier.
    fn flush(&self) -> io::Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Whether the file is empty.
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the file to `len` bytes.
    fn set_len(&self, len: u64) -> io::Result<()>;
}

/// [`BackingStore`] over a regular file.
pub struct FileBacking {
    file: File,
}

impl FileBacking {
    /// Open an existing file, optionally writable.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(Self { file })
    }

    /// Create a new file; fails if it already exists.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl BackingStore for FileBacking {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_backing_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        let backing = FileBacking::create(&path).unwrap();

        backing.write_at(b"hello", 4096).unwrap();
        backing.flush().unwrap();
        assert_eq!(backing.len().unwrap(), 4101);

        let mut buf = [0u8; 5];
        backing.read_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"hello");

        let reopened = FileBacking::open(&path, false).unwrap();
        let mut buf = [0u8; 5];
        reopened.read_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
