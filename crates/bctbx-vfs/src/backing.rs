//! Positioned I/O over the real file underneath a VFS handle

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bctbx_core::OpenFlags;

/// Raw byte storage consumed by the VFS implementations.
///
/// Offsets are absolute; implementations keep no cursor semantics visible to
/// callers. `read_at` may return fewer bytes than asked only at end of file.
pub trait BackingFile: Send {
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn truncate(&mut self, size: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

/// A [`BackingFile`] over a `std::fs::File`.
#[derive(Debug)]
pub struct StdBackingFile {
    file: File,
    path: PathBuf,
}

impl StdBackingFile {
    pub fn open(path: &Path, flags: OpenFlags) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(flags.is_readable())
            .write(flags.is_writable() && !flags.append)
            .append(flags.append)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Create a file that must not already exist, opened read-write.
    pub fn create_new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingFile for StdBackingFile {
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let available = self.size()?.saturating_sub(offset);
        let capacity = usize::try_from(available).map_or(len, |available| available.min(len));
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(capacity);
        (&mut self.file).take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_positioned_read_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("raw.bin");
        let mut file = StdBackingFile::open(&path, OpenFlags::create()).unwrap();

        file.write_at(4, b"tail").unwrap();
        file.write_at(0, b"head").unwrap();

        assert_eq!(file.size().unwrap(), 8);
        assert_eq!(file.read_at(0, 8).unwrap(), b"headtail");
        assert_eq!(file.read_at(2, 4).unwrap(), b"adta");
    }

    #[test]
    fn test_short_read_at_eof() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("raw.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut file = StdBackingFile::open(&path, OpenFlags::read_only()).unwrap();

        assert_eq!(file.read_at(1, 100).unwrap(), b"bc");
        assert!(file.read_at(10, 5).unwrap().is_empty());
    }

    #[test]
    fn test_unbounded_read_length() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("raw.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut file = StdBackingFile::open(&path, OpenFlags::read_only()).unwrap();

        assert_eq!(file.read_at(1, usize::MAX).unwrap(), b"bc");
        assert!(file.read_at(u64::MAX, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_truncate() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("raw.bin");
        let mut file = StdBackingFile::open(&path, OpenFlags::create()).unwrap();
        file.write_at(0, &[7u8; 64]).unwrap();

        file.truncate(10).unwrap();
        assert_eq!(file.size().unwrap(), 10);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn test_create_new_refuses_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("raw.bin");
        std::fs::write(&path, b"x").unwrap();

        let err = StdBackingFile::create_new(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
