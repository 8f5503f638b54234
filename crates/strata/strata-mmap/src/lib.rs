//! Named shared-memory regions backed by files.
//!
//! Every process that opens the same path maps the same bytes. Point the path
//! at a tmpfs such as `/dev/shm` to keep the region in memory only.

use memmap2::MmapMut;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::Path,
};

pub struct MmapFileMut {
    _file: File,
    mmap: MmapMut,
}

impl MmapFileMut {
    /// Create (or truncate) a file to `size_bytes` and map it read-write
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Self::map_sized(file, size_bytes)
    }

    /// Create a file that must not exist yet and map it read-write.
    ///
    /// Fails with `io::ErrorKind::AlreadyExists` when another process already
    /// created the region.
    pub fn create_new_rw<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::map_sized(file, size_bytes)
    }

    /// Open an existing file and map it to read and write
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self { _file: file, mmap })
    }

    fn map_sized(file: File, size_bytes: u64) -> io::Result<Self> {
        // set_len zero-fills, so a fresh region always starts out as zeroes
        file.set_len(size_bytes)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// Remove the file backing a region. Existing mappings stay valid until dropped.
pub fn remove<P: AsRef<Path>>(path: P) -> io::Result<()> {
    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("strata_mmap_{tag}_{}", std::process::id()))
    }

    #[test]
    fn two_mappings_share_bytes() {
        let path = temp_path("share");
        let mut a = MmapFileMut::create_rw(&path, 4096).unwrap();
        let mut b = MmapFileMut::open_rw(&path).unwrap();
        assert_eq!(a.len(), 4096);
        assert_eq!(b.len(), 4096);

        unsafe { a.as_mut_ptr().add(100).write(0xAB) };
        assert_eq!(unsafe { b.as_mut_ptr().add(100).read() }, 0xAB);

        remove(&path).unwrap();
    }

    #[test]
    fn create_new_refuses_existing_file() {
        let path = temp_path("excl");
        let _ = remove(&path);
        let _first = MmapFileMut::create_new_rw(&path, 4096).unwrap();
        let err = MmapFileMut::create_new_rw(&path, 4096).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        remove(&path).unwrap();
    }
}
