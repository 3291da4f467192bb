use crate::utils::mmap_ops::{create_and_ensure_length, open_write_mmap};
use memmap2::MmapMut;
use std::io;
use std::path::{Path, PathBuf};

/// One evicted log page, backed by its own mmap file.
#[derive(Debug)]
pub(crate) struct Page {
    path: PathBuf,
    mmap: MmapMut,
}

impl Page {
    /// Flushes outstanding memory map modifications to disk.
    pub(crate) fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    /// Create a new page at the given path
    pub fn new(path: &Path, size: usize) -> io::Result<Page> {
        create_and_ensure_length(path, size)?;
        let mmap = open_write_mmap(path)?;
        let path = path.to_path_buf();
        Ok(Page { path, mmap })
    }

    /// Write bytes at `offset`
    ///
    /// # Returns
    /// Amount of bytes that didn't fit into the page
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> usize {
        let start = offset.min(self.mmap.len());
        let end = (offset + bytes.len()).min(self.mmap.len());
        let written = end - start;
        self.mmap[start..end].copy_from_slice(&bytes[..written]);
        bytes.len() - written
    }

    /// Read `length` bytes at `offset`
    ///
    /// # Returns
    /// - None if the range is not within the page
    pub fn read_at(&self, offset: usize, length: usize) -> Option<&[u8]> {
        self.mmap.get(offset..offset.checked_add(length)?)
    }

    /// Delete the page from the filesystem.
    pub fn delete_page(self) -> io::Result<()> {
        drop(self.mmap);
        std::fs::remove_file(&self.path)
    }
}
