use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::path::PathBuf;

use crate::config::DeviceConfig;
use crate::store::page::Page;

/// Destination of log pages evicted below the head address.
pub(crate) trait LogDevice: Send + Sync + Debug {
    fn write_page(&mut self, page: u64, bytes: &[u8]) -> io::Result<()>;

    /// Read `len` bytes at `offset` of an evicted page. Ok(None) if the
    /// device does not hold them.
    fn read(&self, page: u64, offset: usize, len: usize) -> io::Result<Option<Vec<u8>>>;

    /// Forget every page below `page`
    fn truncate(&mut self, page: u64) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;
}

pub(crate) fn open_device(config: &DeviceConfig, page_size: usize) -> io::Result<Box<dyn LogDevice>> {
    match config {
        DeviceConfig::Null => Ok(Box::new(NullDevice)),
        DeviceConfig::Mmap { dir } => Ok(Box::new(MmapDevice::new(dir.clone(), page_size)?)),
    }
}

/// Discards everything written to it.
#[derive(Debug, Default)]
pub(crate) struct NullDevice;

impl LogDevice for NullDevice {
    fn write_page(&mut self, _page: u64, _bytes: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn read(&self, _page: u64, _offset: usize, _len: usize) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn truncate(&mut self, _page: u64) -> io::Result<()> {
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps every evicted page in its own mmap segment file.
#[derive(Debug)]
pub(crate) struct MmapDevice {
    dir: PathBuf,
    page_size: usize,
    segments: BTreeMap<u64, Page>,
}

impl MmapDevice {
    pub fn new(dir: PathBuf, page_size: usize) -> io::Result<Self> {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("log directory {} does not exist", dir.display()),
            ));
        }
        Ok(Self {
            dir,
            page_size,
            segments: BTreeMap::new(),
        })
    }

    fn segment_path(&self, page: u64) -> PathBuf {
        self.dir.join(format!("segment_{page}.log"))
    }
}

impl LogDevice for MmapDevice {
    fn write_page(&mut self, page: u64, bytes: &[u8]) -> io::Result<()> {
        debug_assert_eq!(bytes.len(), self.page_size);
        let path = self.segment_path(page);
        let mut segment = Page::new(&path, self.page_size)?;
        let unwritten = segment.write_at(0, bytes);
        debug_assert_eq!(unwritten, 0);
        self.segments.insert(page, segment);
        Ok(())
    }

    fn read(&self, page: u64, offset: usize, len: usize) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .segments
            .get(&page)
            .and_then(|segment| segment.read_at(offset, len))
            .map(<[u8]>::to_vec))
    }

    fn truncate(&mut self, page: u64) -> io::Result<()> {
        let kept = self.segments.split_off(&page);
        let dropped = std::mem::replace(&mut self.segments, kept);
        for segment in dropped.into_values() {
            segment.delete_page()?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        for segment in self.segments.values() {
            segment.flush()?;
        }
        Ok(())
    }
}
