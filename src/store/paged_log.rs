use std::collections::VecDeque;
use std::io;

use crate::config::LogConfig;
use crate::error::StoreError;
use crate::store::device::{open_device, LogDevice};
use crate::store::{LogWatermarks, FIRST_VALID_ADDRESS};

/// Page-structured, append-only address space with in-memory pages at the
/// tail and evicted pages on a [`LogDevice`].
///
/// Regions, from the tail down:
/// - `[read_only, tail)` mutable, updated in place
/// - `[safe_read_only, read_only)` fuzzy, some sessions may still update in place
/// - `[head, safe_read_only)` immutable, still in memory
/// - `[begin, head)` on the device only
#[derive(Debug)]
pub(crate) struct HybridLog {
    page_size_bits: u32,
    memory_pages: usize,
    mutable_pages: usize,
    /// In-memory pages, `pages[0]` is page number `first_page`
    pages: VecDeque<Box<[u8]>>,
    first_page: u64,
    begin: u64,
    head: u64,
    safe_read_only: u64,
    read_only: u64,
    tail: u64,
    device: Box<dyn LogDevice>,
}

impl HybridLog {
    pub fn new(config: &LogConfig) -> io::Result<Self> {
        let device = open_device(&config.device, config.page_size())?;
        let mut log = Self {
            page_size_bits: config.page_size_bits,
            memory_pages: config.memory_pages(),
            mutable_pages: config.mutable_pages(),
            pages: VecDeque::new(),
            first_page: 0,
            begin: FIRST_VALID_ADDRESS,
            head: FIRST_VALID_ADDRESS,
            safe_read_only: FIRST_VALID_ADDRESS,
            read_only: FIRST_VALID_ADDRESS,
            tail: FIRST_VALID_ADDRESS,
            device,
        };
        log.ensure_page(0);
        Ok(log)
    }

    pub fn page_size(&self) -> usize {
        1 << self.page_size_bits
    }

    fn page_of(&self, address: u64) -> u64 {
        address >> self.page_size_bits
    }

    fn offset_of(&self, address: u64) -> usize {
        (address & (self.page_size() as u64 - 1)) as usize
    }

    fn page_start(&self, page: u64) -> u64 {
        page << self.page_size_bits
    }

    fn ensure_page(&mut self, page: u64) {
        while self.first_page + (self.pages.len() as u64) <= page {
            self.pages.push_back(vec![0u8; self.page_size()].into_boxed_slice());
        }
    }

    pub fn watermarks(&self) -> LogWatermarks {
        LogWatermarks {
            begin: self.begin,
            head: self.head,
            safe_read_only: self.safe_read_only,
            read_only: self.read_only,
            tail: self.tail,
        }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn safe_read_only(&self) -> u64 {
        self.safe_read_only
    }

    pub fn read_only(&self) -> u64 {
        self.read_only
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Reserve `len` bytes at the tail and copy `bytes` there.
    ///
    /// A record never spans pages: if it does not fit in the rest of the tail
    /// page it starts at the next one.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, StoreError> {
        let page_size = self.page_size();
        if bytes.len() > page_size {
            return Err(StoreError::RecordTooLarge {
                size: bytes.len(),
                page_size,
            });
        }
        if self.offset_of(self.tail) + bytes.len() > page_size {
            self.tail = self.page_start(self.page_of(self.tail) + 1);
        }
        let address = self.tail;
        self.ensure_page(self.page_of(address));
        self.tail += bytes.len() as u64;
        self.write(address, bytes);

        self.shift_read_only();
        self.evict()?;
        Ok(address)
    }

    /// Overwrite bytes of an in-memory record
    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        debug_assert!(address >= self.head);
        let idx = (self.page_of(address) - self.first_page) as usize;
        let offset = self.offset_of(address);
        self.pages[idx][offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Bytes of an in-memory record, None below `head`
    pub fn read_memory(&self, address: u64, len: usize) -> Option<&[u8]> {
        if address < self.head || address >= self.tail {
            return None;
        }
        let idx = (self.page_of(address) - self.first_page) as usize;
        let offset = self.offset_of(address);
        self.pages.get(idx)?.get(offset..offset + len)
    }

    /// Bytes from `address` to the end of its page, as far as the device
    /// holds them
    pub fn read_device(&self, address: u64, len: usize) -> io::Result<Option<Vec<u8>>> {
        let len = len.min(self.page_size() - self.offset_of(address));
        self.device
            .read(self.page_of(address), self.offset_of(address), len)
    }

    fn shift_read_only(&mut self) {
        let tail_page = self.page_of(self.tail);
        let target = self.page_start((tail_page + 1).saturating_sub(self.mutable_pages as u64));
        self.read_only = self.read_only.max(target.max(self.begin)).min(self.tail);
    }

    /// Let every session observe the current read-only boundary
    pub fn refresh(&mut self) {
        self.safe_read_only = self.read_only;
    }

    /// Write pages out to the device while over the in-memory budget.
    fn evict(&mut self) -> Result<(), StoreError> {
        while self.pages.len() > self.memory_pages {
            let end = self.page_start(self.first_page + 1);
            if end > self.safe_read_only {
                if end > self.read_only {
                    break;
                }
                self.refresh();
            }
            if let Some(page) = self.pages.pop_front() {
                self.device.write_page(self.first_page, &page)?;
            }
            self.first_page += 1;
            self.head = self.head.max(self.page_start(self.first_page)).max(self.begin);
        }
        Ok(())
    }

    /// Fold the whole log into the read-only region
    pub fn fold_over(&mut self) {
        self.read_only = self.tail;
        self.safe_read_only = self.tail;
    }

    /// Move `begin` to `until` and drop everything below it.
    pub fn truncate(&mut self, until: u64) -> Result<(), StoreError> {
        if until < self.begin || until > self.safe_read_only {
            return Err(StoreError::UnsafeCompaction {
                until,
                begin: self.begin,
                safe_read_only: self.safe_read_only,
            });
        }
        while self.pages.len() > 1 && self.page_start(self.first_page + 1) <= until {
            self.pages.pop_front();
            self.first_page += 1;
        }
        self.begin = until;
        self.head = self.head.max(self.page_start(self.first_page)).max(until);
        self.device.truncate(self.page_of(until))?;
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        self.device.flush()
    }
}
