use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;
use crate::Error;

/// Grow the backing file by at most this much at a time when preallocating
/// room for a compressed block.
const GROWTH_LIMIT: u64 = 5 * 1024 * 1024;

/// Page-aligned append-only writer over the capture file's data region.
///
/// Only whole pages are ever written at the end of the data region. The
/// trailing partial page is kept in `tail` (and persisted inside the master
/// slot at commit), so a torn append can never damage committed data.
/// `file_limit` counts every byte handed to `append`, including the bytes
/// still sitting in the tail.
pub struct Pager {
    file: File,
    page_size: u64,
    file_limit: u64,
    tail: Vec<u8>,
}

impl Pager {
    pub fn new(file: File, page_size: u32) -> Self {
        Self {
            file,
            page_size: page_size as u64,
            file_limit: 0,
            tail: vec![0; page_size as usize],
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_limit(&self) -> u64 {
        self.file_limit
    }

    /// The page containing `file_limit`, zero-padded past the valid prefix.
    pub fn tail_page(&self) -> &[u8] {
        &self.tail
    }

    /// Installs the state recorded in a master node.
    pub fn restore(&mut self, file_limit: u64, tail_page: Vec<u8>) {
        debug_assert_eq!(tail_page.len(), self.page_size as usize);
        self.file_limit = file_limit;
        self.tail = tail_page;
    }

    /// Reads raw bytes at an absolute file offset, ignoring `file_limit`.
    /// Used for the fixed header and the master slots.
    pub fn read_at(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes raw bytes at an absolute file offset. Used for the master
    /// slots and the recovery rewrite of the partial data page.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Appends bytes at `file_limit`. Completed pages go to the file; the
    /// remainder stays in the tail until a later append completes its page.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let page_size = self.page_size as usize;
        let pos_in_page = (self.file_limit % self.page_size) as usize;
        let total = pos_in_page + data.len();
        let full_pages = total / page_size * page_size;
        if full_pages > 0 {
            let page_start = self.file_limit / self.page_size * self.page_size;
            let mut file = &self.file;
            file.seek(SeekFrom::Start(page_start))?;
            file.write_all(&self.tail[..pos_in_page])?;
            let head = full_pages - pos_in_page;
            file.write_all(&data[..head])?;
            let rest = data.len() - head;
            self.tail[..rest].copy_from_slice(&data[head..]);
            self.tail[rest..].fill(0);
        } else {
            self.tail[pos_in_page..total].copy_from_slice(data);
        }
        self.file_limit += data.len() as u64;
        Ok(())
    }

    /// Reads committed data in `[pos, pos + len)`, splitting the read
    /// between the file and the in-memory tail as needed.
    pub fn fetch(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let end = pos + len as u64;
        if end > self.file_limit {
            return Err(Error::InvalidCaptureFile(format!(
                "read of {len} bytes at {pos} extends past the file limit {}",
                self.file_limit
            )));
        }
        let written_limit = self.file_limit / self.page_size * self.page_size;
        if pos < written_limit {
            let mut file = &self.file;
            file.seek(SeekFrom::Start(pos))?;
            if end <= written_limit {
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                Ok(buf)
            } else {
                let written = (written_limit - pos) as usize;
                let mut buf = vec![0u8; written];
                file.read_exact(&mut buf)?;
                buf.extend_from_slice(&self.tail[..len - written]);
                Ok(buf)
            }
        } else {
            let start = (pos - written_limit) as usize;
            Ok(self.tail[start..start + len].to_vec())
        }
    }

    /// Preallocates room for `additional` bytes beyond `file_limit`,
    /// growing by up to [`GROWTH_LIMIT`] (never more than doubling) in
    /// whole pages. Appends still extend the file on their own if needed.
    pub fn ensure_capacity(&mut self, additional: u64) -> Result<()> {
        let size = self.file.metadata()?.len();
        if self.file_limit + additional > size {
            let growth =
                GROWTH_LIMIT.min(self.file_limit).div_ceil(self.page_size) * self.page_size;
            self.file.set_len(size + growth)?;
        }
        Ok(())
    }

    /// Rewrites the page containing `file_limit` from the tail, clearing any
    /// torn bytes a failed commit may have left there.
    pub fn rewrite_tail_page(&mut self) -> Result<()> {
        if self.file_limit % self.page_size == 0 {
            return Ok(());
        }
        let page_start = self.file_limit / self.page_size * self.page_size;
        let tail = std::mem::take(&mut self.tail);
        let result = self.write_at(page_start, &tail);
        self.tail = tail;
        result
    }

    pub fn set_len_at_least(&self, len: u64) -> Result<()> {
        if self.file.metadata()?.len() < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
