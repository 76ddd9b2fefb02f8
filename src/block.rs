use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use crate::error::Result;
use crate::index::DataCoordinate;
use crate::pager::Pager;
use crate::Error;

/// A decompressed compression block.
///
/// `compressed_len` is `None` for the in-memory block still being staged,
/// which has no on-disk representation yet. For persisted blocks it gives
/// the distance to the next block: `pos + 4 + compressed_len`.
#[derive(Clone)]
pub struct BlockData {
    pub pos: u64,
    pub compressed_len: Option<u32>,
    pub bytes: Arc<Vec<u8>>,
}

/// Accumulates uncompressed bytes destined for the file.
///
/// The buffer's nominal disk address is always the pager's current file
/// limit: when it fills to exactly `compression_block_size` it is compressed
/// and appended there as a length-prefixed zlib stream, so coordinates taken
/// while staging stay valid after the flush. Payloads larger than the
/// remaining space spill across as many blocks as they need.
pub struct BlockBuffer {
    data: Arc<Vec<u8>>,
    capacity: usize,
}

impl BlockBuffer {
    pub fn new(capacity: u32) -> Self {
        Self {
            data: Arc::new(Vec::with_capacity(capacity as usize)),
            capacity: capacity as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A cheap handle to the current contents, served to readers as the
    /// block nominally located at the file limit.
    pub fn snapshot(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.data)
    }

    /// Installs the staged bytes recorded in a master node.
    pub fn restore(&mut self, contents: &[u8]) {
        self.data = Arc::new(contents.to_vec());
    }

    /// Copies bytes in, compressing and appending a block to the pager each
    /// time the buffer reaches capacity. The buffer is always left below
    /// capacity on return.
    pub fn append(&mut self, pager: &mut Pager, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.data.len() == self.capacity {
                self.flush(pager)?;
            }
            let space = self.capacity - self.data.len();
            let take = space.min(data.len());
            Arc::make_mut(&mut self.data).extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        if self.data.len() == self.capacity {
            self.flush(pager)?;
        }
        Ok(())
    }

    /// Stages a length-prefixed payload and returns the coordinate of its
    /// first byte (the length prefix), taken before anything is written.
    pub fn add_sized(&mut self, pager: &mut Pager, payload: &[u8]) -> Result<DataCoordinate> {
        if self.data.len() == self.capacity {
            self.flush(pager)?;
        }
        let coordinate = DataCoordinate::new(pager.file_limit(), self.data.len() as u32);
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, payload.len() as u32);
        self.append(pager, &len_buf)?;
        self.append(pager, payload)?;
        Ok(coordinate)
    }

    fn flush(&mut self, pager: &mut Pager) -> Result<()> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.data)?;
        let compressed = encoder.finish()?;

        pager.ensure_capacity(4 + compressed.len() as u64)?;
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, compressed.len() as u32);
        let pos = pager.file_limit();
        pager.append(&len_buf)?;
        pager.append(&compressed)?;
        trace!(pos, compressed_len = compressed.len(), "flushed compression block");

        self.data = Arc::new(Vec::with_capacity(self.capacity));
        Ok(())
    }
}

/// Decompresses a single zlib stream.
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut bytes = Vec::new();
    decoder
        .read_to_end(&mut bytes)
        .map_err(|e| Error::InvalidCaptureFile(format!("corrupt compression block: {e}")))?;
    Ok(bytes)
}

/// Single-slot cache of the most recently decompressed block.
///
/// Persisted blocks are immutable, so a hit never needs validation beyond
/// the position match.
pub struct BlockCache(Mutex<Option<BlockData>>);

impl BlockCache {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub fn get(&self, pos: u64) -> Option<BlockData> {
        let slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().filter(|block| block.pos == pos).cloned()
    }

    pub fn put(&self, block: BlockData) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(block);
    }

    pub fn clear(&self) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}
