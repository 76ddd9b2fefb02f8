//! Master node encoding and selection.
//!
//! A master node records the whole committed state of a capture file. Two
//! fixed slots hold the current and the previous master so that a torn
//! write can never lose the file: a commit always overwrites the slot *not*
//! currently relied on, and readers pick whichever slot both passes its CRC
//! and carries the newer serial.
//!
//! # Slot format
//!
//! Each slot is `2 * page_size + compression_block_size` bytes:
//!
//! ```text
//! +--------------------------------------------+
//! | crc32:u32 | serial:u32 | file_limit:u64    |
//! | block_len:u32 | metadata_ptr (12 bytes)    |
//! | child_count:u32 | path entries (13 bytes   |
//! |   each: height:u8, pos:u64, offset:u32)    |
//! | ... zero fill to page_size ...             |
//! +--------------------------------------------+
//! | copy of the page containing file_limit     |
//! +--------------------------------------------+
//! | staged compression-block bytes             |
//! | (block_len valid, zero fill to the end)    |
//! +--------------------------------------------+
//! ```
//!
//! - All integers are little-endian
//! - The CRC-32 (deflate polynomial) covers every slot byte after the CRC
//!   field itself, so a partially written slot is detected and ignored
//! - Serials advance modulo 2^32; slot index = serial % 2

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::FileConfig;
use crate::error::Result;
use crate::index::{DataCoordinate, RightmostPath, ENTRY_SIZE};
use crate::Error;

/// The CRC-32 of the deflate family, the same one protecting the
/// compressed data stream.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const SERIAL_OFFSET: usize = 4;
const FILE_LIMIT_OFFSET: usize = 8;
const BLOCK_LEN_OFFSET: usize = 16;
const METADATA_OFFSET: usize = 20;
const PATH_OFFSET: usize = 32;

/// The committed state of a capture file.
#[derive(Debug, Clone)]
pub struct MasterNode {
    pub serial: u32,
    /// One past the last byte ever handed to the pager. Bytes beyond it are
    /// dead space from uncommitted work.
    pub file_limit: u64,
    pub metadata_ptr: DataCoordinate,
    pub rightmost_path: RightmostPath,
    /// The page containing `file_limit`, exactly `page_size` bytes.
    pub last_page: Vec<u8>,
    /// The staged compression-block bytes, at most `compression_block_size`.
    pub block_contents: Vec<u8>,
}

impl MasterNode {
    /// The slot a master with this serial is written to.
    pub fn slot_index(serial: u32) -> usize {
        (serial % 2) as usize
    }

    /// Wrap-aware serial comparison: `a` is newer than `b` iff
    /// `(a - b) mod 2^32` lies in (0, 2^31).
    pub fn is_newer(a: u32, b: u32) -> bool {
        let delta = a.wrapping_sub(b);
        delta > 0 && delta < 0x8000_0000
    }

    pub fn encode(&self, config: &FileConfig) -> Result<Vec<u8>> {
        let page_size = config.page_size as usize;
        let slot_size = config.master_slot_size() as usize;
        debug_assert_eq!(self.last_page.len(), page_size);

        let path_len = 4 + self.rightmost_path.total_children() * ENTRY_SIZE;
        if PATH_OFFSET + path_len > page_size {
            return Err(Error::InvalidCaptureFile(format!(
                "rightmost path of {} entries does not fit in a {page_size} byte page",
                self.rightmost_path.total_children()
            )));
        }
        if self.block_contents.len() > config.compression_block_size as usize {
            return Err(Error::InvalidCaptureFile(
                "staged block exceeds the compression block size".to_string(),
            ));
        }

        let mut slot = vec![0u8; slot_size];
        LittleEndian::write_u32(&mut slot[SERIAL_OFFSET..], self.serial);
        LittleEndian::write_u64(&mut slot[FILE_LIMIT_OFFSET..], self.file_limit);
        LittleEndian::write_u32(&mut slot[BLOCK_LEN_OFFSET..], self.block_contents.len() as u32);
        let mut header_tail = Vec::with_capacity(12 + path_len);
        self.metadata_ptr.encode_into(&mut header_tail);
        self.rightmost_path.encode_into(&mut header_tail);
        slot[METADATA_OFFSET..METADATA_OFFSET + header_tail.len()]
            .copy_from_slice(&header_tail);

        slot[page_size..2 * page_size].copy_from_slice(&self.last_page);
        slot[2 * page_size..2 * page_size + self.block_contents.len()]
            .copy_from_slice(&self.block_contents);

        let crc = CRC32.checksum(&slot[4..]);
        LittleEndian::write_u32(&mut slot[..4], crc);
        Ok(slot)
    }

    /// Decodes one slot. Returns `None` for any slot that fails its CRC or
    /// does not parse; such a slot is simply not a committed state.
    pub fn decode(slot: &[u8], config: &FileConfig) -> Option<MasterNode> {
        let page_size = config.page_size as usize;
        if slot.len() != config.master_slot_size() as usize {
            return None;
        }
        let recorded_crc = LittleEndian::read_u32(&slot[..4]);
        if CRC32.checksum(&slot[4..]) != recorded_crc {
            return None;
        }

        let serial = LittleEndian::read_u32(&slot[SERIAL_OFFSET..]);
        let file_limit = LittleEndian::read_u64(&slot[FILE_LIMIT_OFFSET..]);
        let block_len = LittleEndian::read_u32(&slot[BLOCK_LEN_OFFSET..]) as usize;
        if block_len > config.compression_block_size as usize {
            return None;
        }

        let mut cursor = Cursor::new(&slot[METADATA_OFFSET..page_size]);
        let block_pos = cursor.read_u64::<LittleEndian>().ok()?;
        let offset = cursor.read_u32::<LittleEndian>().ok()?;
        let metadata_ptr = DataCoordinate::new(block_pos, offset);
        let rightmost_path = RightmostPath::decode(&mut cursor).ok()?;

        Some(MasterNode {
            serial,
            file_limit,
            metadata_ptr,
            rightmost_path,
            last_page: slot[page_size..2 * page_size].to_vec(),
            block_contents: slot[2 * page_size..2 * page_size + block_len].to_vec(),
        })
    }

    /// Picks the current master out of the two decoded slots: the one with
    /// the newer serial when both survived, whichever survived otherwise.
    pub fn select(first: Option<MasterNode>, second: Option<MasterNode>) -> Result<MasterNode> {
        match (first, second) {
            (Some(a), Some(b)) => {
                if Self::is_newer(b.serial, a.serial) {
                    Ok(b)
                } else {
                    Ok(a)
                }
            }
            (Some(a), None) => Ok(a),
            (None, Some(b)) => Ok(b),
            (None, None) => Err(Error::InvalidCaptureFile(
                "both master nodes are corrupt".to_string(),
            )),
        }
    }
}
