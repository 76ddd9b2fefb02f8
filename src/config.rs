use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

pub const MAGIC: &[u8; 11] = b"MioCapture\0";
pub const VERSION: u32 = 2;
pub const HEADER_SIZE: usize = 32;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_COMPRESSION_BLOCK_SIZE: u32 = 32768;
pub const DEFAULT_FAN_OUT: u32 = 32;

/// A freshly created capture file is padded to this many pages to limit
/// fragmentation while records trickle in.
pub const INITIAL_PAGES: u64 = 100;

/// The persistent configuration stored in the first bytes of a capture file,
/// plus the offsets derivable from it. All values are fixed at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct FileConfig {
    pub version: u32,
    /// Unit of alignment for bulk data appends and the master-slot pages.
    pub page_size: u32,
    /// Uncompressed bytes accumulated before a block is compressed and
    /// appended to the file.
    pub compression_block_size: u32,
    /// Number of children in a full index node.
    pub fan_out: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_PAGE_SIZE,
            DEFAULT_COMPRESSION_BLOCK_SIZE,
            DEFAULT_FAN_OUT,
        )
    }
}

impl FileConfig {
    pub fn new(page_size: u32, compression_block_size: u32, fan_out: u32) -> Self {
        assert!(page_size >= 512, "page size must be at least 512 bytes");
        assert!(compression_block_size > 0, "compression block size must be non-zero");
        assert!(fan_out >= 2, "fan out must be at least 2");
        Self {
            version: VERSION,
            page_size,
            compression_block_size,
            fan_out,
        }
    }

    /// Size of one master slot: a header page, a copy of the last partial
    /// data page, and the in-memory compression block.
    pub fn master_slot_size(&self) -> u64 {
        2 * self.page_size as u64 + self.compression_block_size as u64
    }

    /// Starting byte positions of the two master slots. The whole first page
    /// is reserved for the fixed header.
    pub fn slot_positions(&self) -> [u64; 2] {
        let first = self.page_size as u64;
        [first, first + self.master_slot_size()]
    }

    /// Where the data region begins; also the file limit of an empty file.
    pub fn data_start(&self) -> u64 {
        2 * self.page_size as u64 + 2 * self.master_slot_size()
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..11].copy_from_slice(MAGIC);
        (&mut buf[12..16]).write_u32::<LittleEndian>(self.version).unwrap();
        (&mut buf[16..20]).write_u32::<LittleEndian>(self.page_size).unwrap();
        (&mut buf[20..24])
            .write_u32::<LittleEndian>(self.compression_block_size)
            .unwrap();
        (&mut buf[24..28]).write_u32::<LittleEndian>(self.fan_out).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..11] != MAGIC {
            return Err(Error::InvalidCaptureFile(
                "bad magic, not a capture file".to_string(),
            ));
        }
        let mut cursor = Cursor::new(&buf[12..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        let page_size = cursor.read_u32::<LittleEndian>()?;
        let compression_block_size = cursor.read_u32::<LittleEndian>()?;
        let fan_out = cursor.read_u32::<LittleEndian>()?;

        if version > VERSION {
            return Err(Error::InvalidCaptureFile(format!(
                "file version {version} is newer than supported version {VERSION}"
            )));
        }
        if page_size < 512 || compression_block_size == 0 || fan_out < 2 {
            return Err(Error::InvalidCaptureFile(
                "corrupt file header".to_string(),
            ));
        }
        Ok(Self {
            version,
            page_size,
            compression_block_size,
            fan_out,
        })
    }

    /// Reads the fixed header from the start of an open capture file.
    pub fn read_from(file: &File) -> Result<Self> {
        let mut file = file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf)
            .map_err(|_| Error::InvalidCaptureFile("not a capture file".to_string()))?;
        Self::decode(&buf)
    }
}
