//! The capture file handle: transactional appends, committed-state refresh,
//! and record lookup by sequence number.
//!
//! A capture file is an append-only log of length-prefixed binary records
//! staged through a compression block, indexed by a B+-like tree whose only
//! mutable fringe (the rightmost path) lives in the master node. Commits are
//! atomic: data pages are synced, then a new master node is written to the
//! slot not currently relied on. Until that write completes, every reader
//! keeps seeing the previous commit.

use std::fmt::Display;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use crate::block::{decompress, BlockBuffer, BlockCache, BlockData};
use crate::config::{FileConfig, INITIAL_PAGES};
use crate::error::Result;
use crate::index::{DataCoordinate, RightmostPath, COORDINATE_SIZE, ENTRY_SIZE};
use crate::lock::{self, WriterRegistration};
use crate::master::MasterNode;
use crate::pager::Pager;
use crate::Error;

/// Options for opening or creating a capture file.
///
/// The sizing options only matter when a new file is created; an existing
/// file carries its own page size, compression block size, and fan out.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub write: bool,
    /// Metadata committed into a newly created file, so the file has
    /// metadata from birth. Ignored when the file already exists.
    pub initial_metadata: Option<Vec<u8>>,
    /// Replace any existing file with a fresh empty one.
    pub force_new_empty_file: bool,
    pub page_size: u32,
    pub compression_block_size: u32,
    pub fan_out: u32,
    /// Advisory OS locks for cross-process writer exclusion. Off by
    /// default; the in-process writer check is always active.
    pub use_os_file_locking: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            write: false,
            initial_metadata: None,
            force_new_empty_file: false,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            compression_block_size: crate::config::DEFAULT_COMPRESSION_BLOCK_SIZE,
            fan_out: crate::config::DEFAULT_FAN_OUT,
            use_os_file_locking: false,
        }
    }
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn initial_metadata(mut self, metadata: Option<Vec<u8>>) -> Self {
        self.initial_metadata = metadata;
        self
    }

    pub fn force_new_empty_file(mut self, force: bool) -> Self {
        self.force_new_empty_file = force;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn compression_block_size(mut self, size: u32) -> Self {
        self.compression_block_size = size;
        self
    }

    pub fn fan_out(mut self, fan_out: u32) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn use_os_file_locking(mut self, enabled: bool) -> Self {
        self.use_os_file_locking = enabled;
        self
    }
}

struct State {
    pager: Pager,
    block: BlockBuffer,
    cache: BlockCache,
    index: RightmostPath,
    serial: u32,
    metadata_ptr: DataCoordinate,
    record_count: u64,
    _registration: Option<WriterRegistration>,
}

/// A handle onto a capture file, open for read or write.
///
/// Records are addressed 1-based. A write handle sees its own uncommitted
/// records; read handles see the state of the commit that was current at
/// open or at the last [`refresh`](CaptureFile::refresh).
pub struct CaptureFile {
    path: PathBuf,
    write: bool,
    os_locking: bool,
    config: FileConfig,
    state: Option<State>,
}

impl CaptureFile {
    /// Opens an existing capture file for read with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<CaptureFile> {
        Self::open_with(path, CaptureOptions::default())
    }

    /// Opens a capture file. A missing file is created when opening for
    /// write, and an existing one is replaced when `force_new_empty_file`
    /// is set.
    pub fn open_with<P: AsRef<Path>>(path: P, options: CaptureOptions) -> Result<CaptureFile> {
        let path = path.as_ref().to_path_buf();
        let creating = options.force_new_empty_file || (options.write && !path.is_file());

        let registration = if options.write || creating {
            Some(lock::register_writer(&path)?)
        } else {
            None
        };
        if creating {
            Self::create_file(&path, &options)?;
        }

        let file = File::options().read(true).write(options.write).open(&path)?;
        if options.use_os_file_locking && options.write {
            lock::lock_writer(&file).map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied => {
                    Error::AlreadyOpen(format!(
                        "capture file {} is locked by another process",
                        path.display()
                    ))
                }
                _ => Error::from(e),
            })?;
        }

        let config = FileConfig::read_from(&file)?;
        let mut capture = CaptureFile {
            write: options.write,
            os_locking: options.use_os_file_locking,
            state: Some(State {
                pager: Pager::new(file, config.page_size),
                block: BlockBuffer::new(config.compression_block_size),
                cache: BlockCache::new(),
                index: RightmostPath::default(),
                serial: 0,
                metadata_ptr: DataCoordinate::NULL,
                record_count: 0,
                _registration: if options.write { registration } else { None },
            }),
            config,
            path,
        };
        capture.refresh_state()?;
        if capture.write {
            // Clear any torn bytes a failed commit left in the page that
            // the next append will complete.
            capture.state_mut()?.pager.rewrite_tail_page()?;
        }
        debug!(
            path = %capture.path.display(),
            write = capture.write,
            records = capture.state()?.record_count,
            "opened capture file"
        );
        Ok(capture)
    }

    /// Builds a new capture file in a temporary file and renames it into
    /// place, so a partially constructed file can never be observed. Both
    /// master slots are committed before the rename.
    fn create_file(path: &Path, options: &CaptureOptions) -> Result<()> {
        let config = FileConfig::new(
            options.page_size,
            options.compression_block_size,
            options.fan_out,
        );
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = tempfile::NamedTempFile::new_in(dir)?;

        let mut state = State {
            pager: Pager::new(temp.as_file().try_clone()?, config.page_size),
            block: BlockBuffer::new(config.compression_block_size),
            cache: BlockCache::new(),
            index: RightmostPath::default(),
            serial: 0,
            metadata_ptr: DataCoordinate::NULL,
            record_count: 0,
            _registration: None,
        };

        let mut header_region = vec![0u8; config.data_start() as usize];
        header_region[..crate::config::HEADER_SIZE].copy_from_slice(&config.encode());
        state.pager.write_at(0, &header_region)?;
        state
            .pager
            .restore(config.data_start(), vec![0u8; config.page_size as usize]);

        if let Some(metadata) = &options.initial_metadata {
            Self::check_payload_size(metadata)?;
            state.metadata_ptr = state.block.add_sized(&mut state.pager, metadata)?;
        }
        // Two commits so both slots hold a valid master from the start.
        Self::commit_state(&mut state, &config, false)?;
        Self::commit_state(&mut state, &config, false)?;

        state
            .pager
            .set_len_at_least(config.page_size as u64 * INITIAL_PAGES)?;
        state.pager.sync()?;
        drop(state);

        // A rename cannot replace an existing file on every platform.
        let _ = std::fs::remove_file(path);
        temp.persist(path).map_err(|e| Error::from(e.error))?;
        debug!(path = %path.display(), "created capture file");
        Ok(())
    }

    /// Closes the handle, releasing all locks. Uncommitted records and
    /// metadata are discarded. Does nothing if already closed.
    pub fn close(&mut self) {
        if self.state.take().is_some() {
            debug!(path = %self.path.display(), "closed capture file");
        }
    }

    /// Re-reads the committed state from disk, picking up commits made by
    /// a writer since this handle was opened. Any uncommitted work on a
    /// write handle is discarded.
    pub fn refresh(&mut self) -> Result<()> {
        self.state()?;
        self.refresh_state()
    }

    fn refresh_state(&mut self) -> Result<()> {
        let config = self.config.clone();
        let os_locking = self.os_locking;
        let exclusive = self.write;
        let state = self.state_mut()?;

        let [first, second] = config.slot_positions();
        let slot_size = config.master_slot_size() as usize;
        let range = 2 * config.master_slot_size();
        if os_locking {
            lock::lock_masters(state.pager.file(), first, range, exclusive)?;
        }
        let decode = |pos: u64, state: &State| {
            state
                .pager
                .read_at(pos, slot_size)
                .ok()
                .and_then(|slot| MasterNode::decode(&slot, &config))
        };
        let slots = (decode(first, state), decode(second, state));
        if os_locking {
            let _ = lock::unlock_masters(state.pager.file(), first, range);
        }

        let master = MasterNode::select(slots.0, slots.1)?;
        trace!(serial = master.serial, file_limit = master.file_limit, "loaded master node");
        state.serial = master.serial;
        state.metadata_ptr = master.metadata_ptr;
        state.record_count = master.rightmost_path.record_count(config.fan_out);
        state.index = master.rightmost_path;
        state.block.restore(&master.block_contents);
        state.pager.restore(master.file_limit, master.last_page);
        state.cache.clear();
        Ok(())
    }

    /// Stages `record` and returns the new record count. The record is not
    /// visible to other handles until [`commit`](CaptureFile::commit).
    pub fn add_record(&mut self, record: &[u8]) -> Result<u64> {
        Self::check_payload_size(record)?;
        let fan_out = self.config.fan_out;
        let state = self.writable_state()?;

        let coordinate = state.block.add_sized(&mut state.pager, record)?;
        Self::add_child(state, fan_out, coordinate)?;
        state.record_count += 1;
        Ok(state.record_count)
    }

    /// Appends a leaf entry, emitting each rightmost node that fills into
    /// the compression stream and promoting its coordinate one level up.
    fn add_child(state: &mut State, fan_out: u32, coordinate: DataCoordinate) -> Result<()> {
        let mut height = 1usize;
        let mut coordinate = coordinate;
        loop {
            let node = state.index.node_mut(height);
            node.children.push(coordinate);
            if node.children.len() < fan_out as usize {
                return Ok(());
            }
            let children = std::mem::take(&mut node.children);
            let emitted_at =
                DataCoordinate::new(state.pager.file_limit(), state.block.len() as u32);
            let mut entries = Vec::with_capacity(children.len() * ENTRY_SIZE);
            for child in &children {
                entries.push(height as u8);
                child.encode_into(&mut entries);
            }
            state.block.append(&mut state.pager, &entries)?;
            coordinate = emitted_at;
            height += 1;
        }
    }

    /// Commits every record added and any metadata change since the last
    /// commit, atomically. On failure nothing is committed and the handle
    /// should be closed and reopened.
    pub fn commit(&mut self) -> Result<()> {
        let config = self.config.clone();
        let os_locking = self.os_locking;
        let state = self.writable_state()?;
        Self::commit_state(state, &config, os_locking)?;
        debug!(serial = state.serial, records = state.record_count, "committed");
        Ok(())
    }

    fn commit_state(state: &mut State, config: &FileConfig, os_locking: bool) -> Result<()> {
        state.pager.sync()?;
        let serial = state.serial.wrapping_add(1);
        let master = MasterNode {
            serial,
            file_limit: state.pager.file_limit(),
            metadata_ptr: state.metadata_ptr,
            rightmost_path: state.index.clone(),
            last_page: state.pager.tail_page().to_vec(),
            block_contents: state.block.snapshot().as_ref().clone(),
        };
        let slot = master.encode(config)?;
        let position = config.slot_positions()[MasterNode::slot_index(serial)];

        let [first, _] = config.slot_positions();
        let range = 2 * config.master_slot_size();
        if os_locking {
            lock::lock_masters(state.pager.file(), first, range, true)?;
        }
        let written = state
            .pager
            .write_at(position, &slot)
            .and_then(|_| state.pager.sync());
        if os_locking {
            let _ = lock::unlock_masters(state.pager.file(), first, range);
        }
        written?;
        state.serial = serial;
        Ok(())
    }

    /// Returns the record at `record_number` (1-based).
    pub fn record_at(&self, record_number: u64) -> Result<Vec<u8>> {
        let state = self.state()?;
        if record_number < 1 || record_number > state.record_count {
            return Err(Error::OutOfRange(format!(
                "record {record_number} is outside 1..={}",
                state.record_count
            )));
        }
        let coordinate = self.locate(state, record_number)?;
        self.read_sized_at(coordinate)
    }

    /// Descends to the coordinate of a record: first along the in-memory
    /// rightmost path, then through persisted full nodes. At height h the
    /// record index splits as i = k / fan_out^(h-1); an i equal to the
    /// node's occupancy means the record lives under the rightmost child,
    /// which is the next in-memory node down.
    fn locate(&self, state: &State, record_number: u64) -> Result<DataCoordinate> {
        let fan_out = self.config.fan_out as u64;
        let mut k = record_number - 1;
        let mut height = state.index.levels();

        let (mut coordinate, mut subtree_height) = loop {
            let span = fan_out.pow(height as u32 - 1);
            let node = state.index.node(height);
            let child = (k / span) as usize;
            k %= span;
            if child < node.child_count() {
                break (node.children[child], height - 1);
            }
            if height == 1 {
                return Err(Error::InvalidCaptureFile(
                    "record index is inconsistent with the record count".to_string(),
                ));
            }
            height -= 1;
        };

        while subtree_height >= 1 {
            let span = fan_out.pow(subtree_height as u32 - 1);
            let child = (k / span) as usize;
            k %= span;
            coordinate = self.full_node_child(coordinate, child)?;
            subtree_height -= 1;
        }
        Ok(coordinate)
    }

    /// Reads the `index`-th child coordinate out of a persisted full node.
    fn full_node_child(&self, node: DataCoordinate, index: usize) -> Result<DataCoordinate> {
        let mut reader = StreamReader::new(self, node)?;
        reader.skip(index * ENTRY_SIZE + 1)?;
        let mut buf = [0u8; COORDINATE_SIZE];
        reader.read_exact(&mut buf)?;
        DataCoordinate::decode(&buf)
    }

    /// Reads a length-prefixed payload starting at `coordinate`, following
    /// the compression stream across block boundaries as needed.
    fn read_sized_at(&self, coordinate: DataCoordinate) -> Result<Vec<u8>> {
        let mut reader = StreamReader::new(self, coordinate)?;
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = LittleEndian::read_u32(&len_buf);
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// The decompressed block at `pos`. The block still being staged is
    /// served straight from memory; persisted blocks go through the
    /// single-slot cache.
    fn block_at(&self, pos: u64) -> Result<BlockData> {
        let state = self.state()?;
        if pos == state.pager.file_limit() {
            return Ok(BlockData {
                pos,
                compressed_len: None,
                bytes: state.block.snapshot(),
            });
        }
        if let Some(hit) = state.cache.get(pos) {
            return Ok(hit);
        }
        let len_buf = state.pager.fetch(pos, 4)?;
        let compressed_len = LittleEndian::read_u32(&len_buf);
        let compressed = state.pager.fetch(pos + 4, compressed_len as usize)?;
        let block = BlockData {
            pos,
            compressed_len: Some(compressed_len),
            bytes: std::sync::Arc::new(decompress(&compressed)?),
        };
        state.cache.put(block.clone());
        Ok(block)
    }

    /// Number of records visible to this handle. A write handle counts its
    /// uncommitted records; a read handle reflects the state at open or at
    /// the last refresh.
    pub fn record_count(&self) -> Result<u64> {
        Ok(self.state()?.record_count)
    }

    /// A lazy iterator over records starting at `starting_record_number`,
    /// bounded by the record count at the time of this call.
    pub fn record_generator(&self, starting_record_number: u64) -> Result<RecordIterator<'_>> {
        let state = self.state()?;
        if starting_record_number < 1 {
            return Err(Error::OutOfRange(
                "record numbering starts at 1".to_string(),
            ));
        }
        Ok(RecordIterator {
            capture: self,
            next: starting_record_number,
            end: state.record_count,
        })
    }

    /// The metadata committed into the file, or staged on this write
    /// handle; `None` if no metadata is set.
    pub fn get_metadata(&self) -> Result<Option<Vec<u8>>> {
        let pointer = self.state()?.metadata_ptr;
        if pointer.is_null() {
            Ok(None)
        } else {
            Ok(Some(self.read_sized_at(pointer)?))
        }
    }

    /// Replaces the file's metadata, or clears it with `None`. Like
    /// records, the change only becomes durable at the next commit.
    pub fn set_metadata(&mut self, metadata: Option<&[u8]>) -> Result<()> {
        if let Some(metadata) = metadata {
            Self::check_payload_size(metadata)?;
        }
        let state = self.writable_state()?;
        state.metadata_ptr = match metadata {
            None => DataCoordinate::NULL,
            Some(metadata) => state.block.add_sized(&mut state.pager, metadata)?,
        };
        Ok(())
    }

    fn check_payload_size(payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > u32::MAX as u64 {
            return Err(Error::RecordTooLarge(payload.len() as u64));
        }
        Ok(())
    }

    fn state(&self) -> Result<&State> {
        self.state.as_ref().ok_or_else(|| {
            Error::NotOpen(format!("capture file {} is not open", self.path.display()))
        })
    }

    fn state_mut(&mut self) -> Result<&mut State> {
        let path = self.path.clone();
        self.state
            .as_mut()
            .ok_or_else(|| Error::NotOpen(format!("capture file {} is not open", path.display())))
    }

    fn writable_state(&mut self) -> Result<&mut State> {
        if self.state.is_some() && !self.write {
            return Err(Error::NotOpenForWrite(format!(
                "capture file {} is open for read only",
                self.path.display()
            )));
        }
        self.state_mut()
    }
}

impl Drop for CaptureFile {
    fn drop(&mut self) {
        self.close();
    }
}

impl Display for CaptureFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.state {
            Some(state) => write!(
                f,
                "{} opened for {} with {} records",
                self.path.display(),
                if self.write { "writing" } else { "reading" },
                state.record_count
            ),
            None => write!(f, "{} (closed)", self.path.display()),
        }
    }
}

/// Reads bytes out of the decompressed data stream, stepping from block to
/// block using each block's compressed length.
struct StreamReader<'a> {
    capture: &'a CaptureFile,
    block: BlockData,
    offset: usize,
}

impl<'a> StreamReader<'a> {
    fn new(capture: &'a CaptureFile, coordinate: DataCoordinate) -> Result<Self> {
        Ok(Self {
            capture,
            block: capture.block_at(coordinate.block_pos)?,
            offset: coordinate.offset as usize,
        })
    }

    fn advance_block(&mut self) -> Result<()> {
        let compressed_len = self.block.compressed_len.ok_or_else(|| {
            Error::InvalidCaptureFile("read past the end of the capture data".to_string())
        })?;
        let next = self.block.pos + 4 + compressed_len as u64;
        self.block = self.capture.block_at(next)?;
        self.offset = 0;
        Ok(())
    }

    fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            if self.offset >= self.block.bytes.len() {
                self.advance_block()?;
                continue;
            }
            let take = n.min(self.block.bytes.len() - self.offset);
            self.offset += take;
            n -= take;
        }
        Ok(())
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.offset >= self.block.bytes.len() {
                self.advance_block()?;
                if self.block.bytes.is_empty() {
                    return Err(Error::InvalidCaptureFile(
                        "read past the end of the capture data".to_string(),
                    ));
                }
                continue;
            }
            let take = (out.len() - filled).min(self.block.bytes.len() - self.offset);
            out[filled..filled + take]
                .copy_from_slice(&self.block.bytes[self.offset..self.offset + take]);
            self.offset += take;
            filled += take;
        }
        Ok(())
    }
}

/// A one-shot iterator over records, bounded by the record count captured
/// when it was created.
pub struct RecordIterator<'a> {
    capture: &'a CaptureFile,
    next: u64,
    end: u64,
}

impl Iterator for RecordIterator<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }
        let record_number = self.next;
        self.next += 1;
        Some(self.capture.record_at(record_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn capture_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.capture")
    }

    fn open_writer(path: &Path) -> CaptureFile {
        CaptureFile::open_with(path, CaptureOptions::new().write(true))
            .expect("Failed to open capture file for write")
    }

    fn open_reader(path: &Path) -> CaptureFile {
        CaptureFile::open(path).expect("Failed to open capture file for read")
    }

    #[test]
    fn test_create_add_commit_reopen() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        for record in [b"r1".as_slice(), b"r2", b"r3"] {
            capture.add_record(record).expect("Failed to add record");
        }
        capture.commit().expect("Failed to commit");
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_count().unwrap(), 3);
        assert_eq!(capture.record_at(2).unwrap(), b"r2");
        assert_eq!(capture.record_at(1).unwrap(), b"r1");
        assert_eq!(capture.record_at(3).unwrap(), b"r3");
    }

    #[test]
    fn test_uncommitted_records_are_discarded() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.add_record(b"never committed").unwrap();
        assert_eq!(capture.record_count().unwrap(), 1);
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_count().unwrap(), 0);
        assert!(matches!(capture.record_at(1), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_three_level_tree_with_tiny_blocks() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let options = CaptureOptions::new()
            .write(true)
            .fan_out(2)
            .compression_block_size(64);
        let mut capture = CaptureFile::open_with(&path, options).unwrap();
        for i in 1..=7 {
            capture.add_record(format!("R{i}").as_bytes()).unwrap();
        }
        capture.commit().unwrap();
        for i in 1..=7u64 {
            assert_eq!(capture.record_at(i).unwrap(), format!("R{i}").as_bytes());
        }
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_count().unwrap(), 7);
        for i in 1..=7u64 {
            assert_eq!(
                capture.record_at(i).unwrap(),
                format!("R{i}").as_bytes(),
                "record {i} did not survive reopen"
            );
        }
    }

    #[test]
    fn test_large_records_random_access() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let payload = |k: u64| -> Vec<u8> {
            (0..10 * 1024).map(|i| ((i as u64 * 31 + k * 7) % 251) as u8).collect()
        };

        let mut capture = open_writer(&path);
        for k in 1..=1000 {
            capture.add_record(&payload(k)).unwrap();
        }
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_count().unwrap(), 1000);
        for k in [1u64, 500, 1000] {
            assert_eq!(capture.record_at(k).unwrap(), payload(k), "record {k} mismatch");
        }
    }

    #[test]
    fn test_record_straddles_many_blocks() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let options = CaptureOptions::new().write(true).compression_block_size(64);
        let big: Vec<u8> = (0..1000).map(|i| (i % 233) as u8).collect();

        let mut capture = CaptureFile::open_with(&path, options).unwrap();
        capture.add_record(b"before").unwrap();
        capture.add_record(&big).unwrap();
        capture.add_record(b"after").unwrap();
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_at(1).unwrap(), b"before");
        assert_eq!(capture.record_at(2).unwrap(), big);
        assert_eq!(capture.record_at(3).unwrap(), b"after");
    }

    #[test]
    fn test_metadata_roundtrip_and_clear() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        assert_eq!(capture.get_metadata().unwrap(), None);
        capture.set_metadata(Some(b"cursor=42")).unwrap();
        // Visible to this handle before the commit.
        assert_eq!(capture.get_metadata().unwrap(), Some(b"cursor=42".to_vec()));
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.get_metadata().unwrap(), Some(b"cursor=42".to_vec()));
        drop(capture);

        let mut capture = open_writer(&path);
        capture.set_metadata(None).unwrap();
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.get_metadata().unwrap(), None);
    }

    #[test]
    fn test_initial_metadata_at_creation() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let options = CaptureOptions::new()
            .write(true)
            .initial_metadata(Some(b"from birth".to_vec()));
        let capture = CaptureFile::open_with(&path, options).unwrap();
        assert_eq!(capture.get_metadata().unwrap(), Some(b"from birth".to_vec()));
        drop(capture);

        let capture = open_reader(&path);
        assert_eq!(capture.get_metadata().unwrap(), Some(b"from birth".to_vec()));
    }

    #[test]
    fn test_readers_see_commits_after_refresh() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut writer = open_writer(&path);
        writer.commit().unwrap();

        let mut reader_a = open_reader(&path);
        let mut reader_b = open_reader(&path);
        assert_eq!(reader_a.record_count().unwrap(), 0);

        for i in 0..10 {
            writer.add_record(format!("record {i}").as_bytes()).unwrap();
        }
        writer.commit().unwrap();

        // Readers that opened before the commit still see the old state.
        assert_eq!(reader_a.record_count().unwrap(), 0);
        assert_eq!(reader_b.record_count().unwrap(), 0);

        reader_a.refresh().unwrap();
        reader_b.refresh().unwrap();
        assert_eq!(reader_a.record_count().unwrap(), 10);
        assert_eq!(reader_b.record_count().unwrap(), 10);
        assert_eq!(reader_b.record_at(7).unwrap(), b"record 6");
    }

    #[test]
    fn test_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.add_record(b"only").unwrap();
        capture.commit().unwrap();

        assert!(matches!(capture.record_at(0), Err(Error::OutOfRange(_))));
        assert!(matches!(capture.record_at(2), Err(Error::OutOfRange(_))));
        assert!(capture.record_at(1).is_ok());
    }

    #[test]
    fn test_force_new_empty_truncates() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.add_record(b"doomed").unwrap();
        capture.commit().unwrap();
        capture.close();

        let options = CaptureOptions::new().write(true).force_new_empty_file(true);
        let capture = CaptureFile::open_with(&path, options).unwrap();
        assert_eq!(capture.record_count().unwrap(), 0);
    }

    #[test]
    fn test_empty_commits_are_permitted() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.commit().expect("Empty commit should succeed");
        capture.commit().expect("Second empty commit should succeed");
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_count().unwrap(), 0);
    }

    #[test]
    fn test_torn_master_recovery() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        for i in 0..5 {
            capture.add_record(format!("record {i}").as_bytes()).unwrap();
        }
        capture.commit().unwrap();
        // A second, empty commit leaves both slots describing the same
        // records, so losing either one must not lose any state.
        capture.commit().unwrap();
        capture.close();

        let config = FileConfig::default();
        for slot in 0..2 {
            let mut file = File::options().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(config.slot_positions()[slot] + 100)).unwrap();
            file.write_all(&[0xFF; 64]).unwrap();
            drop(file);

            let capture = open_reader(&path);
            assert_eq!(capture.record_count().unwrap(), 5, "slot {slot} corruption lost records");
            assert_eq!(capture.record_at(3).unwrap(), b"record 2");
            drop(capture);

            // The next commit rewrites the corrupt slot, restoring
            // redundancy for the following round.
            let mut writer = open_writer(&path);
            writer.commit().unwrap();
            writer.close();
        }
    }

    #[test]
    fn test_both_masters_corrupt_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        open_writer(&path).close();
        let config = FileConfig::default();
        let mut file = File::options().write(true).open(&path).unwrap();
        for slot in 0..2 {
            file.seek(SeekFrom::Start(config.slot_positions()[slot])).unwrap();
            file.write_all(&[0xAB; 256]).unwrap();
        }
        drop(file);

        let result = CaptureFile::open(&path);
        assert!(matches!(result, Err(Error::InvalidCaptureFile(_))));
    }

    #[test]
    fn test_not_a_capture_file() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);
        std::fs::write(&path, b"just some text, definitely not a capture file").unwrap();

        let result = CaptureFile::open(&path);
        assert!(matches!(result, Err(Error::InvalidCaptureFile(_))));
    }

    #[test]
    fn test_open_missing_file_for_read_fails() {
        let dir = TempDir::new().unwrap();
        let result = CaptureFile::open(capture_path(&dir));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_write_handle_reads_uncommitted() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.add_record(b"staged").unwrap();
        assert_eq!(capture.record_count().unwrap(), 1);
        assert_eq!(capture.record_at(1).unwrap(), b"staged");
    }

    #[test]
    fn test_empty_record() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.add_record(b"").unwrap();
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        assert_eq!(capture.record_at(1).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_record_generator() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let options = CaptureOptions::new().write(true).fan_out(2).compression_block_size(256);
        let mut capture = CaptureFile::open_with(&path, options).unwrap();
        for i in 1..=100u64 {
            capture.add_record(format!("record-{i}").as_bytes()).unwrap();
        }
        capture.commit().unwrap();

        let all: Vec<Vec<u8>> = capture
            .record_generator(1)
            .unwrap()
            .collect::<Result<_>>()
            .expect("Failed to iterate records");
        assert_eq!(all.len(), 100);
        assert_eq!(all[0], b"record-1");
        assert_eq!(all[99], b"record-100");

        let from_37: Vec<Vec<u8>> = capture
            .record_generator(37)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(from_37.len(), 64);
        assert_eq!(from_37[0], b"record-37");

        // Starting past the end yields an empty sequence.
        assert_eq!(capture.record_generator(101).unwrap().count(), 0);
        assert!(matches!(
            capture.record_generator(0),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_deep_tree_random_access() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let options = CaptureOptions::new().write(true).fan_out(2).compression_block_size(128);
        let mut capture = CaptureFile::open_with(&path, options).unwrap();
        for i in 1..=100u64 {
            capture.add_record(format!("deep-{i}").as_bytes()).unwrap();
        }
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        for i in (1..=100u64).rev() {
            assert_eq!(
                capture.record_at(i).unwrap(),
                format!("deep-{i}").as_bytes(),
                "record {i} mismatch"
            );
        }
    }

    #[test]
    fn test_second_writer_fails() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let _writer = open_writer(&path);
        let second = CaptureFile::open_with(&path, CaptureOptions::new().write(true));
        assert!(matches!(second, Err(Error::AlreadyOpen(_))));
    }

    #[test]
    fn test_writer_slot_reusable_after_close() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut writer = open_writer(&path);
        writer.close();
        let mut writer = open_writer(&path);
        writer.add_record(b"second life").unwrap();
        writer.commit().unwrap();
    }

    #[test]
    fn test_closed_handle_errors() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let mut capture = open_writer(&path);
        capture.close();
        assert!(matches!(capture.record_count(), Err(Error::NotOpen(_))));
        assert!(matches!(capture.record_at(1), Err(Error::NotOpen(_))));
        assert!(matches!(capture.add_record(b"x"), Err(Error::NotOpen(_))));
        assert!(matches!(capture.commit(), Err(Error::NotOpen(_))));
        assert!(matches!(capture.refresh(), Err(Error::NotOpen(_))));
        // Closing again is fine.
        capture.close();
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);
        open_writer(&path).close();

        let mut reader = open_reader(&path);
        assert!(matches!(
            reader.add_record(b"nope"),
            Err(Error::NotOpenForWrite(_))
        ));
        assert!(matches!(reader.commit(), Err(Error::NotOpenForWrite(_))));
        assert!(matches!(
            reader.set_metadata(Some(b"nope")),
            Err(Error::NotOpenForWrite(_))
        ));
    }

    #[test]
    fn test_os_locking_smoke() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let options = CaptureOptions::new().write(true).use_os_file_locking(true);
        let mut writer = CaptureFile::open_with(&path, options).unwrap();
        writer.add_record(b"locked").unwrap();
        writer.commit().unwrap();

        // Readers coexist with the writer; they never touch its probe range.
        let mut reader = CaptureFile::open_with(&path, CaptureOptions::new().use_os_file_locking(true))
            .unwrap();
        reader.refresh().unwrap();
        assert_eq!(reader.record_count().unwrap(), 1);
    }

    #[test]
    fn test_mixed_record_sizes_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        let records: Vec<Vec<u8>> = (0..40)
            .map(|i| (0..(i * 613) % 5000).map(|j| ((i + j) % 256) as u8).collect())
            .collect();

        let mut capture = open_writer(&path);
        for record in &records {
            capture.add_record(record).unwrap();
        }
        capture.commit().unwrap();
        capture.close();

        let capture = open_reader(&path);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(&capture.record_at(i as u64 + 1).unwrap(), record);
        }
    }

    #[test]
    fn test_commits_accumulate_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = capture_path(&dir);

        for round in 0..5u64 {
            let mut capture = open_writer(&path);
            assert_eq!(capture.record_count().unwrap(), round * 3);
            for i in 0..3 {
                capture.add_record(format!("round {round} record {i}").as_bytes()).unwrap();
            }
            capture.commit().unwrap();
            capture.close();
        }

        let capture = open_reader(&path);
        assert_eq!(capture.record_count().unwrap(), 15);
        assert_eq!(capture.record_at(4).unwrap(), b"round 1 record 0");
        assert_eq!(capture.record_at(15).unwrap(), b"round 4 record 2");
    }
}
