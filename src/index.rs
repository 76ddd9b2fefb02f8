use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Serialized size of a bare coordinate.
pub const COORDINATE_SIZE: usize = 12;
/// Serialized size of a height-prefixed index entry.
pub const ENTRY_SIZE: usize = 13;

/// The two-dimensional address of data in a capture file: the absolute file
/// position of the compression block holding it, and the data's offset
/// within that block's decompressed bytes.
///
/// The block still being staged in memory is addressed at the current file
/// limit, the position it will occupy once flushed, so coordinates never
/// need rewriting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataCoordinate {
    pub block_pos: u64,
    pub offset: u32,
}

impl DataCoordinate {
    pub const NULL: DataCoordinate = DataCoordinate { block_pos: 0, offset: 0 };

    pub fn new(block_pos: u64, offset: u32) -> Self {
        Self { block_pos, offset }
    }

    pub fn is_null(&self) -> bool {
        self.block_pos == 0 && self.offset == 0
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<LittleEndian>(self.block_pos).unwrap();
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let block_pos = cursor.read_u64::<LittleEndian>()?;
        let offset = cursor.read_u32::<LittleEndian>()?;
        Ok(Self { block_pos, offset })
    }
}

/// The rightmost node of one tree level: the only mutable node at that
/// level, holding the coordinates of up to `fan_out - 1` children. On
/// receiving its `fan_out`-th child it is emitted into the compression
/// stream as an immutable full node and cleared.
#[derive(Clone, Debug, Default)]
pub struct RightmostNode {
    pub children: Vec<DataCoordinate>,
}

impl RightmostNode {
    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// One rightmost node per tree level, leaf (height 1) first. This is the
/// whole mutable fringe of the record index; everything else is immutable
/// full nodes inside compressed blocks.
#[derive(Clone, Debug, Default)]
pub struct RightmostPath {
    nodes: Vec<RightmostNode>,
}

impl RightmostPath {
    /// Number of levels, which is also the height of the root. Zero iff the
    /// file holds no records.
    pub fn levels(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, height: usize) -> &RightmostNode {
        &self.nodes[height - 1]
    }

    /// The node at `height`, creating empty nodes for any missing levels.
    /// Levels can be absent from serialized form because an empty node
    /// contributes no entries.
    pub fn node_mut(&mut self, height: usize) -> &mut RightmostNode {
        if height > self.nodes.len() {
            self.nodes.resize_with(height, RightmostNode::default);
        }
        &mut self.nodes[height - 1]
    }

    pub fn total_children(&self) -> usize {
        self.nodes.iter().map(|node| node.child_count()).sum()
    }

    /// Number of records reachable from this path: each child of a
    /// height-h node roots a full subtree of fan_out^(h-1) records.
    pub fn record_count(&self, fan_out: u32) -> u64 {
        let mut power = 1u64;
        let mut count = 0u64;
        for node in &self.nodes {
            count += node.child_count() as u64 * power;
            power *= fan_out as u64;
        }
        count
    }

    /// Serializes the path for the master node: a total child count, then
    /// height-prefixed entries, root level first.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<LittleEndian>(self.total_children() as u32).unwrap();
        for (index, node) in self.nodes.iter().enumerate().rev() {
            let height = (index + 1) as u8;
            for child in &node.children {
                buf.push(height);
                child.encode_into(buf);
            }
        }
    }

    /// Reads a path back from a master node. Entries carry their node's
    /// height, so the on-disk order does not matter.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut path = RightmostPath::default();
        let total = cursor.read_u32::<LittleEndian>()?;
        for _ in 0..total {
            let height = cursor.read_u8()?;
            if height == 0 {
                return Err(Error::InvalidCaptureFile(
                    "index entry with height zero".to_string(),
                ));
            }
            let block_pos = cursor.read_u64::<LittleEndian>()?;
            let offset = cursor.read_u32::<LittleEndian>()?;
            path.node_mut(height as usize)
                .children
                .push(DataCoordinate::new(block_pos, offset));
        }
        Ok(path)
    }
}
