use std::convert::TryInto;

use crate::fs::{IdxFsError, Result};
use crate::layout::NODE_SIZE;

pub const SB_MAGIC: u32 = 0x4958_4653; // IXFS

/// Number of encoded bytes, the rest of block 0 is zero.
const ENCODED_LEN: usize = 14 * 4;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Locates every region of the device:
///
/// ==============================================================================
/// | SuperBlock | Bitmap (nodes) | Bitmap (data region) | Node table | Data Region |
/// ==============================================================================
///
/// The number of nodes available in the filesystem ultimately sets the upper
/// bound on how many files can exist.
#[derive(Debug, PartialEq, Clone)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case IXFS.
    pub sb_magic: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    /// The device identifier stamped into every node record.
    pub device_id: u32,
    /// Slots in the node table, also the capacity of the node bitmap.
    pub node_count: u32,
    pub node_bitmap_start: u32,
    pub node_bitmap_blocks: u32,
    pub block_bitmap_start: u32,
    pub block_bitmap_blocks: u32,
    pub node_table_start: u32,
    pub node_table_blocks: u32,
    /// Address of the first data block. Always non-zero.
    pub data_start: u32,
    pub data_blocks: u32,
    /// Nodes currently in use.
    pub live_files: u32,
}

impl SuperBlock {
    /// Lays out a device of `total_blocks` blocks holding `node_count` nodes.
    ///
    /// # Errors
    ///
    /// Fails when the regions leave no room for data.
    pub fn layout(
        block_size: usize,
        total_blocks: usize,
        node_count: usize,
        device_id: u32,
    ) -> Result<Self> {
        let bits_per_block = block_size * 8;
        let nodes_per_block = block_size / NODE_SIZE;

        let node_bitmap_blocks = node_count.div_ceil(bits_per_block);
        let node_table_blocks = node_count.div_ceil(nodes_per_block);
        let fixed = 1 + node_bitmap_blocks + node_table_blocks;
        if total_blocks <= fixed + 1 {
            return Err(IdxFsError::InvalidArgument(format!(
                "{} blocks cannot hold {} nodes and any data",
                total_blocks, node_count
            )));
        }

        // Every data block needs one bit, so split the remainder so the bitmap
        // covers exactly what is left after it.
        let remaining = total_blocks - fixed;
        let block_bitmap_blocks = remaining.div_ceil(bits_per_block + 1);
        let data_blocks = remaining - block_bitmap_blocks;

        let node_bitmap_start = 1;
        let block_bitmap_start = node_bitmap_start + node_bitmap_blocks;
        let node_table_start = block_bitmap_start + block_bitmap_blocks;
        let data_start = node_table_start + node_table_blocks;

        let sb = SuperBlock {
            sb_magic: SB_MAGIC,
            block_size: to_u32(block_size)?,
            total_blocks: to_u32(total_blocks)?,
            device_id,
            node_count: to_u32(node_count)?,
            node_bitmap_start: to_u32(node_bitmap_start)?,
            node_bitmap_blocks: to_u32(node_bitmap_blocks)?,
            block_bitmap_start: to_u32(block_bitmap_start)?,
            block_bitmap_blocks: to_u32(block_bitmap_blocks)?,
            node_table_start: to_u32(node_table_start)?,
            node_table_blocks: to_u32(node_table_blocks)?,
            data_start: to_u32(data_start)?,
            data_blocks: to_u32(data_blocks)?,
            live_files: 0,
        };
        sb.validate(block_size, total_blocks)?;
        Ok(sb)
    }

    /// Reads the super block from a buffer holding block 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too short or the magic does not match.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENCODED_LEN {
            return Err(IdxFsError::InvalidLayout(
                "superblock buffer too short".to_string(),
            ));
        }
        let mut fields = buf[..ENCODED_LEN]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let mut next = || fields.next().unwrap_or_default();

        let sb = SuperBlock {
            sb_magic: next(),
            block_size: next(),
            total_blocks: next(),
            device_id: next(),
            node_count: next(),
            node_bitmap_start: next(),
            node_bitmap_blocks: next(),
            block_bitmap_start: next(),
            block_bitmap_blocks: next(),
            node_table_start: next(),
            node_table_blocks: next(),
            data_start: next(),
            data_blocks: next(),
            live_files: next(),
        };
        if sb.sb_magic != SB_MAGIC {
            return Err(IdxFsError::InvalidLayout(
                "superblock magic constant invalid".to_string(),
            ));
        }
        Ok(sb)
    }

    /// Serializes the SuperBlock into a `block_size` buffer for writing to disk.
    /// The encoding is a series of struct fields in little endian order.
    pub fn serialize(&self, block_size: usize) -> Vec<u8> {
        let mut sb_encoded = Vec::with_capacity(block_size);
        for field in &[
            self.sb_magic,
            self.block_size,
            self.total_blocks,
            self.device_id,
            self.node_count,
            self.node_bitmap_start,
            self.node_bitmap_blocks,
            self.block_bitmap_start,
            self.block_bitmap_blocks,
            self.node_table_start,
            self.node_table_blocks,
            self.data_start,
            self.data_blocks,
            self.live_files,
        ] {
            sb_encoded.extend_from_slice(&field.to_le_bytes());
        }
        sb_encoded.resize(block_size, 0);
        sb_encoded
    }

    /// Checks the regions against the device they were read from.
    pub fn validate(&self, block_size: usize, block_count: usize) -> Result<()> {
        let invalid = |msg: String| Err(IdxFsError::InvalidLayout(msg));

        if self.block_size as usize != block_size {
            return invalid(format!(
                "superblock block size {} does not match device block size {}",
                self.block_size, block_size
            ));
        }
        if self.total_blocks as usize > block_count {
            return invalid(format!(
                "superblock claims {} blocks, device has {}",
                self.total_blocks, block_count
            ));
        }

        let bits_per_block = block_size as u64 * 8;
        let nodes_per_block = (block_size / NODE_SIZE) as u64;
        let regions = [
            ("node bitmap", self.node_bitmap_start, self.node_bitmap_blocks),
            ("block bitmap", self.block_bitmap_start, self.block_bitmap_blocks),
            ("node table", self.node_table_start, self.node_table_blocks),
            ("data region", self.data_start, self.data_blocks),
        ];
        let mut cursor = 1_u64;
        for &(name, start, len) in regions.iter() {
            if start as u64 != cursor {
                return invalid(format!("{} starts at {}, expected {}", name, start, cursor));
            }
            cursor += len as u64;
        }
        if cursor > self.total_blocks as u64 {
            return invalid("regions extend past the end of the device".to_string());
        }
        if self.data_start == 0 || self.data_blocks == 0 {
            return invalid("empty data region".to_string());
        }
        if self.node_count as u64 > self.node_bitmap_blocks as u64 * bits_per_block
            || self.node_count as u64 > self.node_table_blocks as u64 * nodes_per_block
        {
            return invalid(format!("{} nodes do not fit their regions", self.node_count));
        }
        if self.data_blocks as u64 > self.block_bitmap_blocks as u64 * bits_per_block {
            return invalid("block bitmap too small for data region".to_string());
        }
        if self.live_files > self.node_count {
            return invalid(format!(
                "{} live files exceed {} nodes",
                self.live_files, self.node_count
            ));
        }
        Ok(())
    }
}

fn to_u32(value: usize) -> Result<u32> {
    value
        .try_into()
        .map_err(|_| IdxFsError::InvalidArgument(format!("{} does not fit in 32 bits", value)))
}
