//! Geometry of the block-pointer tree.
//!
//! A node carries fifteen block pointers. The first twelve address data blocks
//! directly, the last three are roots of indirect chains one, two and three index
//! blocks deep. An index block is a raw block read as `FANOUT` little-endian
//! 32-bit addresses with no header; its level is only known from where the walk
//! found it.
//!
//! | Level      | Logical indices                    | Capacity |
//! |------------|------------------------------------|----------|
//! | direct     | `[0, 12)`                          | 12       |
//! | 1-indirect | `[12, 12+F)`                       | F        |
//! | 2-indirect | `[12+F, 12+F+F²)`                  | F²       |
//! | 3-indirect | `[12+F+F², 12+F+F²+F³)`            | F³       |

use crate::fs::{IdxFsError, Result};

/// A physical block address. Address 0 is reserved on every device and doubles
/// as the empty-slot sentinel in node records and index blocks.
pub type BlockAddr = u32;

/// Number of direct pointers in a node record.
pub const DIRECT_BLOCKS: usize = 12;
/// Deepest indirect chain.
pub const MAX_DEPTH: usize = 3;
/// Total pointer slots in a node record.
pub const BLOCK_POINTERS: usize = DIRECT_BLOCKS + MAX_DEPTH;
/// Bytes per address inside an index block.
pub const POINTER_SIZE: usize = 4;
/// Bytes per node record in the node table.
pub const NODE_SIZE: usize = 128;

pub const MIN_BLOCK_SIZE: usize = NODE_SIZE;
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Where a logical block lives in a node's pointer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPath {
    /// Slot in the node record, direct slot or indirect root.
    slot: usize,
    /// Offsets inside each index block, root first.
    offsets: [usize; MAX_DEPTH],
    depth: usize,
}

impl BlockPath {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of index blocks between the node record and the data block.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets[..self.depth]
    }
}

/// Block size dependent numbers shared by every walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
    fanout: u64,
}

impl Geometry {
    /// # Errors
    ///
    /// The block size must be a power of two between 128 bytes and 64k.
    pub fn new(block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two()
            || block_size < MIN_BLOCK_SIZE
            || block_size > MAX_BLOCK_SIZE
        {
            return Err(IdxFsError::InvalidArgument(format!(
                "block size {} must be a power of two in [{}, {}]",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        Ok(Self {
            block_size,
            fanout: (block_size / POINTER_SIZE) as u64,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pointer slots per index block.
    pub fn fanout(&self) -> usize {
        self.fanout as usize
    }

    pub fn nodes_per_block(&self) -> usize {
        self.block_size / NODE_SIZE
    }

    /// Logical blocks a single node can address.
    pub fn max_blocks(&self) -> u64 {
        let f = self.fanout;
        DIRECT_BLOCKS as u64 + f + f * f + f * f * f
    }

    /// Logical blocks needed to hold `size` bytes.
    pub fn blocks_in(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size as u64)
    }

    /// Splits a logical block index into the node slot and the per-level
    /// offsets, most significant first.
    pub fn locate(&self, index: u64) -> Result<BlockPath> {
        let mut offsets = [0; MAX_DEPTH];
        if index < DIRECT_BLOCKS as u64 {
            return Ok(BlockPath {
                slot: index as usize,
                offsets,
                depth: 0,
            });
        }

        let mut relative = index - DIRECT_BLOCKS as u64;
        let mut span = 1;
        for depth in 1..=MAX_DEPTH {
            span *= self.fanout;
            if relative < span {
                let mut rest = relative;
                for offset in offsets[..depth].iter_mut().rev() {
                    *offset = (rest % self.fanout) as usize;
                    rest /= self.fanout;
                }
                return Ok(BlockPath {
                    slot: DIRECT_BLOCKS + depth - 1,
                    offsets,
                    depth,
                });
            }
            relative -= span;
        }

        Err(IdxFsError::InvalidIndex {
            what: "logical block",
            index,
        })
    }

    /// Data plus index blocks a node of `size` bytes occupies when every block
    /// below its size is allocated.
    pub fn blocks_for_size(&self, size: u64) -> u64 {
        let f = self.fanout;
        let data = self.blocks_in(size);
        let mut total = data;
        let mut rest = data.saturating_sub(DIRECT_BLOCKS as u64);

        // 1-indirect: a single index block.
        if rest > 0 {
            total += 1;
            rest = rest.saturating_sub(f);
        }
        // 2-indirect: the root plus one leaf per started group of F.
        if rest > 0 {
            let here = rest.min(f * f);
            total += 1 + here.div_ceil(f);
            rest -= here;
        }
        // 3-indirect: the root, one middle block per started F², one leaf per F.
        if rest > 0 {
            total += 1 + rest.div_ceil(f * f) + rest.div_ceil(f);
        }
        total
    }
}

/// An index block held in memory as a fixed number of pointer slots.
///
/// Slot values of 0 read back as `None`. Emptiness is decided by scanning every
/// slot; the on-disk format has no population counter to consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    slots: Box<[BlockAddr]>,
}

impl IndexBlock {
    pub fn parse(buf: &[u8]) -> Self {
        let slots = buf
            .chunks_exact(POINTER_SIZE)
            .map(|c| BlockAddr::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { slots }
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        for (chunk, slot) in buf.chunks_exact_mut(POINTER_SIZE).zip(self.slots.iter()) {
            chunk.copy_from_slice(&slot.to_le_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<BlockAddr> {
        match self.slots[slot] {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn set(&mut self, slot: usize, addr: BlockAddr) {
        debug_assert_ne!(addr, 0);
        self.slots[slot] = addr;
    }

    pub fn clear(&mut self, slot: usize) {
        self.slots[slot] = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|&addr| addr == 0)
    }
}
