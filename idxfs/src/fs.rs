use crate::alloc::{Bitmap, BitmapKind, State};
use crate::io::BlockStorage;
use crate::layout::{BlockAddr, Geometry, IndexBlock};
use crate::sb::SuperBlock;
use crate::time::{Clock, PackedTime, SystemClock};

use log::{debug, trace};
use thiserror::Error;

/// Node slots formatted when the caller does not ask for a number.
const DEFAULT_NODE_COUNT: usize = 256;

#[derive(Error, Debug)]
pub enum IdxFsError {
    #[error("device i/o failed: {0}")]
    DeviceIo(#[from] std::io::Error),
    #[error("{0} bitmap exhausted")]
    AllocationExhausted(BitmapKind),
    #[error("{what} index {index} out of range")]
    InvalidIndex { what: &'static str, index: u64 },
    #[error("{kind} bit {index} is not allocated")]
    NotAllocated { kind: BitmapKind, index: u64 },
    #[error("node {node} has no block for logical index {index} inside its size")]
    Hole { node: u32, index: u64 },
    #[error("offset {0} is at or past end of file")]
    EndOfFile(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid file system layout: {0}")]
    InvalidLayout(String),
}

pub type Result<T> = std::result::Result<T, IdxFsError>;

/// Knobs for [`IdxFs::format`]. The block size and block count always come from
/// the device.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    node_count: usize,
    device_id: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            node_count: DEFAULT_NODE_COUNT,
            device_id: 0,
        }
    }
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of node table slots, the upper bound on live files.
    pub fn with_node_count(mut self, nodes: usize) -> Self {
        self.node_count = nodes;
        self
    }

    /// Sets the device identifier stamped into every node.
    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }
}

/// A file system context bound to one block device.
///
/// Holds the superblock, both allocation bitmaps and the clock used to stamp
/// node records. Every operation borrows the context mutably, so at most one
/// mutation is ever in flight; there is no locking below this type and callers
/// sharing a context across threads must serialize access themselves.
///
/// # Layout
/// ==================================================================================
/// | SuperBlock | Bitmap (nodes) | Bitmap (data region) | Node table | Data Region |
/// ==================================================================================
pub struct IdxFs<T: BlockStorage> {
    pub(crate) dev: T,
    pub(crate) super_block: SuperBlock,
    pub(crate) geometry: Geometry,
    node_map: Bitmap,
    block_map: Bitmap,
    clock: Box<dyn Clock>,
}

impl<T: BlockStorage> IdxFs<T> {
    /// Initializes the file system onto owned block storage.
    pub fn format(mut dev: T, options: FormatOptions) -> Result<Self> {
        let geometry = Geometry::new(dev.block_size())?;
        if options.node_count == 0 {
            return Err(IdxFsError::InvalidArgument(
                "node count must be non-zero".to_string(),
            ));
        }
        let super_block = SuperBlock::layout(
            geometry.block_size(),
            dev.block_count(),
            options.node_count,
            options.device_id,
        )?;
        debug!("formatting device {}: {:?}", options.device_id, super_block);

        let (node_map, block_map) = bitmaps(&super_block, geometry.block_size());
        node_map.sync_all(&mut dev)?;
        block_map.sync_all(&mut dev)?;

        // A zeroed node table slot reads back as an invalid node.
        let zeroes = vec![0; geometry.block_size()];
        let table = super_block.node_table_start as usize;
        for block in table..table + super_block.node_table_blocks as usize {
            dev.write_block(block, &zeroes)?;
        }

        dev.write_block(0, &super_block.serialize(geometry.block_size()))?;
        dev.sync_disk()?;

        Ok(IdxFs {
            dev,
            super_block,
            geometry,
            node_map,
            block_map,
            clock: Box::new(SystemClock),
        })
    }

    /// Mounts a device previously prepared by [`IdxFs::format`].
    pub fn mount(mut dev: T) -> Result<Self> {
        let geometry = Geometry::new(dev.block_size())?;
        let mut block_buf = vec![0; geometry.block_size()];

        // Read superblock from first block.
        dev.read_block(0, &mut block_buf)?;
        let super_block = SuperBlock::parse(&block_buf)?;
        super_block.validate(geometry.block_size(), dev.block_count())?;

        let node_map = Bitmap::load(
            &mut dev,
            super_block.node_bitmap_start as usize,
            super_block.node_bitmap_blocks as usize,
            super_block.node_count as usize,
        )?;
        let block_map = Bitmap::load(
            &mut dev,
            super_block.block_bitmap_start as usize,
            super_block.block_bitmap_blocks as usize,
            super_block.data_blocks as usize,
        )?;
        debug!(
            "mounted device {}: {} of {} nodes live, {} of {} blocks used",
            super_block.device_id,
            super_block.live_files,
            super_block.node_count,
            block_map.allocated(),
            super_block.data_blocks
        );

        Ok(IdxFs {
            dev,
            super_block,
            geometry,
            node_map,
            block_map,
            clock: Box::new(SystemClock),
        })
    }

    /// Replaces the clock used to stamp node records.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn device_id(&self) -> u32 {
        self.super_block.device_id
    }

    pub fn device(&self) -> &T {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut T {
        &mut self.dev
    }

    /// Flushes the superblock and the device, then hands the device back.
    pub fn unmount(mut self) -> Result<T> {
        self.sync_super()?;
        self.dev.sync_disk()?;
        Ok(self.dev)
    }

    /// Allocates the lowest free index of a bitmap and persists the changed bit.
    pub fn allocate(&mut self, kind: BitmapKind) -> Result<u32> {
        let (map, dev) = match kind {
            BitmapKind::Node => (&mut self.node_map, &mut self.dev),
            BitmapKind::Block => (&mut self.block_map, &mut self.dev),
        };
        let index = map
            .first_free()
            .ok_or(IdxFsError::AllocationExhausted(kind))?;
        map.set_reserved(index);
        map.sync_bit(dev, index)?;
        trace!("allocated {} bit {}", kind, index);
        Ok(index as u32)
    }

    /// Returns an index to its bitmap and persists the changed bit.
    pub fn free(&mut self, kind: BitmapKind, index: u32) -> Result<()> {
        let (map, dev) = match kind {
            BitmapKind::Node => (&mut self.node_map, &mut self.dev),
            BitmapKind::Block => (&mut self.block_map, &mut self.dev),
        };
        let index = index as usize;
        if index >= map.capacity() || map.get(index) == State::Free {
            return Err(IdxFsError::NotAllocated {
                kind,
                index: index as u64,
            });
        }
        map.set_free(index);
        map.sync_bit(dev, index)?;
        trace!("freed {} bit {}", kind, index);
        Ok(())
    }

    /// Writes the bitmap block holding `index` to disk.
    pub fn sync_bit(&mut self, kind: BitmapKind, index: u32) -> Result<()> {
        let (map, dev) = match kind {
            BitmapKind::Node => (&self.node_map, &mut self.dev),
            BitmapKind::Block => (&self.block_map, &mut self.dev),
        };
        if index as usize >= map.capacity() {
            return Err(IdxFsError::InvalidIndex {
                what: "bitmap",
                index: index as u64,
            });
        }
        map.sync_bit(dev, index as usize)?;
        Ok(())
    }

    /// Number of indices currently handed out by a bitmap.
    pub fn allocated(&self, kind: BitmapKind) -> usize {
        match kind {
            BitmapKind::Node => self.node_map.allocated(),
            BitmapKind::Block => self.block_map.allocated(),
        }
    }

    /// Number of indices still available in a bitmap.
    pub fn free_count(&self, kind: BitmapKind) -> usize {
        match kind {
            BitmapKind::Node => self.node_map.capacity() - self.node_map.allocated(),
            BitmapKind::Block => self.block_map.capacity() - self.block_map.allocated(),
        }
    }

    pub fn sync_super(&mut self) -> Result<()> {
        let buf = self.super_block.serialize(self.geometry.block_size());
        self.dev.write_block(0, &buf)?;
        Ok(())
    }

    pub(crate) fn now(&self) -> PackedTime {
        self.clock.now()
    }

    /// Allocates a data region block, zeroes it on disk and returns its address.
    pub(crate) fn allocate_block(&mut self) -> Result<BlockAddr> {
        let index = self.allocate(BitmapKind::Block)?;
        let addr = self.super_block.data_start + index;
        let zeroes = vec![0; self.geometry.block_size()];
        self.dev.write_block(addr as usize, &zeroes)?;
        debug!("allocated block {}", addr);
        Ok(addr)
    }

    pub(crate) fn free_block(&mut self, addr: BlockAddr) -> Result<()> {
        let (start, len) = (self.super_block.data_start, self.super_block.data_blocks);
        if addr < start || addr - start >= len {
            return Err(IdxFsError::InvalidIndex {
                what: "data block",
                index: addr as u64,
            });
        }
        self.free(BitmapKind::Block, addr - start)?;
        debug!("freed block {}", addr);
        Ok(())
    }

    pub(crate) fn read_index(&mut self, addr: BlockAddr) -> Result<IndexBlock> {
        let mut buf = vec![0; self.geometry.block_size()];
        self.dev.read_block(addr as usize, &mut buf)?;
        Ok(IndexBlock::parse(&buf))
    }

    pub(crate) fn write_index(&mut self, addr: BlockAddr, block: &IndexBlock) -> Result<()> {
        let mut buf = vec![0; self.geometry.block_size()];
        block.serialize(&mut buf);
        self.dev.write_block(addr as usize, &buf)?;
        Ok(())
    }
}

fn bitmaps(sb: &SuperBlock, block_size: usize) -> (Bitmap, Bitmap) {
    let node_map = Bitmap::new(
        sb.node_bitmap_start as usize,
        sb.node_bitmap_blocks as usize,
        block_size,
        sb.node_count as usize,
    );
    let block_map = Bitmap::new(
        sb.block_bitmap_start as usize,
        sb.block_bitmap_blocks as usize,
        block_size,
        sb.data_blocks as usize,
    );
    (node_map, block_map)
}
