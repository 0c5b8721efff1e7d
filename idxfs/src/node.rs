use crate::alloc::BitmapKind;
use crate::fs::{IdxFs, IdxFsError, Result};
use crate::io::BlockStorage;
use crate::layout::{BlockAddr, BLOCK_POINTERS, NODE_SIZE};
use crate::time::PackedTime;

use log::debug;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone)]
/// The on-disk node record. This structure __must be exactly 128 bytes.__
struct DiskNode {
    /// Slot of this record in the node table.
    id: Le32,
    /// The device the node's blocks live on.
    device_id: Le32,
    kind: Le16,
    reserved: Le16,
    /// The total size of the file in bytes.
    size: Le64,
    create_time: Le32,
    update_time: Le32,
    access_time: Le32,
    /// Reserved for future expansion of file attributes up to the 128 byte limit.
    padding: [u8; 36],
    /// Pointers for the data blocks that belong to the file. Uses the remaining
    /// space of the record.
    blocks: [Le32; BLOCK_POINTERS],
}

const _: () = assert!(std::mem::size_of::<DiskNode>() == NODE_SIZE);

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A free table slot. Deleted nodes are marked invalid in place.
    Invalid = 0,
    File = 1,
    Directory = 2,
    Device = 3,
}

impl NodeKind {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(NodeKind::Invalid),
            1 => Some(NodeKind::File),
            2 => Some(NodeKind::Directory),
            3 => Some(NodeKind::Device),
            _ => None,
        }
    }
}

/// How much of a node [`IdxFs::lose`] tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoseDepth {
    /// Leave data blocks alone, the caller already released them or never had any.
    Record,
    /// Release every data and index block first.
    Data,
}

/// In-memory copy of a node record.
///
/// A `Node` is a plain value owned by whoever loaded it. Mutating operations take
/// it by `&mut`, so one handle cannot be changed from two places at once; two
/// handles loaded from the same slot are not kept in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) id: u32,
    pub(crate) device_id: u32,
    pub(crate) kind: NodeKind,
    pub(crate) size: u64,
    pub(crate) blocks: [BlockAddr; BLOCK_POINTERS],
    pub(crate) created_at: PackedTime,
    pub(crate) modified_at: PackedTime,
    pub(crate) accessed_at: PackedTime,
}

impl Node {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Length in bytes visible to readers.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Pointer in slot `slot` of the record, `None` when nothing is allocated or
    /// the slot is past the last of the fifteen.
    pub fn block(&self, slot: usize) -> Option<BlockAddr> {
        self.blocks.get(slot).copied().filter(|&addr| addr != 0)
    }

    pub fn blocks(&self) -> &[BlockAddr; BLOCK_POINTERS] {
        &self.blocks
    }

    pub fn created_at(&self) -> PackedTime {
        self.created_at
    }

    pub fn modified_at(&self) -> PackedTime {
        self.modified_at
    }

    pub fn accessed_at(&self) -> PackedTime {
        self.accessed_at
    }

    fn to_disk(&self) -> DiskNode {
        let mut raw = DiskNode::new_zeroed();
        raw.id.set(self.id);
        raw.device_id.set(self.device_id);
        raw.kind.set(self.kind as u16);
        raw.size.set(self.size);
        raw.create_time.set(self.created_at.raw());
        raw.update_time.set(self.modified_at.raw());
        raw.access_time.set(self.accessed_at.raw());
        for (slot, &addr) in raw.blocks.iter_mut().zip(self.blocks.iter()) {
            slot.set(addr);
        }
        raw
    }

    fn from_disk(raw: &DiskNode) -> Result<Self> {
        let kind = NodeKind::from_raw(raw.kind.get()).ok_or_else(|| {
            IdxFsError::InvalidLayout(format!(
                "node {} has unknown kind {}",
                raw.id.get(),
                raw.kind.get()
            ))
        })?;
        let mut blocks = [0; BLOCK_POINTERS];
        for (addr, slot) in blocks.iter_mut().zip(raw.blocks.iter()) {
            *addr = slot.get();
        }
        Ok(Node {
            id: raw.id.get(),
            device_id: raw.device_id.get(),
            kind,
            size: raw.size.get(),
            blocks,
            created_at: PackedTime::from_raw(raw.create_time.get()),
            modified_at: PackedTime::from_raw(raw.update_time.get()),
            accessed_at: PackedTime::from_raw(raw.access_time.get()),
        })
    }
}

impl<T: BlockStorage> IdxFs<T> {
    /// Allocates a node identifier and persists an empty record for it.
    pub fn create(&mut self, kind: NodeKind) -> Result<Node> {
        if kind == NodeKind::Invalid {
            return Err(IdxFsError::InvalidArgument(
                "cannot create an invalid node".to_string(),
            ));
        }
        let id = self.allocate(BitmapKind::Node)?;
        let now = self.now();
        let node = Node {
            id,
            device_id: self.device_id(),
            kind,
            size: 0,
            blocks: [0; BLOCK_POINTERS],
            created_at: now,
            modified_at: now,
            accessed_at: now,
        };
        self.sync(&node)?;

        self.super_block.live_files += 1;
        self.sync_super()?;
        debug!("created {:?} node {}", kind, id);
        Ok(node)
    }

    /// Writes the in-memory record back to its slot in the node table.
    pub fn sync(&mut self, node: &Node) -> Result<()> {
        let (block, offset) = self.node_position(node.id)?;
        let mut buf = vec![0; self.geometry.block_size()];
        self.dev.read_block(block, &mut buf)?;
        buf[offset..offset + NODE_SIZE].copy_from_slice(node.to_disk().as_bytes());
        self.dev.write_block(block, &buf)?;
        Ok(())
    }

    /// Reads the record stored in slot `id`. Free slots come back as
    /// [`NodeKind::Invalid`].
    pub fn load(&mut self, id: u32) -> Result<Node> {
        let (block, offset) = self.node_position(id)?;
        let mut buf = vec![0; self.geometry.block_size()];
        self.dev.read_block(block, &mut buf)?;
        let raw = DiskNode::read_from(&buf[offset..offset + NODE_SIZE]).ok_or_else(|| {
            IdxFsError::InvalidLayout(format!("node {} record is truncated", id))
        })?;
        let node = Node::from_disk(&raw)?;
        if node.kind != NodeKind::Invalid && node.id != id {
            return Err(IdxFsError::InvalidLayout(format!(
                "slot {} holds a record for node {}",
                id, node.id
            )));
        }
        Ok(node)
    }

    /// Destroys a node: optionally releases its data, marks the record invalid,
    /// returns the identifier to the node bitmap and drops the live-file count.
    pub fn lose(&mut self, mut node: Node, depth: LoseDepth) -> Result<()> {
        if depth == LoseDepth::Data {
            self.release_all(&mut node)?;
        }
        node.kind = NodeKind::Invalid;
        self.sync(&node)?;
        self.free(BitmapKind::Node, node.id)?;

        self.super_block.live_files = self.super_block.live_files.saturating_sub(1);
        self.sync_super()?;
        debug!("lost node {} ({:?})", node.id, depth);
        Ok(())
    }

    /// Block number and byte offset of a node table slot.
    fn node_position(&self, id: u32) -> Result<(usize, usize)> {
        if id >= self.super_block.node_count {
            return Err(IdxFsError::InvalidIndex {
                what: "node",
                index: id as u64,
            });
        }
        let per_block = self.geometry.nodes_per_block() as u32;
        let block = self.super_block.node_table_start + id / per_block;
        let offset = (id % per_block) as usize * NODE_SIZE;
        Ok((block as usize, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FormatOptions;
    use crate::io::MemoryDisk;
    use crate::time::FixedClock;

    fn test_fs() -> IdxFs<MemoryDisk> {
        let dev = MemoryDisk::new(1024, 512);
        IdxFs::format(dev, FormatOptions::new().with_node_count(32).with_device_id(3))
            .unwrap()
            .with_clock(FixedClock(PackedTime::new(2021, 6, 1, 12, 0, 0)))
    }

    #[test]
    fn created_nodes_start_empty() {
        let mut fs = test_fs();
        let node = fs.create(NodeKind::File).unwrap();

        assert_eq!(node.id(), 0);
        assert_eq!(node.device_id(), 3);
        assert_eq!(node.size(), 0);
        assert!(node.blocks().iter().all(|&b| b == 0));
        assert_eq!(node.created_at(), PackedTime::new(2021, 6, 1, 12, 0, 0));
        assert_eq!(fs.super_block().live_files, 1);
    }

    #[test]
    fn can_serialize_record_to_exact_size() {
        let mut fs = test_fs();
        let node = fs.create(NodeKind::Directory).unwrap();
        assert_eq!(node.to_disk().as_bytes().len(), NODE_SIZE);
    }

    #[test]
    fn load_is_inverse_of_sync() {
        let mut fs = test_fs();
        let _first = fs.create(NodeKind::File).unwrap();
        let mut node = fs.create(NodeKind::File).unwrap();
        node.size = 4242;
        node.blocks[0] = 77;
        node.blocks[14] = 99;
        fs.sync(&node).unwrap();

        assert_eq!(fs.load(node.id()).unwrap(), node);
    }

    #[test]
    fn records_share_table_blocks_without_clobbering() {
        let mut fs = test_fs();
        // 1k blocks hold eight 128 byte records.
        let nodes: Vec<Node> = (0..9).map(|_| fs.create(NodeKind::File).unwrap()).collect();
        for node in &nodes {
            assert_eq!(&fs.load(node.id()).unwrap(), node);
        }
        let table = fs.super_block().node_table_start as usize;
        let first_block = fs.device().snapshot(table);
        assert_eq!(&first_block[128..132], &1_u32.to_le_bytes());
    }

    #[test]
    fn unused_slots_load_as_invalid() {
        let mut fs = test_fs();
        assert_eq!(fs.load(5).unwrap().kind(), NodeKind::Invalid);
    }

    #[test]
    fn load_out_of_range_is_invalid_index() {
        let mut fs = test_fs();
        match fs.load(32) {
            Err(IdxFsError::InvalidIndex { what, index }) => {
                assert_eq!(what, "node");
                assert_eq!(index, 32);
            }
            other => panic!("unexpected load result {:?}", other),
        }
    }

    #[test]
    fn cannot_create_invalid_nodes() {
        let mut fs = test_fs();
        assert!(fs.create(NodeKind::Invalid).is_err());
        assert_eq!(fs.allocated(BitmapKind::Node), 0);
    }

    #[test]
    fn lose_record_frees_identifier_for_reuse() {
        let mut fs = test_fs();
        let node = fs.create(NodeKind::File).unwrap();
        let id = node.id();
        fs.lose(node, LoseDepth::Record).unwrap();

        assert_eq!(fs.load(id).unwrap().kind(), NodeKind::Invalid);
        assert_eq!(fs.allocated(BitmapKind::Node), 0);
        assert_eq!(fs.super_block().live_files, 0);
        assert_eq!(fs.create(NodeKind::File).unwrap().id(), id);
    }

    #[test]
    fn lose_data_releases_blocks() {
        let mut fs = test_fs();
        let mut node = fs.create(NodeKind::File).unwrap();
        let data = vec![0x5A; 20 * 1024];
        assert_eq!(fs.write(&mut node, 0, &data).unwrap(), data.len());
        assert_eq!(fs.allocated(BitmapKind::Block), 21);

        fs.lose(node, LoseDepth::Data).unwrap();
        assert_eq!(fs.allocated(BitmapKind::Block), 0);
        assert_eq!(fs.allocated(BitmapKind::Node), 0);
    }

    #[test]
    fn live_file_counter_is_persisted() {
        let mut fs = test_fs();
        fs.create(NodeKind::File).unwrap();
        fs.create(NodeKind::File).unwrap();

        let dev = fs.unmount().unwrap();
        let fs = IdxFs::mount(dev).unwrap();
        assert_eq!(fs.super_block().live_files, 2);
        assert_eq!(fs.allocated(BitmapKind::Node), 2);
    }

    #[test]
    fn block_slots_past_the_record_are_empty() {
        let mut fs = test_fs();
        let mut node = fs.create(NodeKind::File).unwrap();
        node.blocks[BLOCK_POINTERS - 1] = 12;

        assert_eq!(node.block(BLOCK_POINTERS - 1), Some(12));
        assert_eq!(node.block(0), None);
        assert_eq!(node.block(BLOCK_POINTERS), None);
        assert_eq!(node.block(usize::MAX), None);
    }
}
