//! Logical to physical block mapping.
//!
//! `resolve` walks a node's pointer tree top-down and allocates whatever is
//! missing on the way. A freshly allocated block is zeroed and its address is
//! persisted in the parent (the node record or an index block) before the walk
//! descends into it, so an interrupted walk leaks at worst an allocated but
//! unreferenced block.
//!
//! `release` is the inverse. It frees one data block and then unwinds bottom-up,
//! freeing every index block the free left empty. Unwinding stops at the first
//! level that still holds a pointer.

use crate::fs::{IdxFs, Result};
use crate::io::BlockStorage;
use crate::layout::BlockAddr;
use crate::node::Node;

use log::{debug, trace};

impl<T: BlockStorage> IdxFs<T> {
    /// Returns the physical address of logical block `index`, allocating and
    /// zeroing any data or index block on the path that does not exist yet.
    ///
    /// Calling this again for the same index returns the same address without
    /// allocating.
    pub fn resolve(&mut self, node: &mut Node, index: u64) -> Result<BlockAddr> {
        let path = self.geometry.locate(index)?;

        let mut addr = match node.block(path.slot()) {
            Some(addr) => addr,
            None => {
                let addr = self.allocate_block()?;
                node.blocks[path.slot()] = addr;
                self.sync(node)?;
                addr
            }
        };

        for &offset in path.offsets() {
            let mut parent = self.read_index(addr)?;
            addr = match parent.get(offset) {
                Some(child) => child,
                None => {
                    let child = self.allocate_block()?;
                    parent.set(offset, child);
                    self.write_index(addr, &parent)?;
                    trace!("linked block {} at slot {} of index block {}", child, offset, addr);
                    child
                }
            };
        }

        trace!("node {} block {} -> {}", node.id, index, addr);
        Ok(addr)
    }

    /// Returns the physical address of logical block `index` without allocating.
    pub fn lookup(&mut self, node: &Node, index: u64) -> Result<Option<BlockAddr>> {
        let path = self.geometry.locate(index)?;
        let mut addr = match node.block(path.slot()) {
            Some(addr) => addr,
            None => return Ok(None),
        };
        for &offset in path.offsets() {
            addr = match self.read_index(addr)?.get(offset) {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(addr))
    }

    /// Frees logical block `index` and every index block left empty by doing so.
    ///
    /// Each freed block costs one bitmap write; each surviving ancestor is written
    /// at most once. Releasing a block that was never allocated is a no-op, apart
    /// from pruning index blocks that are already empty.
    pub fn release(&mut self, node: &mut Node, index: u64) -> Result<()> {
        let path = self.geometry.locate(index)?;
        let root = match node.block(path.slot()) {
            Some(root) => root,
            None => return Ok(()),
        };

        let root_emptied = path.depth() == 0 || self.prune(root, path.offsets())?;
        if root_emptied {
            self.free_block(root)?;
            node.blocks[path.slot()] = 0;
            self.sync(node)?;
            if path.depth() > 0 {
                debug!("node {} dropped indirect root {}", node.id, root);
            }
        }
        Ok(())
    }

    /// Releases every logical block below the node's size, then sets the size to
    /// zero. A node that is already empty is left untouched.
    pub fn release_all(&mut self, node: &mut Node) -> Result<()> {
        if node.size == 0 {
            return Ok(());
        }
        let blocks = self.geometry.blocks_in(node.size);
        for index in 0..blocks {
            self.release(node, index)?;
        }
        node.size = 0;
        self.sync(node)?;
        debug!("node {} released {} blocks", node.id, blocks);
        Ok(())
    }

    /// Releases the child at `offsets[0]` of the index block at `addr`, recursing
    /// through the remaining offsets first. Returns whether the index block is
    /// empty afterwards so the caller can drop its own pointer to it.
    fn prune(&mut self, addr: BlockAddr, offsets: &[usize]) -> Result<bool> {
        let (&offset, below) = match offsets.split_first() {
            Some(split) => split,
            None => return Ok(false),
        };
        let mut block = self.read_index(addr)?;

        let child = match block.get(offset) {
            Some(child) => child,
            // Nothing to free here, but a leaked empty index block still goes.
            None => return Ok(block.is_empty()),
        };
        let child_emptied = below.is_empty() || self.prune(child, below)?;
        if !child_emptied {
            return Ok(false);
        }

        self.free_block(child)?;
        block.clear(offset);
        self.write_index(addr, &block)?;

        let emptied = block.is_empty();
        if emptied {
            trace!("index block {} is empty", addr);
        }
        Ok(emptied)
    }
}
