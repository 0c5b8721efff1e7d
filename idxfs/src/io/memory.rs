use crate::io::{check_transfer, BlockNumber, BlockStorage};
use std::collections::HashMap;
use std::io::{Error, ErrorKind};

/// A sparse block device held in memory. Blocks that were never written read back
/// as zeroes, so a large device costs only what is actually stored.
///
/// Counts every transfer and can be told to fail a single upcoming write, which
/// makes it the device of choice for exercising error paths in tests.
#[derive(Debug, Default)]
pub struct MemoryDisk {
    blocks: HashMap<BlockNumber, Box<[u8]>>,
    block_size: usize,
    block_count: usize,
    reads: usize,
    writes: usize,
    /// Number of writes to let through before failing exactly one.
    fail_write_after: Option<usize>,
}

impl MemoryDisk {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
            ..Default::default()
        }
    }

    /// Total successful block reads since creation.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Total successful block writes since creation.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Lets `skip` writes succeed and then fails the next one. Later writes
    /// succeed again.
    pub fn inject_write_failure(&mut self, skip: usize) {
        self.fail_write_after = Some(skip);
    }

    /// Returns a copy of a block without touching the transfer counters.
    pub fn snapshot(&self, blocknr: BlockNumber) -> Vec<u8> {
        match self.blocks.get(&blocknr) {
            Some(data) => data.to_vec(),
            None => vec![0; self.block_size],
        }
    }
}

impl BlockStorage for MemoryDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        check_transfer(blocknr, self.block_count, buf.len(), self.block_size)?;
        match self.blocks.get(&blocknr) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.iter_mut().for_each(|b| *b = 0),
        }
        self.reads += 1;
        Ok(())
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        check_transfer(blocknr, self.block_count, buf.len(), self.block_size)?;
        match self.fail_write_after {
            Some(0) => {
                self.fail_write_after = None;
                return Err(Error::new(ErrorKind::Other, "injected write failure"));
            }
            Some(n) => self.fail_write_after = Some(n - 1),
            None => {}
        }
        self.blocks.insert(blocknr, buf.into());
        self.writes += 1;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
