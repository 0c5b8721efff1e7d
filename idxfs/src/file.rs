use crate::fs::{IdxFs, IdxFsError, Result};
use crate::io::BlockStorage;
use crate::node::Node;

use log::{debug, warn};

impl<T: BlockStorage> IdxFs<T> {
    /// Writes `buf` into the node starting at byte `pos`.
    ///
    /// A position past the end of the file is pulled back to the current size,
    /// so writes never leave holes. The size grows block by block as data lands
    /// and the record is synced once at the end. Returns the number of bytes
    /// written, which is short only when an error hits after some progress.
    pub fn write(&mut self, node: &mut Node, pos: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.geometry.block_size();
        let mut pos = pos.min(node.size);
        let mut scratch = vec![0; block_size];
        let mut written = 0;

        while written < buf.len() {
            let index = pos / block_size as u64;
            let offset = (pos % block_size as u64) as usize;
            let len = (block_size - offset).min(buf.len() - written);
            let src = &buf[written..written + len];

            if let Err(err) = self.write_in_block(node, index, offset, src, &mut scratch) {
                if written == 0 {
                    return Err(err);
                }
                warn!(
                    "node {}: short write, {} of {} bytes: {}",
                    node.id,
                    written,
                    buf.len(),
                    err
                );
                break;
            }

            written += len;
            pos += len as u64;
            if pos > node.size {
                node.size = pos;
            }
        }

        node.modified_at = self.now();
        node.accessed_at = node.modified_at;
        self.sync(node)?;
        Ok(written)
    }

    /// Reads up to `buf.len()` bytes starting at byte `pos`, clamped to the size.
    ///
    /// # Errors
    ///
    /// A read at or past the end of the file fails with `EndOfFile` rather than
    /// returning zero bytes. A missing block inside the size is reported as a
    /// `Hole`, which means the record is inconsistent.
    pub fn read(&mut self, node: &Node, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= node.size {
            return Err(IdxFsError::EndOfFile(pos));
        }
        let block_size = self.geometry.block_size();
        let want = (node.size - pos).min(buf.len() as u64) as usize;
        let mut scratch = vec![0; block_size];
        let mut pos = pos;
        let mut read = 0;

        while read < want {
            let index = pos / block_size as u64;
            let offset = (pos % block_size as u64) as usize;
            let len = (block_size - offset).min(want - read);
            let dest = &mut buf[read..read + len];

            if let Err(err) = self.read_in_block(node, index, offset, dest, &mut scratch) {
                if read == 0 {
                    return Err(err);
                }
                warn!("node {}: short read, {} of {} bytes: {}", node.id, read, want, err);
                break;
            }

            read += len;
            pos += len as u64;
        }
        Ok(read)
    }

    /// Sets the node's size. Shrinking releases every block past the new end;
    /// growing allocates zeroed blocks up to it.
    pub fn truncate(&mut self, node: &mut Node, size: u64) -> Result<()> {
        let block_size = self.geometry.block_size() as u64;
        let old_blocks = self.geometry.blocks_in(node.size);
        let new_blocks = self.geometry.blocks_in(size);

        if size < node.size {
            node.size = size;
            self.sync(node)?;
            for index in new_blocks..old_blocks {
                self.release(node, index)?;
            }
            self.zero_tail(node)?;
            debug!("node {} shrunk to {} bytes", node.id, size);
        } else if size > node.size {
            for index in old_blocks..new_blocks {
                self.resolve(node, index)?;
                node.size = size.min((index + 1) * block_size);
            }
            node.size = size;
            debug!("node {} grown to {} bytes", node.id, size);
        }

        node.modified_at = self.now();
        self.sync(node)
    }

    fn write_in_block(
        &mut self,
        node: &mut Node,
        index: u64,
        offset: usize,
        src: &[u8],
        scratch: &mut [u8],
    ) -> Result<()> {
        let addr = self.resolve(node, index)? as usize;
        // Partial writes must keep the bytes around them.
        if src.len() < scratch.len() {
            self.dev.read_block(addr, scratch)?;
        }
        scratch[offset..offset + src.len()].copy_from_slice(src);
        self.dev.write_block(addr, scratch)?;
        Ok(())
    }

    fn read_in_block(
        &mut self,
        node: &Node,
        index: u64,
        offset: usize,
        dest: &mut [u8],
        scratch: &mut [u8],
    ) -> Result<()> {
        let addr = self
            .lookup(node, index)?
            .ok_or(IdxFsError::Hole {
                node: node.id,
                index,
            })?;
        self.dev.read_block(addr as usize, scratch)?;
        dest.copy_from_slice(&scratch[offset..offset + dest.len()]);
        Ok(())
    }

    /// Zeroes the bytes past the end of file in the last block, so growing the
    /// file again never exposes data from before a shrink.
    fn zero_tail(&mut self, node: &Node) -> Result<()> {
        let block_size = self.geometry.block_size();
        let offset = (node.size % block_size as u64) as usize;
        if offset == 0 {
            return Ok(());
        }
        let index = node.size / block_size as u64;
        if let Some(addr) = self.lookup(node, index)? {
            let mut block = vec![0; block_size];
            self.dev.read_block(addr as usize, &mut block)?;
            block[offset..].iter_mut().for_each(|b| *b = 0);
            self.dev.write_block(addr as usize, &block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::alloc::BitmapKind;
    use crate::fs::{FormatOptions, IdxFs, IdxFsError};
    use crate::io::MemoryDisk;
    use crate::node::{Node, NodeKind};
    use crate::time::{FixedClock, PackedTime};

    fn fs_with(block_size: usize, blocks: usize) -> (IdxFs<MemoryDisk>, Node) {
        let dev = MemoryDisk::new(block_size, blocks);
        let mut fs = IdxFs::format(dev, FormatOptions::new().with_node_count(8)).unwrap();
        let node = fs.create(NodeKind::File).unwrap();
        (fs, node)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn read_all(fs: &mut IdxFs<MemoryDisk>, node: &Node) -> Vec<u8> {
        let mut out = vec![0; node.size() as usize];
        assert_eq!(fs.read(node, 0, &mut out).unwrap(), out.len());
        out
    }

    #[test]
    fn round_trip_across_indirect_levels() {
        let (mut fs, mut node) = fs_with(128, 8192);
        // Direct, single and double indirect blocks plus a ragged tail.
        let data = pattern(128 * 60 + 17);
        assert_eq!(fs.write(&mut node, 0, &data).unwrap(), data.len());
        assert_eq!(node.size(), data.len() as u64);
        assert_eq!(read_all(&mut fs, &node), data);

        let mut middle = vec![0; 300];
        assert_eq!(fs.read(&node, 1000, &mut middle).unwrap(), 300);
        assert_eq!(&middle[..], &data[1000..1300]);
    }

    #[test]
    fn partial_overwrite_keeps_neighbouring_bytes() {
        let (mut fs, mut node) = fs_with(128, 256);
        fs.write(&mut node, 0, &[b'a'; 300]).unwrap();
        fs.write(&mut node, 126, b"XYZW").unwrap();

        let content = read_all(&mut fs, &node);
        assert_eq!(&content[124..132], b"aaXYZWaa");
        assert_eq!(content.len(), 300);
    }

    #[test]
    fn size_grows_to_end_of_write() {
        let (mut fs, mut node) = fs_with(128, 256);
        fs.write(&mut node, 0, &pattern(200)).unwrap();
        fs.write(&mut node, 150, &pattern(100)).unwrap();
        assert_eq!(node.size(), 250);

        // Entirely inside the current size.
        fs.write(&mut node, 10, &pattern(20)).unwrap();
        assert_eq!(node.size(), 250);
        assert_eq!(fs.load(node.id()).unwrap().size(), 250);
    }

    #[test]
    fn writes_past_end_of_file_land_at_the_end() {
        let (mut fs, mut node) = fs_with(128, 256);
        fs.write(&mut node, 0, b"head").unwrap();
        fs.write(&mut node, 10_000, b"tail").unwrap();

        assert_eq!(node.size(), 8);
        assert_eq!(read_all(&mut fs, &node), b"headtail".to_vec());
        // Only a single data block was needed.
        assert_eq!(fs.allocated(BitmapKind::Block), 1);
    }

    #[test]
    fn reads_clamp_to_size_and_fail_past_end() {
        let (mut fs, mut node) = fs_with(128, 256);
        fs.write(&mut node, 0, b"0123456789").unwrap();

        let mut buf = [0; 64];
        assert_eq!(fs.read(&node, 4, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"456789");

        match fs.read(&node, 10, &mut buf) {
            Err(IdxFsError::EndOfFile(10)) => (),
            other => panic!("unexpected read result {:?}", other),
        }
    }

    #[test]
    fn empty_node_has_nothing_to_read() {
        let (mut fs, node) = fs_with(128, 256);
        let mut buf = [0; 4];
        assert!(matches!(fs.read(&node, 0, &mut buf), Err(IdxFsError::EndOfFile(0))));
    }

    #[test]
    fn missing_block_inside_size_is_a_hole() {
        let (mut fs, mut node) = fs_with(128, 256);
        node.size = 64;
        let mut buf = [0; 8];
        match fs.read(&node, 0, &mut buf) {
            Err(IdxFsError::Hole { node: id, index }) => {
                assert_eq!(id, node.id());
                assert_eq!(index, 0);
            }
            other => panic!("unexpected read result {:?}", other),
        }
    }

    #[test]
    fn device_failure_mid_transfer_returns_short_count() {
        let (mut fs, mut node) = fs_with(128, 256);
        // Block 0 costs four writes: bitmap bit, zeroing, record, data. The
        // sixth write zeroes the second data block.
        fs.device_mut().inject_write_failure(5);

        let data = pattern(256);
        assert_eq!(fs.write(&mut node, 0, &data).unwrap(), 128);
        assert_eq!(node.size(), 128);
        assert_eq!(fs.load(node.id()).unwrap().size(), 128);
        assert_eq!(read_all(&mut fs, &node), data[..128].to_vec());
    }

    #[test]
    fn device_failure_before_progress_is_an_error() {
        let (mut fs, mut node) = fs_with(128, 256);
        fs.device_mut().inject_write_failure(0);
        match fs.write(&mut node, 0, b"data") {
            Err(IdxFsError::DeviceIo(_)) => (),
            other => panic!("unexpected write result {:?}", other),
        }
        assert_eq!(node.size(), 0);
    }

    #[test]
    fn exhausted_device_fails_the_write() {
        let (mut fs, mut node) = fs_with(128, 256);
        while fs.allocate(BitmapKind::Block).is_ok() {}
        assert!(matches!(
            fs.write(&mut node, 0, b"x"),
            Err(IdxFsError::AllocationExhausted(BitmapKind::Block))
        ));
    }

    #[test]
    fn boundary_writes_allocate_index_block_once() {
        let (mut fs, mut node) = fs_with(1024, 1024);
        fs.write(&mut node, 0, &pattern(11 * 1024)).unwrap();

        // One byte into the last direct block.
        let before = fs.allocated(BitmapKind::Block);
        fs.write(&mut node, 11 * 1024, b"!").unwrap();
        assert_eq!(fs.allocated(BitmapKind::Block), before + 1);
        assert!(node.block(11).is_some());
        assert!(node.block(12).is_none());

        // Fill it, then one byte into the first single indirect block.
        fs.write(&mut node, 11 * 1024 + 1, &pattern(1023)).unwrap();
        let before = fs.allocated(BitmapKind::Block);
        fs.write(&mut node, 12 * 1024, b"?").unwrap();
        assert_eq!(fs.allocated(BitmapKind::Block), before + 2);
        assert!(node.block(12).is_some());
        assert_eq!(node.size(), 12 * 1024 + 1);
    }

    #[test]
    fn write_stamps_modification_time() {
        let created = PackedTime::new(2020, 1, 1, 0, 0, 0);
        let modified = PackedTime::new(2020, 1, 2, 0, 0, 0);
        let dev = MemoryDisk::new(128, 256);
        let mut fs = IdxFs::format(dev, FormatOptions::new().with_node_count(8))
            .unwrap()
            .with_clock(FixedClock(created));
        let mut node = fs.create(NodeKind::File).unwrap();

        let mut fs = fs.with_clock(FixedClock(modified));
        fs.write(&mut node, 0, b"hello").unwrap();

        let stored = fs.load(node.id()).unwrap();
        assert_eq!(stored.created_at(), created);
        assert_eq!(stored.modified_at(), modified);
    }

    #[test]
    fn truncate_shrinks_and_releases_blocks() {
        let (mut fs, mut node) = fs_with(128, 8192);
        let data = pattern(128 * 50);
        fs.write(&mut node, 0, &data).unwrap();

        fs.truncate(&mut node, 100).unwrap();
        assert_eq!(node.size(), 100);
        assert_eq!(fs.allocated(BitmapKind::Block), 1);
        assert!(node.blocks()[1..].iter().all(|&b| b == 0));
        assert_eq!(read_all(&mut fs, &node), data[..100].to_vec());
    }

    #[test]
    fn truncate_grows_with_zeroes() {
        let (mut fs, mut node) = fs_with(128, 8192);
        fs.write(&mut node, 0, &[0xFF; 128]).unwrap();
        fs.truncate(&mut node, 60).unwrap();
        fs.truncate(&mut node, 128 * 20).unwrap();

        let content = read_all(&mut fs, &node);
        assert_eq!(content.len(), 128 * 20);
        assert!(content[..60].iter().all(|&b| b == 0xFF));
        assert!(content[60..].iter().all(|&b| b == 0));
        // Twenty data blocks and the single indirect index block.
        assert_eq!(fs.allocated(BitmapKind::Block), 21);
    }
}
