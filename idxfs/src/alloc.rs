use crate::io::{BlockNumber, BlockStorage};
use log::warn;
use std::fmt;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// Selects one of the two independent allocation maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    /// Tracks node identifiers, bit `i` is node slot `i`.
    Node,
    /// Tracks the data region, bit `i` is block address `data_start + i`.
    Block,
}

impl fmt::Display for BitmapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapKind::Node => write!(f, "node"),
            BitmapKind::Block => write!(f, "block"),
        }
    }
}

/// A bitmap kept in memory and persisted to a contiguous run of blocks. Each
/// block of the region holds `block_size * 8` bits packed into little-endian
/// 64-bit words, bit `i` of word `w` tracking index `w * 64 + i`.
///
/// Only the first `capacity` bits are ever handed out; the tail of the last
/// block stays zero.
#[derive(Debug)]
pub struct Bitmap {
    /// First block of the persisted region.
    start: BlockNumber,
    /// Number of blocks in the persisted region.
    blocks: usize,
    words: Vec<u64>,
    words_per_block: usize,
    capacity: usize,
}

impl Bitmap {
    /// Creates an all-free bitmap covering `blocks` blocks starting at `start`.
    pub fn new(start: BlockNumber, blocks: usize, block_size: usize, capacity: usize) -> Self {
        let words_per_block = block_size / 8;
        debug_assert!(capacity <= blocks * words_per_block * 64);
        Self {
            start,
            blocks,
            words: vec![0; blocks * words_per_block],
            words_per_block,
            capacity,
        }
    }

    /// Reads a persisted bitmap region back into memory.
    pub fn load<T: BlockStorage>(
        dev: &mut T,
        start: BlockNumber,
        blocks: usize,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let block_size = dev.block_size();
        let mut map = Self::new(start, blocks, block_size, capacity);
        let mut buf = vec![0; block_size];
        for block in 0..blocks {
            dev.read_block(start + block, &mut buf)?;
            let words = &mut map.words[block * map.words_per_block..][..map.words_per_block];
            for (word, bytes) in words.iter_mut().zip(buf.chunks_exact(8)) {
                let mut raw = [0; 8];
                raw.copy_from_slice(bytes);
                *word = u64::from_le_bytes(raw);
            }
        }
        let stray = map.clear_past_capacity();
        if stray > 0 {
            warn!(
                "bitmap at block {}: dropped {} set bits past capacity {}",
                start, stray, capacity
            );
        }
        Ok(map)
    }

    /// The number of indices this bitmap can hand out.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Population count over the indices below capacity.
    pub fn allocated(&self) -> usize {
        self.words
            .iter()
            .enumerate()
            .map(|(group, &bits)| (bits & valid_bits(self.capacity, group)).count_ones() as usize)
            .sum()
    }

    pub fn get(&self, index: usize) -> State {
        assert!(index < self.capacity);
        let word = self.words[index / 64];
        match (word >> (index % 64)) & 0b01 {
            0 => State::Free,
            _ => State::Used,
        }
    }

    pub fn set_reserved(&mut self, index: usize) {
        assert!(index < self.capacity);
        self.words[index / 64] |= 0b01_u64 << (index % 64);
    }

    pub fn set_free(&mut self, index: usize) {
        assert!(index < self.capacity);
        self.words[index / 64] &= !(0b01_u64 << (index % 64));
    }

    /// Lowest-numbered free index, scanning in ascending order.
    pub fn first_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find_map(|(group, &bits)| {
                (bits != u64::MAX).then(|| group * 64 + bits.trailing_ones() as usize)
            })
            .filter(|&index| index < self.capacity)
    }

    /// Persists the block of the region that holds `index`.
    pub fn sync_bit<T: BlockStorage>(&self, dev: &mut T, index: usize) -> std::io::Result<()> {
        let bits_per_block = self.words_per_block * 64;
        self.sync_block(dev, index / bits_per_block)
    }

    /// Persists the whole region.
    pub fn sync_all<T: BlockStorage>(&self, dev: &mut T) -> std::io::Result<()> {
        for block in 0..self.blocks {
            self.sync_block(dev, block)?;
        }
        Ok(())
    }

    /// Clears every bit at or past capacity and returns how many were set.
    fn clear_past_capacity(&mut self) -> usize {
        let mut cleared = 0;
        for (group, bits) in self.words.iter_mut().enumerate() {
            let mask = valid_bits(self.capacity, group);
            cleared += (*bits & !mask).count_ones() as usize;
            *bits &= mask;
        }
        cleared
    }

    fn sync_block<T: BlockStorage>(&self, dev: &mut T, block: usize) -> std::io::Result<()> {
        let words = &self.words[block * self.words_per_block..][..self.words_per_block];
        let buf: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        dev.write_block(self.start + block, &buf)
    }
}

/// Mask of the bits of word `group` that track indices below `capacity`.
fn valid_bits(capacity: usize, group: usize) -> u64 {
    let base = group * 64;
    if base >= capacity {
        0
    } else if capacity - base >= 64 {
        u64::MAX
    } else {
        (1_u64 << (capacity - base)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryDisk;

    fn bitmap(capacity: usize) -> Bitmap {
        Bitmap::new(1, 2, 128, capacity)
    }

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = bitmap(2048);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = bitmap(2048);

        bmp.set_reserved(0);
        bmp.set_reserved(2047);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(2047), State::Used);
        assert_eq!(bmp.allocated(), 2);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = bitmap(2048);

        bmp.set_reserved(10);
        bmp.set_reserved(11);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbouring bits are left alone.
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    fn first_free_is_lowest_index() {
        let mut bmp = bitmap(2048);
        for i in 0..70 {
            bmp.set_reserved(i);
        }
        bmp.set_free(3);
        assert_eq!(bmp.first_free(), Some(3));

        bmp.set_reserved(3);
        assert_eq!(bmp.first_free(), Some(70));
    }

    #[test]
    fn first_free_never_exceeds_capacity() {
        let mut bmp = bitmap(5);
        for i in 0..5 {
            bmp.set_reserved(i);
        }
        assert_eq!(bmp.first_free(), None);
    }

    #[test]
    fn sync_bit_writes_only_the_containing_block() {
        let mut dev = MemoryDisk::new(128, 4);
        let mut bmp = bitmap(2048);

        // 128 byte blocks hold 1024 bits, so bit 1030 lives in the second block.
        bmp.set_reserved(1030);
        bmp.sync_bit(&mut dev, 1030).unwrap();

        assert_eq!(dev.writes(), 1);
        assert_eq!(dev.snapshot(1), vec![0; 128]);
        let second = dev.snapshot(2);
        assert_eq!(second[0], 0b0100_0000);
    }

    #[test]
    fn can_persist_and_load_state() {
        let mut dev = MemoryDisk::new(128, 4);
        let mut bmp = bitmap(2048);
        bmp.set_reserved(10);
        bmp.set_reserved(11);
        bmp.set_reserved(1500);
        bmp.sync_all(&mut dev).unwrap();

        let read_bmp = Bitmap::load(&mut dev, 1, 2, 2048).unwrap();
        assert_eq!(read_bmp.allocated(), 3);
        assert_eq!(read_bmp.get(1500), State::Used);
        assert_eq!(read_bmp.get(12), State::Free);
    }

    #[test]
    fn load_drops_bits_past_capacity() {
        let mut dev = MemoryDisk::new(128, 4);
        let mut raw = vec![0; 128];
        raw[0] = 0b1111_0000;
        raw[100] = 0xFF;
        dev.write_block(1, &raw).unwrap();

        let mut bmp = Bitmap::load(&mut dev, 1, 2, 4).unwrap();
        assert_eq!(bmp.allocated(), 0);
        assert_eq!(bmp.first_free(), Some(0));

        // The cleared tail is what gets written back.
        bmp.set_reserved(1);
        bmp.sync_bit(&mut dev, 1).unwrap();
        let mut expected = vec![0; 128];
        expected[0] = 0b10;
        assert_eq!(dev.snapshot(1), expected);
    }

    #[test]
    fn allocated_ignores_bits_past_capacity() {
        let mut bmp = bitmap(70);
        bmp.set_reserved(69);
        bmp.words[1] |= 1 << 40;
        bmp.words[5] = u64::MAX;
        assert_eq!(bmp.allocated(), 1);
    }
}
