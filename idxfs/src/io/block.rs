/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Tried to map as closely as possible to the prescribed interface found here:
/// http://web.mit.edu/6.033/1997/handouts/html/04sfs.html.
///
/// One implementation serves exactly one device. Every transfer moves exactly one
/// block of `block_size()` bytes; the file system never addresses a device in any
/// other unit.
pub trait BlockStorage {
    /// The size in bytes of a single block.
    fn block_size(&self) -> usize;
    /// The total number of blocks available on the device.
    fn block_count(&self) -> usize;
    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}

/// Shared bounds check used by the storage implementations.
pub(crate) fn check_transfer(
    blocknr: BlockNumber,
    block_count: usize,
    buf_len: usize,
    block_size: usize,
) -> std::io::Result<()> {
    use std::io::{Error, ErrorKind};

    if blocknr >= block_count {
        return Err(Error::new(ErrorKind::InvalidInput, "block out of range"));
    }
    if buf_len != block_size {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "buffer length must equal the device block size",
        ));
    }
    Ok(())
}
