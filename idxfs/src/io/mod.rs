mod block;
mod emulator;
mod memory;

pub(crate) use block::check_transfer;
pub use block::{BlockNumber, BlockStorage};
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder};
pub use memory::MemoryDisk;
