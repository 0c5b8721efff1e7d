//! A small indexed block file system.
//!
//! Each node record carries fifteen block pointers: twelve direct ones and the
//! roots of single, double and triple indirect chains. Index blocks are filled
//! on demand as data is written and pruned again when the blocks they lead to
//! are released.
//!
//! ```no_run
//! use idxfs::io::MemoryDisk;
//! use idxfs::{FormatOptions, IdxFs, NodeKind};
//!
//! let dev = MemoryDisk::new(1024, 4096);
//! let mut fs = IdxFs::format(dev, FormatOptions::new())?;
//! let mut node = fs.create(NodeKind::File)?;
//! fs.write(&mut node, 0, b"hello")?;
//! # Ok::<(), idxfs::IdxFsError>(())
//! ```

mod alloc;
mod file;
mod fs;
pub mod io;
pub mod layout;
mod map;
mod node;
mod sb;
mod time;

pub use crate::alloc::BitmapKind;
pub use crate::fs::{FormatOptions, IdxFs, IdxFsError, Result};
pub use crate::layout::{BlockAddr, Geometry};
pub use crate::node::{LoseDepth, Node, NodeKind};
pub use crate::sb::SuperBlock;
pub use crate::time::{Clock, FixedClock, PackedTime, SystemClock};
