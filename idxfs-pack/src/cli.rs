use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Build and inspect idxfs images")]
pub struct Cli {
    /// Image file
    #[arg(long, short)]
    pub image: PathBuf,

    /// Block size in bytes
    #[arg(long, short, default_value_t = 1024)]
    pub block_size: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the image and lay out an empty file system
    Format {
        /// Device size in blocks
        #[arg(long)]
        blocks: usize,

        /// Node table capacity
        #[arg(long, default_value_t = 256)]
        nodes: usize,

        #[arg(long, default_value_t = 0)]
        device_id: u32,
    },
    /// Copy a host file into a new node and print its id
    Put { source: PathBuf },
    /// Copy a node's content out
    Get {
        id: u32,

        /// Output file, stdout when absent
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Release a node and its blocks
    Rm { id: u32 },
    /// Print the superblock summary, or one node's record
    Stat { id: Option<u32> },
}
