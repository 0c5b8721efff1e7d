mod cli;

use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use clap::Parser;
use cli::{Cli, Command};
use idxfs::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use idxfs::{FormatOptions, IdxFs, IdxFsError, LoseDepth, Node, NodeKind, PackedTime};
use log::info;

type Fs = IdxFs<FileBlockEmulator>;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Format {
            blocks,
            nodes,
            device_id,
        } => {
            let fd = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&cli.image)?;
            fd.set_len((blocks * cli.block_size) as u64)?;
            let dev = FileBlockEmulatorBuilder::from(fd)
                .with_block_size(cli.block_size)
                .with_block_count(blocks)
                .build()?;
            let options = FormatOptions::new()
                .with_node_count(nodes)
                .with_device_id(device_id);
            let fs = IdxFs::format(dev, options)?;
            info!("formatted {:?}", cli.image);
            print_super(&fs);
            fs.unmount()?;
        }
        Command::Put { source } => {
            let data = fs::read(&source)?;
            let mut fs = mount(&cli.image, cli.block_size)?;
            let stored = store(&mut fs, &data);
            fs.unmount()?;
            let id = stored?;
            info!("{:?} -> node {}", source, id);
            println!("{}", id);
        }
        Command::Get { id, out } => {
            let mut fs = mount(&cli.image, cli.block_size)?;
            let node = live_node(&mut fs, id)?;
            let data = read_all(&mut fs, &node)?;
            match out {
                Some(path) => File::create(path)?.write_all(&data)?,
                None => io::stdout().write_all(&data)?,
            }
        }
        Command::Rm { id } => {
            let mut fs = mount(&cli.image, cli.block_size)?;
            let node = live_node(&mut fs, id)?;
            fs.lose(node, LoseDepth::Data)?;
            fs.unmount()?;
        }
        Command::Stat { id: None } => {
            let fs = mount(&cli.image, cli.block_size)?;
            print_super(&fs);
        }
        Command::Stat { id: Some(id) } => {
            let mut fs = mount(&cli.image, cli.block_size)?;
            let node = fs.load(id)?;
            println!("node:     {}", node.id());
            println!("kind:     {:?}", node.kind());
            println!("device:   {}", node.device_id());
            println!("size:     {}", node.size());
            println!("created:  {}", show_time(node.created_at()));
            println!("modified: {}", show_time(node.modified_at()));
            println!("accessed: {}", show_time(node.accessed_at()));
            println!("blocks:   {:?}", node.blocks());
        }
    }

    Ok(())
}

fn mount(image: &Path, block_size: usize) -> Result<Fs, IdxFsError> {
    let dev = FileBlockEmulator::open_disk(image, block_size)?;
    IdxFs::mount(dev)
}

/// Copies `data` into a new file node. A node that cannot take all of it is
/// released again so a failed put leaves nothing behind.
fn store<T: BlockStorage>(fs: &mut IdxFs<T>, data: &[u8]) -> Result<u32, Box<dyn Error>> {
    let mut node = fs.create(NodeKind::File)?;
    match fs.write(&mut node, 0, data) {
        Ok(written) if written == data.len() => Ok(node.id()),
        Ok(written) => {
            fs.lose(node, LoseDepth::Data)?;
            Err(format!("only {} of {} bytes fit", written, data.len()).into())
        }
        Err(err) => {
            fs.lose(node, LoseDepth::Data)?;
            Err(err.into())
        }
    }
}

fn live_node(fs: &mut Fs, id: u32) -> Result<Node, Box<dyn Error>> {
    let node = fs.load(id)?;
    if node.kind() == NodeKind::Invalid {
        return Err(format!("node {} is not in use", id).into());
    }
    Ok(node)
}

fn read_all<T: BlockStorage>(fs: &mut IdxFs<T>, node: &Node) -> Result<Vec<u8>, IdxFsError> {
    let mut data = vec![0; node.size() as usize];
    let mut pos = 0;
    while pos < data.len() {
        pos += fs.read(node, pos as u64, &mut data[pos..])?;
    }
    Ok(data)
}

fn print_super(fs: &Fs) {
    let sb = fs.super_block();
    println!("device:      {}", sb.device_id);
    println!("block size:  {}", sb.block_size);
    println!("blocks:      {}", sb.total_blocks);
    println!(
        "nodes:       {} of {} live",
        sb.live_files, sb.node_count
    );
    println!(
        "data blocks: {} free of {} (from block {})",
        fs.free_count(idxfs::BitmapKind::Block),
        sb.data_blocks,
        sb.data_start
    );
}

fn show_time(t: PackedTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}
