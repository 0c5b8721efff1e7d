use idxfs::io::FileBlockEmulatorBuilder;
use idxfs::{BitmapKind, FormatOptions, IdxFs, NodeKind};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_size(1024)
        .with_block_count(2048)
        .build()
        .expect("Could not initialize disk emulator.");

    let mut fs = IdxFs::format(dev, FormatOptions::new()).expect("should format");
    let mut node = fs.create(NodeKind::File).expect("should create node");

    // Large enough to reach into the double indirect chain.
    let data = vec![0xAB; 400 * 1024];
    let written = fs.write(&mut node, 0, &data).unwrap();
    println!(
        "wrote {} bytes to node {}, {} blocks in use",
        written,
        node.id(),
        fs.allocated(BitmapKind::Block)
    );

    fs.truncate(&mut node, 10 * 1024).unwrap();
    println!(
        "truncated to {} bytes, {} blocks in use",
        node.size(),
        fs.allocated(BitmapKind::Block)
    );
}
