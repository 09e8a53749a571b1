use std::path::PathBuf;

use clap::Parser;
use mftfs::{debug_fs, BitmapAllocator, BlockTable, FileSystem, BLOCK_SIZE, NUM_BLOCKS};

/// Prints the inode tree and block usage recorded in a master file table.
#[derive(Parser)]
struct Args {
    /// Path of the master file table.
    mft: PathBuf,
    /// Write a small sample tree to the path before inspecting it.
    #[arg(long)]
    sample: bool,
    /// Number of blocks managed by the allocator.
    #[arg(long, default_value_t = NUM_BLOCKS)]
    blocks: usize,
}

fn allocator(blocks: usize) -> std::io::Result<BitmapAllocator> {
    BitmapAllocator::builder().with_block_count(blocks).build()
}

fn write_sample(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut fs = FileSystem::create(allocator(args.blocks)?)?;
    let root = fs.root().id();
    let docs = fs.create_dir(root, "docs")?;
    fs.create_file(docs, "a.txt", false, BLOCK_SIZE * 3 + 1)?;
    fs.create_file(docs, "notes.md", true, 200)?;
    let bin = fs.create_dir(root, "bin")?;
    fs.create_file(bin, "tool", false, BLOCK_SIZE * 9)?;
    fs.save(&args.mft)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if args.sample {
        write_sample(&args)?;
    }

    let fs = FileSystem::open(&args.mft, allocator(args.blocks)?)?;
    debug_fs(fs.root())?;

    let mismatches = BlockTable::from_tree(fs.root()).mismatches(fs.allocator());
    if !mismatches.is_empty() {
        eprintln!("allocator disagrees on blocks {:?}", mismatches);
    }
    Ok(())
}
