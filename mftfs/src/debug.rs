use std::fmt;
use std::io::{self, Write};

use blockalloc::{BlockAllocator, BlockNumber, State, NUM_BLOCKS};
use log::warn;

use crate::node::Inode;

/// Prints the tree below `root` followed by the blocks its files occupy.
pub fn debug_fs(root: &Inode) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_tree(root, &mut out)?;
    writeln!(out, "{}", BlockTable::from_tree(root))
}

/// Writes one line per inode, indented by two spaces per level.
pub fn write_tree<W: Write>(root: &Inode, out: &mut W) -> io::Result<()> {
    write_node(root, out, 0)
}

fn write_node<W: Write>(node: &Inode, out: &mut W, depth: usize) -> io::Result<()> {
    write!(out, "{:indent$}", "", indent = depth * 2)?;
    if node.is_directory() {
        writeln!(out, "{} (id {})", node.name(), node.id())?;
        for child in node.children() {
            write_node(child, out, depth + 1)?;
        }
    } else {
        writeln!(
            out,
            "{} (id {} size {})",
            node.name(),
            node.id(),
            node.filesize()
        )?;
    }
    Ok(())
}

/// Block occupancy as recorded by the extents in an inode tree. Built independently of any
/// allocator so the two views can be compared.
pub struct BlockTable {
    used: [bool; NUM_BLOCKS],
}

impl BlockTable {
    pub fn from_tree(root: &Inode) -> Self {
        let mut used = [false; NUM_BLOCKS];
        for node in root.iter() {
            for extent in node.extents() {
                for blocknr in extent.blocks() {
                    match used.get_mut(blocknr as usize) {
                        Some(slot) => *slot = true,
                        None => warn!("{:?} references block {} past the table", node.name(), blocknr),
                    }
                }
            }
        }
        Self { used }
    }

    pub fn is_used(&self, blocknr: BlockNumber) -> bool {
        self.used.get(blocknr as usize).copied().unwrap_or(false)
    }

    pub fn used_count(&self) -> usize {
        self.used.iter().filter(|&&used| used).count()
    }

    /// Blocks on which the tree and the allocator disagree. A block the tree uses past the
    /// allocator's capacity always counts as a disagreement.
    pub fn mismatches<A: BlockAllocator + ?Sized>(&self, alloc: &A) -> Vec<BlockNumber> {
        let capacity = alloc.capacity();
        (0..NUM_BLOCKS as BlockNumber)
            .filter(|&blocknr| {
                if blocknr < capacity {
                    self.is_used(blocknr) != (alloc.state(blocknr) == State::Used)
                } else {
                    self.is_used(blocknr)
                }
            })
            .collect()
    }
}

impl fmt::Display for BlockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blocks recorded in master file table:")?;
        for (blocknr, &used) in self.used.iter().enumerate() {
            if blocknr % 20 == 0 {
                write!(f, "\n{:03}: ", blocknr)?;
            }
            write!(f, "{}", used as u8)?;
        }
        writeln!(f)
    }
}
