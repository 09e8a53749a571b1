use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use blockalloc::BlockAllocator;
use log::{debug, info};
use thiserror::Error;

use crate::extent::{blocks_for, release_extents, PendingExtents};
use crate::mft::{self, LoadedTree};
use crate::node::{IdGenerator, Inode, InodeId};

/// Name given to the root directory of a fresh file system.
pub const DEFAULT_ROOT_NAME: &str = "/";

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("an inode named {0:?} already exists")]
    NameCollision(String),
    #[error("found no such inode")]
    NotFound,
    #[error("precondition violated: {0}")]
    PreconditionViolation(&'static str),
    #[error("out of blocks with {needed} block(s) still needed")]
    AllocationExhausted { needed: u32 },
    #[error("out of memory for inode bookkeeping")]
    ResourceExhausted,
    #[error("corrupt master file table: {0}")]
    CorruptFormat(String),
    #[error("master file table io failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// An inode tree backed by a block allocator.
///
/// The file system owns the root directory, the id generator and the allocator. All operations run
/// to completion on the calling thread; callers sharing one instance must serialize access.
pub struct FileSystem<A: BlockAllocator> {
    alloc: A,
    root: Inode,
    ids: IdGenerator,
}

impl<A: BlockAllocator> FileSystem<A> {
    /// Starts an empty file system with a root directory named [`DEFAULT_ROOT_NAME`].
    pub fn create(alloc: A) -> Result<Self> {
        Self::with_root_name(alloc, DEFAULT_ROOT_NAME)
    }

    pub fn with_root_name(alloc: A, root_name: &str) -> Result<Self> {
        validate_name(root_name)?;
        let mut ids = IdGenerator::new();
        let root = Inode::directory(ids.next_id()?, copy_name(root_name)?, Vec::new());
        Ok(FileSystem { alloc, root, ids })
    }

    /// Loads the master file table at `path`.
    ///
    /// The allocator is expected to be empty: every block referenced by the loaded files is
    /// marked used in it, and a block claimed twice or lying outside the allocator fails the load.
    pub fn open<P: AsRef<Path>>(path: P, alloc: A) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let fs = Self::load_from(BufReader::new(file), alloc)?;
        info!(
            "opened master file table {}, largest inode id {}",
            path.as_ref().display(),
            fs.last_id()
        );
        Ok(fs)
    }

    pub fn load_from<R: Read>(reader: R, alloc: A) -> Result<Self> {
        Self::from_loaded(mft::load(reader)?, alloc)
    }

    pub fn from_loaded(loaded: LoadedTree, mut alloc: A) -> Result<Self> {
        for node in loaded.root.iter() {
            for extent in node.extents() {
                for blocknr in extent.blocks() {
                    if !alloc.mark_used(blocknr) {
                        return Err(FsError::CorruptFormat(format!(
                            "block {} of {:?} is out of range or claimed twice",
                            blocknr,
                            node.name()
                        )));
                    }
                }
            }
        }
        Ok(FileSystem {
            alloc,
            root: loaded.root,
            ids: IdGenerator::resume_after(loaded.max_id),
        })
    }

    /// Writes the whole tree to `path`, replacing its previous content.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        let records = mft::save(&self.root, &mut out)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        info!(
            "saved {} inode(s) to {}",
            records,
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn save_to<W: Write>(&self, writer: W) -> Result<usize> {
        Ok(mft::save(&self.root, writer)?)
    }

    pub fn root(&self) -> &Inode {
        &self.root
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// The most recently issued inode id.
    pub fn last_id(&self) -> InodeId {
        InodeId(self.ids.last())
    }

    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.root.find_by_id(id)
    }

    /// First inode named `name` in a depth first, pre-order walk from the root.
    pub fn find_by_name(&self, name: &str) -> Option<&Inode> {
        self.root.find_by_name(name)
    }

    /// Creates a file of `size_in_bytes` bytes in directory `parent` and allocates its blocks.
    ///
    /// Names are unique across the whole tree, not only within `parent`. On failure nothing
    /// changes: blocks taken for the file are released before the error is returned.
    pub fn create_file(
        &mut self,
        parent: InodeId,
        name: &str,
        readonly: bool,
        size_in_bytes: u32,
    ) -> Result<InodeId> {
        validate_name(name)?;
        if size_in_bytes == 0 {
            return Err(FsError::InvalidArgument("file size must not be 0".to_string()));
        }
        self.check_unused(name)?;

        let parent_node = directory_mut(&mut self.root, parent)?;
        parent_node.reserve_entry()?;

        let blocks = blocks_for(size_in_bytes);
        let mut pending = PendingExtents::with_capacity(&mut self.alloc, blocks)?;
        pending.allocate(blocks)?;
        let name = copy_name(name)?;
        let id = self.ids.next_id()?;

        let extents = pending.commit();
        debug!(
            "created file {:?} (id {}) in {} with {} extent(s)",
            name,
            id,
            parent,
            extents.len()
        );
        parent_node.link(Inode::file(id, name, readonly, size_in_bytes, extents));
        Ok(id)
    }

    /// Creates an empty directory in directory `parent`.
    pub fn create_dir(&mut self, parent: InodeId, name: &str) -> Result<InodeId> {
        validate_name(name)?;
        self.check_unused(name)?;

        let parent_node = directory_mut(&mut self.root, parent)?;
        // Room for the entry is secured before an id is taken.
        parent_node.reserve_entry()?;
        let name = copy_name(name)?;
        let id = self.ids.next_id()?;
        debug!("created directory {:?} (id {}) in {}", name, id, parent);
        parent_node.add_inode(Inode::directory(id, name, Vec::new()))?;
        Ok(id)
    }

    /// Removes file `node` from directory `parent` and releases its blocks.
    ///
    /// Entry order of `parent` is not preserved: the last entry takes the place of the removed one.
    pub fn delete_file(&mut self, parent: InodeId, node: InodeId) -> Result<()> {
        let removed = self.unlink(parent, node, false)?;
        release_extents(&mut self.alloc, removed.extents());
        debug!(
            "deleted file {:?} (id {}), released {} block(s)",
            removed.name(),
            node,
            removed.block_count()
        );
        Ok(())
    }

    /// Removes the empty directory `node` from directory `parent`.
    pub fn delete_dir(&mut self, parent: InodeId, node: InodeId) -> Result<()> {
        let removed = self.unlink(parent, node, true)?;
        debug!("deleted directory {:?} (id {})", removed.name(), node);
        Ok(())
    }

    /// Tears the tree down without releasing any block and hands the allocator back.
    pub fn shutdown(self) -> A {
        self.alloc
    }

    fn check_unused(&self, name: &str) -> Result<()> {
        if self.root.find_by_name(name).is_some() {
            return Err(FsError::NameCollision(name.to_string()));
        }
        Ok(())
    }

    fn unlink(&mut self, parent: InodeId, node: InodeId, directory: bool) -> Result<Inode> {
        let parent_node = self.root.find_by_id_mut(parent).ok_or(FsError::NotFound)?;
        if !parent_node.is_directory() {
            return Err(FsError::PreconditionViolation("parent is not a directory"));
        }
        let target = parent_node.find_by_id(node).ok_or(FsError::NotFound)?;
        // The node must be what a name search under parent finds.
        match parent_node.find_by_name(target.name()) {
            Some(found) if found.id() == node => {}
            _ => return Err(FsError::NotFound),
        }
        if target.id() == parent {
            return Err(FsError::PreconditionViolation("cannot remove a directory from itself"));
        }
        if target.is_directory() != directory {
            return Err(FsError::PreconditionViolation(if directory {
                "node is not a directory"
            } else {
                "node is a directory"
            }));
        }
        if directory && target.num_entries() != 0 {
            return Err(FsError::PreconditionViolation("directory is not empty"));
        }

        parent_node
            .delete_inode(node)
            .ok_or(FsError::PreconditionViolation("node is not an entry of parent"))
    }
}

fn directory_mut(root: &mut Inode, id: InodeId) -> Result<&mut Inode> {
    let node = root.find_by_id_mut(id).ok_or(FsError::NotFound)?;
    if !node.is_directory() {
        return Err(FsError::PreconditionViolation("parent is not a directory"));
    }
    Ok(node)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("name must not be empty".to_string()));
    }
    // NUL terminates names in the master file table.
    if name.contains('\0') {
        return Err(FsError::InvalidArgument(
            "name must not contain a NUL byte".to_string(),
        ));
    }
    Ok(())
}

fn copy_name(name: &str) -> Result<String> {
    let mut copy = String::new();
    copy.try_reserve_exact(name.len())
        .map_err(|_| FsError::ResourceExhausted)?;
    copy.push_str(name);
    Ok(copy)
}
