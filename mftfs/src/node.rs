use std::fmt;
use std::ops::Range;

use blockalloc::BlockNumber;

use crate::fs::{FsError, Result};

/// Identifies an inode. Ids are non-zero and never reused while a file system is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub u32);

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of blocks. The extents of a file, in order, describe its byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub start_block: BlockNumber,
    pub run_length: u32,
}

impl Extent {
    pub fn new(start_block: BlockNumber, run_length: u32) -> Self {
        Self {
            start_block,
            run_length,
        }
    }

    /// The block numbers covered by this extent. The extent must end within the block number
    /// range, which holds for every allocated or loaded extent.
    pub fn blocks(&self) -> Range<BlockNumber> {
        self.start_block..self.start_block + self.run_length
    }
}

/// What an inode points at. Directories own their children, files list the extents backing them.
#[derive(Debug, Clone, PartialEq)]
pub enum Entries {
    Children(Vec<Inode>),
    Extents(Vec<Extent>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
    id: InodeId,
    name: String,
    is_readonly: bool,
    /// Size in bytes, always 0 for directories.
    filesize: u32,
    entries: Entries,
}

impl Inode {
    pub(crate) fn directory(id: InodeId, name: String, children: Vec<Inode>) -> Self {
        Self {
            id,
            name,
            is_readonly: false,
            filesize: 0,
            entries: Entries::Children(children),
        }
    }

    pub(crate) fn file(
        id: InodeId,
        name: String,
        is_readonly: bool,
        filesize: u32,
        extents: Vec<Extent>,
    ) -> Self {
        Self {
            id,
            name,
            is_readonly,
            filesize,
            entries: Entries::Extents(extents),
        }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.entries, Entries::Children(_))
    }

    pub fn is_readonly(&self) -> bool {
        self.is_readonly
    }

    pub fn filesize(&self) -> u32 {
        self.filesize
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    /// Number of children for a directory, number of extents for a file.
    pub fn num_entries(&self) -> usize {
        match &self.entries {
            Entries::Children(children) => children.len(),
            Entries::Extents(extents) => extents.len(),
        }
    }

    /// Children of a directory. Empty for files.
    pub fn children(&self) -> &[Inode] {
        match &self.entries {
            Entries::Children(children) => children,
            Entries::Extents(_) => &[],
        }
    }

    /// Extents of a file. Empty for directories.
    pub fn extents(&self) -> &[Extent] {
        match &self.entries {
            Entries::Children(_) => &[],
            Entries::Extents(extents) => extents,
        }
    }

    /// Total number of blocks covered by the extents of a file.
    pub fn block_count(&self) -> u32 {
        self.extents().iter().map(|extent| extent.run_length).sum()
    }

    /// Searches this subtree depth first, visiting a node before its children and children in
    /// entry order. Returns the first inode named `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&Inode> {
        if self.name == name {
            return Some(self);
        }
        self.children()
            .iter()
            .find_map(|child| child.find_by_name(name))
    }

    pub fn find_by_id(&self, id: InodeId) -> Option<&Inode> {
        self.iter().find(|node| node.id == id)
    }

    pub(crate) fn find_by_id_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        if self.id == id {
            return Some(self);
        }
        match &mut self.entries {
            Entries::Children(children) => children
                .iter_mut()
                .find_map(|child| child.find_by_id_mut(id)),
            Entries::Extents(_) => None,
        }
    }

    /// Pre-order iterator over this subtree, the same order the master file table uses.
    pub fn iter(&self) -> PreOrder<'_> {
        PreOrder { stack: vec![self] }
    }

    /// Makes room for one more child so that a later [`Inode::link`] cannot fail.
    pub(crate) fn reserve_entry(&mut self) -> Result<()> {
        match &mut self.entries {
            Entries::Children(children) => children
                .try_reserve(1)
                .map_err(|_| FsError::ResourceExhausted),
            Entries::Extents(_) => Err(FsError::PreconditionViolation(
                "parent is not a directory",
            )),
        }
    }

    /// Appends a child. Callers reserve the slot with [`Inode::reserve_entry`] first.
    pub(crate) fn link(&mut self, child: Inode) {
        if let Entries::Children(children) = &mut self.entries {
            children.push(child);
        }
    }

    /// Appends a child, leaving the directory untouched if the entry cannot be stored.
    pub(crate) fn add_inode(&mut self, child: Inode) -> Result<()> {
        self.reserve_entry()?;
        self.link(child);
        Ok(())
    }

    /// Unlinks the child with the given id and hands ownership back to the caller.
    ///
    /// The last entry is moved into the vacated slot, so removal is O(1) and entry order is not
    /// preserved across deletions.
    pub(crate) fn delete_inode(&mut self, id: InodeId) -> Option<Inode> {
        match &mut self.entries {
            Entries::Children(children) => {
                let position = children.iter().position(|child| child.id == id)?;
                Some(children.swap_remove(position))
            }
            Entries::Extents(_) => None,
        }
    }
}

pub struct PreOrder<'a> {
    stack: Vec<&'a Inode>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = &'a Inode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children().iter().rev());
        Some(node)
    }
}

/// Hands out inode ids. A fresh generator starts at 1, a generator resumed after loading a tree
/// continues above the largest id found in it.
#[derive(Debug)]
pub struct IdGenerator {
    last: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn resume_after(max: InodeId) -> Self {
        Self { last: max.0 }
    }

    /// The most recently issued id, or 0 if nothing was issued yet.
    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn next_id(&mut self) -> Result<InodeId> {
        self.last = self
            .last
            .checked_add(1)
            .ok_or(FsError::ResourceExhausted)?;
        Ok(InodeId(self.last))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(id: u32, name: &str, children: Vec<Inode>) -> Inode {
        Inode::directory(InodeId(id), name.to_string(), children)
    }

    fn file(id: u32, name: &str) -> Inode {
        Inode::file(InodeId(id), name.to_string(), false, 1, vec![Extent::new(id, 1)])
    }

    fn sample_tree() -> Inode {
        dir(
            1,
            "/",
            vec![
                dir(2, "a", vec![file(3, "x"), dir(4, "b", vec![file(5, "y")])]),
                file(6, "z"),
            ],
        )
    }

    #[test]
    fn iterates_in_pre_order() {
        let tree = sample_tree();
        let ids: Vec<u32> = tree.iter().map(|node| node.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn find_by_name_searches_whole_subtree() {
        let tree = sample_tree();

        assert_eq!(tree.find_by_name("/").map(Inode::id), Some(InodeId(1)));
        assert_eq!(tree.find_by_name("y").map(Inode::id), Some(InodeId(5)));
        assert_eq!(tree.find_by_name("z").map(Inode::id), Some(InodeId(6)));
        assert!(tree.find_by_name("missing").is_none());
        // Subtrees only see their own descendants.
        assert!(tree.children()[0].find_by_name("z").is_none());
    }

    #[test]
    fn find_by_name_returns_first_match_in_pre_order() {
        // The tree never holds duplicate names, but the search itself stops at the first hit.
        let tree = dir(1, "/", vec![dir(2, "d", vec![file(3, "dup")]), file(4, "dup")]);
        assert_eq!(tree.find_by_name("dup").map(Inode::id), Some(InodeId(3)));
    }

    #[test]
    fn delete_inode_swaps_last_entry_into_the_hole() {
        let mut tree = dir(1, "/", vec![file(2, "a"), file(3, "b"), file(4, "c")]);

        let removed = tree.delete_inode(InodeId(2)).unwrap();

        assert_eq!(removed.name(), "a");
        let names: Vec<&str> = tree.children().iter().map(Inode::name).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert!(tree.delete_inode(InodeId(2)).is_none());
    }

    #[test]
    fn add_inode_appends_and_rejects_files_as_parents() {
        let mut tree = dir(1, "/", vec![file(2, "a")]);
        tree.add_inode(file(3, "b")).unwrap();
        assert_eq!(tree.num_entries(), 2);
        assert_eq!(tree.children()[1].name(), "b");

        let mut not_a_dir = file(4, "c");
        assert!(matches!(
            not_a_dir.add_inode(file(5, "d")),
            Err(FsError::PreconditionViolation(_))
        ));
        assert_eq!(not_a_dir.num_entries(), 1);
    }

    #[test]
    fn find_by_id_mut_reaches_nested_nodes() {
        let mut tree = sample_tree();
        let b = tree.find_by_id_mut(InodeId(4)).unwrap();
        b.add_inode(file(7, "w")).unwrap();

        assert_eq!(tree.find_by_name("w").map(Inode::id), Some(InodeId(7)));
        assert!(tree.find_by_id_mut(InodeId(42)).is_none());
    }

    #[test]
    fn block_count_sums_run_lengths() {
        let node = Inode::file(
            InodeId(1),
            "f".to_string(),
            false,
            5 * 4096,
            vec![Extent::new(0, 4), Extent::new(9, 1)],
        );
        assert_eq!(node.block_count(), 5);
        assert_eq!(Extent::new(9, 3).blocks().collect::<Vec<_>>(), vec![9, 10, 11]);
    }

    #[test]
    fn id_generator_is_monotonic_and_resumable() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next_id().unwrap(), InodeId(1));
        assert_eq!(ids.next_id().unwrap(), InodeId(2));

        let mut resumed = IdGenerator::resume_after(InodeId(41));
        assert_eq!(resumed.next_id().unwrap(), InodeId(42));

        let mut exhausted = IdGenerator::resume_after(InodeId(u32::MAX));
        assert!(matches!(
            exhausted.next_id(),
            Err(FsError::ResourceExhausted)
        ));
    }
}
