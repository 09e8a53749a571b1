//! The master file table: the whole inode tree flattened into one byte stream.
//!
//! # Layout
//!
//! Records follow each other without padding, in pre-order starting at the root. Every record is
//!
//! ```text
//! | id: u32 | name_length: u32 | name + NUL | is_directory: u8 | is_readonly: u8 |
//! | num_entries: u32 | entries: num_entries * 8 bytes |
//! ```
//!
//! with integers in little endian and `name_length` counting the terminating NUL. A directory
//! entry is the child id followed by 4 reserved zero bytes, a file entry is the start block
//! followed by the run length. A directory's children are written right after its own record.
//!
//! File sizes are not stored. A loaded file reports `sum(run_length) * BLOCK_SIZE` bytes.
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::mem::size_of;

use blockalloc::BLOCK_SIZE;
use log::{debug, info};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::fs::{FsError, Result};
use crate::node::{Extent, Inode, InodeId};

type Le32 = U32<LittleEndian>;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
struct RecordHead {
    id: Le32,
    name_length: Le32,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
struct RecordFlags {
    is_directory: u8,
    is_readonly: u8,
    num_entries: Le32,
}

/// One 8 byte entry: `(child id, 0)` for directories, `(start block, run length)` for files.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
struct EntryRecord {
    first: Le32,
    second: Le32,
}

/// A tree read back from a master file table.
#[derive(Debug)]
pub struct LoadedTree {
    pub root: Inode,
    /// The largest id in the tree. New ids must be issued above it.
    pub max_id: InodeId,
    /// Number of records read.
    pub records: usize,
}

/// Writes `root` and everything below it. Returns the number of records written.
pub fn save<W: Write>(root: &Inode, mut out: W) -> io::Result<usize> {
    let mut records = 0;
    for node in root.iter() {
        write_record(&mut out, node)?;
        records += 1;
    }
    Ok(records)
}

fn write_record<W: Write>(out: &mut W, node: &Inode) -> io::Result<()> {
    let head = RecordHead {
        id: Le32::new(node.id().0),
        name_length: Le32::new(encode_len(node.name().len() + 1)?),
    };
    out.write_all(head.as_bytes())?;
    out.write_all(node.name().as_bytes())?;
    out.write_all(&[0])?;

    let flags = RecordFlags {
        is_directory: node.is_directory() as u8,
        is_readonly: node.is_readonly() as u8,
        num_entries: Le32::new(encode_len(node.num_entries())?),
    };
    out.write_all(flags.as_bytes())?;

    for child in node.children() {
        let entry = EntryRecord {
            first: Le32::new(child.id().0),
            second: Le32::new(0),
        };
        out.write_all(entry.as_bytes())?;
    }
    for extent in node.extents() {
        let entry = EntryRecord {
            first: Le32::new(extent.start_block),
            second: Le32::new(extent.run_length),
        };
        out.write_all(entry.as_bytes())?;
    }
    Ok(())
}

fn encode_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "length does not fit the master file table",
        )
    })
}

/// Reads a complete master file table.
///
/// Records are first parsed into a flat list with directory entries still holding child ids.
/// The tree is then assembled from the first record, which is the root, by resolving each child
/// id against that list. Every malformed input is reported as [`FsError::CorruptFormat`], no
/// partial tree is ever returned.
pub fn load<R: Read>(mut reader: R) -> Result<LoadedTree> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;

    let mut cursor = Cursor { buf: &buf, offset: 0 };
    let mut records = Vec::new();
    while !cursor.is_empty() {
        records.push(read_record(&mut cursor)?);
    }
    if records.is_empty() {
        return Err(corrupt("master file table is empty"));
    }

    let ids: Vec<u32> = records.iter().map(|record| record.id).collect();
    let mut seen = HashSet::new();
    for &id in &ids {
        if id == 0 {
            return Err(corrupt("inode id 0 is reserved"));
        }
        if !seen.insert(id) {
            return Err(corrupt(format!("inode id {} appears more than once", id)));
        }
    }
    let max_id = ids.iter().copied().max().unwrap_or(0);
    let total = records.len();

    let mut slots: Vec<Option<RawRecord>> = records.into_iter().map(Some).collect();
    let root = resolve(&mut slots, &ids, 0)?;
    if !root.is_directory() {
        return Err(corrupt(format!("root {:?} is not a directory", root.name())));
    }
    if let Some(orphan) = slots.iter().flatten().next() {
        return Err(corrupt(format!(
            "inode {} ({:?}) is not reachable from the root",
            orphan.id, orphan.name
        )));
    }

    let mut names = HashSet::new();
    for node in root.iter() {
        if !names.insert(node.name()) {
            return Err(corrupt(format!("name {:?} appears more than once", node.name())));
        }
    }

    info!("loaded {} inode record(s), largest id {}", total, max_id);
    Ok(LoadedTree {
        root,
        max_id: InodeId(max_id),
        records: total,
    })
}

fn corrupt<S: Into<String>>(reason: S) -> FsError {
    FsError::CorruptFormat(reason.into())
}

/// A record as stored, before directory entries are turned into children.
struct RawRecord {
    id: u32,
    name: String,
    is_directory: bool,
    is_readonly: bool,
    entries: Vec<(u32, u32)>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.offset == self.buf.len()
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let available = self.buf.len() - self.offset;
        if len > available {
            return Err(corrupt(format!(
                "short read of {} at offset {}: need {} byte(s), {} left",
                field, self.offset, len, available
            )));
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn read<T: FromBytes>(&mut self, field: &str) -> Result<T> {
        let bytes = self.take(size_of::<T>(), field)?;
        T::read_from(bytes).ok_or_else(|| corrupt(format!("malformed {}", field)))
    }
}

fn read_record(cursor: &mut Cursor<'_>) -> Result<RawRecord> {
    let head: RecordHead = cursor.read("record header")?;
    let id = head.id.get();

    let name_bytes = cursor.take(head.name_length.get() as usize, "name")?;
    let name = match name_bytes.split_last() {
        Some((&0, name)) if !name.is_empty() => std::str::from_utf8(name)
            .map_err(|_| corrupt(format!("name of inode {} is not valid UTF-8", id)))?,
        _ => {
            return Err(corrupt(format!(
                "name of inode {} is empty or not NUL terminated",
                id
            )))
        }
    };
    if name.contains('\0') {
        return Err(corrupt(format!("name of inode {} contains a NUL byte", id)));
    }

    let flags: RecordFlags = cursor.read("flags")?;
    let is_directory = read_flag(flags.is_directory, id)?;
    let is_readonly = read_flag(flags.is_readonly, id)?;

    let num_entries = flags.num_entries.get() as usize;
    let table_len = num_entries
        .checked_mul(size_of::<EntryRecord>())
        .ok_or_else(|| corrupt(format!("entry table of inode {} is too large", id)))?;
    let table = cursor.take(table_len, "entry table")?;
    let entries = table
        .chunks_exact(size_of::<EntryRecord>())
        .filter_map(EntryRecord::read_from)
        .map(|entry| (entry.first.get(), entry.second.get()))
        .collect();

    debug!(
        "parsed record {} {:?} with {} entries",
        id, name, num_entries
    );
    Ok(RawRecord {
        id,
        name: name.to_string(),
        is_directory,
        is_readonly,
        entries,
    })
}

fn read_flag(byte: u8, id: u32) -> Result<bool> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(corrupt(format!(
            "flag byte {:#04x} of inode {} is neither 0 nor 1",
            other, id
        ))),
    }
}

/// Builds the inode at `index`, moving it and its descendants out of `slots`.
fn resolve(slots: &mut [Option<RawRecord>], ids: &[u32], index: usize) -> Result<Inode> {
    let raw = slots[index].take().ok_or_else(|| {
        corrupt(format!("inode {} is referenced more than once", ids[index]))
    })?;

    if !raw.is_directory {
        let mut blocks: u32 = 0;
        let mut extents = Vec::with_capacity(raw.entries.len());
        for (start_block, run_length) in raw.entries {
            if run_length == 0 {
                return Err(corrupt(format!("file {:?} has an empty extent", raw.name)));
            }
            if start_block.checked_add(run_length).is_none() {
                return Err(corrupt(format!(
                    "extent {}+{} of file {:?} runs past the last block number",
                    start_block, run_length, raw.name
                )));
            }
            blocks = blocks
                .checked_add(run_length)
                .ok_or_else(|| corrupt(format!("file {:?} is too large", raw.name)))?;
            extents.push(Extent::new(start_block, run_length));
        }
        let filesize = blocks
            .checked_mul(BLOCK_SIZE)
            .ok_or_else(|| corrupt(format!("file {:?} is too large", raw.name)))?;
        return Ok(Inode::file(
            InodeId(raw.id),
            raw.name,
            raw.is_readonly,
            filesize,
            extents,
        ));
    }

    let mut children = Vec::with_capacity(raw.entries.len());
    for (n, (child_id, reserved)) in raw.entries.into_iter().enumerate() {
        if reserved != 0 {
            return Err(corrupt(format!(
                "entry #{} of directory {:?} has a non-zero reserved word",
                n, raw.name
            )));
        }
        let child = ids.iter().position(|&id| id == child_id).ok_or_else(|| {
            corrupt(format!(
                "failed to resolve inode reference #{} ({}) for directory {:?}",
                n, child_id, raw.name
            ))
        })?;
        children.push(resolve(slots, ids, child)?);
    }
    Ok(Inode::directory(InodeId(raw.id), raw.name, children))
}
