#![forbid(unsafe_code)]
//! Readahead pack files.
//!
//! A pack describes, for one device, the paths opened during a traced
//! workload and the byte ranges of those files to read back at boot. This
//! crate owns the in-memory model, the on-disk codec, the pretty-printer
//! and the per-device pack naming scheme.

use pw_types::{Dev, InodeNumber};
use serde::Serialize;

pub mod codec;
pub mod dump;
pub mod naming;

pub use dump::SortOrder;

/// Maximum per-path byte length the writer accepts.
pub const PACK_PATH_MAX: usize = 255;

/// `physical` value of a block on non-rotational media, where physical
/// placement is irrelevant.
pub const PHYS_UNKNOWN: u64 = u64::MAX;

/// `group` value of a path whose inode group is unknown.
pub const NO_GROUP: i32 = -1;

/// One opened path. Aliases (sym/hard links) of the same inode each get an
/// entry so replay warms every dentry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackPath {
    /// Inode group on the device, `NO_GROUP` when unknown.
    pub group: i32,
    pub inode: InodeNumber,
    pub path: String,
}

/// One byte range to read. `physical` orders the rotational read sweep.
///
/// A zero-length block at offset 0 marks a path that was opened but never
/// read; replay opens it to warm the dentry and issues no data I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PackBlock {
    pub path_index: u32,
    pub offset: u64,
    pub length: u64,
    pub physical: u64,
}

impl PackBlock {
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.length == 0
    }
}

/// The pack for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackFile {
    pub dev: Dev,
    pub rotational: bool,
    pub paths: Vec<PackPath>,
    pub blocks: Vec<PackBlock>,
    /// Inode groups dense enough to preload whole (rotational only),
    /// ascending.
    pub groups: Vec<u32>,
}

impl PackFile {
    #[must_use]
    pub fn new(dev: Dev, rotational: bool) -> Self {
        Self {
            dev,
            rotational,
            paths: Vec::new(),
            blocks: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Append a path record and return its index.
    pub fn push_path(&mut self, inode: InodeNumber, path: String) -> u32 {
        debug_assert!(path.len() <= PACK_PATH_MAX);
        self.paths.push(PackPath {
            group: NO_GROUP,
            inode,
            path,
        });
        (self.paths.len() - 1) as u32
    }

    /// Total bytes of data I/O described by the pack.
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.length).sum()
    }
}
