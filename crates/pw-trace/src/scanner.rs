//! File scanner: page-cache residency to candidate pack blocks.
//!
//! For each admitted path the scanner stats the file, maps it, queries
//! per-page residency with `mincore(2)`, and coalesces resident runs into
//! chunks. On non-rotational devices a chunk becomes one block directly; on
//! rotating media each chunk is split along its on-disk extents (FIEMAP) so
//! the ordering pass can sweep the disk once.
//!
//! Every per-file failure is logged and skipped; a vanished or unreadable
//! file never aborts the trace.

use pw_pack::{PHYS_UNKNOWN, PackBlock, PackFile};
use pw_types::{Dev, InodeNumber};
use std::collections::HashSet;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use tracing::{debug, warn};

// ── Per-device pack accumulation ────────────────────────────────────────────

/// The packs under construction, one per device seen.
#[derive(Debug, Default)]
pub struct PackSet {
    files: Vec<PackFile>,
}

impl PackSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the pack for `dev`, creating it (and probing rotationalness)
    /// on first sight. Devices are few, so a linear scan suffices.
    pub fn index_for(&mut self, dev: Dev, force_ssd: bool) -> usize {
        if let Some(pos) = self.files.iter().position(|f| f.dev == dev) {
            return pos;
        }

        let rotational = if force_ssd {
            false
        } else {
            detect_rotational(dev)
        };
        debug!(%dev, rotational, "new device");
        self.files.push(PackFile::new(dev, rotational));
        self.files.len() - 1
    }

    #[must_use]
    pub fn files(&self) -> &[PackFile] {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut [PackFile] {
        &mut self.files
    }

    #[must_use]
    pub fn into_files(self) -> Vec<PackFile> {
        self.files
    }
}

/// Query sysfs for whether a device seeks. Unknown devices default to
/// rotational, the safer choice for ordering.
#[must_use]
pub fn detect_rotational(dev: Dev) -> bool {
    // Devices managed by the scsi stack need the minor masked before the
    // queue/rotational attribute resolves.
    for minor in [dev.minor, dev.minor & 0xffff0] {
        let path = format!("/sys/dev/block/{}:{minor}/queue/rotational", dev.major);
        if let Ok(value) = std::fs::read_to_string(&path) {
            return value.trim() == "1";
        }
    }
    warn!(%dev, "unable to obtain rotationalness, assuming rotational");
    true
}

// ── Scanner ─────────────────────────────────────────────────────────────────

/// Scans admitted paths into `PackSet` entries. Owned by one trace session.
#[derive(Debug)]
pub struct Scanner {
    /// Inodes already scanned, so aliases only contribute their dentry.
    seen_inodes: HashSet<(Dev, InodeNumber)>,
    force_ssd: bool,
    page_size: u64,
}

impl Scanner {
    #[must_use]
    pub fn new(force_ssd: bool) -> Self {
        Self {
            seen_inodes: HashSet::new(),
            force_ssd,
            page_size: page_size(),
        }
    }

    /// Record `path` and its resident chunks into the pack for its device.
    pub fn scan_path(&mut self, packs: &mut PackSet, path: &str) {
        // No symlinks, fifos, sockets or directories.
        let Ok(meta) = std::fs::symlink_metadata(path) else {
            return;
        };
        if !meta.file_type().is_file() {
            return;
        }

        // Open and stat again for the genuine details, in case the path
        // changed under us.
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOATIME)
            .open(path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!(path, %err, "file vanished or error reading");
                return;
            }
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path, %err, "error retrieving file stat");
                return;
            }
        };
        if !meta.file_type().is_file() {
            return;
        }

        let dev = Dev::from_raw(meta.dev());
        let inode = InodeNumber(meta.ino());
        let size = meta.size();

        let index = packs.index_for(dev, self.force_ssd);
        let pack = &mut packs.files_mut()[index];
        let path_index = pack.push_path(inode, path.to_owned());

        // Aliases of an already-scanned inode keep their dentry entry but
        // contribute no blocks.
        if !self.seen_inodes.insert((dev, inode)) {
            return;
        }

        // Zero-byte files have no blocks (and cannot be mapped).
        if size == 0 {
            return;
        }

        let resident = match resident_pages(&file, size, self.page_size) {
            Ok(vec) => vec,
            Err(err) => {
                warn!(path, %err, "error retrieving page cache info");
                return;
            }
        };

        for (offset, length) in coalesce_resident(&resident, size, self.page_size) {
            if pack.rotational {
                add_extent_blocks(pack, path_index, &file, path, offset, length);
            } else {
                pack.blocks.push(PackBlock {
                    path_index,
                    offset,
                    length,
                    physical: PHYS_UNKNOWN,
                });
            }
        }
    }
}

/// Split one resident chunk along its on-disk extents into pack blocks.
fn add_extent_blocks(
    pack: &mut PackFile,
    path_index: u32,
    file: &File,
    path: &str,
    offset: u64,
    length: u64,
) {
    match chunk_extents(file, offset, length) {
        Ok(extents) => {
            pack.blocks
                .extend(extent_blocks(path_index, offset, length, &extents));
        }
        Err(err) => {
            warn!(path, %err, "error retrieving chunk extents");
        }
    }
}

/// Per-page residency of an open file, one byte per page with bit 0 set
/// for in-core pages.
fn resident_pages(file: &File, size: u64, page_size: u64) -> std::io::Result<Vec<u8>> {
    let map = unsafe { memmap2::Mmap::map(file)? };
    let num_pages = (size - 1) / page_size + 1;
    let mut vec = vec![0_u8; usize::try_from(num_pages).map_err(std::io::Error::other)?];

    let rc = unsafe {
        libc::mincore(
            map.as_ptr().cast_mut().cast::<libc::c_void>(),
            map.len(),
            vec.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(vec)
}

/// Coalesce consecutive resident pages into `(offset, length)` chunks,
/// clamped to the file size.
#[must_use]
pub fn coalesce_resident(resident: &[u8], size: u64, page_size: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut i = 0_usize;

    while i < resident.len() {
        if resident[i] & 1 == 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < resident.len() && resident[i] & 1 == 1 {
            i += 1;
        }

        let offset = start as u64 * page_size;
        let end = (i as u64 * page_size).min(size);
        if end > offset {
            chunks.push((offset, end - offset));
        }
    }

    chunks
}

// ── FIEMAP ──────────────────────────────────────────────────────────────────

pub const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
pub const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0000_0002;

const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;
const EXTENT_BATCH: usize = 32;

/// One logical-to-physical mapping reported by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

const ZERO_EXTENT: FiemapExtent = FiemapExtent {
    fe_logical: 0,
    fe_physical: 0,
    fe_length: 0,
    fe_reserved64: [0; 2],
    fe_flags: 0,
    fe_reserved: [0; 3],
};

#[repr(C)]
struct FiemapRequest {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; EXTENT_BATCH],
}

/// Query the extent map covering `[offset, offset + length)` of an open
/// file, batching the ioctl until the range is exhausted.
pub fn chunk_extents(file: &File, offset: u64, length: u64) -> std::io::Result<Vec<Extent>> {
    let fd = file.as_raw_fd();
    let end = offset.saturating_add(length);
    let mut pos = offset;
    let mut out = Vec::new();

    while pos < end {
        let mut req = FiemapRequest {
            fm_start: pos,
            fm_length: end - pos,
            fm_flags: 0,
            fm_mapped_extents: 0,
            fm_extent_count: EXTENT_BATCH as u32,
            fm_reserved: 0,
            fm_extents: [ZERO_EXTENT; EXTENT_BATCH],
        };

        let rc = unsafe { libc::ioctl(fd, FS_IOC_FIEMAP, std::ptr::from_mut(&mut req)) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mapped = (req.fm_mapped_extents as usize).min(EXTENT_BATCH);
        if mapped == 0 {
            break;
        }

        let mut saw_last = false;
        for fe in &req.fm_extents[..mapped] {
            out.push(Extent {
                logical: fe.fe_logical,
                physical: fe.fe_physical,
                length: fe.fe_length,
                flags: fe.fe_flags,
            });
            saw_last |= fe.fe_flags & FIEMAP_EXTENT_LAST != 0;
        }

        let tail = &req.fm_extents[mapped - 1];
        let next = tail.fe_logical.saturating_add(tail.fe_length);
        if saw_last || next <= pos {
            break;
        }
        pos = next;
    }

    Ok(out)
}

/// Intersect a chunk with its extents, producing blocks with linear
/// physical offsets. Extents whose physical location is unknown are
/// skipped.
#[must_use]
pub fn extent_blocks(
    path_index: u32,
    chunk_offset: u64,
    chunk_length: u64,
    extents: &[Extent],
) -> Vec<PackBlock> {
    let chunk_end = chunk_offset + chunk_length;
    let mut blocks = Vec::new();

    for extent in extents {
        if extent.flags & FIEMAP_EXTENT_UNKNOWN != 0 {
            continue;
        }

        let start = chunk_offset.max(extent.logical);
        let end = chunk_end.min(extent.logical + extent.length);
        if end <= start {
            continue;
        }

        blocks.push(PackBlock {
            path_index,
            offset: start,
            length: end - start,
            physical: extent.physical + (start - extent.logical),
        });
    }

    blocks
}

fn page_size() -> u64 {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value > 0 { value as u64 } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_merges_runs_and_clamps_tail() {
        // pages: resident, resident, absent, resident (file ends mid-page)
        let resident = [1_u8, 1, 0, 1];
        let chunks = coalesce_resident(&resident, 3 * 4096 + 100, 4096);
        assert_eq!(chunks, vec![(0, 8192), (3 * 4096, 100)]);
    }

    #[test]
    fn coalesce_empty_and_absent() {
        assert!(coalesce_resident(&[], 0, 4096).is_empty());
        assert!(coalesce_resident(&[0, 0, 0], 3 * 4096, 4096).is_empty());
    }

    #[test]
    fn coalesce_only_checks_low_bit() {
        // mincore may set other vector bits in future kernels
        let chunks = coalesce_resident(&[0x81, 0x03], 8192, 4096);
        assert_eq!(chunks, vec![(0, 8192)]);
    }

    #[test]
    fn extent_blocks_intersects_and_offsets() {
        let extents = [
            Extent {
                logical: 0,
                physical: 1_000_000,
                length: 8192,
                flags: 0,
            },
            Extent {
                logical: 8192,
                physical: 5_000_000,
                length: 8192,
                flags: 0,
            },
        ];
        // Chunk covers the tail of the first extent and head of the second.
        let blocks = extent_blocks(3, 4096, 8192, &extents);
        assert_eq!(
            blocks,
            vec![
                PackBlock {
                    path_index: 3,
                    offset: 4096,
                    length: 4096,
                    physical: 1_004_096,
                },
                PackBlock {
                    path_index: 3,
                    offset: 8192,
                    length: 4096,
                    physical: 5_000_000,
                },
            ]
        );
    }

    #[test]
    fn extent_blocks_skips_unknown() {
        let extents = [Extent {
            logical: 0,
            physical: 0,
            length: 4096,
            flags: FIEMAP_EXTENT_UNKNOWN,
        }];
        assert!(extent_blocks(0, 0, 4096, &extents).is_empty());
    }

    // ── Scanner behaviour over real files ───────────────────────────────

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn scan_records_path_and_inode() {
        let dir = tempdir();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![7_u8; 10_000]).unwrap();
        let meta = std::fs::metadata(&path).unwrap();

        let mut scanner = Scanner::new(true);
        let mut packs = PackSet::new();
        scanner.scan_path(&mut packs, path.to_str().unwrap());

        let files = packs.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].dev, Dev::from_raw(meta.dev()));
        assert!(!files[0].rotational);
        assert_eq!(files[0].paths.len(), 1);
        assert_eq!(files[0].paths[0].inode, InodeNumber(meta.ino()));
    }

    #[test]
    fn scan_deduplicates_inodes_but_keeps_paths() {
        let dir = tempdir();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![7_u8; 10_000]).unwrap();
        let link = dir.path().join("alias");
        std::fs::hard_link(&path, &link).unwrap();

        let mut scanner = Scanner::new(true);
        let mut packs = PackSet::new();
        scanner.scan_path(&mut packs, path.to_str().unwrap());
        let blocks_after_first = packs.files()[0].blocks.len();
        scanner.scan_path(&mut packs, link.to_str().unwrap());

        let file = &packs.files()[0];
        assert_eq!(file.paths.len(), 2);
        // The alias contributed no further blocks.
        assert_eq!(file.blocks.len(), blocks_after_first);
    }

    #[test]
    fn scan_skips_symlinks_and_missing() {
        let dir = tempdir();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("symlink");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut scanner = Scanner::new(true);
        let mut packs = PackSet::new();
        scanner.scan_path(&mut packs, link.to_str().unwrap());
        scanner.scan_path(&mut packs, dir.path().join("absent").to_str().unwrap());
        scanner.scan_path(&mut packs, dir.path().to_str().unwrap());

        assert!(packs.files().is_empty());
    }

    #[test]
    fn scan_zero_size_file_is_path_only() {
        let dir = tempdir();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let mut scanner = Scanner::new(true);
        let mut packs = PackSet::new();
        scanner.scan_path(&mut packs, path.to_str().unwrap());

        let file = &packs.files()[0];
        assert_eq!(file.paths.len(), 1);
        assert!(file.blocks.is_empty());
    }

    #[test]
    fn scanned_blocks_stay_within_file_size() {
        let dir = tempdir();
        let path = dir.path().join("data");
        let size = 3 * 4096 + 17;
        std::fs::write(&path, vec![9_u8; size]).unwrap();

        let mut scanner = Scanner::new(true);
        let mut packs = PackSet::new();
        scanner.scan_path(&mut packs, path.to_str().unwrap());

        for block in &packs.files()[0].blocks {
            assert!(block.offset + block.length <= size as u64);
            assert_eq!(block.physical, PHYS_UNKNOWN);
        }
    }
}
