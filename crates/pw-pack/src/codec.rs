//! On-disk pack layout.
//!
//! Little-endian throughout:
//!
//! ```text
//! 0   4  magic "PWPK"
//! 4   4  version
//! 8   4  device major
//! 12  4  device minor
//! 16  1  rotational flag
//! 17  3  reserved
//! 20  4  group count G
//! 24  4  path count P
//! 28  4  block count B
//! 32  4G group numbers, ascending
//! ..     P path records: group i32, inode u64, length u16, path bytes
//! ..     B block records: path_index u32, offset u64, length u64, physical u64
//! ```

use crate::{PACK_PATH_MAX, PackBlock, PackFile, PackPath};
use pw_error::{PwError, Result};
use pw_types::{Dev, InodeNumber, read_le_u16, read_le_u32, read_le_u64};
use std::io::Write;
use std::path::Path;
use tracing::debug;

const MAGIC: [u8; 4] = *b"PWPK";
const VERSION: u32 = 2;

/// Serialise a pack into its on-disk byte form.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // path length bounded by PACK_PATH_MAX
pub fn encode(file: &PackFile) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + file.paths.len() * 64 + file.blocks.len() * 28);

    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&file.dev.major.to_le_bytes());
    out.extend_from_slice(&file.dev.minor.to_le_bytes());
    out.push(u8::from(file.rotational));
    out.extend_from_slice(&[0_u8; 3]);
    out.extend_from_slice(&(file.groups.len() as u32).to_le_bytes());
    out.extend_from_slice(&(file.paths.len() as u32).to_le_bytes());
    out.extend_from_slice(&(file.blocks.len() as u32).to_le_bytes());

    for group in &file.groups {
        out.extend_from_slice(&group.to_le_bytes());
    }

    for path in &file.paths {
        out.extend_from_slice(&path.group.to_le_bytes());
        out.extend_from_slice(&path.inode.0.to_le_bytes());
        out.extend_from_slice(&(path.path.len() as u16).to_le_bytes());
        out.extend_from_slice(path.path.as_bytes());
    }

    for block in &file.blocks {
        out.extend_from_slice(&block.path_index.to_le_bytes());
        out.extend_from_slice(&block.offset.to_le_bytes());
        out.extend_from_slice(&block.length.to_le_bytes());
        out.extend_from_slice(&block.physical.to_le_bytes());
    }

    out
}

/// Parse a pack from its on-disk byte form, validating structure.
pub fn decode(data: &[u8]) -> Result<PackFile> {
    let magic = pw_types::read_fixed::<4>(data, 0)?;
    if magic != MAGIC {
        return Err(PwError::Pack(format!(
            "bad magic {magic:02x?}, expected {MAGIC:02x?}"
        )));
    }
    let version = read_le_u32(data, 4)?;
    if version != VERSION {
        return Err(PwError::Pack(format!(
            "unsupported version {version}, expected {VERSION}"
        )));
    }

    let dev = Dev::new(read_le_u32(data, 8)?, read_le_u32(data, 12)?);
    let rotational = match data.get(16) {
        Some(0) => false,
        Some(1) => true,
        other => {
            return Err(PwError::Pack(format!("bad rotational flag {other:?}")));
        }
    };

    let num_groups = read_le_u32(data, 20)? as usize;
    let num_paths = read_le_u32(data, 24)? as usize;
    let num_blocks = read_le_u32(data, 28)? as usize;

    let mut pos = 32_usize;

    let mut groups = Vec::with_capacity(num_groups);
    for _ in 0..num_groups {
        groups.push(read_le_u32(data, pos)?);
        pos += 4;
    }

    let mut paths = Vec::with_capacity(num_paths);
    for _ in 0..num_paths {
        let group = read_le_u32(data, pos)? as i32;
        let inode = InodeNumber(read_le_u64(data, pos + 4)?);
        let len = read_le_u16(data, pos + 12)? as usize;
        pos += 14;

        if len > PACK_PATH_MAX {
            return Err(PwError::Pack(format!(
                "path record of {len} bytes exceeds limit {PACK_PATH_MAX}"
            )));
        }
        let bytes = pw_types::ensure_slice(data, pos, len)?;
        let path = std::str::from_utf8(bytes)
            .map_err(|_| PwError::Pack("path record is not valid UTF-8".into()))?
            .to_owned();
        pos += len;

        paths.push(PackPath { group, inode, path });
    }

    let mut blocks = Vec::with_capacity(num_blocks);
    for _ in 0..num_blocks {
        let path_index = read_le_u32(data, pos)?;
        let offset = read_le_u64(data, pos + 4)?;
        let length = read_le_u64(data, pos + 12)?;
        let physical = read_le_u64(data, pos + 20)?;
        pos += 28;

        if path_index as usize >= paths.len() {
            return Err(PwError::Pack(format!(
                "block references path {path_index} of {}",
                paths.len()
            )));
        }
        blocks.push(PackBlock {
            path_index,
            offset,
            length,
            physical,
        });
    }

    Ok(PackFile {
        dev,
        rotational,
        paths,
        blocks,
        groups,
    })
}

/// Read and parse a pack file.
pub fn read_pack(path: &Path) -> Result<PackFile> {
    let data = std::fs::read(path).map_err(|e| PwError::io_at(path, e))?;
    decode(&data)
}

/// Write a pack file atomically (same-directory tempfile, then rename).
pub fn write_pack(path: &Path, file: &PackFile) -> Result<()> {
    let bytes = encode(file);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| PwError::io_at(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PwError::io_at(dir, e))?;
    tmp.write_all(&bytes).map_err(PwError::Io)?;
    tmp.persist(path)
        .map_err(|e| PwError::io_at(path, e.error))?;

    debug!(
        path = %path.display(),
        paths = file.paths.len(),
        blocks = file.blocks.len(),
        bytes = bytes.len(),
        "pack written"
    );
    Ok(())
}
