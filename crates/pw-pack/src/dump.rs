//! Pack pretty-printer.

use crate::{NO_GROUP, PHYS_UNKNOWN, PackFile};
use std::io::{self, Write};

/// Path ordering for dump output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Stored (open) order.
    #[default]
    Open,
    /// Lexicographic by path.
    Path,
    /// By first block's physical offset.
    Disk,
    /// By total data bytes, largest first.
    Size,
}

struct PathSummary {
    index: usize,
    blocks: usize,
    bytes: u64,
    first_physical: u64,
}

/// Print a human-readable rendering of a pack.
pub fn dump<W: Write>(file: &PackFile, order: SortOrder, out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "pack for device {} ({})",
        file.dev,
        if file.rotational {
            "rotational"
        } else {
            "non-rotational"
        }
    )?;
    if !file.groups.is_empty() {
        let groups: Vec<String> = file.groups.iter().map(ToString::to_string).collect();
        writeln!(out, "preload inode groups: {}", groups.join(" "))?;
    }

    let mut summaries: Vec<PathSummary> = file
        .paths
        .iter()
        .enumerate()
        .map(|(index, _)| {
            let mut blocks = 0;
            let mut bytes = 0;
            let mut first_physical = PHYS_UNKNOWN;
            for block in &file.blocks {
                if block.path_index as usize != index {
                    continue;
                }
                blocks += 1;
                bytes += block.length;
                if first_physical == PHYS_UNKNOWN {
                    first_physical = block.physical;
                }
            }
            PathSummary {
                index,
                blocks,
                bytes,
                first_physical,
            }
        })
        .collect();

    match order {
        SortOrder::Open => {}
        SortOrder::Path => {
            summaries.sort_by(|a, b| file.paths[a.index].path.cmp(&file.paths[b.index].path));
        }
        SortOrder::Disk => summaries.sort_by_key(|s| s.first_physical),
        SortOrder::Size => summaries.sort_by(|a, b| b.bytes.cmp(&a.bytes)),
    }

    for summary in &summaries {
        let path = &file.paths[summary.index];
        write!(out, "{} ino={}", path.path, path.inode)?;
        if path.group != NO_GROUP {
            write!(out, " group={}", path.group)?;
        }
        writeln!(out, " blocks={} bytes={}", summary.blocks, summary.bytes)?;

        for block in &file.blocks {
            if block.path_index as usize != summary.index {
                continue;
            }
            if block.is_sentinel() {
                writeln!(out, "  dentry only")?;
            } else if block.physical == PHYS_UNKNOWN {
                writeln!(out, "  offset={} length={}", block.offset, block.length)?;
            } else {
                writeln!(
                    out,
                    "  offset={} length={} physical={}",
                    block.offset, block.length, block.physical
                )?;
            }
        }
    }

    writeln!(
        out,
        "{} paths, {} blocks, {} bytes",
        file.paths.len(),
        file.blocks.len(),
        file.data_bytes()
    )?;
    Ok(())
}
