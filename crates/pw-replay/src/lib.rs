//! Pack replay: issue the pack's I/O so later real accesses hit cache.
//!
//! Opening every path warms its dentry (which is all a zero-length sentinel
//! block asks for); `readahead(2)` then pulls each block's bytes into the
//! page cache without copying them to userspace. Rotational packs arrive
//! with paths in (group, inode, name) order and blocks sorted by physical
//! offset, so both loops are sequential on disk; before them, dense inode
//! groups named by the pack get their inode tables read in one sweep each.
//!
//! Per-file failures are logged and skipped; replay is best-effort.

use pw_error::{PwError, Result};
use pw_ext::{ExtTopology, GroupTopology};
use pw_pack::PackFile;
use pw_types::GroupNumber;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use tracing::{debug, info, warn};

/// Replay one pack.
pub fn replay(file: &PackFile, daemonise: bool) -> Result<()> {
    if daemonise {
        match unsafe { libc::fork() } {
            -1 => return Err(PwError::Io(std::io::Error::last_os_error())),
            0 => {}
            _ => unsafe { libc::_exit(0) },
        }
    }

    if file.rotational && !file.groups.is_empty() {
        preload_inode_groups(file);
    }

    // Open everything first: dentries and inodes in pack order.
    let handles: Vec<Option<File>> = file
        .paths
        .iter()
        .map(|path| {
            match std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NOATIME)
                .open(&path.path)
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(path = path.path, %err, "skipping unopenable path");
                    None
                }
            }
        })
        .collect();

    // Then the data, in stored (physically sorted, for HDDs) block order.
    let mut requested = 0_u64;
    for block in &file.blocks {
        if block.is_sentinel() {
            continue;
        }
        let Some(handle) = handles
            .get(block.path_index as usize)
            .and_then(Option::as_ref)
        else {
            continue;
        };

        let rc = unsafe {
            libc::readahead(
                handle.as_raw_fd(),
                block.offset as libc::off64_t,
                block.length as libc::size_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            warn!(
                path = file.paths[block.path_index as usize].path,
                offset = block.offset,
                %err,
                "readahead failed"
            );
            continue;
        }
        requested += block.length;
    }

    info!(
        dev = %file.dev,
        paths = file.paths.len(),
        blocks = file.blocks.len(),
        bytes = requested,
        "replay issued"
    );
    Ok(())
}

/// Read the inode tables of the pack's dense groups in one pass each.
fn preload_inode_groups(file: &PackFile) {
    let topology = match ExtTopology::open_for_device(file.dev) {
        Ok(topology) => topology,
        Err(err) => {
            debug!(dev = %file.dev, %err, "cannot preload inode groups");
            return;
        }
    };
    let node = match pw_ext::device_node(file.dev) {
        Ok(node) => node,
        Err(err) => {
            debug!(dev = %file.dev, %err, "cannot resolve device node");
            return;
        }
    };
    let device = match File::open(&node) {
        Ok(device) => device,
        Err(err) => {
            debug!(node = %node.display(), %err, "cannot open device node");
            return;
        }
    };

    let block_size = u64::from(topology.geometry.block_size);
    let table_bytes = topology.geometry.inode_table_bytes();

    let mut device_reader = &device;
    for &group in &file.groups {
        if group >= topology.group_count() {
            continue;
        }
        let desc = match topology.group_desc(&mut device_reader, GroupNumber(group)) {
            Ok(desc) => desc,
            Err(err) => {
                warn!(group, %err, "cannot read group descriptor");
                continue;
            }
        };

        let offset = desc.inode_table_block.saturating_mul(block_size);
        let rc = unsafe {
            libc::readahead(
                device.as_raw_fd(),
                offset as libc::off64_t,
                table_bytes as libc::size_t,
            )
        };
        if rc < 0 {
            warn!(group, err = %std::io::Error::last_os_error(), "inode table readahead failed");
        }
    }
}
