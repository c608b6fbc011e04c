//! Deterministic pack file naming.
//!
//! One pack per device, stored under the state directory. The root
//! filesystem's pack is plain `pack`; any other mount point mangles its
//! interior slashes to dots, so `/home` becomes `home.pack`.

use pw_error::{PwError, Result};
use pw_types::Dev;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Where pack files live.
pub const STATE_DIR: &str = "/var/lib/prewarm";

/// Pack file name for a mount point, under `base`.
pub fn pack_file_name_in(base: &Path, mount: &str) -> Result<PathBuf> {
    if !mount.starts_with('/') {
        return Err(PwError::NoPackName(format!(
            "{mount}: not an absolute mount point"
        )));
    }

    let trimmed = mount.trim_matches('/');
    let name = if trimmed.is_empty() {
        "pack".to_owned()
    } else {
        format!("{}.pack", trimmed.replace('/', "."))
    };
    Ok(base.join(name))
}

/// Pack file name for a mount point, under the default state directory.
pub fn pack_file_name(mount: &str) -> Result<PathBuf> {
    pack_file_name_in(Path::new(STATE_DIR), mount)
}

/// Pack file name for a device, derived from its mount point.
///
/// Scans `/proc/mounts` for the first mount point living on `dev`.
pub fn pack_file_name_for_device(dev: Dev) -> Result<PathBuf> {
    let mounts = std::fs::read_to_string("/proc/mounts")?;
    let mount = mount_point_of(&mounts, dev, |path| {
        std::fs::metadata(path).map(|m| Dev::from_raw(m.dev())).ok()
    })
    .ok_or_else(|| PwError::NoPackName(format!("no mount point found for device {dev}")))?;

    pack_file_name(&mount)
}

/// Find the first mount point in `/proc/mounts` content whose stat device
/// matches `dev`. `stat_dev` is injected so tests need no real mounts.
fn mount_point_of<F>(mounts: &str, dev: Dev, stat_dev: F) -> Option<String>
where
    F: Fn(&str) -> Option<Dev>,
{
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _source = fields.next()?;
        let Some(target) = fields.next() else {
            continue;
        };
        if !target.starts_with('/') {
            continue;
        }
        let target = unescape_mount(target);
        if stat_dev(&target) == Some(dev) {
            return Some(target);
        }
    }
    None
}

/// Decode the octal escapes `/proc/mounts` uses for whitespace in paths.
fn unescape_mount(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &raw[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(oct, 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
