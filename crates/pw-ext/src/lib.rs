#![forbid(unsafe_code)]
//! ext-family inode group topology.
//!
//! The rotational ordering pass wants to know which block group each traced
//! inode lives in, so packs can carry "preload this whole inode table" hints.
//! This crate reads just enough of the ext2/3/4 superblock and group
//! descriptor table to answer that: inodes-per-group, group count, and each
//! group's inode table location. Group hints are strictly optional — any
//! failure here means a pack without hints, never a failed trace.

use pw_error::{PwError, Result};
use pw_types::{
    Dev, GroupNumber, InodeNumber, ParseError, inode_to_group, read_le_u16, read_le_u32,
};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::debug;

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;
const EXT_SUPER_MAGIC: u16 = 0xEF53;
const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x0080;

/// Maps inodes to block groups. The ordering pass only needs this trait,
/// so tests can supply a synthetic topology.
pub trait GroupTopology {
    fn group_of_inode(&self, ino: InodeNumber) -> GroupNumber;
    fn group_count(&self) -> u32;
}

/// Geometry read from an ext-family superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtGeometry {
    pub block_size: u32,
    pub blocks_count: u64,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_data_block: u32,
    desc_size: u16,
    sixty_four_bit: bool,
}

impl ExtGeometry {
    /// Parse from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        if log_block_size > 6 {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        }
        let block_size = 1024_u32 << log_block_size;

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let feature_incompat = read_le_u32(region, 0x60)?;
        let sixty_four_bit = (feature_incompat & EXT4_FEATURE_INCOMPAT_64BIT) != 0;
        let blocks_hi = if sixty_four_bit {
            u64::from(read_le_u32(region, 0x150)?)
        } else {
            0
        };

        let blocks_per_group = read_le_u32(region, 0x20)?;
        if blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be non-zero",
            });
        }
        let inodes_per_group = read_le_u32(region, 0x28)?;
        if inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be non-zero",
            });
        }

        let rev_level = read_le_u32(region, 0x4C)?;
        let inode_size = if rev_level == 0 {
            128
        } else {
            read_le_u16(region, 0x58)?
        };

        Ok(Self {
            block_size,
            blocks_count: blocks_lo | (blocks_hi << 32),
            blocks_per_group,
            inodes_per_group,
            inode_size,
            first_data_block: read_le_u32(region, 0x14)?,
            desc_size: read_le_u16(region, 0xFE)?,
            sixty_four_bit,
        })
    }

    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.sixty_four_bit {
            self.desc_size.max(64)
        } else {
            32
        }
    }

    /// Byte offset of a group's descriptor within the device.
    ///
    /// The descriptor table starts in the block after the superblock.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> Option<u64> {
        let gdt_start_block = if self.block_size == 1024 { 2_u64 } else { 1 };
        let gdt_start = gdt_start_block.checked_mul(u64::from(self.block_size))?;
        let within = u64::from(group.0).checked_mul(u64::from(self.group_desc_size()))?;
        gdt_start.checked_add(within)
    }

    /// Byte length of one group's inode table.
    #[must_use]
    pub fn inode_table_bytes(&self) -> u64 {
        u64::from(self.inodes_per_group) * u64::from(self.inode_size)
    }
}

/// Inode table location for one group, read from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDesc {
    pub inode_table_block: u64,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> std::result::Result<Self, ParseError> {
        let lo = u64::from(read_le_u32(bytes, 0x08)?);
        let hi = if desc_size >= 64 {
            u64::from(read_le_u32(bytes, 0x28)?)
        } else {
            0
        };
        Ok(Self {
            inode_table_block: lo | (hi << 32),
        })
    }
}

/// Group topology of one ext-family device.
#[derive(Debug)]
pub struct ExtTopology {
    pub geometry: ExtGeometry,
    group_count: u32,
}

impl ExtTopology {
    /// Build a topology from superblock geometry.
    ///
    /// Group count follows the device's block span:
    /// `((blocks_count - 1) / blocks_per_group) + 1`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // ext group count is u32
    pub fn from_geometry(geometry: ExtGeometry) -> Self {
        let group_count = ((geometry.blocks_count.saturating_sub(1)
            / u64::from(geometry.blocks_per_group))
            + 1) as u32;
        Self {
            geometry,
            group_count,
        }
    }

    /// Read the superblock from an open device or image.
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        reader.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        reader.read_exact(&mut region)?;
        let geometry = ExtGeometry::parse_superblock_region(&region)?;
        Ok(Self::from_geometry(geometry))
    }

    /// Open the device node for `dev` and read its superblock.
    pub fn open_for_device(dev: Dev) -> Result<Self> {
        let node = device_node(dev)?;
        debug!(%dev, node = %node.display(), "reading ext superblock");
        let mut file = std::fs::File::open(&node).map_err(|e| PwError::io_at(&node, e))?;
        Self::from_reader(&mut file)
    }

    /// Read the inode table location of one group from `reader`.
    pub fn group_desc<R: Read + Seek>(&self, reader: &mut R, group: GroupNumber) -> Result<GroupDesc> {
        let desc_size = self.geometry.group_desc_size();
        let offset = self
            .geometry
            .group_desc_offset(group)
            .ok_or(ParseError::IntegerConversion {
                field: "group_desc_offset",
            })?;
        let mut bytes = vec![0_u8; usize::from(desc_size)];
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut bytes)?;
        Ok(GroupDesc::parse_from_bytes(&bytes, desc_size)?)
    }
}

impl GroupTopology for ExtTopology {
    fn group_of_inode(&self, ino: InodeNumber) -> GroupNumber {
        inode_to_group(ino, self.geometry.inodes_per_group)
    }

    fn group_count(&self) -> u32 {
        self.group_count
    }
}

/// Resolve the `/dev` node of a device id via sysfs.
pub fn device_node(dev: Dev) -> Result<PathBuf> {
    let uevent_path = format!("/sys/dev/block/{}:{}/uevent", dev.major, dev.minor);
    let uevent = std::fs::read_to_string(&uevent_path)
        .map_err(|e| PwError::io_at(std::path::Path::new(&uevent_path), e))?;

    for line in uevent.lines() {
        if let Some(name) = line.strip_prefix("DEVNAME=") {
            return Ok(PathBuf::from(format!("/dev/{name}")));
        }
    }
    Err(PwError::NoPackName(format!(
        "no DEVNAME in {uevent_path} for device {dev}"
    )))
}
