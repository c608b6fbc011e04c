//! Rotational ordering pass.
//!
//! Random reads cost seeks on rotating media, so before a rotational pack is
//! written: paths gain inode-group hints (groups dense enough that replay
//! should preload their whole inode table), blocks are sorted by physical
//! offset into a single disk sweep, and paths are reordered by
//! (group, inode, name) to localise directory and inode-table reads.

use pw_ext::GroupTopology;
use pw_pack::{PackFile, PackPath};
use tracing::debug;

/// Number of inodes in a group before replay preloads the group's inode
/// table as one sequential read.
pub const INODE_GROUP_PRELOAD_THRESHOLD: usize = 8;

/// Fill in each path's inode group and collect the dense groups, ascending.
pub fn add_group_hints(file: &mut PackFile, topology: &dyn GroupTopology) {
    let num_groups = topology.group_count() as usize;
    if num_groups == 0 {
        return;
    }

    let mut inodes_per_group = vec![0_usize; num_groups];
    for path in &mut file.paths {
        let group = topology.group_of_inode(path.inode);
        if let Some(count) = inodes_per_group.get_mut(group.0 as usize) {
            path.group = group.0 as i32;
            *count += 1;
        }
    }

    let mut total = 0_usize;
    let mut hits = 0_usize;
    for (group, &count) in inodes_per_group.iter().enumerate() {
        total += count;
        if count > INODE_GROUP_PRELOAD_THRESHOLD {
            file.groups.push(group as u32);
            hits += 1;
        }
    }

    debug!(
        groups = num_groups,
        mean = total / num_groups,
        hits,
        "inode group census"
    );
}

/// Stable sort of blocks by physical offset: replay becomes one linear
/// sweep, regardless of which path each block belongs to.
pub fn sort_blocks(file: &mut PackFile) {
    file.blocks.sort_by_key(|block| block.physical);
}

/// Sort paths by (group, inode, name) and rewrite every block's path index
/// through the resulting permutation.
pub fn sort_paths(file: &mut PackFile) {
    let mut order: Vec<usize> = (0..file.paths.len()).collect();
    order.sort_by(|&a, &b| {
        let pa = &file.paths[a];
        let pb = &file.paths[b];
        pa.group
            .cmp(&pb.group)
            .then(pa.inode.cmp(&pb.inode))
            .then_with(|| pa.path.cmp(&pb.path))
    });

    let mut new_index = vec![0_u32; order.len()];
    for (new, &old) in order.iter().enumerate() {
        new_index[old] = new as u32;
    }

    for block in &mut file.blocks {
        block.path_index = new_index[block.path_index as usize];
    }

    let reordered: Vec<PackPath> = order.iter().map(|&old| file.paths[old].clone()).collect();
    file.paths = reordered;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pw_pack::PackBlock;
    use pw_types::{Dev, GroupNumber, InodeNumber};

    struct FixedTopology {
        inodes_per_group: u32,
        groups: u32,
    }

    impl GroupTopology for FixedTopology {
        fn group_of_inode(&self, ino: InodeNumber) -> GroupNumber {
            pw_types::inode_to_group(ino, self.inodes_per_group)
        }

        fn group_count(&self) -> u32 {
            self.groups
        }
    }

    fn block(path_index: u32, physical: u64) -> PackBlock {
        PackBlock {
            path_index,
            offset: 0,
            length: 4096,
            physical,
        }
    }

    #[test]
    fn group_hints_cross_threshold() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        // Nine inodes in group 0, one in group 1.
        for ino in 1..=9 {
            file.push_path(InodeNumber(ino), format!("/f{ino}"));
        }
        file.push_path(InodeNumber(150), "/g".into());

        let topology = FixedTopology {
            inodes_per_group: 100,
            groups: 4,
        };
        add_group_hints(&mut file, &topology);

        assert_eq!(file.groups, vec![0]);
        assert_eq!(file.paths[0].group, 0);
        assert_eq!(file.paths[9].group, 1);
    }

    #[test]
    fn group_hints_need_strictly_more_than_threshold() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        for ino in 1..=INODE_GROUP_PRELOAD_THRESHOLD as u64 {
            file.push_path(InodeNumber(ino), format!("/f{ino}"));
        }

        let topology = FixedTopology {
            inodes_per_group: 100,
            groups: 4,
        };
        add_group_hints(&mut file, &topology);
        assert!(file.groups.is_empty());
    }

    #[test]
    fn block_sort_is_ascending_by_physical() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        file.push_path(InodeNumber(1), "/a".into());
        file.push_path(InodeNumber(2), "/b".into());
        file.blocks = vec![block(0, 4096), block(1, 512), block(0, 8192)];

        sort_blocks(&mut file);

        let physicals: Vec<u64> = file.blocks.iter().map(|b| b.physical).collect();
        assert_eq!(physicals, vec![512, 4096, 8192]);
    }

    #[test]
    fn path_sort_rewrites_block_indices() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        file.push_path(InodeNumber(20), "/late".into());
        file.push_path(InodeNumber(10), "/early".into());
        file.paths[0].group = 1;
        file.paths[1].group = 0;
        file.blocks = vec![block(0, 4096), block(1, 512), block(0, 8192)];

        sort_paths(&mut file);

        assert_eq!(file.paths[0].path, "/early");
        assert_eq!(file.paths[1].path, "/late");
        // Blocks still resolve to their original paths.
        assert_eq!(file.blocks[0].path_index, 1);
        assert_eq!(file.blocks[1].path_index, 0);
        assert_eq!(file.blocks[2].path_index, 1);
    }

    #[test]
    fn path_sort_orders_group_then_inode_then_name() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        file.push_path(InodeNumber(5), "/b".into());
        file.push_path(InodeNumber(5), "/a".into());
        file.push_path(InodeNumber(3), "/c".into());
        file.paths[0].group = 2;
        file.paths[1].group = 2;
        file.paths[2].group = 2;

        sort_paths(&mut file);

        let names: Vec<&str> = file.paths.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(names, vec!["/c", "/a", "/b"]);
    }

    #[test]
    fn unknown_group_sorts_first() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        file.push_path(InodeNumber(1), "/grouped".into());
        file.push_path(InodeNumber(2), "/ungrouped".into());
        file.paths[0].group = 3;
        // paths[1] keeps NO_GROUP (-1)

        sort_paths(&mut file);
        assert_eq!(file.paths[0].path, "/ungrouped");
    }

    /// End-to-end over the ordering pass: physicals ascend and every block
    /// index stays valid after the permutation.
    #[test]
    fn full_pass_keeps_indices_valid() {
        let mut file = PackFile::new(Dev::new(8, 0), true);
        file.push_path(InodeNumber(9), "/x".into());
        file.push_path(InodeNumber(4), "/y".into());
        file.blocks = vec![block(0, 4096), block(1, 512), block(0, 8192)];
        let original: Vec<(String, u64)> = file
            .blocks
            .iter()
            .map(|b| (file.paths[b.path_index as usize].path.clone(), b.physical))
            .collect();

        let topology = FixedTopology {
            inodes_per_group: 8,
            groups: 2,
        };
        add_group_hints(&mut file, &topology);
        sort_blocks(&mut file);
        sort_paths(&mut file);

        for pair in file.blocks.windows(2) {
            assert!(pair[0].physical <= pair[1].physical);
        }
        for b in &file.blocks {
            assert!((b.path_index as usize) < file.paths.len());
            let resolved = (
                file.paths[b.path_index as usize].path.clone(),
                b.physical,
            );
            assert!(original.contains(&resolved));
        }
    }
}
