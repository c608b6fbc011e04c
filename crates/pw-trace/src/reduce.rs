//! Block reducer: drop candidate ranges no process read.
//!
//! The scanner records everything resident in the page cache at end of
//! trace, which includes readahead the workload never touched. The interval
//! index knows which pages were actually faulted or read. One ordered pass
//! intersects the two, in byte units, preserving each block's linear
//! physical mapping.
//!
//! A path whose inode never appears in the index was opened but not read;
//! it keeps exactly one zero-length block so replay still warms the dentry.

use pw_index::DeviceTable;
use pw_pack::{PHYS_UNKNOWN, PackBlock, PackFile};
use pw_types::PAGE_SHIFT;

/// Intersect `file`'s candidate blocks with the touched page ranges.
///
/// Output order is stable with respect to the input within each path; no
/// cross-path reordering.
pub fn remove_untouched_blocks(file: &mut PackFile, table: &DeviceTable) {
    let mut reduced: Vec<PackBlock> = Vec::new();

    let mut ranges: &[pw_index::PageRange] = &[];
    let mut range_idx = 0_usize;
    let mut current_path: Option<u32> = None;
    let mut skip_path = false;

    for block in &file.blocks {
        let pages_start = block.offset >> PAGE_SHIFT;
        let pages_end = (block.offset + block.length) >> PAGE_SHIFT;

        // Blocks arrive grouped per path; reset cursors at each boundary.
        if current_path != Some(block.path_index) {
            current_path = Some(block.path_index);
            range_idx = 0;

            let inode = file.paths[block.path_index as usize].inode;
            match table.find(file.dev, inode) {
                Some(index) => {
                    ranges = index.ranges();
                    skip_path = false;
                }
                None => {
                    // Opened but never read: only the dentry is wanted.
                    reduced.push(PackBlock {
                        path_index: block.path_index,
                        offset: 0,
                        length: 0,
                        physical: 0,
                    });
                    ranges = &[];
                    skip_path = true;
                }
            }
        }
        if skip_path {
            continue;
        }

        // Skip ranges entirely below this block.
        while range_idx < ranges.len() && ranges[range_idx].end < pages_start {
            range_idx += 1;
        }

        // Emit the intersection with every overlapping range.
        while range_idx < ranges.len() {
            let range = ranges[range_idx];
            if pages_end < range.start {
                break;
            }

            let new_offset = (range.start << PAGE_SHIFT).max(block.offset);
            let new_end = (range.end << PAGE_SHIFT).min(block.offset + block.length);

            // Zero length means the range merely touches the block edge.
            if new_end > new_offset {
                let physical = if block.physical == PHYS_UNKNOWN {
                    PHYS_UNKNOWN
                } else {
                    block.physical + (new_offset - block.offset)
                };
                reduced.push(PackBlock {
                    path_index: block.path_index,
                    offset: new_offset,
                    length: new_end - new_offset,
                    physical,
                });
            }

            // A range extending past this block may overlap the next one.
            if range.end > pages_end {
                break;
            }
            range_idx += 1;
        }
    }

    file.blocks = reduced;
}
