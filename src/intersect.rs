/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Range intersector (C5): rewrites a `PackFile`'s blocks to retain only
//! bytes the kernel actually pulled into the page cache.

use crate::config::PAGE_SHIFT;
use crate::index::{DeviceIndex, Range};
use crate::pack::{PackBlock, PackFile};

/// Runs once per `PackFile` after the drain, and only if all three filemap
/// events were available (the caller checks that and skips this pass
/// otherwise, leaving `blocks` as assembled).
///
/// Blocks are grouped by `pathidx` in insertion order: the assembler
/// appends a path's chunks in one pass, so blocks for a path are always
/// contiguous (the assembler's ordering guarantee).
pub fn refine(pack: &mut PackFile, index: &DeviceIndex) {
    let old_blocks = std::mem::take(&mut pack.blocks);
    let mut new_blocks = Vec::with_capacity(old_blocks.len());

    let mut i = 0;
    while i < old_blocks.len() {
        let pathidx = old_blocks[i].pathidx;
        let run_end = old_blocks[i..]
            .iter()
            .position(|b| b.pathidx != pathidx)
            .map(|rel| i + rel)
            .unwrap_or(old_blocks.len());

        let ino = pack.paths[pathidx as usize].ino;
        let ranges = index
            .find_device(pack.dev)
            .and_then(|d| d.find_inode(ino))
            .map(|inode| inode.ranges());

        match ranges {
            None => {
                new_blocks.push(PackBlock::marker(pathidx));
            }
            Some(ranges) => {
                let mut mi = 0usize;
                for block in &old_blocks[i..run_end] {
                    intersect_block(block, ranges, &mut mi, &mut new_blocks);
                }
            }
        }

        i = run_end;
    }

    pack.blocks = new_blocks;
}

fn intersect_block(
    block: &PackBlock,
    ranges: &[Range],
    mi: &mut usize,
    out: &mut Vec<PackBlock>,
) {
    let br_start = (block.offset >> PAGE_SHIFT) as i64;
    let br_end = ((block.offset + block.length) >> PAGE_SHIFT) as i64;

    while *mi < ranges.len() && ranges[*mi].end < br_start {
        *mi += 1;
    }

    while *mi < ranges.len() && ranges[*mi].start <= br_end {
        let range = ranges[*mi];
        let no = ((range.start << PAGE_SHIFT) as u64).max(block.offset);
        let ne = ((range.end << PAGE_SHIFT) as u64).min(block.offset + block.length);
        if ne > no {
            out.push(PackBlock {
                pathidx: block.pathidx,
                offset: no,
                length: ne - no,
                physical: if block.physical < 0 {
                    -1
                } else {
                    block.physical + (no - block.offset) as i64
                },
            });
        }
        if range.end > br_end {
            break;
        }
        *mi += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PAGE_SHIFT as SHIFT;

    const PAGE: u64 = 1 << SHIFT;

    fn block(pathidx: u32, first_page: u64, last_page_inclusive: u64) -> PackBlock {
        let offset = first_page * PAGE;
        let length = (last_page_inclusive - first_page + 1) * PAGE;
        PackBlock {
            pathidx,
            offset,
            length,
            physical: -1,
        }
    }

    /// Boundary scenario exercising every branch of the intersection loop:
    /// touching, fully contained, partially overlapping, and wholly
    /// disjoint ranges against a run of blocks.
    #[test]
    fn s3_intersects_and_drops_empty_block() {
        let mut index = DeviceIndex::new();
        for (a, b) in [
            (13, 18),
            (22, 23),
            (32, 45),
            (52, 53),
            (56, 57),
            (62, 62),
            (69, 69),
        ] {
            index.record_access(8, 1, a, b);
        }

        let mut pack = PackFile::new(8, true);
        pack.add_path("/bin/example".into(), 1);
        pack.blocks = vec![
            block(0, 13, 17),
            block(0, 20, 24),
            block(0, 33, 37),
            block(0, 43, 47),
            block(0, 53, 57),
            block(0, 63, 67),
        ];

        refine(&mut pack, &index);

        let page_ranges: Vec<(u64, u64)> = pack
            .blocks
            .iter()
            .map(|b| (b.offset / PAGE, (b.offset + b.length) / PAGE))
            .collect();

        assert_eq!(
            page_ranges,
            vec![(13, 18), (22, 24), (33, 38), (43, 46), (53, 54), (56, 58)]
        );
    }

    #[test]
    fn missing_inode_yields_open_only_marker() {
        let index = DeviceIndex::new();
        let mut pack = PackFile::new(8, true);
        pack.add_path("/bin/never-faulted".into(), 42);
        pack.blocks = vec![block(0, 0, 9)];

        refine(&mut pack, &index);

        assert_eq!(pack.blocks.len(), 1);
        assert!(pack.blocks[0].is_marker());
    }

    #[test]
    fn non_rotational_block_keeps_physical_unknown() {
        let mut index = DeviceIndex::new();
        index.record_access(8, 1, 0, 9);

        let mut pack = PackFile::new(8, false);
        pack.add_path("/bin/example".into(), 1);
        pack.blocks = vec![block(0, 0, 9)];

        refine(&mut pack, &index);

        assert_eq!(pack.blocks.len(), 1);
        assert_eq!(pack.blocks[0].physical, -1);
    }
}
