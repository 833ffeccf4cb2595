//! Post-processing (C6): ext block-group preload list, physical-address
//! block sort, and `(group, ino, path)` path sort.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::config::INODE_GROUP_PRELOAD_THRESHOLD;
use crate::pack::PackFile;

const EXT2_MAGIC: u16 = 0xEF53;
const SUPERBLOCK_OFFSET: u64 = 1024;

/// The handful of ext2 superblock fields the block-group preload list
/// needs. Field layout follows the on-disk ext2 superblock; see
/// <https://www.nongnu.org/ext2-doc/ext2.html#superblock>.
struct Ext2Superblock {
    blocks_count: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
}

impl Ext2Superblock {
    fn parse(buf: &[u8; 1024]) -> Option<Self> {
        let magic = u16::from_le_bytes([buf[56], buf[57]]);
        if magic != EXT2_MAGIC {
            return None;
        }
        Some(Self {
            blocks_count: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            blocks_per_group: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            inodes_per_group: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
        })
    }

    fn read(block_device: &Path) -> io::Result<Option<Self>> {
        let mut file = File::open(block_device)?;
        file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        let mut buf = [0u8; 1024];
        file.read_exact(&mut buf)?;
        Ok(Self::parse(&buf))
    }

    fn group_of_inode(&self, ino: u64) -> u32 {
        (ino.saturating_sub(1) / self.inodes_per_group.max(1) as u64) as u32
    }

    #[allow(dead_code)]
    fn num_groups(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group.max(1))
    }
}

/// Applies post-processing in place: only meaningful for rotational devices.
///
/// `block_device` is the path to the whole-device node (e.g. `/dev/sda`)
/// backing `pack.dev`, used to attempt an ext block-group read. If it
/// can't be opened or isn't an ext filesystem, the group preload list is
/// silently left empty and every path's `group` stays `-1` — the sort
/// still runs, just with a flat `(-1, ino, path)` key.
pub fn post_process(pack: &mut PackFile, block_device: &Path) {
    if !pack.rotational {
        return;
    }

    match Ext2Superblock::read(block_device) {
        Ok(Some(sb)) => annotate_groups(pack, &sb),
        Ok(None) => log::debug!("{} is not an ext filesystem, skipping block-group preload", block_device.display()),
        Err(err) => log::warn!("failed to read superblock of {}: {err}", block_device.display()),
    }

    sort_blocks_by_physical(pack);
    sort_paths(pack);
}

fn annotate_groups(pack: &mut PackFile, sb: &Ext2Superblock) {
    let mut histogram: HashMap<u32, usize> = HashMap::new();
    for path in &mut pack.paths {
        let group = sb.group_of_inode(path.ino);
        path.group = group as i64;
        *histogram.entry(group).or_insert(0) += 1;
    }

    let mut groups: Vec<u32> = histogram
        .into_iter()
        .filter(|&(_, count)| count > INODE_GROUP_PRELOAD_THRESHOLD)
        .map(|(group, _)| group)
        .collect();
    groups.sort_unstable();
    pack.groups = groups;
}

fn sort_blocks_by_physical(pack: &mut PackFile) {
    pack.blocks.sort_by_key(|b| b.physical);
}

fn sort_paths(pack: &mut PackFile) {
    let mut order: Vec<usize> = (0..pack.paths.len()).collect();
    order.sort_by(|&a, &b| pack.paths[a].cmp(&pack.paths[b]));

    let mut old_to_new = vec![0u32; pack.paths.len()];
    for (new_idx, &old_idx) in order.iter().enumerate() {
        old_to_new[old_idx] = new_idx as u32;
    }

    pack.paths = order.into_iter().map(|i| pack.paths[i].clone()).collect();
    for block in &mut pack.blocks {
        block.pathidx = old_to_new[block.pathidx as usize];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pack::{PackBlock, PackPath};

    fn sb(blocks_per_group: u32, inodes_per_group: u32) -> Ext2Superblock {
        Ext2Superblock {
            blocks_count: blocks_per_group * 4,
            blocks_per_group,
            inodes_per_group,
        }
    }

    #[test]
    fn group_of_inode_matches_ext_formula() {
        let sb = sb(8192, 2048);
        assert_eq!(sb.group_of_inode(1), 0);
        assert_eq!(sb.group_of_inode(2048), 0);
        assert_eq!(sb.group_of_inode(2049), 1);
        assert_eq!(sb.group_of_inode(4096), 1);
        assert_eq!(sb.group_of_inode(4097), 2);
    }

    #[test]
    fn path_sort_orders_by_group_then_ino_then_path() {
        let mut pack = PackFile::new(8, true);
        pack.paths = vec![
            PackPath { path: "/b".into(), ino: 5, group: 1 },
            PackPath { path: "/a".into(), ino: 1, group: 0 },
            PackPath { path: "/c".into(), ino: 2, group: 0 },
        ];
        pack.blocks = vec![
            PackBlock { pathidx: 0, offset: 0, length: 4096, physical: 100 },
            PackBlock { pathidx: 1, offset: 0, length: 4096, physical: 50 },
            PackBlock { pathidx: 2, offset: 0, length: 4096, physical: 10 },
        ];

        sort_paths(&mut pack);

        let paths: Vec<&str> = pack.paths.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/c", "/b"]);
        // pathidx 0 ("/b") moved to index 2.
        assert_eq!(pack.blocks[0].pathidx, 2);
        // pathidx 1 ("/a") moved to index 0.
        assert_eq!(pack.blocks[1].pathidx, 0);
        // pathidx 2 ("/c") moved to index 1.
        assert_eq!(pack.blocks[2].pathidx, 1);
    }

    #[test]
    fn block_sort_is_ascending_by_physical() {
        let mut pack = PackFile::new(8, true);
        pack.blocks = vec![
            PackBlock { pathidx: 0, offset: 0, length: 1, physical: 300 },
            PackBlock { pathidx: 0, offset: 0, length: 1, physical: 10 },
            PackBlock { pathidx: 0, offset: 0, length: 1, physical: 100 },
        ];
        sort_blocks_by_physical(&mut pack);
        let physicals: Vec<i64> = pack.blocks.iter().map(|b| b.physical).collect();
        assert_eq!(physicals, vec![10, 100, 300]);
    }

    #[test]
    fn non_ext_superblock_is_rejected() {
        let buf = [0u8; 1024];
        assert!(Ext2Superblock::parse(&buf).is_none());
    }
}
