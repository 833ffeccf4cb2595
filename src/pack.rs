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

//! Pack data model and the per-device assembler (C4): resident-page
//! detection via `mincore` and extent resolution via FIEMAP.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::config::{DevId, PAGE_SHIFT};
use crate::fiemap;

/// System page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// A path that contributed at least one byte (or an open-only marker) to a
/// `PackFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackPath {
    pub path: String,
    pub ino: u64,
    /// ext block group, or `-1` if unknown / not an ext filesystem.
    pub group: i64,
}

impl PackPath {
    fn sort_key(&self) -> (i64, u64, &str) {
        (self.group, self.ino, self.path.as_str())
    }
}

impl PartialOrd for PackPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackPath {
    /// Orders by `(group, ino, path)`.
    ///
    /// The original comparator compared an inode field to itself rather
    /// than to the other path's inode; this compares `self.ino` against
    /// `other.ino` as the sort evidently intended.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// One contiguous byte range to prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackBlock {
    pub pathidx: u32,
    pub offset: u64,
    pub length: u64,
    /// Physical byte address on the block device, or `-1` if unknown.
    pub physical: i64,
}

impl PackBlock {
    /// An "open-only" marker: the file was opened but never faulted, so it
    /// contributed no cached bytes. Kept so the replay engine still warms
    /// the dentry lookup.
    pub fn marker(pathidx: u32) -> Self {
        Self {
            pathidx,
            offset: 0,
            length: 0,
            physical: 0,
        }
    }

    pub fn is_marker(&self) -> bool {
        self.length == 0
    }
}

/// Per-device prefetch plan: the paths touched on this device and the byte
/// ranges of each to warm into the page cache.
#[derive(Debug)]
pub struct PackFile {
    pub dev: DevId,
    pub rotational: bool,
    pub paths: Vec<PackPath>,
    pub blocks: Vec<PackBlock>,
    pub groups: Vec<u32>,
}

impl PackFile {
    pub fn new(dev: DevId, rotational: bool) -> Self {
        Self {
            dev,
            rotational,
            paths: Vec::new(),
            blocks: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Registers a new path occurrence, returning its index into `paths`.
    pub fn add_path(&mut self, path: String, ino: u64) -> usize {
        self.paths.push(PackPath {
            path,
            ino,
            group: -1,
        });
        self.paths.len() - 1
    }

    /// Scans `file` (already known to be `size` bytes) for cache-resident
    /// pages, coalesces them into chunks, and appends blocks for `pathidx`.
    /// On the rotational path, each chunk is additionally resolved to
    /// physical extents via FIEMAP.
    ///
    /// Failures of `mmap`, `mincore`, or `munmap` are logged by the caller
    /// and treated as "no blocks for this file" rather than fatal.
    pub fn scan_file(&mut self, pathidx: usize, file: &File, size: u64) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }

        let mapping = Mapping::new(file, size)?;
        let residency = mapping.mincore()?;

        for (offset, length) in coalesce_chunks(&residency, size) {
            if self.rotational {
                self.append_rotational(pathidx as u32, file.as_raw_fd(), offset, length);
            } else {
                self.blocks.push(PackBlock {
                    pathidx: pathidx as u32,
                    offset,
                    length,
                    physical: -1,
                });
            }
        }

        Ok(())
    }

    fn append_rotational(&mut self, pathidx: u32, fd: std::os::unix::io::RawFd, offset: u64, length: u64) {
        let extents = match fiemap::resolve(fd, offset, length) {
            Ok(extents) => extents,
            Err(err) => {
                log::warn!("fiemap failed for pathidx {pathidx}: {err}");
                return;
            }
        };

        for extent in extents {
            if extent.unknown {
                continue;
            }
            let chunk_end = offset + length;
            let extent_end = extent.logical + extent.length;
            let start = offset.max(extent.logical);
            let end = chunk_end.min(extent_end);
            if end <= start {
                continue;
            }
            self.blocks.push(PackBlock {
                pathidx,
                offset: start,
                length: end - start,
                physical: (extent.physical + (start - extent.logical)) as i64,
            });
        }
    }
}

/// RAII wrapper around a `PROT_READ, MAP_SHARED` mapping of a whole file.
struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    fn new(file: &File, size: u64) -> io::Result<Self> {
        let len = size as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    /// Returns one byte per page: non-zero if resident in the page cache.
    fn mincore(&self) -> io::Result<Vec<u8>> {
        let num_pages = self.len.div_ceil(PAGE_SIZE as usize);
        let mut vec = vec![0u8; num_pages];
        let ret = unsafe { libc::mincore(self.ptr, self.len, vec.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(vec)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Walks a per-page residency vector and returns each maximal run of
/// present pages as a `(byte offset, byte length)` chunk, clipped to the
/// file's actual size.
fn coalesce_chunks(residency: &[u8], size: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut run_start: Option<usize> = None;

    for (page, &present) in residency.iter().enumerate() {
        if present != 0 {
            run_start.get_or_insert(page);
        } else if let Some(start) = run_start.take() {
            chunks.push(page_run_to_bytes(start, page, size));
        }
    }
    if let Some(start) = run_start {
        chunks.push(page_run_to_bytes(start, residency.len(), size));
    }
    chunks
}

fn page_run_to_bytes(start_page: usize, end_page: usize, size: u64) -> (u64, u64) {
    let offset = start_page as u64 * PAGE_SIZE;
    let end = (end_page as u64 * PAGE_SIZE).min(size);
    (offset, end - offset)
}

/// Reads `/sys/dev/block/{major}:{minor}/queue/rotational`, falling back to
/// masking the low nibble of the minor (the SCSI partition-to-whole-disk
/// convention) if the exact node doesn't exist. Defaults to `true`
/// (perform the HDD optimizations) if neither path is readable.
pub fn is_rotational(major: u32, minor: u32) -> bool {
    if let Some(value) = read_rotational(major, minor) {
        return value;
    }
    if let Some(value) = read_rotational(major, minor & !0x0f) {
        return value;
    }
    true
}

fn read_rotational(major: u32, minor: u32) -> Option<bool> {
    let path = Path::new("/sys/dev/block")
        .join(format!("{major}:{minor}"))
        .join("queue/rotational");
    let content = std::fs::read_to_string(path).ok()?;
    match content.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn coalesces_one_run() {
        let residency = [1u8, 1, 1, 0, 0];
        let chunks = coalesce_chunks(&residency, 5 * PAGE_SIZE);
        assert_eq!(chunks, vec![(0, 3 * PAGE_SIZE)]);
    }

    #[test]
    fn coalesces_multiple_runs() {
        let residency = [1u8, 0, 1, 1, 0, 1];
        let chunks = coalesce_chunks(&residency, 6 * PAGE_SIZE);
        assert_eq!(
            chunks,
            vec![(0, PAGE_SIZE), (2 * PAGE_SIZE, 2 * PAGE_SIZE), (5 * PAGE_SIZE, PAGE_SIZE)]
        );
    }

    #[test]
    fn trailing_run_clipped_to_file_size() {
        let residency = [1u8, 1];
        let size = PAGE_SIZE + 100;
        let chunks = coalesce_chunks(&residency, size);
        assert_eq!(chunks, vec![(0, size)]);
    }

    #[test]
    fn no_resident_pages_yields_no_chunks() {
        let residency = [0u8, 0, 0];
        assert!(coalesce_chunks(&residency, 3 * PAGE_SIZE).is_empty());
    }

    #[test]
    fn marker_block_is_recognized() {
        let marker = PackBlock::marker(3);
        assert!(marker.is_marker());
        assert_eq!(marker.physical, 0);
    }

    #[test]
    fn add_path_returns_sequential_indices() {
        let mut pf = PackFile::new(0x0800, true);
        assert_eq!(pf.add_path("/a".into(), 1), 0);
        assert_eq!(pf.add_path("/b".into(), 2), 1);
    }
}
