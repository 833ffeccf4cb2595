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

//! Device/inode/range index (C1).
//!
//! Tracks, per `(device, inode)`, the set of page ranges that the kernel
//! reported as faulted in during the observation window. This is the
//! structure the range intersector (`intersect`) reads back after the drain
//! to figure out which on-disk blocks were actually touched.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::DevId;

/// A half-open interval `[start, end)` over page indices.
///
/// Invariant: `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end);
        Self { start, end }
    }

    /// Compares `self` against `other`, returning `Equal` if the two ranges
    /// overlap or touch (i.e. `self.end >= other.start && other.end >=
    /// self.start`).
    ///
    /// This is the "overlap-or-touch" comparator of the range-merge
    /// algorithm: it is not a total order, but it is monotonic with respect
    /// to a sorted, non-overlapping, non-touching array, which is exactly
    /// what [`Vec::binary_search_by`] requires.
    fn touch_cmp(&self, other: &Range) -> Ordering {
        if self.end < other.start {
            Ordering::Less
        } else if other.end < self.start {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Per-inode record: a sorted, non-overlapping, non-touching array of
/// accessed page ranges.
#[derive(Debug, Default)]
pub struct Inode {
    /// Optional display name, kept for diagnostics; not used by the merge
    /// algorithm itself.
    pub name: Option<String>,
    ranges: Vec<Range>,
}

impl Inode {
    /// Returns the accessed ranges, sorted ascending and non-touching.
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Merges `[first_index, last_index]` (inclusive) into the range array.
    ///
    /// Binary-search for an overlapping-or-touching
    /// range, then widen left/right while the neighbor keeps comparing
    /// equal, then splice the run down to one merged range.
    fn record_access(&mut self, first_index: i64, last_index: i64) {
        let key = Range::new(first_index, last_index + 1);

        match self.ranges.binary_search_by(|r| r.touch_cmp(&key)) {
            Err(pos) => self.ranges.insert(pos, key),
            Ok(idx) => {
                let r = self.ranges[idx];
                if r.start <= key.start && r.end >= key.end {
                    // Fully contained already; nothing to do.
                    return;
                }

                let mut lo = idx;
                while lo > 0 && self.ranges[lo - 1].touch_cmp(&key) == Ordering::Equal {
                    lo -= 1;
                }
                let mut hi = idx;
                while hi + 1 < self.ranges.len()
                    && self.ranges[hi + 1].touch_cmp(&key) == Ordering::Equal
                {
                    hi += 1;
                }

                let merged = Range::new(
                    self.ranges[lo].start.min(key.start),
                    self.ranges[hi].end.max(key.end),
                );
                self.ranges.splice(lo..=hi, std::iter::once(merged));
            }
        }
    }
}

/// Per-device record: the inodes touched on this device during the session.
#[derive(Debug, Default)]
pub struct Device {
    inodes: HashMap<u64, Inode>,
}

impl Device {
    pub fn find_inode(&self, ino: u64) -> Option<&Inode> {
        self.inodes.get(&ino)
    }
}

/// The device hash: a map from `dev_t` to [`Device`], owned by the
/// session controller for the lifetime of one trace run.
///
/// The original implementation backs this with a fixed-size open-chained
/// hash table keyed on `dev & MASK`; a [`HashMap`] keyed on the full `dev_t`
/// is a behavior-preserving substitution (the bucket count and masking were
/// never part of the observable contract, only an artifact of the C
/// allocator).
#[derive(Debug, Default)]
pub struct DeviceIndex {
    devices: HashMap<DevId, Device>,
}

impl DeviceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_device(&self, dev: DevId) -> Option<&Device> {
        self.devices.get(&dev)
    }

    /// Registers that pages `[first_index, last_index]` (inclusive) of
    /// `(dev, ino)` were touched, creating the device and inode entries on
    /// demand.
    pub fn record_access(&mut self, dev: DevId, ino: u64, first_index: i64, last_index: i64) {
        self.devices
            .entry(dev)
            .or_default()
            .inodes
            .entry(ino)
            .or_default()
            .record_access(first_index, last_index);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ranges_of(idx: &DeviceIndex, dev: DevId, ino: u64) -> Vec<(i64, i64)> {
        idx.find_device(dev)
            .and_then(|d| d.find_inode(ino))
            .map(|i| i.ranges().iter().map(|r| (r.start, r.end)).collect())
            .unwrap_or_default()
    }

    /// S1: out-of-order, overlapping inserts collapse into a single range.
    #[test]
    fn s1_merges_into_single_range() {
        let mut idx = DeviceIndex::new();
        let dev = 0x0800u64;
        for (a, b) in [
            (0, 0),
            (2, 3),
            (1, 1),
            (4, 5),
            (8, 10),
            (7, 7),
            (1, 3),
            (7, 10),
            (2, 8),
        ] {
            idx.record_access(dev, 12345, a, b);
        }
        assert_eq!(ranges_of(&idx, dev, 12345), vec![(0, 11)]);
    }

    /// S2: continues from S1, exercising a merge across three existing runs.
    #[test]
    fn s2_merges_multiple_runs() {
        let mut idx = DeviceIndex::new();
        let dev = 0x0800u64;
        for (a, b) in [
            (0, 0),
            (2, 3),
            (1, 1),
            (4, 5),
            (8, 10),
            (7, 7),
            (1, 3),
            (7, 10),
            (2, 8),
        ] {
            idx.record_access(dev, 12345, a, b);
        }
        for (a, b) in [(20, 30), (50, 60), (70, 80), (90, 100)] {
            idx.record_access(dev, 12345, a, b);
        }
        idx.record_access(dev, 12345, 25, 69);

        assert_eq!(
            ranges_of(&idx, dev, 12345),
            vec![(0, 11), (20, 81), (90, 101)]
        );
    }

    #[test]
    fn inserting_same_range_twice_is_idempotent() {
        let mut idx = DeviceIndex::new();
        idx.record_access(8, 1, 5, 9);
        let once = ranges_of(&idx, 8, 1);
        idx.record_access(8, 1, 5, 9);
        assert_eq!(ranges_of(&idx, 8, 1), once);
    }

    #[test]
    fn touching_ranges_coalesce() {
        let mut idx = DeviceIndex::new();
        idx.record_access(8, 1, 0, 4);
        idx.record_access(8, 1, 5, 9);
        assert_eq!(ranges_of(&idx, 8, 1), vec![(0, 10)]);
    }

    #[test]
    fn contained_range_is_noop() {
        let mut idx = DeviceIndex::new();
        idx.record_access(8, 1, 0, 20);
        idx.record_access(8, 1, 5, 9);
        assert_eq!(ranges_of(&idx, 8, 1), vec![(0, 21)]);
    }

    #[test]
    fn unknown_inode_has_no_ranges() {
        let idx = DeviceIndex::new();
        assert!(idx.find_device(8).is_none());
    }
}
