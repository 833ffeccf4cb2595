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

//! Trace event consumer (C2): iterates kernel trace records in delivery
//! order and dispatches each to the path handler or to the device/inode/
//! range index.
//!
//! The consumer is generic over a [`TraceSource`]: a trait that yields
//! decoded [`TraceRecord`]s. This lets the real backend (parsing tracefs's
//! formatted buffer dump, see [`TextTraceSource`]) and an in-memory fixture
//! backend (used by tests) share the dispatch and bookkeeping code below.

use std::collections::HashMap;

use crate::config::{self, DevId, SessionConfig};
use crate::index::DeviceIndex;
use crate::pack::{self, PackFile};
use crate::path::{self, PathDedup};

/// The six trace events the session controller arms. The first two are
/// required; the rest are optional and only refine the result.
pub const EVENTS: [(&str, &str); 6] = [
    ("fs", "do_sys_open"),
    ("fs", "open_exec"),
    ("fs", "uselib"),
    ("filemap", "mm_filemap_fault"),
    ("filemap", "mm_filemap_get_pages"),
    ("filemap", "mm_filemap_map_pages"),
];

/// Number of entries at the front of [`EVENTS`] whose absence is a fatal
/// configuration error rather than a silent loss of accuracy.
pub const NR_REQUIRED_EVENTS: usize = 2;

/// Indices into [`EVENTS`] of the three `filemap` events that gate the
/// range-intersection pass: the refinement only runs if all three were
/// enabled.
pub const FILEMAP_EVENT_RANGE: std::ops::Range<usize> = 3..6;

/// One decoded trace record: an event name and its `key=value` fields.
#[derive(Debug, Clone, Default)]
pub struct TraceRecord {
    event: String,
    fields: HashMap<String, String>,
}

impl TraceRecord {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parses a field as an unsigned integer. Accepts both the plain
    /// decimal and `0x`-prefixed hexadecimal renderings ftrace uses
    /// depending on the field's print format.
    pub fn field_u64(&self, key: &str) -> Option<u64> {
        let raw = self.field_str(key)?;
        if let Some(hex) = raw.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else {
            raw.parse().ok()
        }
    }

    /// Parses one line of tracefs's formatted buffer dump into a record, or
    /// `None` if the line is blank, a comment, or doesn't look like a trace
    /// line at all.
    ///
    /// A typical line looks like:
    /// `  bash-1234  [002] ....  12345.678901: do_sys_open: filename=/bin/ls`
    /// or, for a filemap event:
    /// `  bash-1234  [002] ....  12345.678902: mm_filemap_fault: i_ino=300 s_dev=2097152 index=3`
    fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.splitn(3, ": ");
        let _header = parts.next()?;
        let event = parts.next()?.trim();
        let rest = parts.next().unwrap_or("").trim();

        let mut record = TraceRecord::new(event);
        if let Some(filename) = rest.strip_prefix("filename=") {
            record = record.with_field("filename", filename);
        } else {
            for token in rest.split_whitespace() {
                if let Some((key, value)) = token.split_once('=') {
                    record = record.with_field(key, value);
                }
            }
        }
        Some(record)
    }
}

/// A source of decoded trace records, consumed in delivery order.
pub trait TraceSource {
    fn next_record(&mut self) -> Option<TraceRecord>;
}

/// Parses a complete tracefs buffer dump (the text of the `trace` control
/// file) line by line.
///
/// Unlike `trace_pipe`, reading `trace` doesn't block waiting for new
/// records, which is why the session controller reads it in one shot after
/// disabling tracing rather than streaming it live.
pub struct TextTraceSource {
    lines: std::vec::IntoIter<String>,
}

impl TextTraceSource {
    pub fn new(text: String) -> Self {
        let lines = text.lines().map(str::to_string).collect::<Vec<_>>();
        Self {
            lines: lines.into_iter(),
        }
    }
}

impl TraceSource for TextTraceSource {
    fn next_record(&mut self) -> Option<TraceRecord> {
        for line in self.lines.by_ref() {
            if let Some(record) = TraceRecord::parse_line(&line) {
                return Some(record);
            }
        }
        None
    }
}

/// An in-memory source for tests: records are supplied directly rather than
/// rendered through the tracefs text format.
#[derive(Default)]
pub struct FixtureSource {
    records: std::collections::VecDeque<TraceRecord>,
}

impl FixtureSource {
    pub fn new(records: impl IntoIterator<Item = TraceRecord>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }
}

impl TraceSource for FixtureSource {
    fn next_record(&mut self) -> Option<TraceRecord> {
        self.records.pop_front()
    }
}

/// Drains every record `source` yields, dispatching opens to the path
/// handler and filemap events to the device/inode/range index.
///
/// `packs` accumulates one `PackFile` per device touched; the caller owns
/// it across the whole session so post-processing can run over the
/// complete set once the drain is done.
pub fn drain<S: TraceSource>(
    source: &mut S,
    config: &SessionConfig,
    dedup: &mut PathDedup,
    index: &mut DeviceIndex,
    packs: &mut HashMap<DevId, PackFile>,
) {
    while let Some(record) = source.next_record() {
        match record.event() {
            "do_sys_open" | "open_exec" | "uselib" => handle_open(&record, config, dedup, packs),
            "mm_filemap_fault" | "mm_filemap_get_pages" | "mm_filemap_map_pages" => {
                handle_filemap(&record, index)
            }
            other => log::trace!("ignoring unrecognized trace event {other}"),
        }
    }
}

fn handle_open(
    record: &TraceRecord,
    config: &SessionConfig,
    dedup: &mut PathDedup,
    packs: &mut HashMap<DevId, PackFile>,
) {
    let Some(raw) = record.field_str("filename") else {
        log::warn!(
            "field 'filename' not found for event {}",
            record.event()
        );
        return;
    };

    let opened = match path::handle_candidate(raw, config, dedup) {
        Ok(opened) => opened,
        Err(rejection) => {
            log::debug!("dropping {raw}: {rejection:?}");
            return;
        }
    };

    let already_scanned = dedup.inode_seen(opened.dev, opened.ino);
    dedup.mark_inode_seen(opened.dev, opened.ino);

    let pack = packs.entry(opened.dev).or_insert_with(|| {
        let rotational = if config.force_ssd_mode {
            false
        } else {
            let (major, minor) = config::split_dev(opened.dev);
            pack::is_rotational(major, minor)
        };
        PackFile::new(opened.dev, rotational)
    });
    let pathidx = pack.add_path(opened.path.clone(), opened.ino);

    if already_scanned || opened.size == 0 {
        return;
    }

    if let Err(err) = pack.scan_file(pathidx, &opened.file, opened.size) {
        log::warn!("failed to scan {}: {err}", opened.path);
    }
}

fn handle_filemap(record: &TraceRecord, index: &mut DeviceIndex) {
    let (Some(ino), Some(raw_dev), Some(page_index)) = (
        record.field_u64("i_ino"),
        record.field_u64("s_dev"),
        record.field_u64("index"),
    ) else {
        log::warn!("missing fields for event {}", record.event());
        return;
    };
    let last_index = record.field_u64("last_index").unwrap_or(page_index);

    // `s_dev` is encoded as `(major << 20) | minor_8_bits`, narrower than
    // the kernel's full 20-bit minor. This matches the event's on-wire
    // encoding; preserved as-is rather than "fixed" to a wider mask.
    let major = (raw_dev >> 20) as u32;
    let minor = (raw_dev & 0xff) as u32;
    let dev = libc::makedev(major, minor) as DevId;

    index.record_access(dev, ino, page_index as i64, last_index as i64);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_open_event_line() {
        let line = "   bash-1234  [002] ....  123.456789: do_sys_open: filename=/usr/bin/ls";
        let record = TraceRecord::parse_line(line).unwrap();
        assert_eq!(record.event(), "do_sys_open");
        assert_eq!(record.field_str("filename"), Some("/usr/bin/ls"));
    }

    #[test]
    fn parses_filemap_event_line() {
        let line =
            "   bash-1234  [002] ....  123.456790: mm_filemap_fault: i_ino=300 s_dev=2097152 index=3";
        let record = TraceRecord::parse_line(line).unwrap();
        assert_eq!(record.event(), "mm_filemap_fault");
        assert_eq!(record.field_u64("i_ino"), Some(300));
        assert_eq!(record.field_u64("s_dev"), Some(2097152));
        assert_eq!(record.field_u64("index"), Some(3));
        assert_eq!(record.field_u64("last_index"), None);
    }

    #[test]
    fn skips_comment_and_blank_lines() {
        assert!(TraceRecord::parse_line("# tracer: nop").is_none());
        assert!(TraceRecord::parse_line("").is_none());
        assert!(TraceRecord::parse_line("   ").is_none());
    }

    #[test]
    fn dispatch_routes_filemap_event_into_index() {
        let mut index = DeviceIndex::new();
        let record = TraceRecord::new("mm_filemap_fault")
            .with_field("i_ino", "42")
            .with_field("s_dev", "2097152") // major=2, minor=0
            .with_field("index", "10");
        let mut source = FixtureSource::new([record]);
        let config = SessionConfig::default();
        let mut dedup = PathDedup::new();
        let mut packs = HashMap::new();

        drain(&mut source, &config, &mut dedup, &mut index, &mut packs);

        let dev = libc::makedev(2, 0) as DevId;
        let ranges: Vec<_> = index
            .find_device(dev)
            .and_then(|d| d.find_inode(42))
            .map(|i| i.ranges().to_vec())
            .unwrap_or_default();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (10, 11));
    }

    #[test]
    fn unrecognized_event_is_ignored() {
        let mut index = DeviceIndex::new();
        let mut source = FixtureSource::new([TraceRecord::new("sched_switch")]);
        let config = SessionConfig::default();
        let mut dedup = PathDedup::new();
        let mut packs = HashMap::new();

        drain(&mut source, &config, &mut dedup, &mut index, &mut packs);

        assert!(packs.is_empty());
    }
}
