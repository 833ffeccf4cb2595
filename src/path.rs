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

//! Path normalization and the per-path handling pipeline (C3).

use std::collections::HashSet;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::config::{DevId, SessionConfig, PACK_PATH_MAX};

/// Prefixes whose contents are never worth prefetching: pseudo-filesystems,
/// temporary storage, and logs that are naturally cold on the next boot.
const IGNORED_PREFIXES: &[&str] = &[
    "/proc/",
    "/sys/",
    "/dev/",
    "/tmp/",
    "/run/",
    "/var/run/",
    "/var/log/",
    "/var/lock/",
];

/// Collapses `//`, `/./` and `/../` components and strips a trailing slash
/// (except for the root path itself).
///
/// Operates purely on the string; it does not touch the filesystem and does
/// not resolve symlinks. Matches scenario S4: `fix_path("/a//b/./c/../d/")`
/// normalizes to `/a/b/d`.
pub fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let mut result = String::from("/");
    result.push_str(&out.join("/"));
    result
}

/// True if `path` (already normalized) falls under one of the prefixes this
/// system never wants to prefetch.
pub fn is_ignored_path(path: &str) -> bool {
    IGNORED_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Why a candidate path was not turned into pack entries.
///
/// Distinguishes the "silent skip" and "per-item warning" tiers of the error
/// handling design; the caller decides whether to log.
#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    NotAbsolute,
    Ignored,
    TooLong,
    FilteredByPrefix,
    AlreadySeen,
    NotStatable,
    NotRegular,
    Symlink,
}

/// The outcome of successfully stat-and-opening a candidate path.
pub struct OpenedPath {
    pub file: File,
    pub path: String,
    pub dev: DevId,
    pub ino: u64,
    pub size: u64,
}

/// Session-scoped dedup state for the path handler.
///
/// The original tool kept these as process-wide globals; here they are
/// owned by the session controller and threaded through explicitly so a
/// test (or an embedding binary) can run more than one session in a
/// process.
#[derive(Debug, Default)]
pub struct PathDedup {
    seen_paths: HashSet<String>,
    seen_inodes: HashSet<(DevId, u64)>,
}

impl PathDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `(dev, ino)` has already been registered; does not mark it.
    pub fn inode_seen(&self, dev: DevId, ino: u64) -> bool {
        self.seen_inodes.contains(&(dev, ino))
    }

    /// Marks `(dev, ino)` as registered.
    pub fn mark_inode_seen(&mut self, dev: DevId, ino: u64) {
        self.seen_inodes.insert((dev, ino));
    }
}

/// Runs the normalize/reject/filter/rewrite/dedup/stat/open pipeline on one
/// raw path string from a trace record.
///
/// Steps 7-10 (per-device `PackFile` assembly and the chunk/extent scan)
/// belong to the pack assembler and are invoked by the caller with the
/// `OpenedPath` this function returns.
pub fn handle_candidate(
    raw: &str,
    config: &SessionConfig,
    dedup: &mut PathDedup,
) -> Result<OpenedPath, Rejection> {
    if !raw.starts_with('/') {
        return Err(Rejection::NotAbsolute);
    }
    let normalized = normalize(raw);

    if is_ignored_path(&normalized) {
        return Err(Rejection::Ignored);
    }
    if normalized.len() > PACK_PATH_MAX {
        return Err(Rejection::TooLong);
    }

    let mut candidate = normalized;
    if let Some(prefix) = &config.path_prefix_filter {
        if !candidate.starts_with(prefix.as_str()) {
            return Err(Rejection::FilteredByPrefix);
        }
    }

    if let Some((prefix, expected_dev)) = &config.path_prefix_rewrite {
        let rewritten = join_prefix(prefix, &candidate);
        if let Ok(meta) = std::fs::symlink_metadata(&rewritten) {
            if meta.dev() == *expected_dev {
                candidate = rewritten.to_string_lossy().into_owned();
            }
        }
    }

    if dedup.seen_paths.contains(&candidate) {
        return Err(Rejection::AlreadySeen);
    }

    let lstat = std::fs::symlink_metadata(&candidate).map_err(|_| Rejection::NotStatable)?;
    if lstat.file_type().is_symlink() {
        return Err(Rejection::Symlink);
    }
    if !lstat.is_file() {
        return Err(Rejection::NotRegular);
    }

    let file = open_no_atime(&candidate).map_err(|_| Rejection::NotStatable)?;
    let fstat = file.metadata().map_err(|_| Rejection::NotStatable)?;
    if !fstat.is_file() {
        return Err(Rejection::NotRegular);
    }

    dedup.seen_paths.insert(candidate.clone());

    Ok(OpenedPath {
        file,
        path: candidate,
        dev: fstat.dev(),
        ino: fstat.ino(),
        size: fstat.size(),
    })
}

fn join_prefix(prefix: &Path, path: &str) -> PathBuf {
    let mut joined = prefix.to_path_buf();
    joined.push(path.trim_start_matches('/'));
    joined
}

/// Opens `path` read-only with `O_NOATIME`, falling back to a plain
/// read-only open if the kernel refuses `O_NOATIME` (not the file's owner
/// and not privileged).
fn open_no_atime(path: &str) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOATIME)
        .open(path)
    {
        Ok(f) => Ok(f),
        Err(_) => std::fs::OpenOptions::new().read(true).open(path),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn s4_normalizes_dot_dot_and_double_slash() {
        assert_eq!(normalize("/a//b/./c/../d/"), "/a/b/d");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("/a//b/./c/../d/");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn normalize_collapses_root() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn dot_dot_bounded_at_root() {
        assert_eq!(normalize("/../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn ignored_prefixes_match() {
        assert!(is_ignored_path("/proc/1/maps"));
        assert!(is_ignored_path("/var/log/syslog"));
        assert!(!is_ignored_path("/usr/bin/bash"));
    }

    #[test]
    fn relative_path_is_rejected() {
        let config = SessionConfig::default();
        let mut dedup = PathDedup::new();
        let result = handle_candidate("usr/bin/bash", &config, &mut dedup);
        assert_eq!(result.err(), Some(Rejection::NotAbsolute));
    }

    /// A relative path whose `..` components would, once `normalize` joins
    /// them onto a synthetic leading `/`, happen to look like an absolute
    /// path under an ignored prefix. The absoluteness check must fire on the
    /// raw input, not on `normalize`'s output, or this slips through as
    /// `Ignored` instead of `NotAbsolute`.
    #[test]
    fn relative_path_is_rejected_before_normalization() {
        let config = SessionConfig::default();
        let mut dedup = PathDedup::new();
        let result = handle_candidate("../../proc/self/status", &config, &mut dedup);
        assert_eq!(result.err(), Some(Rejection::NotAbsolute));
    }

    #[test]
    fn ignored_path_is_rejected_before_stat() {
        let config = SessionConfig::default();
        let mut dedup = PathDedup::new();
        let result = handle_candidate("/proc/self/status", &config, &mut dedup);
        assert_eq!(result.err(), Some(Rejection::Ignored));
    }

    #[test]
    fn prefix_filter_drops_non_matching_paths() {
        let mut config = SessionConfig::default();
        config.path_prefix_filter = Some("/usr/".to_string());
        let mut dedup = PathDedup::new();
        let result = handle_candidate("/etc/passwd", &config, &mut dedup);
        assert_eq!(result.err(), Some(Rejection::FilteredByPrefix));
    }

    #[test]
    fn duplicate_path_is_rejected_on_second_call() {
        let config = SessionConfig::default();
        let mut dedup = PathDedup::new();
        dedup.seen_paths.insert("/bin/true".to_string());
        let result = handle_candidate("/bin/true", &config, &mut dedup);
        assert_eq!(result.err(), Some(Rejection::AlreadySeen));
    }
}
