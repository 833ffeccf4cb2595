//! Session-level configuration.
//!
//! Groups the knobs that used to be individual global option variables in the
//! original tool into a single value the CLI front end builds once and hands
//! to the session controller.

use std::path::PathBuf;
use std::time::Duration;

/// `dev_t` as used throughout this crate: the raw, combined major/minor
/// device number.
pub type DevId = u64;

/// Configuration for one trace-and-pack session.
#[derive(Debug, Default, Clone)]
pub struct SessionConfig {
    /// Stop tracing after this much time rather than waiting for a signal.
    pub timeout: Option<Duration>,
    /// Fork and exit the parent once the tracer is armed.
    pub daemonise: bool,
    /// Don't enable/disable trace events ourselves; assume the caller (or
    /// another tool) already did it.
    pub use_existing_trace_events: bool,
    /// Treat every device as non-rotational, skipping block-group preload,
    /// physical-order sorting, and the two-phase FIEMAP resolution.
    pub force_ssd_mode: bool,
    /// Only keep paths starting with this prefix.
    pub path_prefix_filter: Option<String>,
    /// If set, paths are rewritten by prepending `prefix` whenever the
    /// rewritten path resolves to `expected_dev` via `lstat`.
    pub path_prefix_rewrite: Option<(PathBuf, DevId)>,
}

/// Upper bound on a stored path's length, matching the historical on-disk
/// pack format's fixed-size path field.
pub const PACK_PATH_MAX: usize = 4095;

/// Number of inodes in a block group before its blocks are queued for
/// preload.
pub const INODE_GROUP_PRELOAD_THRESHOLD: usize = 8;

/// Shift width of a page size (4096 bytes), used to convert between byte
/// offsets and page indices.
pub const PAGE_SHIFT: u32 = 12;

/// Splits a combined `dev_t` back into its major/minor components, the
/// inverse of `libc::makedev`. Used wherever a device needs to be turned
/// back into a sysfs or devtmpfs node path (`queue/rotational`, the whole
/// block device node for the ext superblock read).
pub fn split_dev(dev: DevId) -> (u32, u32) {
    (
        libc::major(dev as libc::dev_t) as u32,
        libc::minor(dev as libc::dev_t) as u32,
    )
}
