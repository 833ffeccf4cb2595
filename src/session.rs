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

//! Session controller (C7): arms the kernel tracer, waits out the
//! observation window, drains the result through the rest of the pipeline,
//! and restores every bit of environment it touched.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{self, DevId, SessionConfig};
use crate::error::{TraceError, TraceResult};
use crate::index::DeviceIndex;
use crate::intersect;
use crate::pack::PackFile;
use crate::path::PathDedup;
use crate::postprocess;
use crate::trace::{self, EVENTS, FILEMAP_EVENT_RANGE, NR_REQUIRED_EVENTS, TextTraceSource};

/// Per-CPU ring buffer size the session sets for the duration of the trace.
const RING_BUFFER_KB_PER_CPU: u64 = 8192;

/// Niceness increment applied before draining the trace, matching the
/// original tool's "be nicer" step: draining touches a lot of small files
/// and shouldn't compete with real work for CPU time.
const NICE_INCREMENT: i32 = 15;

/// Low-level tracefs access: mount point resolution and the handful of
/// control files the session controller reads and writes. Everything here
/// is plain file I/O against tracefs's pseudo-filesystem; no binary ring
/// buffer decoding happens at this layer.
struct Tracefs {
    base: PathBuf,
}

impl Tracefs {
    fn discover() -> io::Result<Self> {
        for candidate in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
            let base = Path::new(candidate);
            if base.join("trace").exists() {
                return Ok(Self {
                    base: base.to_path_buf(),
                });
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no tracefs mount found under /sys/kernel/tracing or /sys/kernel/debug/tracing",
        ))
    }

    fn event_enable_path(&self, system: &str, name: &str) -> PathBuf {
        self.base
            .join("events")
            .join(system)
            .join(name)
            .join("enable")
    }

    fn event_is_enabled(&self, system: &str, name: &str) -> bool {
        fs::read_to_string(self.event_enable_path(system, name))
            .map(|s| s.trim() != "0")
            .unwrap_or(false)
    }

    fn set_event_enable(&self, system: &str, name: &str, enable: bool) -> io::Result<()> {
        fs::write(
            self.event_enable_path(system, name),
            if enable { "1" } else { "0" },
        )
    }

    fn buffer_size_kb(&self) -> io::Result<u64> {
        fs::read_to_string(self.base.join("buffer_size_kb"))?
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparsable buffer_size_kb"))
    }

    fn set_buffer_size_kb(&self, kb: u64) -> io::Result<()> {
        fs::write(self.base.join("buffer_size_kb"), kb.to_string())
    }

    fn tracing_on(&self) -> io::Result<bool> {
        Ok(fs::read_to_string(self.base.join("tracing_on"))?.trim() == "1")
    }

    fn set_tracing_on(&self, on: bool) -> io::Result<()> {
        fs::write(self.base.join("tracing_on"), if on { "1" } else { "0" })
    }

    /// Dumps the formatted contents of the current buffer. Unlike
    /// `trace_pipe`, reading `trace` doesn't block waiting for new records
    /// and doesn't consume what it reads, which matches the "arm, wait,
    /// disable, then drain what's there" shape of the controller below.
    fn read_trace(&self) -> io::Result<String> {
        fs::read_to_string(self.base.join("trace"))
    }
}

/// Installs an empty handler for `signum`, returning the previous
/// disposition so it can be restored afterwards. The handler's only job is
/// to make the blocking wait below return; it carries no other behavior.
fn install_empty_handler(signum: i32) -> libc::sigaction {
    extern "C" fn empty_handler(_signum: libc::c_int) {}

    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = empty_handler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = 0;

        let mut old: libc::sigaction = std::mem::zeroed();
        libc::sigaction(signum, &act, &mut old);
        old
    }
}

fn restore_handler(signum: i32, old: &libc::sigaction) {
    unsafe {
        libc::sigaction(signum, old, std::ptr::null_mut());
    }
}

/// Blocks until either `timeout` elapses or a signal interrupts, installing
/// and restoring empty `SIGTERM`/`SIGINT` handlers around the wait so a
/// caller's own disposition isn't disturbed for longer than necessary.
fn wait_for_window(timeout: Option<Duration>) {
    let old_term = install_empty_handler(libc::SIGTERM);
    let old_int = install_empty_handler(libc::SIGINT);

    match timeout {
        Some(duration) => {
            let mut tv = libc::timeval {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_usec: duration.subsec_micros() as libc::suseconds_t,
            };
            unsafe {
                libc::select(
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    &mut tv,
                );
            }
        }
        None => unsafe {
            libc::pause();
        },
    }

    restore_handler(libc::SIGTERM, &old_term);
    restore_handler(libc::SIGINT, &old_int);
}

/// The whole-device node backing `dev`, used for the ext block-group read.
/// Mirrors the sysfs lookup the pack assembler does for rotationality: a
/// plain `/dev/block/{major}:{minor}` devtmpfs symlink, not a name lookup.
fn block_device_path(dev: DevId) -> PathBuf {
    let (major, minor) = config::split_dev(dev);
    PathBuf::from(format!("/dev/block/{major}:{minor}"))
}

/// Runs one full trace-and-pack session: arms the tracer, waits for the
/// observation window to end, drains and assembles the result, and returns
/// one [`PackFile`] per device that had at least one qualifying open.
///
/// On any fatal setup or teardown failure, returns before doing anything
/// that would need undoing beyond what's already been restored inline.
pub fn run(config: &SessionConfig) -> TraceResult<Vec<PackFile>> {
    let tracefs = Tracefs::discover().map_err(|err| TraceError::OpenTrace(err))?;

    let mut prior_enabled = [false; EVENTS.len()];
    for (i, &(system, name)) in EVENTS.iter().enumerate() {
        prior_enabled[i] = tracefs.event_is_enabled(system, name);
    }

    let mut enabled_ok = [false; EVENTS.len()];
    if config.use_existing_trace_events {
        enabled_ok = prior_enabled;
        for (i, &(_, name)) in EVENTS.iter().enumerate().take(NR_REQUIRED_EVENTS) {
            if !enabled_ok[i] {
                return Err(TraceError::RequiredEvent(
                    name,
                    io::Error::new(io::ErrorKind::NotFound, "required event not pre-enabled"),
                ));
            }
        }
    } else {
        for (i, &(system, name)) in EVENTS.iter().enumerate() {
            match tracefs.set_event_enable(system, name, true) {
                Ok(()) => enabled_ok[i] = true,
                Err(err) => {
                    if i < NR_REQUIRED_EVENTS {
                        return Err(TraceError::RequiredEvent(name, err));
                    }
                    log::debug!("optional event {name} unavailable: {err}");
                }
            }
        }
    }
    let filemap_available = FILEMAP_EVENT_RANGE.clone().all(|i| enabled_ok[i]);

    let old_buffer_kb = tracefs.buffer_size_kb().map_err(TraceError::BufferSize)?;
    tracefs
        .set_buffer_size_kb(RING_BUFFER_KB_PER_CPU)
        .map_err(TraceError::BufferSize)?;

    let old_tracing_on = tracefs.tracing_on().map_err(TraceError::TracingToggle)?;
    tracefs
        .set_tracing_on(true)
        .map_err(TraceError::TracingToggle)?;

    if config.daemonise {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(TraceError::Fork(io::Error::last_os_error()));
        }
        if pid > 0 {
            std::process::exit(0);
        }
    }

    wait_for_window(config.timeout);

    if !old_tracing_on {
        tracefs
            .set_tracing_on(false)
            .map_err(TraceError::TracingToggle)?;
    }
    if !config.use_existing_trace_events {
        for (i, &(system, name)) in EVENTS.iter().enumerate() {
            if enabled_ok[i] && !prior_enabled[i] {
                if let Err(err) = tracefs.set_event_enable(system, name, false) {
                    log::warn!("failed to restore disabled state of {name}: {err}");
                }
            }
        }
    }

    unsafe {
        libc::nice(NICE_INCREMENT);
    }

    let trace_text = tracefs.read_trace().map_err(TraceError::OpenTrace)?;
    let mut source = TextTraceSource::new(trace_text);
    let mut dedup = PathDedup::new();
    let mut index = DeviceIndex::new();
    let mut packs: HashMap<DevId, PackFile> = HashMap::new();
    trace::drain(&mut source, config, &mut dedup, &mut index, &mut packs);

    tracefs
        .set_buffer_size_kb(old_buffer_kb)
        .map_err(TraceError::BufferSize)?;

    let mut result: Vec<PackFile> = packs.into_values().collect();
    for pack in &mut result {
        if filemap_available {
            intersect::refine(pack, &index);
        }
        if pack.rotational {
            let block_device = block_device_path(pack.dev);
            postprocess::post_process(pack, &block_device);
        }
    }
    Ok(result)
}
