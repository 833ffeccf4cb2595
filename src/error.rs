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

//! Error types for the trace session.
//!
//! Per-item failures (an unreadable file, a failed FIEMAP call, ...) are not
//! represented here: they are logged with [`log::warn!`] at the call site and
//! the offending item is skipped, matching the three-tier policy of the
//! session controller. [`TraceError`] only covers the fatal tier, where the
//! session as a whole cannot continue.

use std::io;

/// A fatal failure of the trace session.
///
/// Each variant corresponds to one of the session controller's fallible setup
/// or teardown steps. The caller (the CLI front end) maps these to distinct
/// process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// A required trace event (`do_sys_open` or `open_exec`) could not be
    /// enabled.
    #[error("failed to enable required trace event {0}: {1}")]
    RequiredEvent(&'static str, io::Error),

    /// The per-CPU ring buffer size could not be read or set.
    #[error("failed to size the trace ring buffer: {0}")]
    BufferSize(io::Error),

    /// The global tracing toggle could not be read or set.
    #[error("failed to toggle tracing: {0}")]
    TracingToggle(io::Error),

    /// Daemonising via `fork` failed.
    #[error("failed to daemonise: {0}")]
    Fork(io::Error),

    /// The raw trace event stream could not be opened for draining.
    #[error("failed to open trace event stream: {0}")]
    OpenTrace(io::Error),
}

/// Convenience alias for fallible session-level operations.
pub type TraceResult<T> = Result<T, TraceError>;
