//! Error types for mkcert discovery and invocation.

use std::path::PathBuf;
use std::process::ExitStatus;

/// Errors raised while locating `mkcert` or reading its CA bundle.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MkcertError {
    /// The executable is not installed (or not on `PATH`).
    #[error("`{name}` was not found on PATH")]
    NotFound {
        /// Executable name that was searched for.
        name: String,
    },

    /// No ancestor directory carried any of the monorepo root markers.
    #[error("no monorepo root found above {}", .start.display())]
    MonorepoRootNotFound {
        /// Directory the upward search started from.
        start: PathBuf,
    },

    /// The executable could not be spawned.
    #[error("failed to run {}: {source}", .bin.display())]
    Spawn {
        /// Executable that failed to start.
        bin: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The executable ran but exited unsuccessfully.
    #[error("{} {args} exited with {status}: {stderr}", .bin.display())]
    CommandFailed {
        /// Executable that was run.
        bin: PathBuf,
        /// Space-joined arguments, for the log line.
        args: String,
        /// Exit status reported by the OS.
        status: ExitStatus,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// A certificate file could not be read or its directory created.
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
