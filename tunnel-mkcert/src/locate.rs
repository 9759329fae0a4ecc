//! Filesystem probing for the `mkcert` executable and the monorepo root.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::MkcertError;

/// Searches the process `PATH` for an executable called `name`.
///
/// # Errors
///
/// Returns [`MkcertError::NotFound`] if `PATH` is unset or no entry holds
/// an executable file with that name.
pub fn find_executable(name: &str) -> Result<PathBuf, MkcertError> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    find_executable_in(name, std::env::split_paths(&path))
}

/// Searches the given directories, in order, for an executable called `name`.
///
/// On Windows the `.exe` suffix is tried as well.
///
/// # Errors
///
/// Returns [`MkcertError::NotFound`] if no directory holds a match.
pub fn find_executable_in<I>(name: &str, dirs: I) -> Result<PathBuf, MkcertError>
where
    I: IntoIterator<Item = PathBuf>,
{
    let candidates = candidate_names(name);
    for dir in dirs {
        for candidate in &candidates {
            let full = dir.join(candidate);
            if is_executable(&full) {
                #[cfg(feature = "telemetry")]
                tracing::trace!(path = %full.display(), "found executable");
                return Ok(full);
            }
        }
    }
    Err(MkcertError::NotFound {
        name: name.to_owned(),
    })
}

/// Walks up from `start` and returns the first directory containing any of
/// `markers` (files or directories).
///
/// # Errors
///
/// Returns [`MkcertError::MonorepoRootNotFound`] if the filesystem root is
/// reached without a match.
pub fn find_monorepo_root(start: &Path, markers: &[&str]) -> Result<PathBuf, MkcertError> {
    start
        .ancestors()
        .find(|dir| markers.iter().any(|marker| dir.join(marker).exists()))
        .map(Path::to_path_buf)
        .ok_or_else(|| MkcertError::MonorepoRootNotFound {
            start: start.to_path_buf(),
        })
}

fn candidate_names(name: &str) -> Vec<OsString> {
    let mut names = vec![OsString::from(name)];
    if cfg!(windows) && Path::new(name).extension().is_none() {
        names.push(OsString::from(format!("{name}.exe")));
    }
    names
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
