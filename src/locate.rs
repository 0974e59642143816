use crate::{config::Locator, util::expand_tilde};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a located binary was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Configured,
    Candidate,
    SearchPath,
}

/// A path that existed and was executable at lookup time. Not cached: every
/// render resolves it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedBinary {
    pub path: PathBuf,
    pub origin: Origin,
}

/// Find the converter binary: explicit override, then well-known candidates,
/// then a PATH lookup for `cfg.binary_name`. Absence is a normal outcome.
pub fn locate(cfg: &Locator) -> Option<LocatedBinary> {
    let cwd = std::env::current_dir().ok();
    locate_in(cfg, cwd.as_deref(), std::env::var_os("PATH"))
}

/// Same as [`locate`] with the working directory and search path supplied by
/// the caller.
pub fn locate_in(
    cfg: &Locator,
    cwd: Option<&Path>,
    search_path: Option<OsString>,
) -> Option<LocatedBinary> {
    let configured = cfg.binary.trim();
    if !configured.is_empty() {
        let p = resolve_relative(expand_tilde(configured), cwd);
        if is_executable(&p) {
            return Some(LocatedBinary {
                path: p,
                origin: Origin::Configured,
            });
        }
        debug!("configured binary is not executable: {}", p.display());
    }

    for raw in &cfg.candidates {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let p = resolve_relative(expand_tilde(raw), cwd);
        if is_executable(&p) {
            return Some(LocatedBinary {
                path: p,
                origin: Origin::Candidate,
            });
        }
    }

    let name = cfg.binary_name.trim();
    if name.is_empty() {
        return None;
    }
    let search_path = search_path?;
    for dir in std::env::split_paths(&search_path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let p = dir.join(name);
        if is_executable(&p) {
            return Some(LocatedBinary {
                path: p,
                origin: Origin::SearchPath,
            });
        }
    }

    debug!("no executable found for {name}");
    None
}

fn resolve_relative(p: PathBuf, cwd: Option<&Path>) -> PathBuf {
    match cwd {
        Some(cwd) if p.is_relative() => cwd.join(p),
        _ => p,
    }
}

#[cfg(unix)]
pub fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(p) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_executable(p: &Path) -> bool {
    std::fs::metadata(p).map(|m| m.is_file()).unwrap_or(false)
}
