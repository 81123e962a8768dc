//! Resolves a file descriptor to its filesystem path by inspecting the
//! process's per-descriptor symlink namespace (spec.md §4.2).

use std::os::raw::c_int;
use std::path::PathBuf;

/// Returns the path a descriptor currently refers to, or `None` on any
/// resolution failure (descriptor closed, permission denied, path longer
/// than the namespace can report). The caller degrades to fallback on
/// `None`; this never panics or aborts.
pub fn resolve_path(fd: c_int) -> Option<PathBuf> {
    let link = format!("/proc/self/fd/{fd}");
    std::fs::read_link(&link).ok()
}
