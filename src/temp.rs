//! Per-request scratch space.
//!
//! Every intermediate artifact a dubbing job creates lives inside one
//! [`TempScope`]. Names are unique within the scope and the scope directory is
//! unique per process and request, so concurrent jobs never collide. Dropping
//! the scope deletes everything it still holds, on success and error alike.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tempfile::TempDir;
use tracing::debug;

const TEMP_PREFIX: &str = "autodub_";

#[derive(Debug)]
pub struct TempScope {
    dir: TempDir,
    counter: AtomicUsize,
    live: Mutex<HashSet<PathBuf>>,
}

impl TempScope {
    /// Create a scope under the system temp directory.
    pub fn new() -> std::io::Result<Self> {
        Self::new_in(std::env::temp_dir())
    }

    /// Create a scope under `parent`.
    pub fn new_in(parent: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}_", TEMP_PREFIX, std::process::id()))
            .tempdir_in(parent)?;
        debug!("Created temp scope {}", dir.path().display());
        Ok(Self {
            dir,
            counter: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a fresh file path ending in `suffix` (e.g. `".wav"`).
    /// The file itself is not created.
    pub fn file(&self, suffix: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.path().join(format!("{:05}{}", n, suffix));
        self.lock().insert(path.clone());
        path
    }

    /// Delete a reserved file now instead of at scope end.
    pub fn release(&self, path: &Path) {
        if self.lock().remove(path) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Number of reserved paths that currently exist on disk.
    pub fn live_files(&self) -> usize {
        self.lock().iter().filter(|p| p.exists()).count()
    }

    /// Move a scoped artifact out to `dest` so it survives the scope.
    pub fn persist(&self, path: &Path, dest: &Path) -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // rename fails across filesystems; fall back to copy
        if std::fs::rename(path, dest).is_err() {
            std::fs::copy(path, dest)?;
            std::fs::remove_file(path)?;
        }
        self.lock().remove(path);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        // a poisoned set is still a valid set of paths
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        debug!(
            "Releasing temp scope {} ({} files left)",
            self.dir.path().display(),
            self.live_files()
        );
    }
}

/// Remove temp scopes left behind by autodub processes that were killed.
pub fn cleanup_orphaned_temp_files() {
    cleanup_orphans_in(&std::env::temp_dir());
}

fn cleanup_orphans_in(temp_dir: &Path) {
    let current_pid = std::process::id();
    let Ok(entries) = std::fs::read_dir(temp_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(pid) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(owner_pid)
        else {
            continue;
        };
        if pid == current_pid || is_process_running(pid) {
            continue;
        }
        debug!("Removing orphaned temp scope {}", path.display());
        let _ = std::fs::remove_dir_all(&path);
    }
}

/// PID embedded in a scope directory name: `autodub_<pid>_<random>`.
fn owner_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(TEMP_PREFIX)?;
    let (pid, _) = rest.split_once('_')?;
    pid.parse().ok()
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // signal 0 only probes for existence
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
        extern "system" {
            fn OpenProcess(access: u32, inherit: i32, pid: u32) -> *mut std::ffi::c_void;
            fn CloseHandle(handle: *mut std::ffi::c_void) -> i32;
        }
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                false
            } else {
                CloseHandle(handle);
                true
            }
        }
    }
}
