//! Process-wide delete-on-exit registry.
//!
//! Some files cannot be unlinked at handshake teardown (the target VM may
//! still hold them open, or the path may sit in a directory we no longer
//! own). Such paths are parked here and drained once at orderly process
//! exit. Single-initialization, read-mostly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use once_cell::sync::Lazy;

static DOOMED: Lazy<Mutex<Vec<PathBuf>>> = Lazy::new(|| {
    unsafe {
        libc::atexit(drain_at_exit);
    }
    Mutex::new(Vec::new())
});

extern "C" fn drain_at_exit() {
    drain();
}

/// Remove the file at `path` now, or schedule it for removal at exit.
pub(crate) fn remove_or_defer(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            debug!("deferring removal of {}: {}", path.display(), err);
            schedule(path);
        }
    }
}

/// Remove the directory at `path` now, or schedule it for removal at exit.
pub(crate) fn remove_dir_or_defer(path: &Path) {
    match fs::remove_dir(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            debug!("deferring removal of {}: {}", path.display(), err);
            schedule(path);
        }
    }
}

/// Park `path` for removal at process exit.
pub(crate) fn schedule(path: &Path) {
    DOOMED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(path.to_path_buf());
}

/// Unlink everything scheduled so far. Runs from the exit hook; callable
/// directly in tests.
pub(crate) fn drain() {
    let doomed: Vec<PathBuf> = std::mem::take(
        &mut *DOOMED
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    );
    for path in doomed {
        let outcome = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match outcome {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove {} at exit: {}", path.display(), err),
        }
    }
}
