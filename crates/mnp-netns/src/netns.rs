//! Scoped network-namespace entry

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use tracing::error;

use mnp_core::{Error, Result};

/// Switches the calling thread into a target netns and back on drop.
///
/// Must only be used on a thread that owns its namespace for the duration,
/// i.e. a dedicated blocking thread, never a runtime worker.
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    pub fn enter(path: &Path) -> Result<Self> {
        let original = File::open("/proc/thread-self/ns/net")
            .map_err(|e| Error::Netns(format!("Failed to open current netns: {}", e)))?;
        let target = File::open(path)
            .map_err(|e| Error::Netns(format!("Failed to open netns {}: {}", path.display(), e)))?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Netns(format!("Failed to enter netns {}: {}", path.display(), e)))?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            // A thread stranded in a foreign netns must not rejoin the pool.
            error!("Failed to restore original netns: {}", e);
            std::process::abort();
        }
    }
}

/// Run `f` inside the netns at `path`, pinned to a dedicated OS thread.
///
/// The namespace is restored before the thread returns to the blocking pool,
/// on every exit path including panics inside `f`.
pub async fn within<T, F>(path: PathBuf, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let _guard = NetnsGuard::enter(&path)?;
        f()
    })
    .await
    .map_err(|e| Error::Netns(format!("Netns worker failed: {}", e)))?
}
