//! Atomic install/remove of rule tables inside a pod netns

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use mnp_core::{Error, Result, TABLE_PREFIX};

use crate::{netns, nft};

/// Seam between the orchestrator and the in-kernel packet filter.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Atomically install `payload`, replacing any prior table with the same
    /// name. A failed commit leaves prior state untouched.
    async fn install(&self, netns_path: &Path, table: &str, payload: &str) -> Result<()>;

    /// Remove every owned table whose name starts with `prefix`. Zero matches
    /// is a successful no-op. Foreign tables are never touched.
    async fn remove_matching(&self, netns_path: &Path, prefix: &str) -> Result<()>;
}

/// Production applier driving the `nft` binary inside the target netns.
pub struct NftApplier {
    command_timeout: Duration,
}

impl NftApplier {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run_in<T, F>(&self, netns_path: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let fut = netns::within(netns_path.to_path_buf(), f);
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "nft command in {} exceeded {:?}",
                    netns_path.display(),
                    self.command_timeout
                ))
            })?
    }
}

impl Default for NftApplier {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl PacketFilter for NftApplier {
    async fn install(&self, netns_path: &Path, table: &str, payload: &str) -> Result<()> {
        if !table.starts_with(TABLE_PREFIX) {
            return Err(Error::PacketFilter(format!(
                "Refusing to install table {} outside the reserved prefix",
                table
            )));
        }
        let script = nft::replace_script(table, payload);
        self.run_in(netns_path, move || nft::run_script(&script).map(|_| ()))
            .await?;
        debug!("Installed table {} in {}", table, netns_path.display());
        Ok(())
    }

    async fn remove_matching(&self, netns_path: &Path, prefix: &str) -> Result<()> {
        if !prefix.starts_with(TABLE_PREFIX) {
            return Err(Error::PacketFilter(format!(
                "Refusing to remove tables outside the reserved prefix: {}",
                prefix
            )));
        }
        let prefix = prefix.to_string();
        let netns_display = netns_path.display().to_string();
        self.run_in(netns_path, move || {
            let owned: Vec<String> = nft::list_inet_tables()?
                .into_iter()
                .filter(|table| table.starts_with(&prefix))
                .collect();
            if owned.is_empty() {
                return Ok(());
            }
            tracing::debug!("Removing tables {:?} from {}", owned, netns_display);
            nft::run_script(&nft::delete_script(&owned)).map(|_| ())
        })
        .await
    }
}

/// Resolve a netns path against an optional host mount prefix.
pub fn host_path(prefix: Option<&Path>, netns_path: &Path) -> PathBuf {
    match prefix {
        Some(prefix) => {
            let relative = netns_path.strip_prefix("/").unwrap_or(netns_path);
            prefix.join(relative)
        }
        None => netns_path.to_path_buf(),
    }
}
