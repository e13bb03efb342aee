//! Pod netns discovery through the container runtime

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use mnp_core::types::Pod;
use mnp_core::{Error, Result};
use mnp_netns::host_path;

/// Resolves a pod to the path of its network namespace.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn netns_path(&self, pod: &Pod) -> Result<PathBuf>;
}

/// Resolver driving `crictl` against the configured CRI endpoint.
pub struct CrictlResolver {
    endpoint: String,
    host_prefix: Option<PathBuf>,
    timeout: Duration,
}

impl CrictlResolver {
    pub fn new(endpoint: String, host_prefix: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            endpoint,
            host_prefix,
            timeout,
        }
    }

    async fn crictl(&self, args: &[&str]) -> Result<String> {
        debug!("Executing crictl {:?}", args);
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("crictl")
                .arg("--runtime-endpoint")
                .arg(&self.endpoint)
                .args(args)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(format!("crictl {:?} exceeded {:?}", args, self.timeout)))?
        .map_err(|e| Error::Runtime(format!("Failed to execute crictl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!("crictl {:?} failed: {}", args, stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RuntimeResolver for CrictlResolver {
    async fn netns_path(&self, pod: &Pod) -> Result<PathBuf> {
        let listing = self
            .crictl(&[
                "pods",
                "--name",
                &pod.name,
                "--namespace",
                &pod.namespace,
                "--state",
                "ready",
                "-o",
                "json",
            ])
            .await?;
        let listing: serde_json::Value = serde_json::from_str(&listing)?;

        let sandbox_id = select_sandbox(&listing, &pod.uid).ok_or_else(|| {
            Error::Runtime(format!(
                "No ready sandbox for pod {}/{}",
                pod.namespace, pod.name
            ))
        })?;

        let inspected = self.crictl(&["inspectp", "-o", "json", &sandbox_id]).await?;
        let inspected: serde_json::Value = serde_json::from_str(&inspected)?;

        let netns = extract_netns_path(&inspected).ok_or_else(|| {
            Error::Runtime(format!(
                "Sandbox {} exposes no network namespace",
                sandbox_id
            ))
        })?;

        Ok(host_path(self.host_prefix.as_deref(), Path::new(&netns)))
    }
}

/// Pick the sandbox matching the pod UID, falling back to the first entry.
fn select_sandbox(listing: &serde_json::Value, uid: &str) -> Option<String> {
    let items = listing.get("items")?.as_array()?;
    let by_uid = items.iter().find(|item| {
        item.pointer("/metadata/uid").and_then(|v| v.as_str()) == Some(uid)
    });
    by_uid
        .or_else(|| items.first())?
        .get("id")?
        .as_str()
        .map(String::from)
}

/// Network namespace path from `crictl inspectp` output.
fn extract_netns_path(inspected: &serde_json::Value) -> Option<String> {
    let namespaces = inspected
        .pointer("/info/runtimeSpec/linux/namespaces")?
        .as_array()?;
    namespaces
        .iter()
        .find(|ns| ns.get("type").and_then(|t| t.as_str()) == Some("network"))?
        .get("path")?
        .as_str()
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_sandbox_by_uid() {
        let listing: serde_json::Value = serde_json::from_str(
            r#"{"items": [
                {"id": "sandbox-1", "metadata": {"uid": "uid-a"}},
                {"id": "sandbox-2", "metadata": {"uid": "uid-b"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(select_sandbox(&listing, "uid-b").as_deref(), Some("sandbox-2"));
        assert_eq!(select_sandbox(&listing, "uid-missing").as_deref(), Some("sandbox-1"));
        assert_eq!(select_sandbox(&serde_json::json!({"items": []}), "x"), None);
    }

    #[test]
    fn test_extract_netns_path() {
        let inspected: serde_json::Value = serde_json::from_str(
            r#"{"info": {"runtimeSpec": {"linux": {"namespaces": [
                {"type": "pid"},
                {"type": "network", "path": "/var/run/netns/cni-1234"}
            ]}}}}"#,
        )
        .unwrap();
        assert_eq!(
            extract_netns_path(&inspected).as_deref(),
            Some("/var/run/netns/cni-1234")
        );
        assert_eq!(extract_netns_path(&serde_json::json!({})), None);
    }
}
