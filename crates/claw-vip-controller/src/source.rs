//! A `ClusterApi` backed by a single JSON snapshot file, for running this
//! controller against a cluster state produced by an external sync agent
//! rather than a live Kubernetes client. Lists once at startup; its
//! `watch()` never yields, so a deployment using it relies on a process
//! supervisor to restart the controller when the snapshot changes.

use std::path::Path;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::ClusterApiError;
use crate::informer::{ClusterApi, ConfigMap, NodeRecord, WatchEvent};
use crate::types::{Endpoints, Service};

#[derive(Debug, Deserialize)]
struct ClusterSnapshot {
    #[serde(default)]
    services: Vec<Service>,
    #[serde(default)]
    endpoints: Vec<Endpoints>,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    config_maps: Vec<ConfigMap>,
}

/// Reads cluster state once from a JSON file at construction time.
pub struct FileClusterApi {
    snapshot: ClusterSnapshot,
}

impl FileClusterApi {
    /// Loads and parses the snapshot at `path`.
    ///
    /// # Errors
    ///
    /// Returns `ClusterApiError::InitialListFailed` if the file cannot be
    /// read or does not parse as a `ClusterSnapshot`.
    pub fn load(path: &Path) -> Result<Self, ClusterApiError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ClusterApiError::InitialListFailed {
            resource: "ClusterSnapshot",
            reason: format!("reading {}: {e}", path.display()),
        })?;
        let snapshot: ClusterSnapshot =
            serde_json::from_str(&contents).map_err(|e| ClusterApiError::InitialListFailed {
                resource: "ClusterSnapshot",
                reason: format!("parsing {}: {e}", path.display()),
            })?;
        Ok(Self { snapshot })
    }
}

impl ClusterApi for FileClusterApi {
    async fn list_services(&self) -> Result<Vec<Service>, ClusterApiError> {
        Ok(self.snapshot.services.clone())
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoints>, ClusterApiError> {
        Ok(self.snapshot.endpoints.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ClusterApiError> {
        Ok(self.snapshot.nodes.clone())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterApiError> {
        self.snapshot
            .config_maps
            .iter()
            .find(|cm| cm.namespace == namespace && cm.name == name)
            .cloned()
            .ok_or_else(|| ClusterApiError::ConfigMapNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn watch(&self) -> mpsc::Receiver<WatchEvent> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}
