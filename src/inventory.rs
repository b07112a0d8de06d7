//! Static bastion and cluster inventory
//!
//! A JSON file standing in for AWS lookups, for offline use and tests:
//!
//! ```json
//! {
//!   "bastions": { "i-0abc": { "status": "running", "privateIp": "10.0.1.12" } },
//!   "clusters": { "db1": { "writerEndpoint": "db1.internal", "port": 5432 } }
//! }
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use crate::aws::{AwsError, Bastion, BastionResolver, Cluster, ClusterResolver, InstanceStatus};
use tunnelkeep_model::{BastionRef, ClusterRef};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryFile {
    #[serde(default)]
    bastions: HashMap<String, BastionEntry>,
    #[serde(default)]
    clusters: HashMap<String, Cluster>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BastionEntry {
    status: InstanceStatus,
    private_ip: Option<String>,
}

pub struct StaticInventory {
    bastions: RwLock<HashMap<String, Bastion>>,
    clusters: HashMap<String, Cluster>,
}

impl StaticInventory {
    pub fn new(bastions: impl IntoIterator<Item = Bastion>, clusters: HashMap<String, Cluster>) -> Self {
        StaticInventory {
            bastions: RwLock::new(bastions.into_iter().map(|b| (b.id.clone(), b)).collect()),
            clusters,
        }
    }

    pub fn load(path: &Path) -> Result<Self, AwsError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AwsError::Inventory(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
            .map_err(|e| AwsError::Inventory(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        let file: InventoryFile = serde_json::from_str(contents)?;
        let bastions = file.bastions.into_iter().map(|(id, entry)| Bastion {
            id,
            status: entry.status,
            private_ip: entry.private_ip,
        });
        Ok(Self::new(bastions, file.clusters))
    }
}

#[async_trait]
impl BastionResolver for StaticInventory {
    async fn get(&self, bastion: &BastionRef) -> Result<Option<Bastion>, AwsError> {
        Ok(self.bastions.read().await.get(&bastion.exid).cloned())
    }

    async fn start(&self, bastion: &BastionRef) -> Result<(), AwsError> {
        let mut bastions = self.bastions.write().await;
        let entry = bastions
            .get_mut(&bastion.exid)
            .ok_or_else(|| AwsError::Inventory(format!("bastion '{}' not in inventory", bastion.exid)))?;
        info!(bastion = %bastion.exid, "marking inventory bastion as running");
        entry.status = InstanceStatus::Running;
        Ok(())
    }
}

#[async_trait]
impl ClusterResolver for StaticInventory {
    async fn get(&self, cluster: &ClusterRef) -> Result<Option<Cluster>, AwsError> {
        Ok(self.clusters.get(&cluster.name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"{
        "bastions": {
            "i-0abc": { "status": "stopped", "privateIp": "10.0.1.12" }
        },
        "clusters": {
            "db1": { "writerEndpoint": "db1.internal", "readerEndpoint": "db1-ro.internal", "port": 5432, "status": "available" },
            "db2": { }
        }
    }"#;

    #[tokio::test]
    async fn test_lookup_and_start() {
        let inventory = StaticInventory::parse(INVENTORY).unwrap();
        let bastion = BastionRef {
            exid: "i-0abc".to_string(),
        };

        let found = BastionResolver::get(&inventory, &bastion).await.unwrap().unwrap();
        assert_eq!(found.status, InstanceStatus::Stopped);
        assert_eq!(found.private_ip.as_deref(), Some("10.0.1.12"));

        inventory.start(&bastion).await.unwrap();
        let found = BastionResolver::get(&inventory, &bastion).await.unwrap().unwrap();
        assert!(found.status.is_running());
    }

    #[tokio::test]
    async fn test_missing_entries() {
        let inventory = StaticInventory::parse(INVENTORY).unwrap();

        let bastion = BastionRef {
            exid: "i-missing".to_string(),
        };
        assert!(BastionResolver::get(&inventory, &bastion).await.unwrap().is_none());
        assert!(inventory.start(&bastion).await.is_err());

        let cluster = ClusterRef {
            name: "nope".to_string(),
        };
        assert!(ClusterResolver::get(&inventory, &cluster).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cluster_without_endpoint() {
        let inventory = StaticInventory::parse(INVENTORY).unwrap();
        let cluster = ClusterRef {
            name: "db2".to_string(),
        };

        let found = ClusterResolver::get(&inventory, &cluster).await.unwrap().unwrap();
        assert!(found.writer_endpoint.is_none());
        assert!(found.port.is_none());
    }
}
