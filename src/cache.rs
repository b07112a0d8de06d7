//! Durable tunnel records, one per identity
//!
//! A record ties a tunnel identity to the pid of its detached session process.
//! A missing record is the normal state of a tunnel that was never opened, so
//! reads never fail: unreadable or malformed files are reported as absent.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use tunnelkeep_model::{CacheRecord, TunnelIdentity, hash};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode tunnel record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Account and region a store fingerprints identities under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub account: String,
    pub region: String,
}

impl Scope {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Scope {
            account: account.into(),
            region: region.into(),
        }
    }

    pub fn key(&self, identity: &TunnelIdentity) -> String {
        hash(identity, &self.account, &self.region)
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// On-disk key of an identity (also names its log and lock files)
    fn key(&self, identity: &TunnelIdentity) -> String;

    async fn read(&self, identity: &TunnelIdentity) -> Option<CacheRecord>;

    async fn write(&self, identity: &TunnelIdentity, record: &CacheRecord) -> Result<(), CacheError>;

    /// Deleting a record that does not exist succeeds
    async fn delete(&self, identity: &TunnelIdentity) -> Result<(), CacheError>;

    /// All records belonging to this store's scope
    async fn list(&self) -> Result<Vec<CacheRecord>, CacheError>;
}

/// One pretty-printed JSON file per identity under a directory
pub struct DirCacheStore {
    dir: PathBuf,
    scope: Scope,
}

impl DirCacheStore {
    /// Opens the store, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>, scope: Scope) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(DirCacheStore { dir, scope })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    async fn read_path(path: &Path) -> Option<CacheRecord> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable tunnel record, ignoring");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed tunnel record, ignoring");
                None
            }
        }
    }
}

#[async_trait]
impl CacheStore for DirCacheStore {
    fn key(&self, identity: &TunnelIdentity) -> String {
        self.scope.key(identity)
    }

    async fn read(&self, identity: &TunnelIdentity) -> Option<CacheRecord> {
        Self::read_path(&self.record_path(&self.key(identity))).await
    }

    async fn write(&self, identity: &TunnelIdentity, record: &CacheRecord) -> Result<(), CacheError> {
        let path = self.record_path(&self.key(identity));
        let encoded = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, encoded)
            .await
            .map_err(|source| CacheError::Io { path: path.clone(), source })?;
        debug!(path = %path.display(), pid = record.process_id, "wrote tunnel record");
        Ok(())
    }

    async fn delete(&self, identity: &TunnelIdentity) -> Result<(), CacheError> {
        let path = self.record_path(&self.key(identity));
        remove_if_exists(&path)
            .await
            .map_err(|source| CacheError::Io { path, source })
    }

    async fn list(&self) -> Result<Vec<CacheRecord>, CacheError> {
        let io_err = |source: io::Error| CacheError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(record) = Self::read_path(&path).await else {
                continue;
            };
            // records written under another account or region share the directory
            if self.key(&record.tunnel) == stem {
                records.push(record);
            }
        }

        records.sort_by_key(|r| r.tunnel.from.port);
        Ok(records)
    }
}

/// In-process store for tests
#[cfg(test)]
pub struct MemoryCacheStore {
    scope: Scope,
    records: tokio::sync::RwLock<std::collections::HashMap<String, CacheRecord>>,
}

#[cfg(test)]
impl MemoryCacheStore {
    pub fn new(scope: Scope) -> Self {
        MemoryCacheStore {
            scope,
            records: Default::default(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn key(&self, identity: &TunnelIdentity) -> String {
        self.scope.key(identity)
    }

    async fn read(&self, identity: &TunnelIdentity) -> Option<CacheRecord> {
        self.records.read().await.get(&self.key(identity)).cloned()
    }

    async fn write(&self, identity: &TunnelIdentity, record: &CacheRecord) -> Result<(), CacheError> {
        let key = self.key(identity);
        self.records.write().await.insert(key, record.clone());
        Ok(())
    }

    async fn delete(&self, identity: &TunnelIdentity) -> Result<(), CacheError> {
        let key = self.key(identity);
        self.records.write().await.remove(&key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CacheRecord>, CacheError> {
        let mut records: Vec<CacheRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.tunnel.from.port);
        Ok(records)
    }
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
