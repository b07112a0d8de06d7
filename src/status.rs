//! Read-only tunnel status resolution

use std::time::Duration;
use tracing::debug;

use crate::cache::CacheStore;
use crate::probe;
use tunnelkeep_model::{TunnelIdentity, TunnelState};

/// Derive the current state of a tunnel without changing anything.
///
/// | record | process alive | port healthy | result          |
/// |--------|---------------|--------------|-----------------|
/// | no     | -             | -            | CLOSED, no pid  |
/// | yes    | no            | -            | CLOSED, no pid  |
/// | yes    | yes           | no           | CLOSED, pid     |
/// | yes    | yes           | yes          | OPEN, pid       |
///
/// Stale records are left in place; cleanup belongs to the caller.
pub async fn resolve(store: &dyn CacheStore, identity: &TunnelIdentity, health_timeout: Duration) -> TunnelState {
    let Some(record) = store.read(identity).await else {
        return TunnelState::closed();
    };

    let pid = record.process_id;
    if !probe::is_alive(pid) {
        debug!(pid, "tunnel record points at a dead process");
        return TunnelState::closed();
    }

    if !probe::is_healthy(identity.local_port(), health_timeout).await {
        debug!(pid, port = identity.local_port(), "tunnel process alive but port unhealthy");
        return TunnelState::unhealthy(pid);
    }

    TunnelState::open(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCacheStore, Scope};
    use tokio::net::TcpListener;
    use tokio::process::Command;
    use tunnelkeep_model::{CacheRecord, TunnelStatus};

    const HEALTH: Duration = Duration::from_secs(2);

    async fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    async fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        pid
    }

    async fn store_with(identity: &TunnelIdentity, pid: u32) -> MemoryCacheStore {
        let store = MemoryCacheStore::new(Scope::new("123456789012", "us-east-1"));
        let record = CacheRecord {
            process_id: pid,
            tunnel: identity.clone(),
        };
        store.write(identity, &record).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_no_record_is_closed() {
        let store = MemoryCacheStore::new(Scope::new("123456789012", "us-east-1"));
        let identity = TunnelIdentity::new("b1", "db1", "localhost", free_port().await);

        let state = resolve(&store, &identity, HEALTH).await;
        assert_eq!(state, TunnelState::closed());
    }

    #[tokio::test]
    async fn test_dead_process_is_closed_without_pid() {
        let identity = TunnelIdentity::new("b1", "db1", "localhost", free_port().await);
        let store = store_with(&identity, dead_pid().await).await;

        let state = resolve(&store, &identity, HEALTH).await;
        assert_eq!(state, TunnelState::closed());

        // resolution does not clean up
        assert!(store.read(&identity).await.is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_port_is_closed_with_pid() {
        let identity = TunnelIdentity::new("b1", "db1", "localhost", free_port().await);
        let pid = std::process::id();
        let store = store_with(&identity, pid).await;

        let state = resolve(&store, &identity, HEALTH).await;
        assert_eq!(state.status, TunnelStatus::Closed);
        assert_eq!(state.process_id, Some(pid));
    }

    #[tokio::test]
    async fn test_alive_and_healthy_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let identity = TunnelIdentity::new("b1", "db1", "localhost", port);
        let pid = std::process::id();
        let store = store_with(&identity, pid).await;

        let state = resolve(&store, &identity, HEALTH).await;
        assert_eq!(state, TunnelState::open(pid));
    }
}
