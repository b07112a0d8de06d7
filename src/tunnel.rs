//! Tunnel lifecycle management
//!
//! Drives a tunnel identity toward OPEN or CLOSED. An open tunnel is a
//! detached session-manager process in its own session; it outlives this
//! process and is tracked only through its cache record and liveness probes.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::aws::{AwsError, BastionResolver, ClusterResolver};
use crate::cache::{CacheError, CacheStore, remove_if_exists};
use crate::config::Timeouts;
use crate::lock::{self, LockError};
use crate::probe;
use crate::readiness::{self, ReadinessError};
use crate::session::{SessionLauncher, SessionTarget};
use crate::status;
use tunnelkeep_model::{CacheRecord, TunnelIdentity, TunnelState, TunnelStatus};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("bastion '{0}' not found")]
    BastionNotFound(String),
    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),
    #[error("cluster '{0}' does not expose a writer endpoint and port")]
    ClusterEndpointMissing(String),
    #[error("local port {0} is in use by a process with no tunnel record")]
    PortInUse(u16),
    #[error("tunnel process exited before reporting a process id")]
    NoProcessId,
    #[error("tunnel did not become ready within {0:?}")]
    ReadinessTimeout(Duration),
    #[error("tunnel process exited during startup ({0}), see {1}")]
    ExitedDuringStartup(String, String),
    #[error("tunnel on port {0} reported ready but does not accept connections")]
    Unhealthy(u16),
    #[error("timed out after {0:?} waiting for another open of this tunnel")]
    LockTimeout(Duration),
    #[error("aws error: {0}")]
    Aws(#[from] AwsError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad class of a tunnel failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// the request cannot be satisfied as asked; retrying will not help
    BadRequest,
    /// the tunnel did not reach the state it should have
    UnexpectedState,
    Collaborator,
    Io,
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::BastionNotFound(_)
            | TunnelError::ClusterNotFound(_)
            | TunnelError::ClusterEndpointMissing(_)
            | TunnelError::PortInUse(_) => ErrorKind::BadRequest,
            TunnelError::NoProcessId
            | TunnelError::ReadinessTimeout(_)
            | TunnelError::ExitedDuringStartup(..)
            | TunnelError::Unhealthy(_)
            | TunnelError::LockTimeout(_) => ErrorKind::UnexpectedState,
            TunnelError::Aws(_) => ErrorKind::Collaborator,
            TunnelError::Cache(_) | TunnelError::Io(_) => ErrorKind::Io,
        }
    }
}

/// A cache record together with what it currently resolves to
#[derive(Debug, Clone)]
pub struct TrackedTunnel {
    pub key: String,
    pub tunnel: TunnelIdentity,
    pub state: TunnelState,
}

pub struct TunnelManager {
    store: Arc<dyn CacheStore>,
    bastions: Arc<dyn BastionResolver>,
    clusters: Arc<dyn ClusterResolver>,
    launcher: Arc<dyn SessionLauncher>,
    /// session logs and lock files live here
    work_dir: PathBuf,
    timeouts: Timeouts,
}

impl TunnelManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        bastions: Arc<dyn BastionResolver>,
        clusters: Arc<dyn ClusterResolver>,
        launcher: Arc<dyn SessionLauncher>,
        work_dir: impl Into<PathBuf>,
        timeouts: Timeouts,
    ) -> Self {
        TunnelManager {
            store,
            bastions,
            clusters,
            launcher,
            work_dir: work_dir.into(),
            timeouts,
        }
    }

    /// Drive a tunnel to the desired status and return where it ended up
    pub async fn reconcile(&self, identity: &TunnelIdentity, desired: TunnelStatus) -> Result<TunnelState, TunnelError> {
        match desired {
            TunnelStatus::Open => self.open(identity).await,
            TunnelStatus::Closed => self.close(identity).await,
        }
    }

    pub async fn status(&self, identity: &TunnelIdentity) -> TunnelState {
        status::resolve(self.store.as_ref(), identity, self.timeouts.health).await
    }

    pub fn key(&self, identity: &TunnelIdentity) -> String {
        self.store.key(identity)
    }

    pub fn log_path(&self, identity: &TunnelIdentity) -> PathBuf {
        self.work_dir.join(format!("{}.log", self.key(identity)))
    }

    fn lock_path(&self, identity: &TunnelIdentity) -> PathBuf {
        self.work_dir.join(format!("{}.lock", self.key(identity)))
    }

    /// Every tracked tunnel with its current state
    pub async fn list(&self) -> Result<Vec<TrackedTunnel>, TunnelError> {
        let mut tracked = Vec::new();
        for record in self.store.list().await? {
            let state = self.status(&record.tunnel).await;
            tracked.push(TrackedTunnel {
                key: self.key(&record.tunnel),
                tunnel: record.tunnel,
                state,
            });
        }
        Ok(tracked)
    }

    /// Forget tunnels whose process has died; returns the pruned identities
    pub async fn prune(&self) -> Result<Vec<TunnelIdentity>, TunnelError> {
        let mut pruned = Vec::new();
        for record in self.store.list().await? {
            if probe::is_alive(record.process_id) {
                continue;
            }
            info!(tunnel = %record.tunnel, pid = record.process_id, "pruning dead tunnel record");
            if !probe::terminate(record.process_id, self.timeouts.shutdown_grace).await {
                warn!(tunnel = %record.tunnel, pid = record.process_id, "tunnel process group may still be running");
            }
            self.store.delete(&record.tunnel).await?;
            remove_if_exists(&self.log_path(&record.tunnel)).await?;
            pruned.push(record.tunnel);
        }
        Ok(pruned)
    }

    async fn close(&self, identity: &TunnelIdentity) -> Result<TunnelState, TunnelError> {
        let key = self.key(identity);

        if let Some(record) = self.store.read(identity).await {
            let pid = record.process_id;
            info!(tunnel = %key, pid, "stopping tunnel process");
            if !probe::terminate(pid, self.timeouts.shutdown_grace).await {
                warn!(tunnel = %key, pid, "tunnel process may still be running");
            }
        }

        self.store.delete(identity).await?;
        remove_if_exists(&self.log_path(identity)).await?;

        info!(tunnel = %key, "tunnel closed");
        Ok(TunnelState::closed())
    }

    async fn open(&self, identity: &TunnelIdentity) -> Result<TunnelState, TunnelError> {
        let key = self.key(identity);
        let port = identity.local_port();
        let bastion_ref = &identity.via.bastion;
        let cluster_ref = &identity.into.cluster;

        let bastion = self
            .bastions
            .get(bastion_ref)
            .await?
            .ok_or_else(|| TunnelError::BastionNotFound(bastion_ref.exid.clone()))?;

        let cluster = self
            .clusters
            .get(cluster_ref)
            .await?
            .ok_or_else(|| TunnelError::ClusterNotFound(cluster_ref.name.clone()))?;
        let (Some(remote_host), Some(remote_port)) = (cluster.writer_endpoint, cluster.port) else {
            return Err(TunnelError::ClusterEndpointMissing(cluster_ref.name.clone()));
        };

        let _lock = match lock::acquire(&self.lock_path(identity), self.timeouts.lock).await {
            Ok(lock) => lock,
            Err(LockError::TimedOut) => return Err(TunnelError::LockTimeout(self.timeouts.lock)),
            Err(LockError::Io(e)) => return Err(e.into()),
        };

        if probe::is_bound(port).await? {
            let Some(record) = self.store.read(identity).await else {
                warn!(tunnel = %key, port, "port bound by an untracked process, refusing to open");
                return Err(TunnelError::PortInUse(port));
            };

            if probe::is_alive(record.process_id) && probe::is_healthy(port, self.timeouts.health).await {
                info!(tunnel = %key, pid = record.process_id, "tunnel already open");
                return Ok(TunnelState::open(record.process_id));
            }

            warn!(tunnel = %key, pid = record.process_id, "replacing stale tunnel");
            self.discard(identity, record.process_id).await?;

            if probe::is_bound(port).await? {
                warn!(tunnel = %key, port, "port still bound after stopping the recorded process");
                return Err(TunnelError::PortInUse(port));
            }
        } else if let Some(record) = self.store.read(identity).await {
            info!(tunnel = %key, pid = record.process_id, "clearing stale tunnel record");
            self.discard(identity, record.process_id).await?;
        }

        if !bastion.status.is_running() {
            info!(tunnel = %key, bastion = %bastion.id, status = ?bastion.status, "bastion not running, starting it");
            self.bastions.start(bastion_ref).await?;
        }

        let target = SessionTarget {
            instance_id: bastion.id,
            remote_host,
            remote_port,
            local_port: port,
        };
        let log_path = self.log_path(identity);
        let (mut child, log_offset) = self.spawn_session(&target, &log_path)?;

        let Some(pid) = child.id() else {
            error!(tunnel = %key, "tunnel process has no pid");
            return Err(TunnelError::NoProcessId);
        };

        // recorded before readiness so a crash of this process mid-startup
        // still leaves a handle on the tunnel process
        let record = CacheRecord {
            process_id: pid,
            tunnel: identity.clone(),
        };
        if let Err(e) = self.store.write(identity, &record).await {
            error!(tunnel = %key, pid, error = %e, "failed to record tunnel process, stopping it");
            self.abandon(identity, pid).await;
            return Err(e.into());
        }

        info!(
            tunnel = %key,
            pid,
            local_port = port,
            remote = %format!("{}:{}", target.remote_host, target.remote_port),
            "tunnel process started, waiting for readiness"
        );

        if let Err(e) = self.await_ready(&mut child, &log_path, log_offset).await {
            self.abandon(identity, pid).await;
            return Err(match e {
                ReadinessError::Timeout(limit) => TunnelError::ReadinessTimeout(limit),
                ReadinessError::Exited(status) => {
                    TunnelError::ExitedDuringStartup(status.to_string(), log_path.display().to_string())
                }
                ReadinessError::Io(e) => TunnelError::Io(e),
            });
        }

        if !probe::is_healthy(port, self.timeouts.health).await {
            error!(tunnel = %key, pid, port, "tunnel reported ready but is not healthy");
            self.abandon(identity, pid).await;
            return Err(TunnelError::Unhealthy(port));
        }

        info!(tunnel = %key, pid, port, "tunnel open");

        // dropping the handle neither kills nor waits for the process
        drop(child);
        Ok(TunnelState::open(pid))
    }

    /// Spawn the session client detached, appending its output to the log.
    /// Returns the child and the log offset its output starts at.
    fn spawn_session(&self, target: &SessionTarget, log_path: &Path) -> Result<(Child, u64), TunnelError> {
        let mut log = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
        writeln!(
            log,
            "[{}] opening tunnel 127.0.0.1:{} -> {}:{} via {}",
            humantime::format_rfc3339_seconds(SystemTime::now()),
            target.local_port,
            target.remote_host,
            target.remote_port,
            target.instance_id
        )?;
        let offset = log.metadata()?.len();
        let stderr = log.try_clone()?;

        let mut cmd = self.launcher.command(target);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        detach(&mut cmd);

        Ok((cmd.spawn()?, offset))
    }

    async fn await_ready(&self, child: &mut Child, log_path: &Path, offset: u64) -> Result<(), ReadinessError> {
        let mut log = tokio::fs::File::open(log_path).await?;
        log.seek(std::io::SeekFrom::Start(offset)).await?;

        readiness::await_readiness_marker(
            BufReader::new(log),
            self.launcher.readiness_marker(),
            self.timeouts.ready,
            || child.try_wait().ok().flatten(),
        )
        .await
    }

    /// Stop a recorded process and its group, then forget it
    async fn discard(&self, identity: &TunnelIdentity, pid: u32) -> Result<(), TunnelError> {
        if !probe::terminate(pid, self.timeouts.shutdown_grace).await {
            warn!(pid, "stale tunnel process may still be running");
        }
        self.store.delete(identity).await?;
        Ok(())
    }

    /// Best-effort cleanup after a failed open; never leaves a record behind
    /// pointing at a tunnel known to be bad
    async fn abandon(&self, identity: &TunnelIdentity, pid: u32) {
        if let Err(e) = self.discard(identity, pid).await {
            warn!(pid, error = %e, "failed to clean up after failed open");
        }
    }
}

/// Put the child in its own session so it survives this process and its
/// terminal
fn detach(cmd: &mut Command) {
    // SAFETY: setsid is async-signal-safe and touches no parent state
    unsafe {
        cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
    }
}
