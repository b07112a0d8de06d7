//! Process liveness and local port probes
//!
//! Negative answers ("not alive", "not healthy") are ordinary results, never
//! errors. Every answer is a point-in-time hint: re-check after acting on it.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

/// Tunnels always bind and are probed on loopback
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Whether a process with this pid exists, via a null signal.
///
/// Missing processes and processes we may not signal both count as not
/// alive. Zombies count as dead too.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = as_pid(pid) else {
        return false;
    };

    match kill(target, None::<Signal>) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => false,
        Err(e) => {
            warn!(pid, error = %e, "unexpected error probing process");
            false
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns whether the process
/// and its group are gone.
///
/// Tunnel processes lead their own process group, and the forwarding client
/// they fork lives in that group. The group is signalled even when its leader
/// has already died.
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    let Some(target) = as_pid(pid) else {
        return true;
    };
    if !is_alive(pid) && !group_exists(target) {
        return true;
    }

    info!(pid, "sending SIGTERM");
    match signal_tree(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return true,
        Err(e) => warn!(pid, error = %e, "failed to send SIGTERM"),
    }

    if wait_for_exit(pid, target, grace).await {
        info!(pid, "process stopped gracefully");
        return true;
    }

    warn!(pid, "process did not stop gracefully, killing");
    match signal_tree(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to send SIGKILL"),
    }

    let gone = wait_for_exit(pid, target, KILL_WAIT).await;
    if !gone {
        warn!(pid, "process did not die after SIGKILL");
    }
    gone
}

/// Whether something is already listening on `127.0.0.1:port`.
///
/// Only "address in use" means bound; any other bind failure is returned.
pub async fn is_bound(port: u16) -> io::Result<bool> {
    match TcpListener::bind(SocketAddr::from((LOOPBACK, port))).await {
        Ok(listener) => {
            drop(listener);
            Ok(false)
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(true),
        Err(e) => Err(e),
    }
}

/// Whether `127.0.0.1:port` completes a TCP handshake within `limit`.
///
/// A bound port alone does not prove the remote hop forwards anything, so
/// this is the authoritative health signal for a tunnel.
pub async fn is_healthy(port: u16, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect(SocketAddr::from((LOOPBACK, port)))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(port, error = %e, "health check connection failed");
            false
        }
        Err(_) => {
            debug!(port, timeout = ?limit, "health check timed out");
            false
        }
    }
}

fn signal_tree(target: Pid, signal: Signal) -> nix::Result<()> {
    match killpg(target, signal) {
        Ok(()) => Ok(()),
        // not a group leader
        Err(Errno::ESRCH) | Err(Errno::EPERM) => kill(target, signal),
        Err(e) => Err(e),
    }
}

async fn wait_for_exit(pid: u32, target: Pid, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !is_alive(pid) && !group_exists(target) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

// pid 0 and negative values address process groups
fn as_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|raw| *raw > 0).map(Pid::from_raw)
}

/// Whether a process group with this id still has a live member
#[cfg(target_os = "linux")]
fn group_exists(pgid: Pid) -> bool {
    if killpg(pgid, None::<Signal>).is_err() {
        return false;
    }
    // zombies keep the group id in use but no longer hold sockets
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries.flatten().any(|entry| {
        entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
            .and_then(proc_stat)
            .is_some_and(|(state, pgrp)| pgrp == pgid.as_raw() && state != "Z")
    })
}

#[cfg(not(target_os = "linux"))]
fn group_exists(pgid: Pid) -> bool {
    killpg(pgid, None::<Signal>).is_ok()
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    proc_stat(pid).is_some_and(|(state, _)| state == "Z")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// State and process group from `/proc/<pid>/stat`
#[cfg(target_os = "linux")]
fn proc_stat(pid: u32) -> Option<(String, i32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // fields after the parenthesised command name: state ppid pgrp ...
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.to_string();
    let pgrp = fields.nth(1)?.parse().ok()?;
    Some((state, pgrp))
}
