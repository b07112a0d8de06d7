use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::TunnelIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelStatus {
    Open,
    Closed,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Open => write!(f, "OPEN"),
            TunnelStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Observed state of a tunnel.
///
/// `process_id` is only ever set from a cache record whose process was alive
/// when checked; `Open` additionally means the local port accepted a TCP
/// connection at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub process_id: Option<u32>,
}

impl TunnelState {
    pub fn closed() -> Self {
        TunnelState {
            status: TunnelStatus::Closed,
            process_id: None,
        }
    }

    /// process is alive but the port did not answer
    pub fn unhealthy(pid: u32) -> Self {
        TunnelState {
            status: TunnelStatus::Closed,
            process_id: Some(pid),
        }
    }

    pub fn open(pid: u32) -> Self {
        TunnelState {
            status: TunnelStatus::Open,
            process_id: Some(pid),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TunnelStatus::Open
    }
}

/// Durable handle on a detached tunnel process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub process_id: u32,
    pub tunnel: TunnelIdentity,
}
