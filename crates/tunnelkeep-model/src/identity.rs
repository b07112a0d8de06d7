use serde::{Deserialize, Serialize};
use std::fmt;

/// How traffic reaches the private network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelMechanism {
    /// AWS Systems Manager port-forwarding session through a bastion instance
    #[serde(rename = "aws.ssm")]
    AwsSsm,
}

/// Reference to a bastion compute instance by its external id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BastionRef {
    pub exid: String,
}

/// Reference to a database cluster by its unique name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelVia {
    pub mechanism: TunnelMechanism,
    pub bastion: BastionRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelInto {
    pub cluster: ClusterRef,
}

/// Local binding of the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelFrom {
    pub host: String,
    pub port: u16,
}

/// The immutable intent of a tunnel: via which bastion, into which cluster,
/// from which local binding. Independent of any running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelIdentity {
    pub via: TunnelVia,
    pub into: TunnelInto,
    pub from: TunnelFrom,
}

impl TunnelIdentity {
    pub fn new(
        bastion_exid: impl Into<String>,
        cluster_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        TunnelIdentity {
            via: TunnelVia {
                mechanism: TunnelMechanism::AwsSsm,
                bastion: BastionRef {
                    exid: bastion_exid.into(),
                },
            },
            into: TunnelInto {
                cluster: ClusterRef {
                    name: cluster_name.into(),
                },
            },
            from: TunnelFrom {
                host: host.into(),
                port,
            },
        }
    }

    pub fn local_port(&self) -> u16 {
        self.from.port
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {} via {}",
            self.from.host, self.from.port, self.into.cluster.name, self.via.bastion.exid
        )
    }
}
