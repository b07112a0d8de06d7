//! Bastion and cluster lookups
//!
//! The tunnel manager only needs two answers from AWS: where a bastion is and
//! whether it runs, and where a cluster's writer listens. These are behind
//! traits; the production implementation shells out to the AWS CLI the same
//! way the session itself does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use tunnelkeep_model::{BastionRef, ClusterRef};

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("failed to run '{bin}': {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("unexpected output from '{command}': {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("inventory error: {0}")]
    Inventory(String),
}

/// EC2 instance lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    pub fn is_running(&self) -> bool {
        *self == InstanceStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bastion {
    /// instance id the session targets
    pub id: String,
    pub status: InstanceStatus,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub writer_endpoint: Option<String>,
    pub reader_endpoint: Option<String>,
    pub port: Option<u16>,
    pub status: Option<String>,
}

#[async_trait]
pub trait BastionResolver: Send + Sync {
    async fn get(&self, bastion: &BastionRef) -> Result<Option<Bastion>, AwsError>;

    /// Start the instance and return once it is running
    async fn start(&self, bastion: &BastionRef) -> Result<(), AwsError>;
}

#[async_trait]
pub trait ClusterResolver: Send + Sync {
    async fn get(&self, cluster: &ClusterRef) -> Result<Option<Cluster>, AwsError>;
}

/// Lookups through the `aws` command line client
#[derive(Debug, Clone)]
pub struct AwsCli {
    bin: String,
    region: Option<String>,
}

enum CliOutcome {
    Ok(Vec<u8>),
    Failed(String),
}

impl AwsCli {
    pub fn new(bin: impl Into<String>, region: Option<String>) -> Self {
        AwsCli { bin: bin.into(), region }
    }

    async fn run(&self, args: &[&str]) -> Result<CliOutcome, AwsError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(ref region) = self.region {
            cmd.arg("--region").arg(region);
        }
        cmd.arg("--output").arg("json");

        debug!(bin = %self.bin, args = ?args, "running aws cli");

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| AwsError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(CliOutcome::Ok(output.stdout))
        } else {
            Ok(CliOutcome::Failed(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    async fn run_ok(&self, args: &[&str]) -> Result<Vec<u8>, AwsError> {
        match self.run(args).await? {
            CliOutcome::Ok(stdout) => Ok(stdout),
            CliOutcome::Failed(stderr) => Err(AwsError::Command {
                command: describe(args),
                stderr,
            }),
        }
    }

    /// Account of the active credentials
    pub async fn caller_account(&self) -> Result<String, AwsError> {
        let args = ["sts", "get-caller-identity"];
        let stdout = self.run_ok(&args).await?;
        let identity: CallerIdentity = parse(&args, &stdout)?;
        Ok(identity.account)
    }

    /// Region the CLI would use when none is given
    pub async fn default_region(&self) -> Option<String> {
        let output = Command::new(&self.bin)
            .args(["configure", "get", "region"])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        let region = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !region.is_empty()).then_some(region)
    }
}

#[async_trait]
impl BastionResolver for AwsCli {
    async fn get(&self, bastion: &BastionRef) -> Result<Option<Bastion>, AwsError> {
        let args = ["ec2", "describe-instances", "--instance-ids", bastion.exid.as_str()];
        let stdout = match self.run(&args).await? {
            CliOutcome::Ok(stdout) => stdout,
            CliOutcome::Failed(stderr) if stderr.contains("InvalidInstanceID") => return Ok(None),
            CliOutcome::Failed(stderr) => {
                return Err(AwsError::Command {
                    command: describe(&args),
                    stderr,
                });
            }
        };

        let described: DescribeInstances = parse(&args, &stdout)?;
        let instance = described
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .find(|i| i.instance_id == bastion.exid);

        Ok(instance.map(|i| Bastion {
            id: i.instance_id,
            status: i.state.name,
            private_ip: i.private_ip_address,
        }))
    }

    async fn start(&self, bastion: &BastionRef) -> Result<(), AwsError> {
        info!(bastion = %bastion.exid, "starting bastion instance");
        self.run_ok(&["ec2", "start-instances", "--instance-ids", bastion.exid.as_str()])
            .await?;
        self.run_ok(&["ec2", "wait", "instance-running", "--instance-ids", bastion.exid.as_str()])
            .await?;
        info!(bastion = %bastion.exid, "bastion instance running");
        Ok(())
    }
}

#[async_trait]
impl ClusterResolver for AwsCli {
    async fn get(&self, cluster: &ClusterRef) -> Result<Option<Cluster>, AwsError> {
        let args = ["rds", "describe-db-clusters", "--db-cluster-identifier", cluster.name.as_str()];
        let stdout = match self.run(&args).await? {
            CliOutcome::Ok(stdout) => stdout,
            CliOutcome::Failed(stderr) if stderr.contains("DBClusterNotFoundFault") => return Ok(None),
            CliOutcome::Failed(stderr) => {
                return Err(AwsError::Command {
                    command: describe(&args),
                    stderr,
                });
            }
        };

        let described: DescribeDbClusters = parse(&args, &stdout)?;
        Ok(described.db_clusters.into_iter().next().map(|c| Cluster {
            writer_endpoint: c.endpoint,
            reader_endpoint: c.reader_endpoint,
            port: c.port,
            status: c.status,
        }))
    }
}

fn describe(args: &[&str]) -> String {
    format!("aws {}", args.join(" "))
}

fn parse<T: serde::de::DeserializeOwned>(args: &[&str], stdout: &[u8]) -> Result<T, AwsError> {
    serde_json::from_slice(stdout).map_err(|source| AwsError::Parse {
        command: describe(args),
        source,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceState,
    private_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: InstanceStatus,
}

#[derive(Debug, Deserialize)]
struct DescribeDbClusters {
    #[serde(rename = "DBClusters", default)]
    db_clusters: Vec<DbCluster>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DbCluster {
    endpoint: Option<String>,
    reader_endpoint: Option<String>,
    port: Option<u16>,
    status: Option<String>,
}
