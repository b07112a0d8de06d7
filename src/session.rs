//! Session-manager client invocation

use tokio::process::Command;

/// Marker the SSM session plugin prints once the local listener is up
pub const SSM_READY_MARKER: &str = "Waiting for connections";

/// SSM document that forwards a local port to a host reachable from the target
pub const SSM_REMOTE_HOST_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// Where a session forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    /// instance id of the bastion
    pub instance_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Builds the port-forwarding client process for one tunnel mechanism.
///
/// Stdio and detachment are applied by the caller.
pub trait SessionLauncher: Send + Sync {
    fn command(&self, target: &SessionTarget) -> Command;

    /// Substring of the client's output that means "listening and forwarding"
    fn readiness_marker(&self) -> &str;
}

/// `aws ssm start-session` through the AWS CLI
#[derive(Debug, Clone)]
pub struct SsmSessionLauncher {
    aws_bin: String,
    region: Option<String>,
}

impl SsmSessionLauncher {
    pub fn new(aws_bin: impl Into<String>, region: Option<String>) -> Self {
        SsmSessionLauncher {
            aws_bin: aws_bin.into(),
            region,
        }
    }

    pub fn args(&self, target: &SessionTarget) -> Vec<String> {
        // every SSM document parameter is a list of strings
        let parameters = serde_json::json!({
            "host": [target.remote_host],
            "portNumber": [target.remote_port.to_string()],
            "localPortNumber": [target.local_port.to_string()],
        });

        let mut args = vec![
            "ssm".to_string(),
            "start-session".to_string(),
            "--target".to_string(),
            target.instance_id.clone(),
            "--document-name".to_string(),
            SSM_REMOTE_HOST_DOCUMENT.to_string(),
            "--parameters".to_string(),
            parameters.to_string(),
        ];
        if let Some(ref region) = self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        args
    }
}

impl SessionLauncher for SsmSessionLauncher {
    fn command(&self, target: &SessionTarget) -> Command {
        let mut cmd = Command::new(&self.aws_bin);
        cmd.args(self.args(target));
        cmd
    }

    fn readiness_marker(&self) -> &str {
        SSM_READY_MARKER
    }
}
