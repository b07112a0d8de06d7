//! Open/close round trips against a fake `aws` executable

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Behaves like `aws ssm start-session` with the remote-host forwarding document
const FAKE_AWS: &str = r#"#!/usr/bin/env python3
import json, socket, sys
args = sys.argv[1:]
if args[:2] != ["ssm", "start-session"]:
    sys.exit("unexpected arguments: %r" % args)
params = json.loads(args[args.index("--parameters") + 1])
port = int(params["localPortNumber"][0])
s = socket.socket()
s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
s.bind(("127.0.0.1", port))
s.listen(16)
print("Starting session with SessionId: fake-0123", flush=True)
print("Port %d opened for sessionId fake-0123." % port, flush=True)
print("Waiting for connections...", flush=True)
while True:
    c, _ = s.accept()
    c.close()
"#;

const FAILING_AWS: &str = r#"#!/bin/sh
echo "An error occurred (TargetNotConnected) when calling the StartSession operation" >&2
exit 254
"#;

#[allow(deprecated)]
fn tk_cmd() -> Command {
    Command::cargo_bin("tk").unwrap()
}

struct Sandbox {
    dir: TempDir,
    aws_bin: PathBuf,
    inventory: PathBuf,
}

impl Sandbox {
    fn new(aws_script: &str) -> Self {
        let dir = TempDir::new().unwrap();

        let aws_bin = dir.path().join("aws");
        fs::write(&aws_bin, aws_script).unwrap();
        fs::set_permissions(&aws_bin, fs::Permissions::from_mode(0o755)).unwrap();

        let inventory = dir.path().join("inventory.json");
        fs::write(
            &inventory,
            r#"{
  "bastions": { "i-0abc": { "status": "running" } },
  "clusters": { "db1": { "writerEndpoint": "db1.internal", "port": 5432 } }
}"#,
        )
        .unwrap();

        Sandbox { dir, aws_bin, inventory }
    }

    fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    fn cmd(&self) -> Command {
        let mut cmd = tk_cmd();
        cmd.current_dir(self.dir.path())
            .env("TUNNELKEEP_AWS_BIN", &self.aws_bin)
            .env("TUNNELKEEP_READY_TIMEOUT", "20s")
            .env("TUNNELKEEP_SHUTDOWN_GRACE", "2s")
            .arg("--cache-dir")
            .arg(self.cache_dir())
            .args(["--account", "123456789012", "--region", "us-east-1"])
            .arg("--inventory")
            .arg(&self.inventory);
        cmd
    }

    fn tunnel(&self, subcommand: &str, port: u16) -> Command {
        let mut cmd = self.cmd();
        cmd.args(["--format", "json", subcommand])
            .args(["--bastion", "i-0abc", "--cluster", "db1", "--port"])
            .arg(port.to_string());
        cmd
    }

    fn run_json(&self, subcommand: &str, port: u16) -> serde_json::Value {
        let output = self.tunnel(subcommand, port).output().unwrap();
        assert!(
            output.status.success(),
            "tk {} failed: {}",
            subcommand,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    fn files_with_extension(&self, ext: &str) -> Vec<PathBuf> {
        files_with_extension(&self.cache_dir(), ext)
    }
}

/// Kills a leftover tunnel process if a test bails out early
struct ProcessGuard(Option<i32>);

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == ext))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn find_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn accepts_connections(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).is_ok()
}

#[test]
fn test_open_status_close_round_trip() {
    let sandbox = Sandbox::new(FAKE_AWS);
    let port = find_free_port();

    let opened = sandbox.run_json("open", port);
    let pid = opened["processId"].as_i64().expect("open tunnel reports a pid");
    let _guard = ProcessGuard(Some(pid as i32));

    assert_eq!(opened["status"], "OPEN");
    assert!(accepts_connections(port));
    assert_eq!(sandbox.files_with_extension("json").len(), 1);

    let log = &sandbox.files_with_extension("log")[0];
    let contents = fs::read_to_string(log).unwrap();
    assert!(contents.contains("Waiting for connections"));

    // the process outlives the invocation that opened it
    let status = sandbox.run_json("status", port);
    assert_eq!(status["status"], "OPEN");
    assert_eq!(status["processId"], opened["processId"]);

    // a healthy tunnel is reused, not respawned
    let reopened = sandbox.run_json("open", port);
    assert_eq!(reopened["processId"], opened["processId"]);

    sandbox
        .cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("OPEN"))
        .stdout(predicate::str::contains("db1"));

    let closed = sandbox.run_json("close", port);
    assert_eq!(closed["status"], "CLOSED");
    assert!(closed["processId"].is_null());

    assert!(!accepts_connections(port));
    assert!(sandbox.files_with_extension("json").is_empty());
    assert!(sandbox.files_with_extension("log").is_empty());
}

#[test]
fn test_failed_session_leaves_no_record() {
    let sandbox = Sandbox::new(FAILING_AWS);
    let port = find_free_port();

    sandbox
        .tunnel("open", port)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("exited during startup"));

    assert!(sandbox.files_with_extension("json").is_empty());

    // the session log stays behind for diagnosis
    let log = &sandbox.files_with_extension("log")[0];
    let contents = fs::read_to_string(log).unwrap();
    assert!(contents.contains("TargetNotConnected"));
}
