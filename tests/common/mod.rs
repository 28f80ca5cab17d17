//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Sandbox with its own config dir so the host's settings never leak in.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn create() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create sandbox dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `ami-ci` with a scrubbed environment rooted in the sandbox.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_ami-ci"));
        cmd.env_remove("AMI_CI_CONFIG")
            .env_remove("AMI_CI_EVAL_COMMAND")
            .env_remove("GITHUB_OUTPUT")
            .env_remove("RUST_LOG")
            .env("AMI_CI_LOG", "warn")
            .env("HOME", self.path())
            .env("XDG_CONFIG_HOME", self.path().join("config"));
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().expect("run ami-ci")
    }

    pub fn run_with_stdin(&self, args: &[&str], stdin: &str) -> Output {
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn ami-ci");
        // The binary may exit before reading stdin; a broken pipe is fine.
        let _ = child
            .stdin
            .take()
            .expect("stdin piped")
            .write_all(stdin.as_bytes());
        child.wait_with_output().expect("wait for ami-ci")
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&path, contents).expect("write sandbox file");
        path
    }
}

/// One `nix-eval-jobs` output line.
pub fn job_line(name: &str, system: &str, builds: &[&str], features: &[&str]) -> String {
    let value = json!({
        "attr": format!("{system}.{name}"),
        "attrPath": [system, name],
        "drvPath": drv(name),
        "name": name,
        "system": system,
        "cacheStatus": "notBuilt",
        "neededBuilds": builds.iter().copied().map(drv).collect::<Vec<_>>(),
        "neededSubstitutes": [],
        "requiredSystemFeatures": features,
    });
    value.to_string()
}

pub fn drv(name: &str) -> String {
    format!("/nix/store/{name}.drv")
}

pub fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "ami-ci failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("parse stdout JSON")
}

pub fn matrix_names(matrix: &Value) -> Vec<String> {
    matrix["include"]
        .as_array()
        .expect("include array")
        .iter()
        .map(|entry| entry["name"].as_str().expect("name").to_string())
        .collect()
}
