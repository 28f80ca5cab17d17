//! Ingestion of `nix-eval-jobs` output.
//!
//! Jobs come either from a saved JSON-lines file or from a live evaluator
//! run. Evaluation failures are collected and reported together.
use crate::job::Job;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

const EVAL_JOBS_BIN: &str = "nix-eval-jobs";

/// Environment override for the full evaluator command line.
pub const EVAL_COMMAND_ENV: &str = "AMI_CI_EVAL_COMMAND";

/// Evaluator invocation settings for a live run.
pub struct EvalRequest<'a> {
    pub flake: &'a str,
    pub workers: usize,
    pub command: Option<&'a str>,
}

/// Result of ingesting evaluator output.
#[derive(Debug, Default)]
pub struct EvalOutput {
    pub jobs: Vec<Job>,
    pub duplicates: usize,
}

/// Parse evaluator JSON lines from any reader.
pub fn read_jobs<R: Read>(reader: R) -> Result<EvalOutput> {
    let mut output = EvalOutput::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut failures = Vec::new();

    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("read evaluator line {line_no}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed)
            .with_context(|| format!("parse evaluator line {line_no} as JSON"))?;
        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            let attr = value
                .get("attr")
                .and_then(Value::as_str)
                .unwrap_or("<unknown attr>");
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            failures.push(format!("{attr}: {}", message.trim()));
            continue;
        }
        let job: Job = serde_json::from_value(value)
            .with_context(|| format!("decode job on evaluator line {line_no}"))?;
        if !seen.insert(job.id.clone()) {
            tracing::debug!(drv = %job.id, attr = %job.attr, "duplicate derivation dropped");
            output.duplicates += 1;
            continue;
        }
        output.jobs.push(job);
    }

    if !failures.is_empty() {
        return Err(anyhow!(
            "{} attribute(s) failed to evaluate:\n  {}",
            failures.len(),
            failures.join("\n  ")
        ));
    }
    Ok(output)
}

/// Read jobs from a file, or stdin when `path` is `-`.
pub fn read_jobs_from_path(path: &Path) -> Result<EvalOutput> {
    if path.as_os_str() == "-" {
        return read_jobs(std::io::stdin().lock());
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("open evaluator output {}", path.display()))?;
    read_jobs(file)
}

/// Build the evaluator argv, honoring an explicit command override.
pub fn eval_command(request: &EvalRequest<'_>, gc_roots: &Path) -> Result<Vec<String>> {
    let override_cmd = request
        .command
        .map(str::to_string)
        .or_else(|| std::env::var(EVAL_COMMAND_ENV).ok())
        .filter(|value| !value.trim().is_empty());
    if let Some(command) = override_cmd {
        let args = shell_words::split(&command)
            .with_context(|| format!("parse evaluator command: {command}"))?;
        if args.is_empty() {
            return Err(anyhow!("evaluator command is empty"));
        }
        return Ok(args);
    }

    let program = which::which(EVAL_JOBS_BIN)
        .with_context(|| format!("{EVAL_JOBS_BIN} not found on PATH"))?;
    Ok(vec![
        program.display().to_string(),
        "--flake".to_string(),
        request.flake.to_string(),
        "--check-cache-status".to_string(),
        "--force-recurse".to_string(),
        "--show-required-system-features".to_string(),
        "--workers".to_string(),
        request.workers.to_string(),
        "--gc-roots-dir".to_string(),
        gc_roots.display().to_string(),
    ])
}

/// Run the evaluator and ingest its stdout.
pub fn run_eval(request: &EvalRequest<'_>) -> Result<EvalOutput> {
    let gc_roots = tempfile::Builder::new()
        .prefix("ami-ci-gcroots-")
        .tempdir()
        .context("create gc roots dir")?;
    let argv = eval_command(request, gc_roots.path())?;

    let start = Instant::now();
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawn evaluator: {}", argv[0]))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("evaluator stdout not captured"))?;
    let parsed = read_jobs(stdout);
    if parsed.is_err() {
        // Unread output would otherwise block the child on a full pipe.
        let _ = child.kill();
    }
    let status = child.wait().context("wait for evaluator")?;
    let elapsed_ms = start.elapsed().as_millis();

    tracing::info!(elapsed_ms, flake = request.flake, "evaluation complete");

    let output = parsed?;
    if !status.success() {
        return Err(anyhow!("evaluator failed with status {status}"));
    }
    Ok(output)
}
