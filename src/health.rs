//! Post-boot service health polling.
//!
//! Runs on the booted image: waits for the init completion marker, then
//! retries a fixed list of service checks until one full round passes or
//! the attempt budget is spent.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

const INIT_COMPLETE_MARKER: &str = "/var/lib/init-complete";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

/// One service probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthCheck {
    /// GET `url`; any 2xx passes.
    Http {
        service: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// Header name to environment variable holding its value.
        #[serde(default)]
        header_env: BTreeMap<String, String>,
        #[serde(default)]
        insecure: bool,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
    /// Run `command` (shell words); exit 0 passes.
    Command { service: String, command: String },
}

impl HealthCheck {
    pub fn service(&self) -> &str {
        match self {
            HealthCheck::Http { service, .. } | HealthCheck::Command { service, .. } => service,
        }
    }

    fn command(service: &str, command: &str) -> Self {
        HealthCheck::Command {
            service: service.to_string(),
            command: command.to_string(),
        }
    }

    fn http(service: &str, url: &str) -> Self {
        HealthCheck::Http {
            service: service.to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            header_env: BTreeMap::new(),
            insecure: false,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// File whose presence signals that first-boot init finished.
    pub marker: Option<PathBuf>,
    pub marker_attempts: u32,
    pub marker_interval_secs: u64,
    pub attempts: u32,
    pub interval_secs: u64,
    pub checks: Vec<HealthCheck>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let adminapi = HealthCheck::Http {
            service: "adminapi".to_string(),
            url: "https://localhost:8085/health".to_string(),
            headers: BTreeMap::new(),
            header_env: BTreeMap::from([("apikey".to_string(), "ADMIN_API_KEY".to_string())]),
            insecure: true,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        };
        HealthConfig {
            marker: Some(PathBuf::from(INIT_COMPLETE_MARKER)),
            marker_attempts: 60,
            marker_interval_secs: 5,
            attempts: 120,
            interval_secs: 1,
            checks: vec![
                HealthCheck::command("postgres", "sudo -u postgres /usr/bin/pg_isready -U postgres"),
                adminapi,
                HealthCheck::http("postgrest", "http://localhost:3001/ready"),
                HealthCheck::http("gotrue", "http://localhost:8081/health"),
                HealthCheck::command("kong", "sudo kong health"),
                HealthCheck::command("fail2ban", "sudo fail2ban-client status"),
            ],
        }
    }
}

/// Outcome of a successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub rounds: u32,
    pub services: Vec<String>,
}

/// Wait for the init marker, then for every check to pass in one round.
pub fn wait_until_healthy(config: &HealthConfig) -> Result<HealthReport> {
    let checks = resolve_checks(&config.checks)?;
    if let Some(marker) = &config.marker {
        wait_for_marker(
            marker,
            config.marker_attempts,
            Duration::from_secs(config.marker_interval_secs),
        )?;
    }

    let interval = Duration::from_secs(config.interval_secs);
    for round in 1..=config.attempts {
        match run_round(&checks) {
            Ok(()) => {
                tracing::info!(round, services = checks.len(), "all services healthy");
                return Ok(HealthReport {
                    rounds: round,
                    services: checks.iter().map(|check| check.service.clone()).collect(),
                });
            }
            Err(err) => {
                tracing::warn!(round, attempts = config.attempts, "{err:#}");
            }
        }
        if round < config.attempts {
            thread::sleep(interval);
        }
    }
    Err(anyhow!(
        "services not healthy after {} attempts",
        config.attempts
    ))
}

/// Poll for `path` up to `attempts` times.
pub fn wait_for_marker(path: &Path, attempts: u32, interval: Duration) -> Result<()> {
    for attempt in 1..=attempts {
        if path.exists() {
            tracing::info!(marker = %path.display(), attempt, "init marker present");
            return Ok(());
        }
        tracing::warn!(
            marker = %path.display(),
            "waiting for init to complete (attempt {attempt}/{attempts})"
        );
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    Err(anyhow!(
        "init marker {} did not appear after {attempts} attempts",
        path.display()
    ))
}

/// A check with environment lookups and argv splitting already done.
struct ResolvedCheck {
    service: String,
    probe: Probe,
}

enum Probe {
    Http {
        url: String,
        headers: Vec<(String, String)>,
        insecure: bool,
        timeout: Duration,
    },
    Command {
        argv: Vec<String>,
    },
}

fn resolve_checks(checks: &[HealthCheck]) -> Result<Vec<ResolvedCheck>> {
    checks.iter().map(resolve_check).collect()
}

fn resolve_check(check: &HealthCheck) -> Result<ResolvedCheck> {
    let probe = match check {
        HealthCheck::Http {
            service,
            url,
            headers,
            header_env,
            insecure,
            timeout_secs,
        } => {
            let mut resolved: Vec<(String, String)> = headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            for (name, var) in header_env {
                let value = std::env::var(var).with_context(|| {
                    format!("{service}: header {name} needs environment variable {var}")
                })?;
                resolved.push((name.clone(), value));
            }
            Probe::Http {
                url: url.clone(),
                headers: resolved,
                insecure: *insecure,
                timeout: Duration::from_secs(*timeout_secs),
            }
        }
        HealthCheck::Command { service, command } => {
            let argv = shell_words::split(command)
                .with_context(|| format!("{service}: parse command {command}"))?;
            if argv.is_empty() {
                return Err(anyhow!("{service}: command is empty"));
            }
            Probe::Command { argv }
        }
    };
    Ok(ResolvedCheck {
        service: check.service().to_string(),
        probe,
    })
}

/// Run checks in order, stopping at the first failure.
fn run_round(checks: &[ResolvedCheck]) -> Result<()> {
    for check in checks {
        let outcome = match &check.probe {
            Probe::Http {
                url,
                headers,
                insecure,
                timeout,
            } => http_probe(url, headers, *insecure, *timeout),
            Probe::Command { argv } => command_probe(argv),
        };
        outcome.with_context(|| format!("{} not ready", check.service))?;
        tracing::debug!(service = %check.service, "service ready");
    }
    Ok(())
}

fn http_probe(
    url: &str,
    headers: &[(String, String)],
    insecure: bool,
    timeout: Duration,
) -> Result<()> {
    // Probes target services on this host; environment proxies never apply.
    let mut config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .proxy(None);
    if insecure {
        config = config.tls_config(
            ureq::tls::TlsConfig::builder()
                .disable_verification(true)
                .build(),
        );
    }
    let agent: ureq::Agent = config.build().into();

    let mut request = agent.get(url);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.call().with_context(|| format!("GET {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("GET {url} returned {status}"));
    }
    Ok(())
}

fn command_probe(argv: &[String]) -> Result<()> {
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawn {}", argv[0]))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr_line = stderr.trim().lines().next().unwrap_or_default();
        return Err(anyhow!(
            "{} exited with {}{}",
            argv[0],
            output.status,
            if stderr_line.is_empty() {
                String::new()
            } else {
                format!(": {stderr_line}")
            }
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
