//! fail2ban jail audit for the PostgreSQL auth-failure log.
use super::{rooted, AuditReport};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Instant;

pub const JAIL_NAME: &str = "postgresql";
pub const CONFIG_DIR: &str = "/etc/fail2ban";
pub const JAIL_CONFIG: &str = "/etc/fail2ban/jail.d/postgresql.conf";
pub const FILTER_CONFIG: &str = "/etc/fail2ban/filter.d/postgresql.conf";
pub const AUTH_FAILURE_LOG: &str = "/var/log/postgresql/auth-failures.csv";

/// Directive lines the jail file must contain verbatim.
const JAIL_DIRECTIVES: &[(&str, &str)] = &[
    ("enabled = true", "enabled setting"),
    ("port    = 5432", "port setting"),
    ("protocol = tcp", "protocol setting"),
    ("filter = postgresql", "filter setting"),
    (
        "logpath = /var/log/postgresql/auth-failures.csv",
        "logpath setting",
    ),
    ("maxretry = 3", "maxretry setting"),
    ("backend = auto", "backend setting"),
];

const IGNORE_IP_RANGES: &[&str] = &["192.168.0.0/16", "172.17.1.0/20"];

const FAIL_REGEX: &str =
    r#"^.*,.*,.*,.*,"<HOST>:.*password authentication failed for user.*$"#;
const IGNORE_REGEX: &str =
    r#"^.*,.*,.*,.*,"127\.0\.0\.1.*password authentication failed for user.*$"#;

/// Service roles whose failed logins never ban the client.
const IGNORED_ROLES: &[&str] = &[
    "supabase_admin",
    "supabase_auth_admin",
    "supabase_storage_admin",
    "authenticator",
    "pgbouncer",
];

const CHECK_JAIL: &str = "jail";
const CHECK_FILTER: &str = "filter";
const CHECK_SYNTAX: &str = "syntax";
const CHECK_REGEX: &str = "regex";
const CHECK_RUNTIME: &str = "runtime";

fn role_ignore_regex(role: &str) -> String {
    format!(r#"^.*,.*,.*,.*,"<HOST>:.*password authentication failed for user ""{role}".*$"#)
}

/// Paths of the fail2ban binaries.
#[derive(Debug, Clone)]
pub struct Fail2banTools {
    pub client: PathBuf,
    pub regex: PathBuf,
}

impl Fail2banTools {
    pub fn locate() -> Result<Self> {
        Ok(Self {
            client: which::which("fail2ban-client").context("locate fail2ban-client")?,
            regex: which::which("fail2ban-regex").context("locate fail2ban-regex")?,
        })
    }
}

/// Counts reported by `fail2ban-client status <jail>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JailCounts {
    pub currently_failed: Option<u64>,
    pub total_failed: Option<u64>,
}

/// Every expected line missing from the jail file.
pub fn check_jail_config(content: &str) -> Vec<String> {
    let mut missing = Vec::new();
    for (line, description) in JAIL_DIRECTIVES {
        if !content.contains(line) {
            missing.push(format!("missing or incorrect {description}: expected `{line}`"));
        }
    }
    for range in IGNORE_IP_RANGES {
        if !content.contains(range) {
            missing.push(format!("missing ignoreip range {range}"));
        }
    }
    missing
}

/// Every expected regex missing from the filter file.
pub fn check_filter_config(content: &str) -> Vec<String> {
    let mut missing = Vec::new();
    if !content.contains(FAIL_REGEX) {
        missing.push(format!("missing or incorrect failregex: expected `{FAIL_REGEX}`"));
    }
    if !content.contains(IGNORE_REGEX) {
        missing.push(format!(
            "missing or incorrect ignoreregex: expected `{IGNORE_REGEX}`"
        ));
    }
    for role in IGNORED_ROLES {
        let pattern = role_ignore_regex(role);
        if !content.contains(&pattern) {
            missing.push(format!("missing ignoreregex for role {role}: expected `{pattern}`"));
        }
    }
    missing
}

/// Validate `fail2ban-client status <jail>` output and pull out its counters.
pub fn check_status_output(output: &str, logpath: &str) -> Result<JailCounts> {
    if !output.contains(&format!("Status for the jail: {JAIL_NAME}")) {
        return Err(anyhow!("{JAIL_NAME} jail is not active"));
    }
    if !output.contains(logpath) {
        return Err(anyhow!(
            "{JAIL_NAME} jail is not monitoring the expected log file: {logpath}"
        ));
    }
    let currently = Regex::new(r"Currently failed:\s+(\d+)")?;
    let total = Regex::new(r"Total failed:\s+(\d+)")?;
    let capture = |re: &Regex| {
        re.captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };
    Ok(JailCounts {
        currently_failed: capture(&currently),
        total_failed: capture(&total),
    })
}

/// Run the audit, stopping at the first failed check.
///
/// Static checks read the configuration under `root`. The jail status check
/// talks to the running server, so it only runs when `root` is `/`.
pub fn audit(root: &Path, skip_runtime: bool, tools: &Fail2banTools) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    let jail_path = rooted(root, JAIL_CONFIG);
    match std::fs::read_to_string(&jail_path) {
        Ok(content) => {
            let missing = check_jail_config(&content);
            if !missing.is_empty() {
                report.fail(CHECK_JAIL, format!("{JAIL_CONFIG}: {}", missing.join("; ")));
                return Ok(report);
            }
            report.pass(CHECK_JAIL, "fail2ban jail configuration is correct");
        }
        Err(err) => {
            report.fail(CHECK_JAIL, format!("read {}: {err}", jail_path.display()));
            return Ok(report);
        }
    }

    let filter_path = rooted(root, FILTER_CONFIG);
    match std::fs::read_to_string(&filter_path) {
        Ok(content) => {
            let missing = check_filter_config(&content);
            if !missing.is_empty() {
                report.fail(
                    CHECK_FILTER,
                    format!("{FILTER_CONFIG}: {}", missing.join("; ")),
                );
                return Ok(report);
            }
            report.pass(CHECK_FILTER, "fail2ban filter configuration is correct");
        }
        Err(err) => {
            report.fail(CHECK_FILTER, format!("read {}: {err}", filter_path.display()));
            return Ok(report);
        }
    }

    let config_dir = rooted(root, CONFIG_DIR);
    let config_arg = config_dir.to_string_lossy();
    let dump = run_tool(&tools.client, &["-c", &*config_arg, "-d"])?;
    if !dump.status.success() {
        report.fail(
            CHECK_SYNTAX,
            format!(
                "fail2ban-client -d failed: {}",
                String::from_utf8_lossy(&dump.stderr).trim()
            ),
        );
        return Ok(report);
    }
    if !String::from_utf8_lossy(&dump.stdout).contains(JAIL_NAME) {
        report.fail(
            CHECK_SYNTAX,
            format!("{JAIL_NAME} jail not found in fail2ban configuration dump"),
        );
        return Ok(report);
    }
    report.pass(CHECK_SYNTAX, "fail2ban configuration syntax is valid");

    let log_path = rooted(root, AUTH_FAILURE_LOG);
    if log_path.exists() {
        let log_arg = log_path.to_string_lossy();
        let filter_arg = filter_path.to_string_lossy();
        let tested = run_tool(&tools.regex, &[&*log_arg, &*filter_arg])?;
        if !tested.status.success() {
            report.fail(
                CHECK_REGEX,
                format!(
                    "fail2ban-regex failed: {}",
                    String::from_utf8_lossy(&tested.stderr).trim()
                ),
            );
            return Ok(report);
        }
        report.pass(CHECK_REGEX, "fail2ban filter regex test passed");
    } else {
        report.warn(
            CHECK_REGEX,
            format!("{AUTH_FAILURE_LOG} does not exist yet, skipping regex test"),
        );
    }

    if skip_runtime {
        return Ok(report);
    }
    if root != Path::new("/") {
        report.warn(
            CHECK_RUNTIME,
            format!(
                "{} is not the live system, skipping jail status check",
                root.display()
            ),
        );
        return Ok(report);
    }
    check_runtime(tools, &mut report)?;
    Ok(report)
}

/// Query the running server for the jail; only meaningful on the live host.
pub fn check_runtime(tools: &Fail2banTools, report: &mut AuditReport) -> Result<()> {
    let status = run_tool(&tools.client, &["status", JAIL_NAME])?;
    if !status.status.success() {
        report.fail(
            CHECK_RUNTIME,
            format!(
                "failed to get {JAIL_NAME} jail status: {}",
                String::from_utf8_lossy(&status.stderr).trim()
            ),
        );
        return Ok(());
    }
    match check_status_output(&String::from_utf8_lossy(&status.stdout), AUTH_FAILURE_LOG) {
        Ok(counts) => {
            tracing::info!(
                currently_failed = ?counts.currently_failed,
                total_failed = ?counts.total_failed,
                "{JAIL_NAME} jail counters"
            );
            report.pass(
                CHECK_RUNTIME,
                format!("{JAIL_NAME} jail is active and monitoring {AUTH_FAILURE_LOG}"),
            );
        }
        Err(err) => report.fail(CHECK_RUNTIME, err.to_string()),
    }
    Ok(())
}

fn run_tool(program: &Path, args: &[&str]) -> Result<Output> {
    let started = Instant::now();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawn {}", program.display()))?;
    tracing::debug!(
        program = %program.display(),
        elapsed_ms = started.elapsed().as_millis(),
        status = %output.status,
        "fail2ban tool finished"
    );
    Ok(output)
}

#[cfg(test)]
#[path = "fail2ban_tests.rs"]
mod tests;
