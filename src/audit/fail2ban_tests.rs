use super::{
    audit, check_filter_config, check_jail_config, check_runtime, check_status_output,
    role_ignore_regex, Fail2banTools, JailCounts, AUTH_FAILURE_LOG, FAIL_REGEX, IGNORED_ROLES,
    IGNORE_REGEX,
};
use crate::audit::{AuditReport, Outcome};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const JAIL: &str = "\
[postgresql]
enabled = true
port    = 5432
protocol = tcp
filter = postgresql
logpath = /var/log/postgresql/auth-failures.csv
maxretry = 3
ignoreip = 192.168.0.0/16 172.17.1.0/20
backend = auto
";

const STATUS: &str = "\
Status for the jail: postgresql
|- Filter
|  |- Currently failed: 2
|  |- Total failed:     17
|  `- File list:        /var/log/postgresql/auth-failures.csv
`- Actions
";

fn filter_file() -> String {
    let mut content = format!("[Definition]\nfailregex = {FAIL_REGEX}\nignoreregex = {IGNORE_REGEX}\n");
    for role in IGNORED_ROLES {
        content.push_str("              ");
        content.push_str(&role_ignore_regex(role));
        content.push('\n');
    }
    content
}

fn write_image(root: &Path, jail: &str, filter: &str) {
    let jail_dir = root.join("etc/fail2ban/jail.d");
    let filter_dir = root.join("etc/fail2ban/filter.d");
    fs::create_dir_all(&jail_dir).expect("create jail.d");
    fs::create_dir_all(&filter_dir).expect("create filter.d");
    fs::write(jail_dir.join("postgresql.conf"), jail).expect("write jail");
    fs::write(filter_dir.join("postgresql.conf"), filter).expect("write filter");
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Fake client that logs its argv and only dumps a configuration when pointed
/// at `config_dir`.
fn healthy_tools(dir: &Path, config_dir: &Path) -> Fail2banTools {
    let status = dir.join("status.txt");
    let argv_log = dir.join("client-argv.log");
    fs::write(&status, STATUS).expect("write status");
    let client = script(
        dir,
        "fail2ban-client",
        &format!(
            "echo \"$*\" >> '{log}'\n\
             if [ \"$1\" = -c ] && [ \"$2\" = '{config}' ] && [ \"$3\" = -d ]; then\n\
             \x20 echo \"['add', 'postgresql', 'auto']\"\n\
             elif [ \"$1\" = status ]; then\n\
             \x20 cat '{status}'\n\
             else\n\
             \x20 exit 2\n\
             fi",
            log = argv_log.display(),
            config = config_dir.display(),
            status = status.display()
        ),
    );
    let regex = script(dir, "fail2ban-regex", "echo 'Lines: 0'");
    Fail2banTools { client, regex }
}

fn client_calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("client-argv.log"))
        .expect("read client argv log")
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn complete_jail_has_no_missing_lines() {
    assert!(check_jail_config(JAIL).is_empty());
}

#[test]
fn jail_port_needs_exact_spacing() {
    let jail = JAIL.replace("port    = 5432", "port = 5432");
    let missing = check_jail_config(&jail);
    assert_eq!(missing.len(), 1);
    assert!(missing[0].contains("port setting"));
}

#[test]
fn jail_reports_missing_ignoreip_range() {
    let jail = JAIL.replace(" 172.17.1.0/20", "");
    let missing = check_jail_config(&jail);
    assert_eq!(missing, vec!["missing ignoreip range 172.17.1.0/20".to_string()]);
}

#[test]
fn complete_filter_has_no_missing_regex() {
    assert!(check_filter_config(&filter_file()).is_empty());
}

#[test]
fn filter_reports_each_missing_role() {
    let filter = filter_file().replace(&role_ignore_regex("pgbouncer"), "");
    let missing = check_filter_config(&filter);
    assert_eq!(missing.len(), 1);
    assert!(missing[0].contains("role pgbouncer"));
}

#[test]
fn status_output_yields_counters() {
    let counts = check_status_output(STATUS, AUTH_FAILURE_LOG).expect("active jail");
    assert_eq!(
        counts,
        JailCounts {
            currently_failed: Some(2),
            total_failed: Some(17),
        }
    );
}

#[test]
fn status_output_must_name_log_file() {
    let status = STATUS.replace(AUTH_FAILURE_LOG, "/var/log/other.log");
    let err = check_status_output(&status, AUTH_FAILURE_LOG).expect_err("wrong log");
    assert!(err.to_string().contains("not monitoring"));
}

#[test]
fn inactive_jail_is_rejected() {
    let err = check_status_output("Sorry but the jail 'postgresql' does not exist", AUTH_FAILURE_LOG)
        .expect_err("inactive");
    assert!(err.to_string().contains("not active"));
}

#[test]
fn audit_passes_against_healthy_image() {
    let root = tempfile::tempdir().expect("tempdir");
    let bin = tempfile::tempdir().expect("bin tempdir");
    write_image(root.path(), JAIL, &filter_file());

    let tools = healthy_tools(bin.path(), &root.path().join("etc/fail2ban"));
    let report = audit(root.path(), false, &tools).expect("audit runs");
    let outcomes: Vec<Outcome> = report.findings.iter().map(|f| f.outcome).collect();
    // No auth log yet, and an image root is not the live system.
    assert_eq!(
        outcomes,
        vec![
            Outcome::Pass,
            Outcome::Pass,
            Outcome::Pass,
            Outcome::Warn,
            Outcome::Warn
        ]
    );
    let runtime = report.findings.last().expect("a finding");
    assert_eq!(runtime.check, "runtime");
    assert!(runtime.message.contains("not the live system"));
}

#[test]
fn syntax_check_reads_config_under_root() {
    let root = tempfile::tempdir().expect("tempdir");
    let bin = tempfile::tempdir().expect("bin tempdir");
    write_image(root.path(), JAIL, &filter_file());
    let config_dir = root.path().join("etc/fail2ban");

    let tools = healthy_tools(bin.path(), &config_dir);
    let report = audit(root.path(), false, &tools).expect("audit runs");
    assert!(!report.has_failures(), "{:?}", report.findings);
    // The status query would hit the host's server, so it never runs for an image root.
    assert_eq!(
        client_calls(bin.path()),
        vec![format!("-c {} -d", config_dir.display())]
    );
}

#[test]
fn syntax_check_fails_when_client_reads_host_config() {
    let root = tempfile::tempdir().expect("tempdir");
    let bin = tempfile::tempdir().expect("bin tempdir");
    write_image(root.path(), JAIL, &filter_file());

    // A client that only knows the host's /etc/fail2ban refuses the image config.
    let tools = healthy_tools(bin.path(), Path::new("/etc/fail2ban"));
    let report = audit(root.path(), false, &tools).expect("audit runs");
    let last = report.findings.last().expect("a finding");
    assert_eq!(last.check, "syntax");
    assert_eq!(last.outcome, Outcome::Fail);
}

#[test]
fn runtime_check_reads_jail_status() {
    let bin = tempfile::tempdir().expect("bin tempdir");
    let tools = healthy_tools(bin.path(), Path::new("/etc/fail2ban"));
    let mut report = AuditReport::default();
    check_runtime(&tools, &mut report).expect("status runs");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].outcome, Outcome::Pass);
    assert_eq!(client_calls(bin.path()), vec!["status postgresql".to_string()]);
}

#[test]
fn runtime_check_fails_on_client_error() {
    let bin = tempfile::tempdir().expect("bin tempdir");
    let mut tools = healthy_tools(bin.path(), Path::new("/etc/fail2ban"));
    tools.client = script(
        bin.path(),
        "fail2ban-client-down",
        "echo 'server not running' >&2; exit 255",
    );
    let mut report = AuditReport::default();
    check_runtime(&tools, &mut report).expect("status runs");
    assert!(report.has_failures());
    assert!(report.findings[0].message.contains("server not running"));
}

#[test]
fn audit_runs_regex_when_log_exists() {
    let root = tempfile::tempdir().expect("tempdir");
    let bin = tempfile::tempdir().expect("bin tempdir");
    write_image(root.path(), JAIL, &filter_file());
    let log_dir = root.path().join("var/log/postgresql");
    fs::create_dir_all(&log_dir).expect("create log dir");
    fs::write(log_dir.join("auth-failures.csv"), "").expect("write log");

    let mut tools = healthy_tools(bin.path(), &root.path().join("etc/fail2ban"));
    tools.regex = script(bin.path(), "fail2ban-regex-broken", "echo 'bad filter' >&2; exit 1");
    let report = audit(root.path(), true, &tools).expect("audit runs");
    assert!(report.has_failures());
    let last = report.findings.last().expect("a finding");
    assert_eq!(last.check, "regex");
    assert!(last.message.contains("bad filter"));
}

#[test]
fn audit_stops_at_first_failure() {
    let root = tempfile::tempdir().expect("tempdir");
    let bin = tempfile::tempdir().expect("bin tempdir");
    write_image(root.path(), &JAIL.replace("maxretry = 3", "maxretry = 5"), &filter_file());

    let tools = healthy_tools(bin.path(), &root.path().join("etc/fail2ban"));
    let report = audit(root.path(), false, &tools).expect("audit runs");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].check, "jail");
    assert!(report.findings[0].message.contains("maxretry"));
}

#[test]
fn skip_runtime_omits_status_check() {
    let root = tempfile::tempdir().expect("tempdir");
    let bin = tempfile::tempdir().expect("bin tempdir");
    write_image(root.path(), JAIL, &filter_file());

    let tools = healthy_tools(bin.path(), &root.path().join("etc/fail2ban"));
    let report = audit(root.path(), true, &tools).expect("audit runs");
    assert!(report.findings.iter().all(|f| f.check != "runtime"));
    assert!(!report.has_failures());
}
