use super::{
    audit, check_directories, check_memberships, check_nixbld_users, check_postgres_mount,
    describe_stat_error, AccountDb, ExpectedDir,
};
use crate::audit::{AuditReport, Outcome};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
# comment lines are ignored
postgres:x:101:102::/var/lib/postgresql:/bin/bash
nixbld1:x:30001:30000::/var/empty:/sbin/nologin
nixbld2:x:30002:30000::/var/empty:/sbin/nologin
";

const GROUP: &str = "\
root:x:0:
postgres:x:102:
ssl-cert:x:110:postgres
nixbld:x:30000:nixbld1,nixbld2
";

fn db() -> AccountDb {
    AccountDb::parse(PASSWD, GROUP).expect("parse account db")
}

fn outcomes(report: &AuditReport) -> Vec<Outcome> {
    report.findings.iter().map(|finding| finding.outcome).collect()
}

#[test]
fn groups_include_primary_and_supplementary() {
    let db = db();
    assert_eq!(
        db.groups_of("postgres"),
        Some(vec!["postgres".to_string(), "ssl-cert".to_string()])
    );
    assert_eq!(db.groups_of("root"), Some(vec!["root".to_string()]));
    assert_eq!(db.groups_of("ghost"), None);
}

#[test]
fn rejects_malformed_passwd_line() {
    let err = AccountDb::parse("root:x:zero:0::/root:/bin/sh\n", GROUP).expect_err("bad uid");
    assert!(format!("{err:#}").contains("uid"));
}

#[test]
fn membership_compares_as_sets() {
    let mut report = AuditReport::default();
    let expected: &[(&str, &[&str])] = &[("postgres", &["ssl-cert", "postgres"])];
    check_memberships(&db(), expected, &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Pass]);
}

#[test]
fn membership_mismatch_and_missing_user_fail() {
    let mut report = AuditReport::default();
    let expected: &[(&str, &[&str])] = &[("postgres", &["postgres"]), ("kong", &["kong"])];
    check_memberships(&db(), expected, &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Fail, Outcome::Fail]);
    assert!(report.findings[0].message.contains("got:      postgres, ssl-cert"));
    assert!(report.findings[1].message.contains("'kong' not found"));
}

#[test]
fn nixbld_users_only_in_nixbld() {
    let mut report = AuditReport::default();
    check_nixbld_users(&db(), &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Pass]);

    let group = format!("{GROUP}wheel:x:10:nixbld2\n");
    let db = AccountDb::parse(PASSWD, &group).expect("parse");
    let mut report = AuditReport::default();
    check_nixbld_users(&db, &mut report);
    assert!(report.has_failures());
    assert!(report.findings[0].message.contains("'nixbld2' is in group 'wheel'"));
}

fn fake_process(root: &Path, pid: &str, cmdline: &str, mounts: &str) {
    let dir = root.join("proc").join(pid);
    fs::create_dir_all(&dir).expect("create proc dir");
    fs::write(dir.join("cmdline"), cmdline.replace(' ', "\0")).expect("write cmdline");
    fs::write(dir.join("mounts"), mounts).expect("write mounts");
}

#[test]
fn postgres_mount_read_only_passes() {
    let root = tempfile::tempdir().expect("tempdir");
    fake_process(root.path(), "12", "/usr/bin/sshd -D", "/dev/root / ext4 rw,relatime 0 0\n");
    fake_process(
        root.path(),
        "40",
        "/nix/store/abc/bin/.postgres-wrapped -D /etc/postgresql",
        "/dev/root / ext4 rw,relatime 0 0\n/dev/root /etc ext4 ro,relatime 0 0\n",
    );
    let mut report = AuditReport::default();
    check_postgres_mount(root.path(), &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Pass]);
}

#[test]
fn postgres_mount_writable_fails() {
    let root = tempfile::tempdir().expect("tempdir");
    fake_process(
        root.path(),
        "40",
        "/nix/store/abc/bin/.postgres-wrapped -D /etc/postgresql",
        "/dev/root /etc ext4 rw,relatime 0 0\n",
    );
    let mut report = AuditReport::default();
    check_postgres_mount(root.path(), &mut report);
    assert!(report.has_failures());
    assert!(report.findings[0].message.contains("got 0"));
}

#[test]
fn missing_postgres_process_fails() {
    let root = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(root.path().join("proc")).expect("create proc");
    let mut report = AuditReport::default();
    check_postgres_mount(root.path(), &mut report);
    assert!(report.has_failures());
}

/// Account db naming the tempdir owner `postgres`.
fn owner_db(root: &Path) -> AccountDb {
    let meta = fs::metadata(root).expect("stat root");
    let passwd = format!("postgres:x:{}:{}::/home/postgres:/bin/sh\n", meta.uid(), meta.gid());
    let group = format!("postgres:x:{}:\n", meta.gid());
    AccountDb::parse(&passwd, &group).expect("parse owner db")
}

fn make_dir(root: &Path, path: &str, mode: u32) {
    let dir = root.join(path.trim_start_matches('/'));
    fs::create_dir_all(&dir).expect("create dir");
    fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).expect("chmod");
}

const DATA_DIRS: &[ExpectedDir] = &[
    ExpectedDir {
        path: "/data/pgdata",
        mode: 0o750,
        owner: "postgres",
        group: "postgres",
        description: "data",
    },
    ExpectedDir {
        path: "/var/log/postgresql",
        mode: 0o750,
        owner: "postgres",
        group: "postgres",
        description: "logs",
    },
];

#[test]
fn directory_with_expected_mode_passes() {
    let root = tempfile::tempdir().expect("tempdir");
    make_dir(root.path(), "/data/pgdata", 0o750);
    make_dir(root.path(), "/var/log/postgresql", 0o750);
    let mut report = AuditReport::default();
    check_directories(root.path(), &owner_db(root.path()), DATA_DIRS, &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Pass, Outcome::Pass]);
    assert!(report.findings[0].message.contains("0750 postgres:postgres"));
}

#[test]
fn directory_mode_mismatch_suggests_chmod() {
    let root = tempfile::tempdir().expect("tempdir");
    make_dir(root.path(), "/data/pgdata", 0o755);
    make_dir(root.path(), "/var/log/postgresql", 0o750);
    let mut report = AuditReport::default();
    check_directories(root.path(), &owner_db(root.path()), DATA_DIRS, &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Fail, Outcome::Pass]);
    assert!(report.findings[0]
        .message
        .contains("fix: sudo chmod 0750 /data/pgdata"));
}

#[test]
fn missing_directory_only_warns() {
    let root = tempfile::tempdir().expect("tempdir");
    make_dir(root.path(), "/data/pgdata", 0o750);
    let mut report = AuditReport::default();
    check_directories(root.path(), &owner_db(root.path()), DATA_DIRS, &mut report);
    assert_eq!(outcomes(&report), vec![Outcome::Pass, Outcome::Warn]);
    assert!(!report.has_failures());
}

#[test]
fn unknown_owner_is_reported_numerically() {
    let root = tempfile::tempdir().expect("tempdir");
    make_dir(root.path(), "/data/pgdata", 0o750);
    let empty = AccountDb::default();
    let mut report = AuditReport::default();
    check_directories(root.path(), &empty, &DATA_DIRS[..1], &mut report);
    assert!(report.has_failures());
    let uid = fs::metadata(root.path()).expect("stat").uid();
    assert!(report.findings[0]
        .message
        .contains(&format!("has owner {uid}")));
}

#[test]
fn full_audit_requires_account_files() {
    let root = tempfile::tempdir().expect("tempdir");
    assert!(audit(root.path(), false).is_err());
}

#[test]
fn qemu_audit_skips_instance_connect_user() {
    let root = tempfile::tempdir().expect("tempdir");
    let etc = root.path().join("etc");
    fs::create_dir_all(&etc).expect("create etc");
    fs::write(etc.join("passwd"), PASSWD).expect("write passwd");
    fs::write(etc.join("group"), GROUP).expect("write group");

    let report = audit(root.path(), true).expect("audit runs");
    assert!(!report
        .findings
        .iter()
        .any(|finding| finding.message.contains("ec2-instance-connect")));
    let report = audit(root.path(), false).expect("audit runs");
    assert!(report
        .findings
        .iter()
        .any(|finding| finding.message.contains("'ec2-instance-connect' not found")));
}

#[test]
fn permission_denied_suggests_running_as_root() {
    let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
    assert_eq!(
        describe_stat_error("/etc/ssl/private", &err),
        "failed to check /etc/ssl/private: permission denied (run the audit as root)"
    );
}

#[test]
fn other_stat_errors_keep_the_io_message() {
    let err = std::io::Error::other("input/output error");
    let message = describe_stat_error("/data/pgdata", &err);
    assert_eq!(message, "failed to check /data/pgdata: input/output error");
}
