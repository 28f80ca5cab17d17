//! Unix account and filesystem permission audit.
//!
//! Compares the image's user/group database, the postgres mount namespace
//! and a table of security-sensitive directories against fixed
//! expectations. All paths resolve under a root so a mounted image can be
//! audited from outside.
use super::{rooted, AuditReport};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

const CHECK_GROUPS: &str = "groups";
const CHECK_NIXBLD: &str = "nixbld";
const CHECK_MOUNT: &str = "mount";
const CHECK_DIRS: &str = "dirs";

const NIXBLD_PREFIX: &str = "nixbld";
const NIXBLD_GROUP: &str = "nixbld";

/// Users absent from QEMU artifacts.
const QEMU_EXCLUDED_USERS: &[&str] = &["ec2-instance-connect"];

/// Expected group membership per user.
pub const EXPECTED_MEMBERSHIPS: &[(&str, &[&str])] = &[
    ("postgres", &["postgres", "ssl-cert"]),
    (
        "ubuntu",
        &[
            "adm", "audio", "cdrom", "dialout", "dip", "floppy", "lxd", "netdev", "plugdev",
            "sudo", "ubuntu", "video",
        ],
    ),
    ("root", &["root"]),
    ("daemon", &["daemon"]),
    ("bin", &["bin"]),
    ("sys", &["sys"]),
    ("sync", &["nogroup"]),
    ("games", &["games"]),
    ("man", &["man"]),
    ("lp", &["lp"]),
    ("mail", &["mail"]),
    ("news", &["news"]),
    ("uucp", &["uucp"]),
    ("proxy", &["proxy"]),
    ("www-data", &["www-data"]),
    ("backup", &["backup"]),
    ("list", &["list"]),
    ("irc", &["irc"]),
    ("nobody", &["nogroup"]),
    ("systemd-network", &["systemd-network"]),
    ("systemd-resolve", &["systemd-resolve"]),
    ("systemd-timesync", &["systemd-timesync"]),
    ("messagebus", &["messagebus"]),
    ("sshd", &["nogroup"]),
    ("wal-g", &["postgres", "wal-g"]),
    ("pgbouncer", &["pgbouncer", "postgres", "ssl-cert"]),
    ("gotrue", &["gotrue"]),
    ("envoy", &["envoy"]),
    ("kong", &["kong"]),
    ("nginx", &["nginx"]),
    ("vector", &["adm", "postgres", "systemd-journal", "vector"]),
    (
        "adminapi",
        &[
            "admin",
            "adminapi",
            "envoy",
            "gotrue",
            "kong",
            "pgbouncer",
            "postgres",
            "postgrest",
            "root",
            "systemd-journal",
            "vector",
            "wal-g",
        ],
    ),
    ("postgrest", &["postgrest"]),
    ("tcpdump", &["tcpdump"]),
    ("systemd-coredump", &["systemd-coredump"]),
    (
        "supabase-admin-agent",
        &["admin", "salt", "supabase-admin-agent"],
    ),
    ("ec2-instance-connect", &["nogroup"]),
];

/// Expected mode and ownership of a security-sensitive directory.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedDir {
    pub path: &'static str,
    pub mode: u32,
    pub owner: &'static str,
    pub group: &'static str,
    pub description: &'static str,
}

pub const EXPECTED_DIRECTORIES: &[ExpectedDir] = &[
    ExpectedDir {
        path: "/var/lib/postgresql",
        mode: 0o755,
        owner: "postgres",
        group: "postgres",
        description: "PostgreSQL home - must be traversable for nix-profile symlinks",
    },
    ExpectedDir {
        path: "/var/lib/postgresql/data",
        mode: 0o750,
        owner: "postgres",
        group: "postgres",
        description: "PostgreSQL data directory symlink - postgres only",
    },
    ExpectedDir {
        path: "/data/pgdata",
        mode: 0o750,
        owner: "postgres",
        group: "postgres",
        description: "PostgreSQL data directory - postgres only",
    },
    ExpectedDir {
        path: "/etc/postgresql",
        mode: 0o775,
        owner: "postgres",
        group: "postgres",
        description: "PostgreSQL configuration directory - adminapi writable",
    },
    ExpectedDir {
        path: "/etc/postgresql-custom",
        mode: 0o775,
        owner: "postgres",
        group: "postgres",
        description: "PostgreSQL custom configuration - adminapi writable",
    },
    ExpectedDir {
        path: "/etc/ssl/private",
        mode: 0o750,
        owner: "root",
        group: "ssl-cert",
        description: "SSL private keys directory - ssl-cert group only",
    },
    ExpectedDir {
        path: "/home/postgres",
        mode: 0o750,
        owner: "postgres",
        group: "postgres",
        description: "postgres user home directory - postgres only",
    },
    ExpectedDir {
        path: "/var/log/postgresql",
        mode: 0o750,
        owner: "postgres",
        group: "postgres",
        description: "PostgreSQL logs directory - postgres only",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// Parsed `/etc/passwd` + `/etc/group`.
#[derive(Debug, Default)]
pub struct AccountDb {
    pub users: Vec<UserEntry>,
    pub groups: Vec<GroupEntry>,
}

impl AccountDb {
    pub fn load(root: &Path) -> Result<Self> {
        let passwd_path = rooted(root, "/etc/passwd");
        let group_path = rooted(root, "/etc/group");
        let passwd = fs::read_to_string(&passwd_path)
            .with_context(|| format!("read {}", passwd_path.display()))?;
        let group = fs::read_to_string(&group_path)
            .with_context(|| format!("read {}", group_path.display()))?;
        Self::parse(&passwd, &group)
    }

    pub fn parse(passwd: &str, group: &str) -> Result<Self> {
        let mut db = AccountDb::default();
        for (idx, line) in database_lines(passwd) {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return Err(anyhow!("passwd line {}: expected at least 4 fields", idx + 1));
            }
            db.users.push(UserEntry {
                name: fields[0].to_string(),
                uid: parse_id(fields[2], "uid", idx)?,
                gid: parse_id(fields[3], "gid", idx)?,
                home: fields.get(5).copied().unwrap_or_default().to_string(),
                shell: fields.get(6).copied().unwrap_or_default().to_string(),
            });
        }
        for (idx, line) in database_lines(group) {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return Err(anyhow!("group line {}: expected at least 3 fields", idx + 1));
            }
            let members = fields
                .get(3)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|member| !member.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            db.groups.push(GroupEntry {
                name: fields[0].to_string(),
                gid: parse_id(fields[2], "gid", idx)?,
                members,
            });
        }
        Ok(db)
    }

    pub fn user(&self, name: &str) -> Option<&UserEntry> {
        self.users.iter().find(|user| user.name == name)
    }

    /// Sorted names of every group `name` belongs to, primary or supplementary.
    pub fn groups_of(&self, name: &str) -> Option<Vec<String>> {
        let user = self.user(name)?;
        let mut groups: Vec<String> = self
            .groups
            .iter()
            .filter(|group| group.gid == user.gid || group.members.iter().any(|m| m == name))
            .map(|group| group.name.clone())
            .collect();
        groups.sort();
        groups.dedup();
        Some(groups)
    }

    pub fn user_name(&self, uid: u32) -> String {
        self.users
            .iter()
            .find(|user| user.uid == uid)
            .map(|user| user.name.clone())
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn group_name(&self, gid: u32) -> String {
        self.groups
            .iter()
            .find(|group| group.gid == gid)
            .map(|group| group.name.clone())
            .unwrap_or_else(|| gid.to_string())
    }
}

fn database_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn parse_id(raw: &str, label: &str, idx: usize) -> Result<u32> {
    raw.trim()
        .parse()
        .with_context(|| format!("line {}: invalid {label} {raw:?}", idx + 1))
}

/// Run every permission check against the image under `root`.
pub fn audit(root: &Path, qemu: bool) -> Result<AuditReport> {
    let db = AccountDb::load(root)?;
    let mut report = AuditReport::default();

    let expected: Vec<(&str, &[&str])> = EXPECTED_MEMBERSHIPS
        .iter()
        .copied()
        .filter(|(user, _)| !(qemu && QEMU_EXCLUDED_USERS.contains(user)))
        .collect();
    check_memberships(&db, &expected, &mut report);
    check_nixbld_users(&db, &mut report);
    check_postgres_mount(root, &mut report);
    check_directories(root, &db, EXPECTED_DIRECTORIES, &mut report);
    Ok(report)
}

pub fn check_memberships(db: &AccountDb, expected: &[(&str, &[&str])], report: &mut AuditReport) {
    for (user, groups) in expected {
        let mut wanted: Vec<String> = groups.iter().map(|group| group.to_string()).collect();
        wanted.sort();
        match db.groups_of(user) {
            None => report.fail(CHECK_GROUPS, format!("user '{user}' not found")),
            Some(actual) if actual == wanted => {
                report.pass(CHECK_GROUPS, format!("'{user}' groups match"));
            }
            Some(actual) => report.fail(
                CHECK_GROUPS,
                format!(
                    "'{user}' groups do not match\n  expected: {}\n  got:      {}",
                    wanted.join(", "),
                    actual.join(", ")
                ),
            ),
        }
    }
}

/// Every `nixbld*` build user must belong to `nixbld` only.
pub fn check_nixbld_users(db: &AccountDb, report: &mut AuditReport) {
    let builders: Vec<&UserEntry> = db
        .users
        .iter()
        .filter(|user| user.name.starts_with(NIXBLD_PREFIX))
        .collect();
    if builders.is_empty() {
        report.pass(CHECK_NIXBLD, "no nixbld users found");
        return;
    }
    let mut clean = true;
    for user in builders {
        let groups = db.groups_of(&user.name).unwrap_or_default();
        for group in groups.iter().filter(|group| group.as_str() != NIXBLD_GROUP) {
            clean = false;
            report.fail(
                CHECK_NIXBLD,
                format!("user '{}' is in group '{group}' instead of '{NIXBLD_GROUP}'", user.name),
            );
        }
    }
    if clean {
        report.pass(CHECK_NIXBLD, "all nixbld users are in the 'nixbld' group");
    }
}

/// The postgres service must see `/etc` mounted read-only.
pub fn check_postgres_mount(root: &Path, report: &mut AuditReport) {
    let proc_root = rooted(root, "/proc");
    let Some(pid) = find_postgres_pid(&proc_root) else {
        report.fail(
            CHECK_MOUNT,
            "could not find postgres process with .postgres-wrapped and -D /etc/postgresql",
        );
        return;
    };
    let mounts_path = proc_root.join(&pid).join("mounts");
    let mounts = match fs::read_to_string(&mounts_path) {
        Ok(mounts) => mounts,
        Err(err) => {
            report.fail(CHECK_MOUNT, format!("read {}: {err}", mounts_path.display()));
            return;
        }
    };
    let matches: Vec<&str> = mounts
        .lines()
        .filter(|line| line.contains("/etc") && line.contains("ro,"))
        .collect();
    if matches.len() == 1 {
        report.pass(CHECK_MOUNT, "postgresql.service mounts /etc as read-only");
    } else {
        report.fail(
            CHECK_MOUNT,
            format!(
                "expected exactly 1 read-only /etc mount for pid {pid}, got {}{}",
                matches.len(),
                if matches.is_empty() {
                    String::new()
                } else {
                    format!(": {}", matches.join(";"))
                }
            ),
        );
    }
}

fn find_postgres_pid(proc_root: &Path) -> Option<String> {
    let entries = fs::read_dir(proc_root).ok()?;
    let mut pids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
        .collect();
    pids.sort_by_key(|pid| pid.parse::<u64>().unwrap_or(u64::MAX));
    pids.into_iter().find(|pid| {
        // Processes may exit or be unreadable between listing and reading.
        fs::read(proc_root.join(pid).join("cmdline"))
            .map(|raw| {
                let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
                cmdline.contains(".postgres-wrapped") && cmdline.contains("-D /etc/postgresql")
            })
            .unwrap_or(false)
    })
}

/// Failure text for a directory that exists but could not be inspected.
pub fn describe_stat_error(path: &str, err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::PermissionDenied {
        tracing::warn!(path, "stat denied; the audit is probably running without root");
        return format!("failed to check {path}: permission denied (run the audit as root)");
    }
    format!("failed to check {path}: {err}")
}

pub fn check_directories(
    root: &Path,
    db: &AccountDb,
    expected: &[ExpectedDir],
    report: &mut AuditReport,
) {
    for dir in expected {
        let path = rooted(root, dir.path);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                report.warn(
                    CHECK_DIRS,
                    format!("{} does not exist, skipping permission check", dir.path),
                );
                continue;
            }
            Err(err) => {
                report.fail(CHECK_DIRS, describe_stat_error(dir.path, &err));
                continue;
            }
        };
        let mode = meta.mode() & 0o7777;
        let owner = db.user_name(meta.uid());
        let group = db.group_name(meta.gid());

        let mut ok = true;
        if mode != dir.mode {
            ok = false;
            report.fail(
                CHECK_DIRS,
                format!(
                    "{} has mode {mode:04o}, expected {:04o} ({})\n  fix: sudo chmod {:04o} {}",
                    dir.path, dir.mode, dir.description, dir.mode, dir.path
                ),
            );
        }
        if owner != dir.owner {
            ok = false;
            report.fail(
                CHECK_DIRS,
                format!(
                    "{} has owner {owner}, expected {} ({})\n  fix: sudo chown {}:{group} {}",
                    dir.path, dir.owner, dir.description, dir.owner, dir.path
                ),
            );
        }
        if group != dir.group {
            ok = false;
            report.fail(
                CHECK_DIRS,
                format!(
                    "{} has group {group}, expected {} ({})\n  fix: sudo chown {owner}:{} {}",
                    dir.path, dir.group, dir.description, dir.group, dir.path
                ),
            );
        }
        if ok {
            report.pass(
                CHECK_DIRS,
                format!("{}: {mode:04o} {owner}:{group}", dir.path),
            );
        }
    }
}

#[cfg(test)]
#[path = "permissions_tests.rs"]
mod tests;
