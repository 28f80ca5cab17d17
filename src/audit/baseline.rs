//! Account, mount and file-permission baselines.
//!
//! `generate` snapshots the security-relevant static state of an image into
//! JSON; `validate` diffs a later image against that snapshot. Only state
//! that is stable across boots is captured: dynamic resources (ports,
//! processes, services) belong to the health checks.
use super::fail2ban::{FILTER_CONFIG, JAIL_CONFIG};
use super::permissions::{AccountDb, EXPECTED_DIRECTORIES};
use super::{rooted, AuditReport};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

pub const BASELINE_SCHEMA_VERSION: u32 = 1;

const CHECK_USERS: &str = "users";
const CHECK_GROUPS: &str = "groups";
const CHECK_MOUNTS: &str = "mounts";
const CHECK_FILES: &str = "files";

/// Mount options that vary with instance size.
const INSTANCE_OPTION_PREFIXES: &[&str] = &["size=", "nr_inodes=", "nr_blocks="];

/// Filesystems whose source is a label rather than a device.
const VIRTUAL_FILESYSTEMS: &[&str] = &[
    "tmpfs",
    "devtmpfs",
    "sysfs",
    "proc",
    "devpts",
    "cgroup",
    "cgroup2",
    "securityfs",
    "debugfs",
    "hugetlbfs",
    "mqueue",
    "binfmt_misc",
    "configfs",
    "fusectl",
    "tracefs",
    "pstore",
    "efivarfs",
    "bpf",
];

/// Block device names that change between instance types.
const INSTANCE_DEVICE_PREFIXES: &[&str] = &["/dev/nvme", "/dev/xvd", "/dev/sd"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub schema_version: u32,
    #[serde(default)]
    pub users: BTreeMap<String, UserSpec>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupSpec>,
    #[serde(default)]
    pub mounts: BTreeMap<String, MountSpec>,
    #[serde(default)]
    pub files: BTreeMap<String, FileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub uid: u32,
    pub gid: u32,
    /// Sorted; includes the primary group.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub filesystem: String,
    #[serde(default)]
    pub opts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub filetype: FileType,
    /// Octal permission bits, e.g. `0750`.
    pub mode: String,
    pub owner: String,
    pub group: String,
}

/// Paths captured when the caller names none.
pub fn default_paths() -> Vec<String> {
    let mut paths: Vec<String> = EXPECTED_DIRECTORIES
        .iter()
        .map(|dir| dir.path.to_string())
        .collect();
    paths.extend(
        ["/etc/passwd", "/etc/group", JAIL_CONFIG, FILTER_CONFIG]
            .iter()
            .map(|path| path.to_string()),
    );
    paths
}

/// Snapshot the image under `root`. Paths that do not exist are left out.
pub fn generate(root: &Path, paths: &[String]) -> Result<Baseline> {
    let db = AccountDb::load(root)?;
    let users = db
        .users
        .iter()
        .map(|user| {
            let spec = UserSpec {
                uid: user.uid,
                gid: user.gid,
                groups: db.groups_of(&user.name).unwrap_or_default(),
                home: user.home.clone(),
                shell: user.shell.clone(),
            };
            (user.name.clone(), spec)
        })
        .collect();
    let groups = db
        .groups
        .iter()
        .map(|group| (group.name.clone(), GroupSpec { gid: group.gid }))
        .collect();

    let mounts = match read_mount_table(root)? {
        Some(text) => parse_mounts(&text),
        None => BTreeMap::new(),
    };

    let mut files = BTreeMap::new();
    for path in paths {
        match file_spec(root, path, &db) {
            Ok(spec) => {
                files.insert(path.clone(), spec);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path, "not present, left out of baseline");
            }
            Err(err) => return Err(err).with_context(|| format!("stat {path}")),
        }
    }

    let baseline = Baseline {
        schema_version: BASELINE_SCHEMA_VERSION,
        users,
        groups,
        mounts,
        files,
    };
    tracing::info!(
        users = baseline.users.len(),
        groups = baseline.groups.len(),
        mounts = baseline.mounts.len(),
        files = baseline.files.len(),
        "baseline generated"
    );
    Ok(baseline)
}

pub fn load(path: &Path) -> Result<Baseline> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let baseline: Baseline =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if baseline.schema_version != BASELINE_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported baseline schema_version {} (expected {BASELINE_SCHEMA_VERSION})",
            baseline.schema_version
        ));
    }
    Ok(baseline)
}

/// Compare the image under `root` with `expected`.
///
/// Missing or changed resources fail. Users and groups absent from the
/// baseline only warn.
pub fn validate(root: &Path, expected: &Baseline) -> Result<AuditReport> {
    let paths: Vec<String> = expected.files.keys().cloned().collect();
    let actual = generate(root, &paths)?;
    let mut report = AuditReport::default();

    compare(CHECK_USERS, "user", &expected.users, &actual.users, &mut report);
    compare(CHECK_GROUPS, "group", &expected.groups, &actual.groups, &mut report);
    if !expected.mounts.is_empty() && read_mount_table(root)?.is_none() {
        report.warn(CHECK_MOUNTS, "/proc/mounts is unavailable, skipping mount comparison");
    } else {
        compare_expected(CHECK_MOUNTS, "mount", &expected.mounts, &actual.mounts, &mut report);
    }
    compare_expected(CHECK_FILES, "file", &expected.files, &actual.files, &mut report);
    Ok(report)
}

/// Like [`compare_expected`], plus a warning for every unexpected entry.
fn compare<T: PartialEq + std::fmt::Debug>(
    check: &str,
    kind: &str,
    expected: &BTreeMap<String, T>,
    actual: &BTreeMap<String, T>,
    report: &mut AuditReport,
) {
    compare_expected(check, kind, expected, actual, report);
    for name in actual.keys().filter(|name| !expected.contains_key(*name)) {
        report.warn(check, format!("{kind} {name} is not in the baseline"));
    }
}

fn compare_expected<T: PartialEq + std::fmt::Debug>(
    check: &str,
    kind: &str,
    expected: &BTreeMap<String, T>,
    actual: &BTreeMap<String, T>,
    report: &mut AuditReport,
) {
    let mut matched = 0;
    for (name, want) in expected {
        match actual.get(name) {
            None => report.fail(check, format!("{kind} {name} is missing")),
            Some(got) if got != want => report.fail(
                check,
                format!("{kind} {name} changed\n  expected: {want:?}\n  found:    {got:?}"),
            ),
            Some(_) => matched += 1,
        }
    }
    if matched > 0 {
        report.pass(check, format!("{matched} {kind}(s) match the baseline"));
    }
}

fn read_mount_table(root: &Path) -> Result<Option<String>> {
    let path = rooted(root, "/proc/mounts");
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no mount table");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Parse `/proc/mounts`, dropping options and sources that differ between
/// otherwise identical instances.
pub fn parse_mounts(text: &str) -> BTreeMap<String, MountSpec> {
    let mut mounts = BTreeMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [device, mountpoint, filesystem, options, ..] = fields[..] else {
            tracing::debug!(line, "skipping malformed mount line");
            continue;
        };
        let opts = options
            .split(',')
            .filter(|opt| {
                !opt.is_empty()
                    && !INSTANCE_OPTION_PREFIXES
                        .iter()
                        .any(|prefix| opt.starts_with(prefix))
            })
            .map(str::to_string)
            .collect();
        let instance_specific = VIRTUAL_FILESYSTEMS.contains(&filesystem)
            || INSTANCE_DEVICE_PREFIXES
                .iter()
                .any(|prefix| device.starts_with(prefix));
        mounts.insert(
            mountpoint.to_string(),
            MountSpec {
                filesystem: filesystem.to_string(),
                opts,
                source: (!instance_specific).then(|| device.to_string()),
            },
        );
    }
    mounts
}

fn file_spec(root: &Path, path: &str, db: &AccountDb) -> io::Result<FileSpec> {
    let meta = fs::symlink_metadata(rooted(root, path))?;
    let file_type = meta.file_type();
    let filetype = if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_file() {
        FileType::File
    } else {
        FileType::Other
    };
    Ok(FileSpec {
        filetype,
        mode: format!("{:04o}", meta.mode() & 0o7777),
        owner: db.user_name(meta.uid()),
        group: db.group_name(meta.gid()),
    })
}

#[cfg(test)]
#[path = "baseline_tests.rs"]
mod tests;
