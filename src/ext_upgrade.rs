//! Extension install/upgrade verification across a version matrix.
//!
//! The harness issues DDL through a [`SqlSession`] and reads
//! `pg_extension.extversion` back after every step. Checks that live outside
//! SQL (pg_regress suites, library version switching) go through
//! [`HostCommands`].
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_PSQL: &str = "sudo -u postgres psql";
pub const DEFAULT_REGRESS_AS: &str = "sudo -u postgres";

/// PostgreSQL major version to its extension versions, oldest first.
pub type VersionMatrix = BTreeMap<String, Vec<String>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("No versions available for PostgreSQL version {pg_version}")]
    NoVersions { pg_version: String },
    #[error("invalid extension name {0:?}")]
    InvalidExtensionName(String),
    #[error("invalid extension version {0:?}")]
    InvalidVersion(String),
    #[error("Expected version {expected}, but found {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("Expected {extension} version {expected}, but found {found}")]
    LibraryMismatch {
        extension: String,
        expected: String,
        found: String,
    },
}

/// One-shot SQL execution returning unaligned, tuples-only output.
pub trait SqlSession {
    fn query(&mut self, sql: &str) -> Result<String>;
}

/// Runs each query through a `psql`-compatible command line.
#[derive(Debug, Clone)]
pub struct PsqlSession {
    argv: Vec<String>,
}

impl PsqlSession {
    pub fn new(command: &str) -> Result<Self> {
        let argv =
            shell_words::split(command).with_context(|| format!("parse psql command {command}"))?;
        if argv.is_empty() {
            return Err(anyhow!("psql command is empty"));
        }
        Ok(Self { argv })
    }
}

impl SqlSession for PsqlSession {
    fn query(&mut self, sql: &str) -> Result<String> {
        let started = Instant::now();
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .args(["-t", "-A", "-F", ",", "-c", sql])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawn {}", self.argv[0]))?;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis(),
            status = %output.status,
            "{sql}"
        );
        if !output.status.success() {
            return Err(anyhow!(
                "query failed ({}): {sql}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Runs programs on the host under test.
pub trait HostCommands {
    /// Trimmed stdout; a non-zero exit is an error carrying stderr.
    fn run(&mut self, argv: &[String]) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl HostCommands for LocalHost {
    fn run(&mut self, argv: &[String]) -> Result<String> {
        let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
        let started = Instant::now();
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawn {program}"))?;
        tracing::debug!(
            program = %program,
            elapsed_ms = started.elapsed().as_millis(),
            status = %output.status,
            "host command finished"
        );
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                shell_words::join(argv),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// A pg_regress suite to run against the installed extension.
#[derive(Debug, Clone)]
pub struct RegressTest {
    pub pg_regress: PathBuf,
    /// Holds `sql/<test>.sql` and `expected/<test>.out`.
    pub sql_dir: PathBuf,
    pub test_name: String,
    /// Command prefix, e.g. `sudo -u postgres`.
    pub run_as: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegressOutcome {
    Passed { test: String },
    Skipped,
}

/// Run the suite, preferring `<test>.sql` over the version-specific
/// `z_<pg>_<test>.sql`. Missing both is a skip, not a failure.
pub fn check_pg_regress<H: HostCommands>(
    host: &mut H,
    regress: &RegressTest,
    pg_version: &str,
) -> Result<RegressOutcome> {
    let sql = regress.sql_dir.join("sql");
    let test = [
        regress.test_name.clone(),
        format!("z_{pg_version}_{}", regress.test_name),
    ]
    .into_iter()
    .find(|name| sql.join(format!("{name}.sql")).is_file());
    let Some(test) = test else {
        tracing::warn!(
            test = %regress.test_name,
            pg_version,
            "no pg_regress sql file found, skipping"
        );
        return Ok(RegressOutcome::Skipped);
    };

    let output_dir = format!("/tmp/regression_output_{pg_version}");
    let mut argv = regress.run_as.clone();
    argv.extend([
        regress.pg_regress.display().to_string(),
        format!("--inputdir={}", regress.sql_dir.display()),
        "--debug".to_string(),
        "--use-existing".to_string(),
        "--dbname=postgres".to_string(),
        format!("--outputdir={output_dir}"),
        test.clone(),
    ]);
    match host.run(&argv) {
        Ok(stdout) => {
            tracing::info!(test = %test, pg_version, "pg_regress passed");
            tracing::debug!("{stdout}");
            Ok(RegressOutcome::Passed { test })
        }
        Err(err) => {
            let diffs_path = format!("{output_dir}/regression.diffs");
            let diffs = host
                .run(&["cat".to_string(), diffs_path.clone()])
                .unwrap_or_else(|cat_err| format!("{diffs_path} unavailable: {cat_err:#}"));
            Err(anyhow!(
                "pg_regress {test} failed on PostgreSQL {pg_version}: {err:#}\n{diffs}"
            ))
        }
    }
}

pub fn load_versions(path: &Path) -> Result<VersionMatrix> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

pub struct ExtensionHarness<S> {
    session: S,
    extension: String,
    versions: VersionMatrix,
    support_upgrade: bool,
}

impl<S: SqlSession> ExtensionHarness<S> {
    /// Validates the extension name and every version before any SQL runs.
    pub fn new(
        session: S,
        extension: &str,
        versions: VersionMatrix,
        support_upgrade: bool,
    ) -> Result<Self> {
        let identifier = Regex::new(r"^[a-z_][a-z0-9_-]*$")?;
        if !identifier.is_match(extension) {
            return Err(UpgradeError::InvalidExtensionName(extension.to_string()).into());
        }
        let version_text = Regex::new(r#"^[^'"\\\s]+$"#)?;
        if let Some(bad) = versions
            .values()
            .flatten()
            .find(|version| !version_text.is_match(version))
        {
            return Err(UpgradeError::InvalidVersion(bad.clone()).into());
        }
        Ok(Self {
            session,
            extension: extension.to_string(),
            versions,
            support_upgrade,
        })
    }

    #[cfg(test)]
    pub fn into_session(self) -> S {
        self.session
    }

    fn available(&self, pg_version: &str) -> Result<&[String], UpgradeError> {
        match self.versions.get(pg_version) {
            Some(versions) if !versions.is_empty() => Ok(versions),
            _ => Err(UpgradeError::NoVersions {
                pg_version: pg_version.to_string(),
            }),
        }
    }

    pub fn drop_extension(&mut self) -> Result<()> {
        let sql = format!("DROP EXTENSION IF EXISTS \"{}\";", self.extension);
        self.session.query(&sql)?;
        Ok(())
    }

    pub fn install_extension(&mut self, version: &str) -> Result<()> {
        let sql = format!(
            "CREATE EXTENSION \"{}\" WITH VERSION '{version}' CASCADE;",
            self.extension
        );
        self.session.query(&sql)?;
        self.assert_version_matches(version)
    }

    pub fn update_extension(&mut self, version: &str) -> Result<()> {
        let sql = format!(
            "ALTER EXTENSION \"{}\" UPDATE TO '{version}';",
            self.extension
        );
        self.session.query(&sql)?;
        self.assert_version_matches(version)
    }

    /// Empty when the extension is not installed.
    pub fn installed_version(&mut self) -> Result<String> {
        let sql = format!(
            "SELECT extversion FROM pg_extension WHERE extname = '{}';",
            self.extension
        );
        self.session.query(&sql)
    }

    pub fn assert_version_matches(&mut self, expected: &str) -> Result<()> {
        let found = self.installed_version()?;
        if found != expected {
            return Err(UpgradeError::VersionMismatch {
                expected: expected.to_string(),
                found,
            }
            .into());
        }
        tracing::info!(extension = %self.extension, version = expected, "extension version verified");
        Ok(())
    }

    /// Install the first version, then walk every later one.
    pub fn check_upgrade_path(&mut self, pg_version: &str) -> Result<Vec<String>> {
        let versions = self.available(pg_version)?.to_vec();
        self.drop_extension()?;
        self.install_extension(&versions[0])?;
        for version in &versions[1..] {
            if self.support_upgrade {
                self.update_extension(version)?;
            } else {
                self.drop_extension()?;
                self.install_extension(version)?;
            }
        }
        Ok(versions)
    }

    pub fn check_install_last_version(&mut self, pg_version: &str) -> Result<String> {
        let last = self
            .available(pg_version)?
            .last()
            .cloned()
            .ok_or_else(|| UpgradeError::NoVersions {
                pg_version: pg_version.to_string(),
            })?;
        self.drop_extension()?;
        self.install_extension(&last)?;
        Ok(last)
    }

    /// Flip a background-worker extension's shared library to the first
    /// version and back with `switch_<ext>_version`, checking the resolved
    /// library after each step. Returns the versions visited.
    pub fn check_switch_version<H: HostCommands>(
        &self,
        host: &mut H,
        lib_path: &Path,
        pg_version: &str,
    ) -> Result<Vec<String>> {
        let versions = self.available(pg_version)?;
        let first = versions[0].clone();
        let last = versions.last().cloned().unwrap_or_else(|| first.clone());
        let switch = format!("switch_{}_version", self.extension);

        self.assert_library_matches(host, lib_path, &last)?;
        for version in [&first, &last] {
            host.run(&[switch.clone(), version.clone()])?;
            self.assert_library_matches(host, lib_path, version)?;
        }
        Ok(vec![last.clone(), first, last])
    }

    fn assert_library_matches<H: HostCommands>(
        &self,
        host: &mut H,
        lib_path: &Path,
        version: &str,
    ) -> Result<()> {
        let found = host.run(&[
            "readlink".to_string(),
            "-f".to_string(),
            lib_path.display().to_string(),
        ])?;
        if !found.ends_with(&format!("{version}.so")) {
            return Err(UpgradeError::LibraryMismatch {
                extension: self.extension.clone(),
                expected: version.to_string(),
                found,
            }
            .into());
        }
        tracing::info!(
            extension = %self.extension,
            version,
            library = %found,
            "library version verified"
        );
        Ok(())
    }
}
