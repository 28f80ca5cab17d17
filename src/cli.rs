//! CLI argument parsing for the CI helper.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Flake attribute set evaluated when no `--input` is given.
pub const DEFAULT_FLAKE: &str = ".#checks";

#[derive(Parser, Debug)]
#[command(
    name = "ami-ci",
    version,
    about = "CI matrix scheduling and image checks for the PostgreSQL AMI",
    after_help = "Examples:\n  nix-eval-jobs ... | ami-ci matrix --input - --github-output\n  ami-ci matrix --flake .#checks --workers 8 --out matrix.json\n  sudo ami-ci audit-permissions\n  ami-ci audit-fail2ban --root /mnt/image --skip-runtime\n  ami-ci baseline --root /mnt/image --out baseline.json\n  ami-ci audit-baseline baseline.json --root /mnt/next-image\n  ami-ci ext-upgrade --extension pg_graphql --versions versions.json --pg-version 15\n  ami-ci health --skip adminapi\n  ami-ci config > ~/.config/ami-ci/config.json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// JSON config file (overrides AMI_CI_CONFIG and the default location)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless AMI_CI_LOG/RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the GitHub Actions job matrix from evaluator output
    Matrix(MatrixArgs),
    /// Check users, groups, mounts and directory permissions on an image
    AuditPermissions(AuditPermissionsArgs),
    /// Check the fail2ban PostgreSQL jail and filter
    #[command(name = "audit-fail2ban")]
    AuditFail2ban(AuditFail2banArgs),
    /// Snapshot accounts, mounts and file permissions as a JSON baseline
    Baseline(BaselineArgs),
    /// Compare an image against a saved baseline
    AuditBaseline(AuditBaselineArgs),
    /// Verify extension install and upgrade paths through psql
    ExtUpgrade(ExtUpgradeArgs),
    /// Wait for first-boot init and poll service health
    Health(HealthArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Saved nix-eval-jobs output (JSON lines); `-` reads stdin
    #[arg(long, value_name = "PATH", conflicts_with_all = ["flake", "eval_command"])]
    pub input: Option<PathBuf>,

    /// Flake reference evaluated live
    #[arg(long, value_name = "REF", default_value = DEFAULT_FLAKE)]
    pub flake: String,

    /// Evaluator worker processes
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Full evaluator command line (shell words), replacing nix-eval-jobs
    #[arg(long, value_name = "CMD")]
    pub eval_command: Option<String>,

    /// Keep jobs already cached or present locally
    #[arg(long)]
    pub include_cached: bool,

    /// Write the matrix here instead of stdout
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,

    /// Also append `matrix=<json>` to the file named by $GITHUB_OUTPUT
    #[arg(long)]
    pub github_output: bool,
}

#[derive(Args, Debug)]
pub struct AuditPermissionsArgs {
    /// Image root to audit
    #[arg(long, value_name = "DIR", default_value = "/")]
    pub root: PathBuf,

    /// QEMU artifact: skip EC2-only accounts
    #[arg(long)]
    pub qemu: bool,
}

#[derive(Args, Debug)]
pub struct AuditFail2banArgs {
    /// Image root holding /etc/fail2ban and /var/log/postgresql
    #[arg(long, value_name = "DIR", default_value = "/")]
    pub root: PathBuf,

    /// Skip the running-jail status check
    #[arg(long)]
    pub skip_runtime: bool,
}

#[derive(Args, Debug)]
pub struct BaselineArgs {
    /// Image root to snapshot
    #[arg(long, value_name = "DIR", default_value = "/")]
    pub root: PathBuf,

    /// Absolute path to capture (repeatable) [default: the audited directories and account files]
    #[arg(long = "path", value_name = "PATH")]
    pub paths: Vec<String>,

    /// Write the baseline here instead of stdout
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AuditBaselineArgs {
    /// Baseline JSON written by `ami-ci baseline`
    #[arg(value_name = "BASELINE")]
    pub baseline: PathBuf,

    /// Image root to compare
    #[arg(long, value_name = "DIR", default_value = "/")]
    pub root: PathBuf,
}

#[derive(Args, Debug)]
pub struct ExtUpgradeArgs {
    /// Extension name
    #[arg(long, value_name = "NAME")]
    pub extension: String,

    /// JSON file mapping PostgreSQL version to extension versions
    #[arg(long, value_name = "PATH")]
    pub versions: PathBuf,

    /// PostgreSQL version key to test (e.g. 15, orioledb-17)
    #[arg(long, value_name = "VERSION")]
    pub pg_version: String,

    /// psql command line (shell words)
    #[arg(long, value_name = "CMD", default_value = crate::ext_upgrade::DEFAULT_PSQL)]
    pub psql: String,

    /// Drop and recreate between versions instead of ALTER ... UPDATE
    #[arg(long)]
    pub reinstall: bool,

    /// Only install the newest version
    #[arg(long, conflicts_with = "reinstall")]
    pub last_only: bool,

    /// pg_regress binary; runs the extension's regression suite afterwards
    #[arg(long, value_name = "PATH", requires = "sql_dir")]
    pub pg_regress: Option<PathBuf>,

    /// pg_regress input directory (holds sql/ and expected/)
    #[arg(long, value_name = "DIR", requires = "pg_regress")]
    pub sql_dir: Option<PathBuf>,

    /// Regression test name [default: the extension name]
    #[arg(long, value_name = "NAME")]
    pub regress_test: Option<String>,

    /// Command prefix for pg_regress (shell words)
    #[arg(long, value_name = "CMD", default_value = crate::ext_upgrade::DEFAULT_REGRESS_AS)]
    pub regress_as: String,

    /// Extension library symlink to flip with `switch_<ext>_version`
    #[arg(long, value_name = "PATH")]
    pub switch_lib: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Skip a configured service (repeatable)
    #[arg(long, value_name = "SERVICE")]
    pub skip: Vec<String>,

    /// Do not wait for the init completion marker
    #[arg(long)]
    pub no_marker: bool,
}
