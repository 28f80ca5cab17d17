use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod audit;
mod cli;
mod closure;
mod commands;
mod config;
mod error;
mod eval;
mod ext_upgrade;
mod health;
mod job;
mod matrix;
mod runner;

use cli::{Command, RootArgs};

const LOG_ENV: &str = "AMI_CI_LOG";

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = RootArgs::parse();
    init_tracing(args.verbose);
    let config = config::load_config(args.config.as_deref())?;

    match args.command {
        Command::Matrix(matrix) => commands::run_matrix(matrix, &config),
        Command::AuditPermissions(audit) => commands::run_audit_permissions(audit),
        Command::AuditFail2ban(audit) => commands::run_audit_fail2ban(audit),
        Command::Baseline(baseline) => commands::run_baseline(baseline),
        Command::AuditBaseline(audit) => commands::run_audit_baseline(audit),
        Command::ExtUpgrade(upgrade) => commands::run_ext_upgrade(upgrade),
        Command::Health(health) => commands::run_health(health, &config),
        Command::Config => commands::run_config(&config),
    }
}
