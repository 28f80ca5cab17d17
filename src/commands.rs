use crate::audit::{baseline, fail2ban, permissions};
use crate::cli::{
    AuditBaselineArgs, AuditFail2banArgs, AuditPermissionsArgs, BaselineArgs, ExtUpgradeArgs,
    HealthArgs, MatrixArgs,
};
use crate::config::{render_config, Config};
use crate::eval::{read_jobs_from_path, run_eval, EvalRequest};
use crate::ext_upgrade::{
    check_pg_regress, load_versions, ExtensionHarness, LocalHost, PsqlSession, RegressOutcome,
    RegressTest,
};
use crate::health::wait_until_healthy;
use crate::matrix::{append_github_output, build_matrix, MatrixOptions};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;

const GITHUB_OUTPUT_ENV: &str = "GITHUB_OUTPUT";

pub fn run_matrix(args: MatrixArgs, config: &Config) -> Result<()> {
    // Resolve the step output target before evaluating so a missing
    // variable fails fast.
    let github_output = if args.github_output {
        let path = std::env::var_os(GITHUB_OUTPUT_ENV)
            .ok_or_else(|| anyhow!("--github-output needs ${GITHUB_OUTPUT_ENV} to be set"))?;
        Some(PathBuf::from(path))
    } else {
        None
    };

    let evaluated = match &args.input {
        Some(path) => read_jobs_from_path(path)?,
        None => run_eval(&EvalRequest {
            flake: &args.flake,
            workers: args.workers,
            command: args.eval_command.as_deref(),
        })?,
    };
    if evaluated.duplicates > 0 {
        tracing::info!(duplicates = evaluated.duplicates, "dropped duplicate derivations");
    }

    let matrix = build_matrix(
        evaluated.jobs,
        &config.runners,
        MatrixOptions {
            include_cached: args.include_cached,
        },
    )?;
    let pretty = serde_json::to_string_pretty(&matrix).context("serialize matrix")?;
    match &args.out {
        Some(path) => {
            fs::write(path, format!("{pretty}\n"))
                .with_context(|| format!("write {}", path.display()))?;
            tracing::info!(path = %path.display(), entries = matrix.include.len(), "wrote matrix");
        }
        None => println!("{pretty}"),
    }
    if let Some(path) = github_output {
        append_github_output(&path, &matrix)?;
    }
    Ok(())
}

pub fn run_audit_permissions(args: AuditPermissionsArgs) -> Result<()> {
    let report = permissions::audit(&args.root, args.qemu)?;
    report.finish("permission audit")
}

pub fn run_audit_fail2ban(args: AuditFail2banArgs) -> Result<()> {
    let tools = fail2ban::Fail2banTools::locate()?;
    let report = fail2ban::audit(&args.root, args.skip_runtime, &tools)?;
    report.finish("fail2ban audit")
}

pub fn run_baseline(args: BaselineArgs) -> Result<()> {
    let paths = if args.paths.is_empty() {
        baseline::default_paths()
    } else {
        args.paths
    };
    if let Some(relative) = paths.iter().find(|path| !path.starts_with('/')) {
        return Err(anyhow!("--path {relative}: expected an absolute path"));
    }
    let snapshot = baseline::generate(&args.root, &paths)?;
    let pretty = serde_json::to_string_pretty(&snapshot).context("serialize baseline")?;
    match &args.out {
        Some(path) => {
            fs::write(path, format!("{pretty}\n"))
                .with_context(|| format!("write {}", path.display()))?;
            tracing::info!(path = %path.display(), "wrote baseline");
        }
        None => println!("{pretty}"),
    }
    Ok(())
}

pub fn run_audit_baseline(args: AuditBaselineArgs) -> Result<()> {
    let expected = baseline::load(&args.baseline)?;
    let report = baseline::validate(&args.root, &expected)?;
    report.finish("baseline audit")
}

pub fn run_ext_upgrade(args: ExtUpgradeArgs) -> Result<()> {
    let versions = load_versions(&args.versions)?;
    let session = PsqlSession::new(&args.psql)?;
    let mut harness = ExtensionHarness::new(session, &args.extension, versions, !args.reinstall)?;
    if args.last_only {
        let version = harness.check_install_last_version(&args.pg_version)?;
        println!("{}: installed {version} on PostgreSQL {}", args.extension, args.pg_version);
    } else {
        let walked = harness.check_upgrade_path(&args.pg_version)?;
        println!(
            "{}: verified {} on PostgreSQL {}",
            args.extension,
            walked.join(" -> "),
            args.pg_version
        );
    }

    let mut host = LocalHost;
    if let (Some(pg_regress), Some(sql_dir)) = (args.pg_regress, args.sql_dir) {
        let regress = RegressTest {
            pg_regress,
            sql_dir,
            test_name: args.regress_test.unwrap_or_else(|| args.extension.clone()),
            run_as: shell_words::split(&args.regress_as)
                .with_context(|| format!("parse --regress-as {}", args.regress_as))?,
        };
        match check_pg_regress(&mut host, &regress, &args.pg_version)? {
            RegressOutcome::Passed { test } => {
                println!("{}: pg_regress {test} passed", args.extension)
            }
            RegressOutcome::Skipped => println!(
                "{}: no pg_regress test for PostgreSQL {}, skipped",
                args.extension, args.pg_version
            ),
        }
    }
    if let Some(lib) = &args.switch_lib {
        let visited = harness.check_switch_version(&mut host, lib, &args.pg_version)?;
        println!("{}: switched library {}", args.extension, visited.join(" -> "));
    }
    Ok(())
}

pub fn run_health(args: HealthArgs, config: &Config) -> Result<()> {
    let mut health = config.health.clone();
    for service in &args.skip {
        if !health.checks.iter().any(|check| check.service() == service) {
            return Err(anyhow!("--skip {service}: no such configured service"));
        }
    }
    health
        .checks
        .retain(|check| !args.skip.iter().any(|skip| skip == check.service()));
    if args.no_marker {
        health.marker = None;
    }
    let report = wait_until_healthy(&health)?;
    println!(
        "healthy after {} round(s): {}",
        report.rounds,
        report.services.join(", ")
    );
    Ok(())
}

pub fn run_config(config: &Config) -> Result<()> {
    println!("{}", render_config(config)?);
    Ok(())
}
