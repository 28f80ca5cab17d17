//! GitHub Actions matrix generation.
//!
//! Filters jobs that still need building, orders them by closure, and pairs
//! each with its runner. Any scheduling error aborts before output exists.
use crate::closure::closure_sort;
use crate::error::ScheduleError;
use crate::job::{self, Job};
use crate::runner::{classify, RunnerLabel, RunnerTable};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// One `include` row of the generated matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub attr: String,
    pub name: String,
    pub system: String,
    pub drv_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgresql_version: Option<String>,
    pub is_extension: bool,
    pub is_large: bool,
    pub runs_on: RunnerLabel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matrix {
    pub include: Vec<MatrixEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixOptions {
    pub include_cached: bool,
}

/// Build the matrix for `jobs`.
pub fn build_matrix(
    jobs: Vec<Job>,
    table: &RunnerTable,
    options: MatrixOptions,
) -> Result<Matrix, ScheduleError> {
    let total = jobs.len();
    let pending: Vec<Job> = jobs
        .into_iter()
        .filter(|job| options.include_cached || !job.cache_status.is_available())
        .collect();
    tracing::info!(
        total,
        pending = pending.len(),
        skipped = total - pending.len(),
        virtualization = pending.iter().filter(|job| job::is_virtualization(job)).count(),
        "jobs selected for matrix"
    );

    let include = closure_sort(pending)?
        .into_iter()
        .map(|job| entry_for(job, table))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Matrix { include })
}

fn entry_for(job: Job, table: &RunnerTable) -> Result<MatrixEntry, ScheduleError> {
    let runs_on = classify(&job, table)?;
    Ok(MatrixEntry {
        postgresql_version: job::postgresql_version(&job).map(str::to_string),
        is_extension: job::is_extension(&job),
        is_large: job::is_large(&job),
        runs_on,
        attr: job.attr,
        name: job.name,
        system: job.system,
        drv_path: job.id,
    })
}

/// Append `matrix=<compact json>` to the GitHub step output file.
pub fn append_github_output(path: &Path, matrix: &Matrix) -> Result<()> {
    let json = serde_json::to_string(matrix).context("serialize matrix")?;
    if json.contains('\n') {
        return Err(anyhow!("compact matrix JSON contains a newline"));
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "matrix={json}").with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
