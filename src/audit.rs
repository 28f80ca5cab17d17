//! Image posture audits.
//!
//! Each audit fills an [`AuditReport`]; the command layer prints it and
//! turns any failure into a non-zero exit.
pub mod baseline;
pub mod fail2ban;
pub mod permissions;

use anyhow::{anyhow, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub check: String,
    pub outcome: Outcome,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn pass(&mut self, check: &str, message: impl Into<String>) {
        self.push(check, Outcome::Pass, message.into());
    }

    pub fn warn(&mut self, check: &str, message: impl Into<String>) {
        self.push(check, Outcome::Warn, message.into());
    }

    pub fn fail(&mut self, check: &str, message: impl Into<String>) {
        self.push(check, Outcome::Fail, message.into());
    }

    fn push(&mut self, check: &str, outcome: Outcome, message: String) {
        match outcome {
            Outcome::Pass => tracing::debug!(check, "{message}"),
            Outcome::Warn => tracing::warn!(check, "{message}"),
            Outcome::Fail => tracing::error!(check, "{message}"),
        }
        self.findings.push(Finding {
            check: check.to_string(),
            outcome,
            message,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|finding| finding.outcome == Outcome::Fail)
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Human-readable rendering, one line per finding.
    pub fn render(&self, out: &mut impl Write) -> io::Result<()> {
        for finding in &self.findings {
            let marker = match finding.outcome {
                Outcome::Pass => "✓",
                Outcome::Warn => "!",
                Outcome::Fail => "✗",
            };
            writeln!(out, "{marker} [{}] {}", finding.check, finding.message)?;
        }
        Ok(())
    }

    /// Print the report to stdout and fail when any check failed.
    pub fn finish(self, audit: &str) -> Result<()> {
        let mut stdout = io::stdout().lock();
        self.render(&mut stdout)?;
        let failed = self.failures().count();
        if failed > 0 {
            return Err(anyhow!("{audit}: {failed} check(s) failed"));
        }
        writeln!(stdout, "{audit}: all checks passed")?;
        Ok(())
    }
}

/// Map an absolute image path under `root`.
pub(crate) fn rooted(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}
