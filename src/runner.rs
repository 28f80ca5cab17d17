//! CI runner selection.
//!
//! Which runner a job lands on is a pure function of its features and
//! platform. The pools and labels live in [`RunnerTable`] so the precedence
//! in [`classify`] is the only logic to audit.
use crate::error::ScheduleError;
use crate::job::{Job, LARGE_FEATURE, VIRTUALIZATION_FEATURE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SELF_HOSTED_GROUP: &str = "self-hosted-runners-nix";
const DARWIN_OS: &str = "darwin";

/// Self-hosted pool selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerPool {
    pub group: String,
    pub labels: Vec<String>,
}

/// Execution environment for one matrix entry.
///
/// Serialized untagged so it can be dropped straight into `runs-on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunnerLabel {
    Pool(RunnerPool),
    Hosted { labels: Vec<String> },
}

impl RunnerLabel {
    fn hosted(label: String) -> Self {
        RunnerLabel::Hosted {
            labels: vec![label],
        }
    }
}

/// Hosted runner tier with per-architecture label suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedTier {
    pub label: String,
    #[serde(default)]
    pub arch_suffixes: BTreeMap<String, String>,
}

impl HostedTier {
    fn with_arm(label: &str) -> Self {
        HostedTier {
            label: label.to_string(),
            arch_suffixes: BTreeMap::from([("aarch64".to_string(), "-arm".to_string())]),
        }
    }

    pub fn label_for(&self, arch: &str) -> String {
        match self.arch_suffixes.get(arch) {
            Some(suffix) => format!("{}{}", self.label, suffix),
            None => self.label.clone(),
        }
    }
}

/// Lookup tables consulted by [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerTable {
    pub virtualization_feature: String,
    pub large_feature: String,
    /// Virtualization-capable pools keyed by system string.
    pub virtualization_pools: BTreeMap<String, RunnerPool>,
    pub darwin_group: String,
    pub large: HostedTier,
    pub standard: HostedTier,
}

impl Default for RunnerTable {
    fn default() -> Self {
        let pool = |system: &str| {
            (
                system.to_string(),
                RunnerPool {
                    group: SELF_HOSTED_GROUP.to_string(),
                    labels: vec![system.to_string()],
                },
            )
        };
        RunnerTable {
            virtualization_feature: VIRTUALIZATION_FEATURE.to_string(),
            large_feature: LARGE_FEATURE.to_string(),
            virtualization_pools: BTreeMap::from([pool("aarch64-linux"), pool("aarch64-darwin")]),
            darwin_group: SELF_HOSTED_GROUP.to_string(),
            large: HostedTier::with_arm("blacksmith-32vcpu-ubuntu-2404"),
            standard: HostedTier::with_arm("blacksmith-8vcpu-ubuntu-2404"),
        }
    }
}

/// Pick the runner for `job`.
///
/// Rules, first match wins:
/// 1. virtualization feature: the registered pool for the exact system, or
///    [`ScheduleError::UnsupportedPlatform`];
/// 2. darwin: the self-hosted pool labelled with the system string;
/// 3. large feature: the large hosted tier for the architecture;
/// 4. the standard hosted tier for the architecture.
pub fn classify(job: &Job, table: &RunnerTable) -> Result<RunnerLabel, ScheduleError> {
    let platform = job.platform();

    if job.has_feature(&table.virtualization_feature) {
        return table
            .virtualization_pools
            .get(&job.system)
            .cloned()
            .map(RunnerLabel::Pool)
            .ok_or_else(|| ScheduleError::UnsupportedPlatform {
                system: job.system.clone(),
            });
    }

    if platform.os == DARWIN_OS {
        return Ok(RunnerLabel::Pool(RunnerPool {
            group: table.darwin_group.clone(),
            labels: vec![job.system.clone()],
        }));
    }

    if job.has_feature(&table.large_feature) {
        return Ok(RunnerLabel::hosted(table.large.label_for(platform.arch)));
    }

    Ok(RunnerLabel::hosted(table.standard.label_for(platform.arch)))
}
