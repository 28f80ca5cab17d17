//! Job descriptors as emitted by `nix-eval-jobs`.
//!
//! One line of evaluator output becomes one [`Job`]. Collections that the
//! evaluator omits default to empty, so a job with no requirements is valid.
use serde::{Deserialize, Serialize};

/// System feature requesting a virtualization-capable builder.
pub const VIRTUALIZATION_FEATURE: &str = "kvm";

/// System feature requesting a high-parallelism builder.
pub const LARGE_FEATURE: &str = "big-parallel";

const EXTENSIONS_SEGMENT: &str = "exts";
const POSTGRESQL_SEGMENT_PREFIX: &str = "psql_";

/// One buildable/testable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique key within a scheduling run (the derivation path).
    #[serde(rename = "drvPath")]
    pub id: String,
    pub name: String,
    /// Target platform, e.g. `aarch64-linux`.
    pub system: String,
    #[serde(default)]
    pub attr: String,
    #[serde(default)]
    pub attr_path: Vec<String>,
    #[serde(default)]
    pub cache_status: CacheStatus,
    /// Derivations that must be built before this one.
    #[serde(default, rename = "neededBuilds")]
    pub required_builds: Vec<String>,
    /// Paths fetched from the binary cache; informational only.
    #[serde(default, rename = "neededSubstitutes")]
    pub required_fetches: Vec<String>,
    #[serde(default, rename = "requiredSystemFeatures")]
    pub system_features: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheStatus {
    #[default]
    NotBuilt,
    Cached,
    Local,
}

impl CacheStatus {
    /// True when the output already exists and no CI build is needed.
    pub fn is_available(self) -> bool {
        matches!(self, CacheStatus::Cached | CacheStatus::Local)
    }
}

/// Architecture + OS pair parsed from a system string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform<'a> {
    pub arch: &'a str,
    pub os: &'a str,
}

impl<'a> Platform<'a> {
    pub fn parse(system: &'a str) -> Self {
        match system.split_once('-') {
            Some((arch, os)) => Platform { arch, os },
            None => Platform {
                arch: system,
                os: "",
            },
        }
    }
}

impl Job {
    pub fn platform(&self) -> Platform<'_> {
        Platform::parse(&self.system)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.system_features.iter().any(|value| value == feature)
    }
}

/// True when the attribute path names an extension (`... exts <name> ...`).
pub fn is_extension(job: &Job) -> bool {
    job.attr_path
        .iter()
        .position(|segment| segment == EXTENSIONS_SEGMENT)
        .is_some_and(|idx| idx + 1 < job.attr_path.len())
}

/// True when the job declares the big-parallelism feature.
///
/// Runner selection checks the same tag, so matrix annotation and runner
/// choice always agree.
pub fn is_large(job: &Job) -> bool {
    job.has_feature(LARGE_FEATURE)
}

pub fn is_virtualization(job: &Job) -> bool {
    job.has_feature(VIRTUALIZATION_FEATURE)
}

/// PostgreSQL flavor the job belongs to, from its first `psql_<ver>` segment.
pub fn postgresql_version(job: &Job) -> Option<&str> {
    job.attr_path.iter().find_map(|segment| {
        segment
            .strip_prefix(POSTGRESQL_SEGMENT_PREFIX)
            .filter(|version| !version.is_empty())
    })
}
