//! Errors raised by matrix scheduling.
//!
//! Both variants are configuration errors: a bad matrix must never reach
//! the build step, so callers abort instead of retrying.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("No self-hosted with kvm support available for system: {system}")]
    UnsupportedPlatform { system: String },

    /// `jobs` holds every job that could not be placed: the cycle members and
    /// anything that depends on them.
    #[error(
        "{} jobs unresolved by a dependency cycle (members and their dependents): {}",
        jobs.len(),
        jobs.join(", ")
    )]
    CyclicDependency { jobs: Vec<String> },
}
