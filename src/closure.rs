//! Build ordering by dependency closure.
//!
//! Jobs are placed in an index arena and sorted with Kahn's algorithm over
//! `required_builds`. The ready set is a min-heap keyed by input position, so
//! jobs with no ordering constraint between them keep their input order as
//! far as the dependency graph allows.
use crate::error::ScheduleError;
use crate::job::Job;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Reorder `jobs` so every prerequisite precedes its dependents.
///
/// Prerequisites that are not part of `jobs` are treated as already
/// satisfied (cached or built elsewhere).
pub fn closure_sort(jobs: Vec<Job>) -> Result<Vec<Job>, ScheduleError> {
    let order = closure_order(&jobs)?;
    let mut slots: Vec<Option<Job>> = jobs.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect())
}

/// Input indices of `jobs` in build order.
pub fn closure_order(jobs: &[Job]) -> Result<Vec<usize>, ScheduleError> {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(jobs.len());
    for (idx, job) in jobs.iter().enumerate() {
        index_of.entry(job.id.as_str()).or_insert(idx);
    }

    let mut in_degree: Vec<usize> = vec![0; jobs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
    for (idx, job) in jobs.iter().enumerate() {
        let mut prereqs: Vec<usize> = job
            .required_builds
            .iter()
            .filter_map(|id| index_of.get(id.as_str()).copied())
            .collect();
        prereqs.sort_unstable();
        prereqs.dedup();
        in_degree[idx] = prereqs.len();
        for prereq in prereqs {
            dependents[prereq].push(idx);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut order = Vec::with_capacity(jobs.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() < jobs.len() {
        let jobs = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(idx, _)| jobs[idx].id.clone())
            .collect();
        return Err(ScheduleError::CyclicDependency { jobs });
    }

    tracing::debug!(jobs = order.len(), "closure order computed");
    Ok(order)
}

#[cfg(test)]
#[path = "closure_tests.rs"]
mod tests;
