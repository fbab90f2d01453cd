//! Readiness engine.
//!
//! Partitions a backlog snapshot into `ready`, `blocked`, `claimed` and
//! `done` features. Recomputed from scratch on every scheduling tick in
//! O(features + dependency edges).
//!
//! A dependency on an id that does not exist is never satisfied. Features
//! caught in a dependency cycle stay blocked forever; both cases are
//! reported as [`Diagnostic`]s instead of errors.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use foreman_core::{Feature, FeatureId};

/// Something that keeps part of the backlog from ever becoming ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// `feature` depends on ids that do not exist.
    UnknownDependency {
        feature: FeatureId,
        missing: Vec<FeatureId>,
    },
    /// These features sit on, or downstream of, a dependency cycle.
    Cycle { features: Vec<FeatureId> },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDependency { feature, missing } => {
                write!(f, "feature {feature} depends on unknown features {missing:?}")
            }
            Self::Cycle { features } => {
                write!(f, "features {features:?} are blocked by a dependency cycle")
            }
        }
    }
}

/// Partition of one backlog snapshot.
#[derive(Debug, Default)]
pub struct Partition<'a> {
    /// Pending features with every dependency passing, most urgent first.
    pub ready: Vec<&'a Feature>,
    /// Pending features with at least one unsatisfied dependency.
    pub blocked: Vec<&'a Feature>,
    /// Features currently owned by a batch (passing or not).
    pub claimed: Vec<&'a Feature>,
    /// Passing features nobody holds.
    pub done: Vec<&'a Feature>,
    pub diagnostics: Vec<Diagnostic>,
    passing: usize,
}

/// Feature ids per partition, as shown to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionIds {
    pub ready: Vec<FeatureId>,
    pub blocked: Vec<FeatureId>,
    pub claimed: Vec<FeatureId>,
    pub done: Vec<FeatureId>,
}

impl Partition<'_> {
    pub fn total(&self) -> usize {
        self.ready.len() + self.blocked.len() + self.claimed.len() + self.done.len()
    }

    /// True when the backlog is non-empty and every feature passes.
    pub fn all_passing(&self) -> bool {
        let total = self.total();
        total > 0 && self.passing == total
    }

    pub fn ids(&self) -> PartitionIds {
        fn ids(features: &[&Feature]) -> Vec<FeatureId> {
            features.iter().map(|f| f.id).collect()
        }
        PartitionIds {
            ready: ids(&self.ready),
            blocked: ids(&self.blocked),
            claimed: ids(&self.claimed),
            done: ids(&self.done),
        }
    }
}

/// Partition `features`.
pub fn partition(features: &[Feature]) -> Partition<'_> {
    let by_id: HashMap<FeatureId, &Feature> = features.iter().map(|f| (f.id, f)).collect();
    let mut out = Partition::default();

    for feature in features {
        if feature.passes {
            out.passing += 1;
        }

        let missing: Vec<FeatureId> = feature
            .dependencies
            .iter()
            .copied()
            .filter(|dep| !by_id.contains_key(dep))
            .collect();
        if !missing.is_empty() && !feature.passes {
            out.diagnostics.push(Diagnostic::UnknownDependency {
                feature: feature.id,
                missing,
            });
        }

        if feature.in_progress {
            out.claimed.push(feature);
        } else if feature.passes {
            out.done.push(feature);
        } else if dependencies_pass(feature, &by_id) {
            out.ready.push(feature);
        } else {
            out.blocked.push(feature);
        }
    }

    out.ready.sort_by_key(|f| (f.priority, f.id));

    let cyclic = cyclic_features(features, &by_id);
    if !cyclic.is_empty() {
        out.diagnostics.push(Diagnostic::Cycle { features: cyclic });
    }
    out
}

fn dependencies_pass(feature: &Feature, by_id: &HashMap<FeatureId, &Feature>) -> bool {
    feature
        .dependencies
        .iter()
        .all(|dep| by_id.get(dep).is_some_and(|d| d.passes))
}

/// Kahn's algorithm over the not-yet-passing features. Whatever never
/// reaches in-degree zero is on or behind a cycle.
fn cyclic_features(features: &[Feature], by_id: &HashMap<FeatureId, &Feature>) -> Vec<FeatureId> {
    let mut in_degree: HashMap<FeatureId, usize> = HashMap::new();
    let mut dependents: HashMap<FeatureId, Vec<FeatureId>> = HashMap::new();

    for feature in features.iter().filter(|f| !f.passes) {
        let mut degree = 0;
        for dep in &feature.dependencies {
            if by_id.get(dep).is_some_and(|d| !d.passes) {
                degree += 1;
                dependents.entry(*dep).or_default().push(feature.id);
            }
        }
        in_degree.insert(feature.id, degree);
    }

    let mut queue: VecDeque<FeatureId> = in_degree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    while let Some(id) = queue.pop_front() {
        for next in dependents.get(&id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    let mut stuck: Vec<FeatureId> = in_degree
        .into_iter()
        .filter(|&(_, d)| d > 0)
        .map(|(id, _)| id)
        .collect();
    stuck.sort_unstable();
    stuck
}
