//! Feature backlog model.
//!
//! A [`Feature`] is one unit of backlog work. It becomes *ready* once every
//! dependency passes and nobody holds a claim on it; it is *done* once a
//! worker reported it passing.

use serde::{Deserialize, Serialize};

/// Stable feature identifier.
pub type FeatureId = i64;

/// Priority assigned to features created without one. Lower is more urgent.
pub const DEFAULT_PRIORITY: i64 = 999_999;

const fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// A unit of backlog work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<FeatureId>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub in_progress: bool,
}

impl Feature {
    /// Create a pending feature with default priority and no dependencies.
    pub fn new(id: FeatureId, name: impl Into<String>) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            category: String::new(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            dependencies: Vec::new(),
            passes: false,
            in_progress: false,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<FeatureId>) -> Self {
        self.dependencies = deps;
        self
    }

    #[must_use]
    pub const fn passing(mut self) -> Self {
        self.passes = true;
        self
    }

    #[must_use]
    pub const fn claimed(mut self) -> Self {
        self.in_progress = true;
        self
    }
}

/// Input for creating a feature. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeature {
    #[serde(default)]
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<FeatureId>,
}

impl NewFeature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            category: String::new(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            priority: DEFAULT_PRIORITY,
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<FeatureId>) -> Self {
        self.dependencies = deps;
        self
    }
}

/// Backlog-wide progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub passing: u64,
    pub in_progress: u64,
    pub total: u64,
}

impl FeatureStats {
    /// Tally counters from a feature snapshot.
    pub fn from_features(features: &[Feature]) -> Self {
        features.iter().fold(Self::default(), |mut acc, f| {
            acc.total += 1;
            if f.passes {
                acc.passing += 1;
            }
            if f.in_progress {
                acc.in_progress += 1;
            }
            acc
        })
    }

    /// Share of passing features, 0.0 to 100.0. An empty backlog reports 0.
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let raw = self.passing as f64 / self.total as f64 * 100.0;
        (raw * 10.0).round() / 10.0
    }

    /// True when the backlog is non-empty and every feature passes.
    pub const fn all_passing(&self) -> bool {
        self.total > 0 && self.passing == self.total
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn new_feature_defaults_to_sentinel_priority() {
        let f = Feature::new(1, "login");
        assert_eq!(f.priority, DEFAULT_PRIORITY);
        assert!(!f.passes);
        assert!(!f.in_progress);
    }

    #[test]
    fn new_feature_json_fills_defaults() {
        let nf: NewFeature = serde_json::from_str(r#"{"name":"signup"}"#).unwrap();
        assert_eq!(nf.priority, DEFAULT_PRIORITY);
        assert!(nf.dependencies.is_empty());
        assert!(nf.steps.is_empty());
    }

    #[test]
    fn stats_percentage() {
        let features = vec![
            Feature::new(1, "a").passing(),
            Feature::new(2, "b").claimed(),
            Feature::new(3, "c"),
        ];
        let stats = FeatureStats::from_features(&features);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passing, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.percentage(), 33.3);
        assert!(!stats.all_passing());
    }

    #[test]
    fn empty_backlog_is_not_all_passing() {
        let stats = FeatureStats::default();
        assert_eq!(stats.percentage(), 0.0);
        assert!(!stats.all_passing());
    }
}
