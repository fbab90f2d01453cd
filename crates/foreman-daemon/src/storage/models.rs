//! Database models for the feature store.

use serde::{Deserialize, Serialize};

use foreman_core::{Feature, FeatureId, WorkerClass};

use super::db::DatabaseError;

/// Feature record as stored. `steps` and `dependencies` are JSON arrays.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureRow {
    pub id: i64,
    pub priority: i64,
    pub category: String,
    pub name: String,
    pub description: String,
    pub steps: String,
    pub dependencies: String,
    pub passes: i64,
    pub in_progress: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<FeatureRow> for Feature {
    type Error = DatabaseError;

    fn try_from(row: FeatureRow) -> Result<Self, Self::Error> {
        let steps: Vec<String> = serde_json::from_str(&row.steps)
            .map_err(|e| DatabaseError::Corrupt(format!("feature {} steps: {e}", row.id)))?;
        let dependencies: Vec<FeatureId> = serde_json::from_str(&row.dependencies)
            .map_err(|e| DatabaseError::Corrupt(format!("feature {} dependencies: {e}", row.id)))?;

        Ok(Self {
            id: row.id,
            priority: row.priority,
            category: row.category,
            name: row.name,
            description: row.description,
            steps,
            dependencies,
            passes: row.passes != 0,
            in_progress: row.in_progress != 0,
        })
    }
}

/// Test-run record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TestRunRow {
    pub id: i64,
    pub feature_id: i64,
    pub passes: i64,
    pub worker_class: String,
    pub agent_id: String,
    pub note: Option<String>,
    pub completed_at: i64,
}

/// One completed check of a feature by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: i64,
    pub feature_id: FeatureId,
    pub passes: bool,
    pub worker_class: WorkerClass,
    pub agent_id: String,
    pub note: Option<String>,
    pub completed_at: i64,
}

impl TryFrom<TestRunRow> for TestRun {
    type Error = DatabaseError;

    fn try_from(row: TestRunRow) -> Result<Self, Self::Error> {
        let worker_class = row
            .worker_class
            .parse()
            .map_err(|e| DatabaseError::Corrupt(format!("test run {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            feature_id: row.feature_id,
            passes: row.passes != 0,
            worker_class,
            agent_id: row.agent_id,
            note: row.note,
            completed_at: row.completed_at,
        })
    }
}

/// Input for appending a test run.
#[derive(Debug, Clone)]
pub struct NewTestRun {
    pub feature_id: FeatureId,
    pub passes: bool,
    pub worker_class: WorkerClass,
    pub agent_id: String,
    pub note: Option<String>,
}
