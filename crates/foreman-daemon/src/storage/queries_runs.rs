//! Test-run history queries. Rows are appended once and never updated.

use foreman_core::FeatureId;
use foreman_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{NewTestRun, TestRun, TestRunRow};

/// Upper bound for a single history listing.
pub const MAX_TEST_RUNS: i64 = 1_000;

impl Database {
    /// Append test runs for one agent completion in a single transaction.
    pub async fn record_test_runs(&self, runs: &[NewTestRun]) -> Result<(), DatabaseError> {
        if runs.is_empty() {
            return Ok(());
        }
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        for run in runs {
            sqlx::query(
                r"
                INSERT INTO test_runs
                    (feature_id, passes, worker_class, agent_id, note, completed_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(run.feature_id)
            .bind(i64::from(run.passes))
            .bind(run.worker_class.as_str())
            .bind(&run.agent_id)
            .bind(run.note.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent test runs first, optionally for one feature.
    pub async fn list_test_runs(
        &self,
        feature_id: Option<FeatureId>,
        limit: i64,
    ) -> Result<Vec<TestRun>, DatabaseError> {
        let limit = limit.clamp(1, MAX_TEST_RUNS);
        let rows = if let Some(feature_id) = feature_id {
            sqlx::query_as::<_, TestRunRow>(
                "SELECT * FROM test_runs WHERE feature_id = ? ORDER BY completed_at DESC, id DESC LIMIT ?",
            )
            .bind(feature_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, TestRunRow>(
                "SELECT * FROM test_runs ORDER BY completed_at DESC, id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };

        rows.into_iter().map(TestRun::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use foreman_core::{NewFeature, WorkerClass};

    use super::*;

    fn run(feature_id: FeatureId, passes: bool, class: WorkerClass) -> NewTestRun {
        NewTestRun {
            feature_id,
            passes,
            worker_class: class,
            agent_id: "agent-1".to_string(),
            note: None,
        }
    }

    #[tokio::test]
    async fn records_and_filters_history() {
        let db = Database::open_in_memory().await.unwrap();
        let ids = db
            .create_features(&[NewFeature::new("a"), NewFeature::new("b")])
            .await
            .unwrap();

        db.record_test_runs(&[
            run(ids[0], true, WorkerClass::Primary),
            run(ids[1], false, WorkerClass::Primary),
        ])
        .await
        .unwrap();
        db.record_test_runs(&[run(ids[0], false, WorkerClass::Verification)])
            .await
            .unwrap();

        let all = db.list_test_runs(None, 50).await.unwrap();
        assert_eq!(all.len(), 3);

        let for_a = db.list_test_runs(Some(ids[0]), 50).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].worker_class, WorkerClass::Verification);
        assert!(!for_a[0].passes);

        assert_eq!(db.list_test_runs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_record_is_a_no_op() {
        let db = Database::open_in_memory().await.unwrap();
        db.record_test_runs(&[]).await.unwrap();
        assert!(db.list_test_runs(None, 10).await.unwrap().is_empty());
    }
}
