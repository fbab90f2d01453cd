//! Feature store queries.
//!
//! Every mutation of `in_progress`/`passes` goes through the claim, release
//! and mark operations here. A claim is a compare-and-set: it flips
//! `in_progress` for the whole batch or for none of it.

use foreman_core::db::unix_timestamp;
use foreman_core::{Feature, FeatureId, FeatureStats, NewFeature};
use tracing::{debug, info};

use super::db::{Database, DatabaseError};
use super::models::FeatureRow;

const SELECT_FEATURES: &str = "SELECT * FROM features";

impl Database {
    // =========================================================================
    // Intake
    // =========================================================================

    /// Create a single feature and return it.
    pub async fn create_feature(&self, new: &NewFeature) -> Result<Feature, DatabaseError> {
        let ids = self.create_features(std::slice::from_ref(new)).await?;
        let id = ids
            .first()
            .copied()
            .ok_or_else(|| DatabaseError::Query("insert returned no id".to_string()))?;
        self.get_feature(id).await
    }

    /// Create features in one transaction, returning the assigned ids in
    /// input order.
    pub async fn create_features(
        &self,
        features: &[NewFeature],
    ) -> Result<Vec<FeatureId>, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        let mut ids = Vec::with_capacity(features.len());

        for new in features {
            let mut deps = new.dependencies.clone();
            deps.sort_unstable();
            deps.dedup();
            let steps = serde_json::to_string(&new.steps)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            let deps = serde_json::to_string(&deps)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            let result = sqlx::query(
                r"
                INSERT INTO features
                    (priority, category, name, description, steps, dependencies,
                     created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(new.priority)
            .bind(&new.category)
            .bind(&new.name)
            .bind(&new.description)
            .bind(steps)
            .bind(deps)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        info!(count = ids.len(), "Features created");
        Ok(ids)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a feature by ID.
    pub async fn get_feature(&self, id: FeatureId) -> Result<Feature, DatabaseError> {
        let row = sqlx::query_as::<_, FeatureRow>("SELECT * FROM features WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Feature {id}")))?;
        row.try_into()
    }

    /// Snapshot of the whole backlog, most urgent first.
    pub async fn list_features(&self) -> Result<Vec<Feature>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeatureRow>(&format!(
            "{SELECT_FEATURES} ORDER BY priority ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Feature::try_from).collect()
    }

    /// Features that are neither passing nor claimed and whose dependencies
    /// all exist and pass, most urgent first.
    pub async fn list_ready(&self) -> Result<Vec<Feature>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeatureRow>(&format!(
            r"
            {SELECT_FEATURES} f
            WHERE f.passes = 0 AND f.in_progress = 0
              AND NOT EXISTS (
                SELECT 1 FROM json_each(f.dependencies) d
                LEFT JOIN features dep ON dep.id = d.value
                WHERE dep.id IS NULL OR dep.passes = 0
              )
            ORDER BY f.priority ASC, f.id ASC
            "
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Feature::try_from).collect()
    }

    /// Backlog counters.
    pub async fn feature_stats(&self) -> Result<FeatureStats, DatabaseError> {
        let (total, passing, in_progress): (i64, i64, i64) = sqlx::query_as(
            r"
            SELECT COUNT(*), COALESCE(SUM(passes), 0), COALESCE(SUM(in_progress), 0)
            FROM features
            ",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(FeatureStats {
            passing: u64::try_from(passing).unwrap_or_default(),
            in_progress: u64::try_from(in_progress).unwrap_or_default(),
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    // =========================================================================
    // Claim / release / complete
    // =========================================================================

    /// Atomically claim every feature in `ids`.
    ///
    /// Returns `false` (and changes nothing) if any feature is already
    /// claimed or does not exist. An empty batch claims nothing and returns
    /// `false`.
    pub async fn claim_batch(&self, ids: &[FeatureId]) -> Result<bool, DatabaseError> {
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() || unique.len() != ids.len() {
            return Ok(false);
        }

        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        for id in &unique {
            let result = sqlx::query(
                "UPDATE features SET in_progress = 1, updated_at = ? WHERE id = ? AND in_progress = 0",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                debug!(feature_id = id, "Claim lost");
                return Ok(false);
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Return features to pending without touching `passes`.
    pub async fn release(&self, ids: &[FeatureId]) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        let mut released = 0;
        for id in ids {
            released += sqlx::query(
                "UPDATE features SET in_progress = 0, updated_at = ? WHERE id = ? AND in_progress = 1",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(released)
    }

    /// Record a passing outcome and drop the claim.
    pub async fn mark_passed(&self, id: FeatureId) -> Result<(), DatabaseError> {
        self.set_outcome(id, true).await
    }

    /// Record a failing outcome and drop the claim. On a passing feature this
    /// is the explicit reset that reopens it.
    pub async fn mark_failed(&self, id: FeatureId) -> Result<(), DatabaseError> {
        self.set_outcome(id, false).await
    }

    async fn set_outcome(&self, id: FeatureId, passes: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE features SET passes = ?, in_progress = 0, updated_at = ? WHERE id = ?",
        )
        .bind(i64::from(passes))
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Feature {id}")));
        }
        Ok(())
    }

    /// Clear every claim. Only safe when no worker can own one, i.e. at
    /// startup.
    pub async fn release_all_claims(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE features SET in_progress = 0, updated_at = ? WHERE in_progress = 1",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
