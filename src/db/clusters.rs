//! Cluster store
//!
//! Persistence for clusters and chunk-cluster assignments. Reclustering
//! replaces the whole table atomically; label refreshes touch only the
//! name/description columns so carried-over identity survives.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{EngramError, Result};
use crate::math::angular_distance;
use crate::types::{Cluster, ClusterAssignment};

use super::{blob_to_vec, vec_to_blob};

type ClusterRow = (
    i64,                    // id
    Option<String>,         // name
    Option<String>,         // description
    Vec<u8>,                // centroid blob
    String,                 // exemplar_ids (JSON)
    String,                 // membership_hash
    Option<DateTime<Utc>>,  // refreshed_at
    DateTime<Utc>,          // created_at
);

const CLUSTER_COLUMNS: &str =
    "id, name, description, centroid, exemplar_ids, membership_hash, refreshed_at, created_at";

fn row_to_cluster(row: ClusterRow) -> Result<Cluster> {
    let exemplar_ids: Vec<String> = serde_json::from_str(&row.4)?;
    Ok(Cluster {
        id: row.0,
        name: row.1,
        description: row.2,
        centroid: blob_to_vec(&row.3),
        exemplar_ids,
        membership_hash: row.5,
        refreshed_at: row.6,
        created_at: row.7,
    })
}

/// Persistent store for clusters and their membership
#[derive(Clone)]
pub struct ClusterStore {
    pool: SqlitePool,
}

impl ClusterStore {
    /// Create a store, initializing the schema if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        super::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a cluster, returning its row id
    pub async fn insert(&self, cluster: &Cluster) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_in_tx(&mut tx, cluster).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Cluster>> {
        let row: Option<ClusterRow> =
            sqlx::query_as(&format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_cluster).transpose()
    }

    pub async fn all(&self) -> Result<Vec<Cluster>> {
        let rows: Vec<ClusterRow> =
            sqlx::query_as(&format!("SELECT {CLUSTER_COLUMNS} FROM clusters ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(row_to_cluster).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM clusters")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Update the human-readable label of a cluster (the external
    /// labeler's write path).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the cluster does not exist.
    pub async fn update_label(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE clusters SET name = ?, description = ?, refreshed_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(refreshed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngramError::not_found("cluster", id.to_string()));
        }
        Ok(())
    }

    /// Delete a cluster; membership rows cascade.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the cluster does not exist.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cluster_members WHERE cluster_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngramError::not_found("cluster", id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------------

    /// Record one chunk-cluster assignment
    pub async fn assign(&self, chunk_id: &str, cluster_id: i64, distance: f32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_members (chunk_id, cluster_id, distance)
            VALUES (?, ?, ?)
            ON CONFLICT(chunk_id, cluster_id) DO UPDATE SET distance = excluded.distance
            "#,
        )
        .bind(chunk_id)
        .bind(cluster_id)
        .bind(distance as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a batch of assignments in one transaction
    pub async fn assign_many(&self, assignments: &[ClusterAssignment]) -> Result<usize> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for a in assignments {
            sqlx::query(
                r#"
                INSERT INTO cluster_members (chunk_id, cluster_id, distance)
                VALUES (?, ?, ?)
                ON CONFLICT(chunk_id, cluster_id) DO UPDATE SET distance = excluded.distance
                "#,
            )
            .bind(&a.chunk_id)
            .bind(a.cluster_id)
            .bind(a.distance as f64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(assignments.len())
    }

    /// Drop every assignment of one cluster
    pub async fn clear_assignments(&self, cluster_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cluster_members WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Members of a cluster, closest first
    pub async fn members(&self, cluster_id: i64) -> Result<Vec<ClusterAssignment>> {
        let rows: Vec<(String, i64, f64)> = sqlx::query_as(
            "SELECT chunk_id, cluster_id, distance FROM cluster_members
             WHERE cluster_id = ? ORDER BY distance",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(chunk_id, cluster_id, distance)| ClusterAssignment {
                chunk_id,
                cluster_id,
                distance: distance as f32,
            })
            .collect())
    }

    /// Every cluster a chunk belongs to
    pub async fn assignments_for_chunk(&self, chunk_id: &str) -> Result<Vec<ClusterAssignment>> {
        let rows: Vec<(String, i64, f64)> = sqlx::query_as(
            "SELECT chunk_id, cluster_id, distance FROM cluster_members
             WHERE chunk_id = ? ORDER BY distance",
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(chunk_id, cluster_id, distance)| ClusterAssignment {
                chunk_id,
                cluster_id,
                distance: distance as f32,
            })
            .collect())
    }

    /// The clusters nearest an embedding, by angular distance to their
    /// centroids. Linear scan; the cluster table stays small.
    pub async fn find_by_centroid(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(Cluster, f32)>> {
        let mut scored = Vec::new();
        for cluster in self.all().await? {
            let distance = angular_distance(embedding, &cluster.centroid)?;
            scored.push((cluster, distance));
        }
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Atomically replace every cluster and assignment with a fresh set.
    /// Assignments carry per-batch indices into `clusters`; real row ids
    /// are assigned inside the transaction. Returns the new row ids.
    pub async fn replace_all(
        &self,
        clusters: &[Cluster],
        assignments: &[(usize, ClusterAssignment)],
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cluster_members").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM clusters").execute(&mut *tx).await?;

        let mut ids = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            ids.push(insert_in_tx(&mut tx, cluster).await?);
        }
        for (cluster_index, assignment) in assignments {
            let cluster_id = *ids.get(*cluster_index).ok_or_else(|| {
                EngramError::invalid(format!("assignment references cluster {cluster_index}"))
            })?;
            sqlx::query(
                "INSERT INTO cluster_members (chunk_id, cluster_id, distance) VALUES (?, ?, ?)
                 ON CONFLICT(chunk_id, cluster_id) DO UPDATE SET distance = excluded.distance",
            )
            .bind(&assignment.chunk_id)
            .bind(cluster_id)
            .bind(assignment.distance as f64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "replaced clusters: {} clusters, {} assignments",
            clusters.len(),
            assignments.len()
        );
        Ok(ids)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    cluster: &Cluster,
) -> Result<i64> {
    let exemplars = serde_json::to_string(&cluster.exemplar_ids)?;
    let result = sqlx::query(
        r#"
        INSERT INTO clusters (
            name, description, centroid, exemplar_ids,
            membership_hash, refreshed_at, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cluster.name)
    .bind(&cluster.description)
    .bind(vec_to_blob(&cluster.centroid))
    .bind(exemplars)
    .bind(&cluster.membership_hash)
    .bind(cluster.refreshed_at)
    .bind(cluster.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
pub(crate) fn test_cluster(name: Option<&str>, centroid: Vec<f32>) -> Cluster {
    Cluster {
        id: 0,
        name: name.map(String::from),
        description: None,
        centroid,
        exemplar_ids: Vec::new(),
        membership_hash: "hash".to_string(),
        refreshed_at: name.map(|_| Utc::now()),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let pool = memory_pool().await.unwrap();
        let store = ClusterStore::new(pool).await.unwrap();

        let mut cluster = test_cluster(Some("auth work"), vec![0.6, 0.8]);
        cluster.exemplar_ids = vec!["c1".into(), "c2".into()];
        let id = store.insert(&cluster).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("auth work"));
        assert_eq!(loaded.exemplar_ids, vec!["c1", "c2"]);
        assert!((loaded.centroid[0] - 0.6).abs() < 1e-6);

        assert!(store.get(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assignments() {
        let pool = memory_pool().await.unwrap();
        let store = ClusterStore::new(pool).await.unwrap();
        let id = store.insert(&test_cluster(None, vec![1.0, 0.0])).await.unwrap();

        store.assign("c1", id, 0.05).await.unwrap();
        store.assign("c2", id, 0.02).await.unwrap();
        // Re-assigning updates the distance instead of duplicating.
        store.assign("c1", id, 0.03).await.unwrap();

        let members = store.members(id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].chunk_id, "c2");

        let for_chunk = store.assignments_for_chunk("c1").await.unwrap();
        assert_eq!(for_chunk.len(), 1);
        assert!((for_chunk[0].distance - 0.03).abs() < 1e-6);

        assert_eq!(store.clear_assignments(id).await.unwrap(), 2);
        assert!(store.members(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_centroid() {
        let pool = memory_pool().await.unwrap();
        let store = ClusterStore::new(pool).await.unwrap();
        store.insert(&test_cluster(Some("x"), vec![1.0, 0.0])).await.unwrap();
        store.insert(&test_cluster(Some("y"), vec![0.0, 1.0])).await.unwrap();

        let found = store.find_by_centroid(&[0.9, 0.1], 1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.name.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_replace_all_atomic_swap() {
        let pool = memory_pool().await.unwrap();
        let store = ClusterStore::new(pool).await.unwrap();

        let old = store.insert(&test_cluster(Some("old"), vec![1.0, 0.0])).await.unwrap();
        store.assign("c1", old, 0.1).await.unwrap();

        let fresh = vec![
            test_cluster(Some("one"), vec![1.0, 0.0]),
            test_cluster(None, vec![0.0, 1.0]),
        ];
        let assignments = vec![
            (0, ClusterAssignment { chunk_id: "c1".into(), cluster_id: 0, distance: 0.02 }),
            (1, ClusterAssignment { chunk_id: "c2".into(), cluster_id: 0, distance: 0.04 }),
        ];
        let ids = store.replace_all(&fresh, &assignments).await.unwrap();
        assert_eq!(ids.len(), 2);

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.get(old).await.unwrap().is_none() || old == ids[0]);

        let members = store.members(ids[0]).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn test_update_label_and_delete() {
        let pool = memory_pool().await.unwrap();
        let store = ClusterStore::new(pool).await.unwrap();
        let id = store.insert(&test_cluster(None, vec![1.0, 0.0])).await.unwrap();

        store
            .update_label(id, Some("named now"), Some("desc"), Utc::now())
            .await
            .unwrap();
        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("named now"));
        assert!(loaded.refreshed_at.is_some());

        store.delete(id).await.unwrap();
        assert!(store.delete(id).await.is_err());
    }
}
