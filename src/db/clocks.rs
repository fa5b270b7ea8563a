//! Vector clock store
//!
//! Per-project, per-agent logical counters. The reference clock of a
//! project is the element-wise max over its agents, which for counters
//! stored one-per-agent is simply the full map.

use sqlx::SqlitePool;

use crate::clock::VectorClock;
use crate::error::Result;

/// Persistent store for agent clocks
#[derive(Clone)]
pub struct ClockStore {
    pool: SqlitePool,
}

impl ClockStore {
    /// Create a store, initializing the schema if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        super::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Advance one agent's counter within a project; returns the new value.
    pub async fn tick(&self, session_slug: &str, agent_id: &str) -> Result<u64> {
        sqlx::query(
            r#"
            INSERT INTO vector_clocks (session_slug, agent_id, counter)
            VALUES (?, ?, 1)
            ON CONFLICT(session_slug, agent_id) DO UPDATE SET counter = counter + 1
            "#,
        )
        .bind(session_slug)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        let row: (i64,) = sqlx::query_as(
            "SELECT counter FROM vector_clocks WHERE session_slug = ? AND agent_id = ?",
        )
        .bind(session_slug)
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    /// The project's reference clock: every agent's current counter
    pub async fn reference_clock(&self, session_slug: &str) -> Result<VectorClock> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT agent_id, counter FROM vector_clocks WHERE session_slug = ?")
                .bind(session_slug)
                .fetch_all(&self.pool)
                .await?;
        let mut clock = VectorClock::new();
        for (agent, counter) in rows {
            clock.0.insert(agent, counter as u64);
        }
        Ok(clock)
    }

    /// Reference clock across every project (merge of all agent clocks)
    pub async fn global_reference(&self) -> Result<VectorClock> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT agent_id, MAX(counter) FROM vector_clocks GROUP BY agent_id")
                .fetch_all(&self.pool)
                .await?;
        let mut clock = VectorClock::new();
        for (agent, counter) in rows {
            clock.0.insert(agent, counter as u64);
        }
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn test_tick_and_reference() {
        let pool = memory_pool().await.unwrap();
        let store = ClockStore::new(pool).await.unwrap();

        assert_eq!(store.tick("proj", "alice").await.unwrap(), 1);
        assert_eq!(store.tick("proj", "alice").await.unwrap(), 2);
        assert_eq!(store.tick("proj", "bob").await.unwrap(), 1);
        assert_eq!(store.tick("other", "alice").await.unwrap(), 1);

        let reference = store.reference_clock("proj").await.unwrap();
        assert_eq!(reference.get("alice"), 2);
        assert_eq!(reference.get("bob"), 1);

        let empty = store.reference_clock("nowhere").await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_global_reference_merges() {
        let pool = memory_pool().await.unwrap();
        let store = ClockStore::new(pool).await.unwrap();
        store.tick("p1", "alice").await.unwrap();
        store.tick("p1", "alice").await.unwrap();
        store.tick("p2", "alice").await.unwrap();
        store.tick("p2", "bob").await.unwrap();

        let global = store.global_reference().await.unwrap();
        assert_eq!(global.get("alice"), 2);
        assert_eq!(global.get("bob"), 1);
    }
}
