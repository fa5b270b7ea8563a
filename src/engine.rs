//! Engine lifecycle
//!
//! One handle owning every store and pipeline, built from a validated
//! configuration and an embedder. Construction wires the dead-edge
//! channel between the edge store and the pruner, opens the vector file
//! at the embedder's dimension, and primes the project index. There is
//! no global state; everything the pipelines need rides on this handle.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use crate::clustering::ClusterManager;
use crate::config::EngramConfig;
use crate::db::{
    self, ChunkStore, ClockStore, ClusterStore, EdgeStore, KeywordStore, MemoryStats,
};
use crate::embedder::Embedder;
use crate::error::{EngramError, Result};
use crate::ingest::Ingestor;
use crate::maintenance::{standard_tasks, Scheduler};
use crate::pruner::Pruner;
use crate::retrieval::Retriever;
use crate::vectors::VectorStore;

/// A fully wired memory engine
pub struct MemoryEngine {
    pub config: Arc<EngramConfig>,
    pub pool: SqlitePool,
    pub chunks: ChunkStore,
    pub edges: EdgeStore,
    pub clusters: ClusterStore,
    pub keywords: KeywordStore,
    pub clocks: ClockStore,
    pub vectors: Arc<VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub ingestor: Ingestor,
    pub retriever: Retriever,
    pub cluster_manager: Arc<ClusterManager>,
    pub pruner: Arc<Pruner>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Open (or create) the on-disk state and wire every component.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` listing every configuration problem when
    /// validation fails, or the underlying storage error.
    pub async fn init(config: EngramConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(EngramError::invalid(problems.join("; ")));
        }
        let config = Arc::new(config);

        let pool = db::init_pool(&config.storage).await?;
        let vectors = Arc::new(VectorStore::open(
            config.storage.vector_path(),
            embedder.dimension(),
        )?);

        Self::wire(config, pool, vectors, embedder).await
    }

    /// Engine over an in-memory database and a temp-path vector file;
    /// the caller owns the vector file's lifetime.
    pub async fn init_ephemeral(
        config: EngramConfig,
        vector_path: std::path::PathBuf,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(EngramError::invalid(problems.join("; ")));
        }
        let config = Arc::new(config);
        let pool = db::memory_pool().await?;
        let vectors = Arc::new(VectorStore::open(vector_path, embedder.dimension())?);
        Self::wire(config, pool, vectors, embedder).await
    }

    async fn wire(
        config: Arc<EngramConfig>,
        pool: SqlitePool,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let (dead_tx, dead_rx) = Pruner::channel();
        let chunks = ChunkStore::new(pool.clone()).await?;
        let edges = EdgeStore::new(pool.clone(), dead_tx).await?;
        let clusters = ClusterStore::new(pool.clone()).await?;
        let keywords = KeywordStore::new(pool.clone()).await?;
        let clocks = ClockStore::new(pool.clone()).await?;

        // Project-filtered search needs the side index from day one.
        vectors.set_project_index(chunks.project_index().await?);

        let pruner = Arc::new(Pruner::new(dead_rx, edges.clone(), chunks.clone()));
        let cluster_manager = Arc::new(ClusterManager::new(
            clusters.clone(),
            vectors.clone(),
            config.clustering.clone(),
        ));
        let ingestor = Ingestor::new(
            embedder.clone(),
            chunks.clone(),
            edges.clone(),
            keywords.clone(),
            vectors.clone(),
            clocks.clone(),
        );
        let retriever = Retriever::new(
            embedder.clone(),
            chunks.clone(),
            edges.clone(),
            clusters.clone(),
            keywords.clone(),
            vectors.clone(),
            clocks.clone(),
            config.clone(),
        );

        info!("memory engine ready (dimension {})", embedder.dimension());
        Ok(Self {
            config,
            pool,
            chunks,
            edges,
            clusters,
            keywords,
            clocks,
            vectors,
            embedder,
            ingestor,
            retriever,
            cluster_manager,
            pruner,
        })
    }

    /// Build the maintenance scheduler for this engine.
    pub fn scheduler(&self) -> Scheduler {
        let tasks = standard_tasks(
            &self.config.maintenance,
            self.config.vectors.clone(),
            self.pool.clone(),
            self.chunks.clone(),
            self.vectors.clone(),
            self.cluster_manager.clone(),
            self.pruner.clone(),
        );
        Scheduler::new(tasks, self.config.storage.state_path())
    }

    /// Current table counts
    pub async fn stats(&self) -> Result<MemoryStats> {
        db::memory_stats(&self.pool).await
    }

    /// Close the database pool. Pending writes flush first.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_rejects_bad_config() {
        let dir = tempdir().unwrap();
        let mut config = EngramConfig::default();
        config.clustering.threshold = 7.0;
        config.retrieval.mmr_lambda = 5.0;
        let embedder = Arc::new(HashingEmbedder::new(16).unwrap());
        let err = MemoryEngine::init_ephemeral(config, dir.path().join("v.bin"), embedder)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("threshold"));
        assert!(message.contains("mmr_lambda"));
    }

    #[tokio::test]
    async fn test_init_and_stats() {
        let dir = tempdir().unwrap();
        let embedder = Arc::new(HashingEmbedder::new(16).unwrap());
        let engine = MemoryEngine::init_ephemeral(
            EngramConfig::default(),
            dir.path().join("v.bin"),
            embedder,
        )
        .await
        .unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 0);

        let scheduler = engine.scheduler();
        assert_eq!(scheduler.task_names().len(), 5);
        engine.close().await;
    }
}
