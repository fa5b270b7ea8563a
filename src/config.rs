//! Engine configuration
//!
//! One concrete struct per concern, resolved in priority order:
//! caller overrides > environment variables > project file > user file >
//! defaults. Validation collects every problem into a list instead of
//! failing on the first, so a misconfigured install reports everything
//! at once.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::DecayConfig;

/// Project-local config file name
pub const PROJECT_CONFIG_FILE: &str = "engram.toml";

// ============================================================================
// Sections
// ============================================================================

/// Where the engine keeps its state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the database, vector file, and scheduler state
    pub data_dir: PathBuf,
    /// Maximum connections in the SQLite pool
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_connections: 5,
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    pub fn vector_path(&self) -> PathBuf {
        self.data_dir.join("vectors.bin")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("maintenance-state.json")
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(data) = dirs::data_dir() {
        return data.join("engram");
    }
    PathBuf::from("./data")
}

/// HDBSCAN and assignment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Angular distance cap for soft cluster assignment, in (0, 1)
    pub threshold: f32,
    /// HDBSCAN minimum cluster size, >= 2
    pub min_cluster_size: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            threshold: 0.10,
            min_cluster_size: 4,
        }
    }
}

/// Graph traversal caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// BFS depth cap
    pub max_depth: u32,
    /// Weight below which propagation stops
    pub min_weight: f32,
    /// Hard cap on visited nodes per traversal
    pub max_visited: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            min_weight: 0.01,
            max_visited: 500,
        }
    }
}

/// Token budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Default retrieval token budget
    pub max_response: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { max_response: 8_000 }
    }
}

/// Vector store retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Days an orphaned chunk's vector survives without access
    pub ttl_days: u32,
    /// FIFO cap on stored vectors; 0 = unlimited
    pub max_count: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            ttl_days: 90,
            max_count: 0,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Hour of day (local) for the daily recluster
    pub cluster_hour: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { cluster_hour: 2 }
    }
}

/// Retrieval pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub vector_search_limit: u32,
    pub keyword_search_limit: u32,
    /// Reciprocal rank fusion constant
    pub rrf_k: u32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Clusters expanded per hit
    pub max_clusters: usize,
    /// Siblings pulled per cluster
    pub max_siblings: usize,
    /// Score factor applied to cluster siblings
    pub sibling_boost: f32,
    /// MMR relevance/diversity balance, in [0, 1]
    pub mmr_lambda: f32,
    /// Top fused hits used as traversal seeds
    pub max_seeds: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_search_limit: 20,
            keyword_search_limit: 20,
            rrf_k: 60,
            vector_weight: 1.0,
            keyword_weight: 1.0,
            max_clusters: 3,
            max_siblings: 5,
            sibling_boost: 0.3,
            mmr_lambda: 0.7,
            max_seeds: 5,
        }
    }
}

// ============================================================================
// Top-level config
// ============================================================================

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngramConfig {
    pub storage: StorageConfig,
    pub clustering: ClusteringConfig,
    pub traversal: TraversalConfig,
    pub tokens: TokenConfig,
    pub vectors: VectorConfig,
    pub maintenance: MaintenanceConfig,
    pub retrieval: RetrievalConfig,
    pub decay: DecayConfig,
}

impl EngramConfig {
    /// Resolve configuration from files and environment: defaults, then
    /// the user file, then the project file, then env vars. Caller code
    /// applies its own overrides on the returned value.
    pub fn load(project_dir: Option<&Path>) -> Self {
        let mut layered = toml::Value::try_from(Self::default())
            .unwrap_or(toml::Value::Table(Default::default()));

        if let Some(user_path) = user_config_path() {
            merge_file(&mut layered, &user_path);
        }
        let project_path = project_dir
            .map(|d| d.join(PROJECT_CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
        merge_file(&mut layered, &project_path);

        let mut config: Self = layered.try_into().unwrap_or_else(|e| {
            warn!("config file contents ignored: {}", e);
            Self::default()
        });
        config.apply_env();
        config
    }

    /// Apply supported environment-variable overrides
    pub fn apply_env(&mut self) {
        env_parse("ENGRAM_DATA_DIR", &mut self.storage.data_dir);
        env_parse("ENGRAM_CLUSTER_THRESHOLD", &mut self.clustering.threshold);
        env_parse(
            "ENGRAM_MIN_CLUSTER_SIZE",
            &mut self.clustering.min_cluster_size,
        );
        env_parse("ENGRAM_MAX_DEPTH", &mut self.traversal.max_depth);
        env_parse("ENGRAM_MIN_WEIGHT", &mut self.traversal.min_weight);
        env_parse("ENGRAM_MAX_RESPONSE_TOKENS", &mut self.tokens.max_response);
        env_parse("ENGRAM_VECTOR_TTL_DAYS", &mut self.vectors.ttl_days);
        env_parse("ENGRAM_VECTOR_MAX_COUNT", &mut self.vectors.max_count);
        env_parse("ENGRAM_CLUSTER_HOUR", &mut self.maintenance.cluster_hour);
        env_parse("ENGRAM_MMR_LAMBDA", &mut self.retrieval.mmr_lambda);
    }

    /// Check every constraint and report all violations. An empty list
    /// means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !(0.0..1.0).contains(&self.clustering.threshold) || self.clustering.threshold <= 0.0 {
            problems.push(format!(
                "clustering.threshold must be in (0, 1), got {}",
                self.clustering.threshold
            ));
        }
        if self.clustering.min_cluster_size < 2 {
            problems.push(format!(
                "clustering.min_cluster_size must be >= 2, got {}",
                self.clustering.min_cluster_size
            ));
        }
        if self.traversal.max_depth == 0 {
            problems.push("traversal.max_depth must be positive".to_string());
        }
        if self.traversal.min_weight <= 0.0 {
            problems.push(format!(
                "traversal.min_weight must be positive, got {}",
                self.traversal.min_weight
            ));
        }
        if self.tokens.max_response == 0 {
            problems.push("tokens.max_response must be positive".to_string());
        }
        if self.maintenance.cluster_hour >= 24 {
            problems.push(format!(
                "maintenance.cluster_hour must be 0..=23, got {}",
                self.maintenance.cluster_hour
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.mmr_lambda) {
            problems.push(format!(
                "retrieval.mmr_lambda must be in [0, 1], got {}",
                self.retrieval.mmr_lambda
            ));
        }
        if self.retrieval.rrf_k == 0 {
            problems.push("retrieval.rrf_k must be positive".to_string());
        }
        if self.retrieval.vector_weight < 0.0 || self.retrieval.keyword_weight < 0.0 {
            problems.push("retrieval source weights must be non-negative".to_string());
        }
        if self.retrieval.sibling_boost <= 0.0 || self.retrieval.sibling_boost > 1.0 {
            problems.push(format!(
                "retrieval.sibling_boost must be in (0, 1], got {}",
                self.retrieval.sibling_boost
            ));
        }
        for (name, spec) in [("decay.backward", &self.decay.backward), ("decay.forward", &self.decay.forward)] {
            if spec.dies_at_hops <= 0.0 {
                problems.push(format!("{name}.dies_at_hops must be positive"));
            }
            if spec.hold_hops < 0.0 || spec.hold_hops >= spec.dies_at_hops {
                problems.push(format!("{name}.hold_hops must be in [0, dies_at_hops)"));
            }
        }
        if self.decay.ms_per_hop <= 0.0 {
            problems.push("decay.ms_per_hop must be positive".to_string());
        }

        problems
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("engram").join("config.toml"))
}

/// Deep-merge a TOML file over the layered value, ignoring missing or
/// unreadable files.
fn merge_file(base: &mut toml::Value, path: &Path) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    match text.parse::<toml::Value>() {
        Ok(overlay) => merge_toml(base, overlay),
        Err(e) => warn!("ignoring malformed config {}: {}", path.display(), e),
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("ignoring unparseable {}={}", var, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DecayCurveKind;

    #[test]
    fn test_defaults_validate_clean() {
        let config = EngramConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.clustering.threshold, 0.10);
        assert_eq!(config.clustering.min_cluster_size, 4);
        assert_eq!(config.vectors.ttl_days, 90);
        assert_eq!(config.retrieval.mmr_lambda, 0.7);
        assert_eq!(config.maintenance.cluster_hour, 2);
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut config = EngramConfig::default();
        config.clustering.threshold = 1.5;
        config.clustering.min_cluster_size = 1;
        config.retrieval.mmr_lambda = -0.2;
        config.maintenance.cluster_hour = 99;
        let problems = config.validate();
        assert_eq!(problems.len(), 4, "{:?}", problems);
    }

    #[test]
    fn test_decay_validation() {
        let mut config = EngramConfig::default();
        config.decay.backward.hold_hops = config.decay.backward.dies_at_hops + 1.0;
        config.decay.ms_per_hop = 0.0;
        let problems = config.validate();
        assert_eq!(problems.len(), 2, "{:?}", problems);
    }

    #[test]
    fn test_toml_round_trip_with_partial_overlay() {
        let mut base = toml::Value::try_from(EngramConfig::default()).unwrap();
        let overlay: toml::Value = r#"
            [clustering]
            threshold = 0.25

            [decay.forward]
            kind = "exponential"
            dies_at_hops = 8.0
        "#
        .parse()
        .unwrap();
        merge_toml(&mut base, overlay);
        let config: EngramConfig = base.try_into().unwrap();

        assert_eq!(config.clustering.threshold, 0.25);
        // Untouched siblings keep defaults.
        assert_eq!(config.clustering.min_cluster_size, 4);
        assert_eq!(config.decay.forward.kind, DecayCurveKind::Exponential);
        assert_eq!(config.decay.forward.dies_at_hops, 8.0);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("ENGRAM_MMR_LAMBDA", "0.4");
        std::env::set_var("ENGRAM_VECTOR_TTL_DAYS", "not-a-number");
        let mut config = EngramConfig::default();
        config.apply_env();
        assert_eq!(config.retrieval.mmr_lambda, 0.4);
        // Unparseable values are ignored, not fatal.
        assert_eq!(config.vectors.ttl_days, 90);
        std::env::remove_var("ENGRAM_MMR_LAMBDA");
        std::env::remove_var("ENGRAM_VECTOR_TTL_DAYS");
    }
}
