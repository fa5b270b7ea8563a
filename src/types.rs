//! Core entity types
//!
//! The storage model: chunks (indivisible retrievable transcript slices),
//! typed weighted edges between them, clusters with centroids, and the
//! parsed-transcript input shape the ingestor consumes. Retrieval request
//! and response types live here too so the public surface is one import.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Chunk
// ============================================================================

/// An indivisible retrievable unit: a contiguous slice of a session
/// transcript with metadata. Never mutated after ingest except for
/// best-effort `last_accessed` bumps on retrieval hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Opaque unique id (UUID v4), immutable
    pub id: String,

    /// Session this chunk was cut from
    pub session_id: String,

    /// Project tag of the session
    pub session_slug: String,

    /// Agent that produced the turns, when known
    pub agent_id: Option<String>,

    /// Ordered set of transcript turn indices covered by this chunk
    pub turn_indices: Vec<u32>,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// The chunk text
    pub content: String,

    /// Approximate token count, when estimated at ingest
    pub approx_tokens: Option<u32>,

    /// Fenced code blocks in the content
    pub code_block_count: u32,

    /// Tool invocations covered by the chunk
    pub tool_use_count: u32,

    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Chunk {
    /// Fresh chunk id
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Validate the structural invariants enforced at insert time.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.turn_indices.is_empty() {
            problems.push("turn_indices must be non-empty".to_string());
        }
        if self.end_time < self.start_time {
            problems.push("end_time must not precede start_time".to_string());
        }
        problems
    }
}

// ============================================================================
// Edge
// ============================================================================

/// Relation type of a directed edge between chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    /// Later chunk referring back to an earlier one
    Backward,
    /// Earlier chunk anticipating a later one
    Forward,
    /// Structural link along a causal chain within a session
    WithinChain,
    /// Lead chunk spawning a teammate
    TeamSpawn,
    /// Teammate reporting back to the lead
    TeamReport,
    /// Teammate messaging another teammate
    PeerMessage,
    /// Parent briefing a sub-agent
    Brief,
    /// Sub-agent debriefing its parent
    Debrief,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Backward => "backward",
            EdgeType::Forward => "forward",
            EdgeType::WithinChain => "within-chain",
            EdgeType::TeamSpawn => "team-spawn",
            EdgeType::TeamReport => "team-report",
            EdgeType::PeerMessage => "peer-message",
            EdgeType::Brief => "brief",
            EdgeType::Debrief => "debrief",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backward" => Some(EdgeType::Backward),
            "forward" => Some(EdgeType::Forward),
            "within-chain" => Some(EdgeType::WithinChain),
            "team-spawn" => Some(EdgeType::TeamSpawn),
            "team-report" => Some(EdgeType::TeamReport),
            "peer-message" => Some(EdgeType::PeerMessage),
            "brief" => Some(EdgeType::Brief),
            "debrief" => Some(EdgeType::Debrief),
            _ => None,
        }
    }

    /// Edge types followed by a forward traversal
    pub fn forward_set() -> &'static [EdgeType] {
        &[EdgeType::Forward, EdgeType::TeamSpawn, EdgeType::Brief]
    }

    /// Edge types followed by a backward traversal
    pub fn backward_set() -> &'static [EdgeType] {
        &[
            EdgeType::Backward,
            EdgeType::WithinChain,
            EdgeType::Debrief,
            EdgeType::TeamReport,
            EdgeType::PeerMessage,
        ]
    }

    /// Whether decay uses the forward curve (backward otherwise;
    /// within-chain decays like backward).
    pub fn decays_forward(&self) -> bool {
        matches!(self, EdgeType::Forward | EdgeType::TeamSpawn | EdgeType::Brief)
    }
}

/// What kind of shared evidence produced a reference edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceType {
    /// Plain adjacency with no stronger signal
    Adjacent,
    /// Shared file path
    FilePath,
    /// Shared code identifier
    CodeEntity,
    /// Propagated error message fragment
    ErrorFragment,
    /// Explicit backreference phrase
    ExplicitBackref,
    /// Shared tool-output marker
    ToolOutput,
    /// Structural within-chain link
    WithinChain,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Adjacent => "adjacent",
            ReferenceType::FilePath => "file-path",
            ReferenceType::CodeEntity => "code-entity",
            ReferenceType::ErrorFragment => "error-fragment",
            ReferenceType::ExplicitBackref => "explicit-backref",
            ReferenceType::ToolOutput => "tool-output",
            ReferenceType::WithinChain => "within-chain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "adjacent" => Some(ReferenceType::Adjacent),
            "file-path" => Some(ReferenceType::FilePath),
            "code-entity" => Some(ReferenceType::CodeEntity),
            "error-fragment" => Some(ReferenceType::ErrorFragment),
            "explicit-backref" => Some(ReferenceType::ExplicitBackref),
            "tool-output" => Some(ReferenceType::ToolOutput),
            "within-chain" => Some(ReferenceType::WithinChain),
            _ => None,
        }
    }
}

/// A directed, typed, weighted reference between two chunks. Edges are
/// written once and decayed at query time; they are never rewritten on
/// the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Row id; 0 until stored
    pub id: i64,
    pub source_chunk_id: String,
    pub target_chunk_id: String,
    pub edge_type: EdgeType,
    pub reference_type: Option<ReferenceType>,
    /// Starting weight, strictly positive
    pub initial_weight: f32,
    pub created_at: DateTime<Utc>,
    /// Serialized agent-clock snapshot at creation, when available
    pub vector_clock: Option<crate::clock::VectorClock>,
    /// How many times this reference has been observed
    pub link_count: u32,
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        edge_type: EdgeType,
        reference_type: Option<ReferenceType>,
        initial_weight: f32,
    ) -> Self {
        Self {
            id: 0,
            source_chunk_id: source.into(),
            target_chunk_id: target.into(),
            edge_type,
            reference_type,
            initial_weight,
            created_at: Utc::now(),
            vector_clock: None,
            link_count: 1,
        }
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// A named group of semantically related chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Row id; 0 until stored
    pub id: i64,
    /// Human-readable label, carried across reclusters
    pub name: Option<String>,
    pub description: Option<String>,
    /// Unit-normalized mean of member vectors
    pub centroid: Vec<f32>,
    /// Member chunk ids closest to the centroid, best first
    pub exemplar_ids: Vec<String>,
    /// Deterministic hash of the sorted member ids
    pub membership_hash: String,
    /// When an external labeler last refreshed name/description
    pub refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A chunk's membership in a cluster, with its distance to the centroid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub chunk_id: String,
    pub cluster_id: i64,
    /// Angular distance to the cluster centroid, in [0, 2]
    pub distance: f32,
}

// ============================================================================
// Parsed transcript input
// ============================================================================

/// One parsed conversational turn. The engine consumes already-parsed
/// turns; it does not own the transcript file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTurn {
    pub index: u32,
    pub start_time: DateTime<Utc>,
    /// The user's text for this turn, if any
    pub user_text: Option<String>,
    pub assistant_blocks: Vec<AssistantBlock>,
    pub tool_exchanges: Vec<ToolExchange>,
}

/// One assistant output block within a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// A tool invocation paired with its stringified result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExchange {
    pub tool_use_id: String,
    pub result: String,
}

/// A parsed session handed to the ingestor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSession {
    pub session_id: String,
    pub session_slug: String,
    pub agent_id: Option<String>,
    pub turns: Vec<SessionTurn>,
}

// ============================================================================
// Retrieval request / response
// ============================================================================

/// Which retrieval intent drives graph traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Both traversal directions, merged
    #[default]
    Recall,
    /// Backward traversal: how did we get here
    Explain,
    /// Forward traversal: what tends to follow
    Predict,
}

/// Requested temporal range of the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryRange {
    Short,
    Long,
    #[default]
    Auto,
}

/// A context-assembly request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    /// Session issuing the query; same-session chunks get a recency boost
    pub current_session_id: Option<String>,
    /// Restrict results to these project slugs
    pub project_filter: Option<Vec<String>>,
    /// Token budget; defaults to the configured maximum response size
    pub max_tokens: Option<u32>,
    pub vector_search_limit: Option<u32>,
    pub range: QueryRange,
    pub mode: QueryMode,
}

impl ContextRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            current_session_id: None,
            project_filter: None,
            max_tokens: None,
            vector_search_limit: None,
            range: QueryRange::default(),
            mode: QueryMode::default(),
        }
    }
}

/// Which retrieval stage first surfaced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Vector,
    Keyword,
    Cluster,
    Graph,
}

impl HitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitSource::Vector => "vector",
            HitSource::Keyword => "keyword",
            HitSource::Cluster => "cluster",
            HitSource::Graph => "graph",
        }
    }
}

/// One chunk included in an assembled context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludedChunk {
    pub id: String,
    pub session_slug: String,
    pub weight: f32,
    /// First line of the content, capped
    pub preview: String,
    pub source: HitSource,
}

/// The assembled, token-budgeted answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextResponse {
    pub text: String,
    pub token_count: u32,
    pub chunks: Vec<IncludedChunk>,
    /// Candidates examined before budgeting
    pub total_considered: u32,
    pub duration_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_type_round_trip() {
        for edge_type in [
            EdgeType::Backward,
            EdgeType::Forward,
            EdgeType::WithinChain,
            EdgeType::TeamSpawn,
            EdgeType::TeamReport,
            EdgeType::PeerMessage,
            EdgeType::Brief,
            EdgeType::Debrief,
        ] {
            assert_eq!(EdgeType::parse(edge_type.as_str()), Some(edge_type));
        }
        assert_eq!(EdgeType::parse("sideways"), None);
    }

    #[test]
    fn test_direction_sets_are_disjoint_and_complete() {
        let forward = EdgeType::forward_set();
        let backward = EdgeType::backward_set();
        assert_eq!(forward.len() + backward.len(), 8);
        for t in forward {
            assert!(!backward.contains(t));
        }
    }

    #[test]
    fn test_reference_type_round_trip() {
        for reference in [
            ReferenceType::Adjacent,
            ReferenceType::FilePath,
            ReferenceType::CodeEntity,
            ReferenceType::ErrorFragment,
            ReferenceType::ExplicitBackref,
            ReferenceType::ToolOutput,
            ReferenceType::WithinChain,
        ] {
            assert_eq!(ReferenceType::parse(reference.as_str()), Some(reference));
        }
    }

    #[test]
    fn test_chunk_validation() {
        let now = Utc::now();
        let mut chunk = Chunk {
            id: Chunk::new_id(),
            session_id: "s1".into(),
            session_slug: "proj".into(),
            agent_id: None,
            turn_indices: vec![0],
            start_time: now,
            end_time: now,
            content: "hello".into(),
            approx_tokens: Some(2),
            code_block_count: 0,
            tool_use_count: 0,
            created_at: now,
            last_accessed: now,
        };
        assert!(chunk.validate().is_empty());

        chunk.turn_indices.clear();
        chunk.end_time = now - chrono::Duration::seconds(5);
        assert_eq!(chunk.validate().len(), 2);
    }
}
