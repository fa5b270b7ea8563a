//! Retrieval pipeline
//!
//! The one public read path: embed the query, fan out vector and keyword
//! search concurrently, fuse with reciprocal rank fusion, widen through
//! cluster siblings and decay-weighted graph traversal, boost recency,
//! diversify with MMR, and assemble a token-budgeted answer. Degradable
//! failures (keyword index gone, a chunk missing its vector) never fail
//! the call; only an unusable embedder does.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::EngramConfig;
use crate::db::{ChunkStore, ClockStore, ClusterStore, EdgeStore, KeywordStore};
use crate::embedder::Embedder;
use crate::error::{EngramError, Result};
use crate::math::cosine_similarity;
use crate::traversal::{dedupe_and_rank, Direction, TraversalLimits, Traverser};
use crate::types::{
    Chunk, ContextRequest, ContextResponse, HitSource, IncludedChunk, QueryMode, QueryRange,
};
use crate::vectors::VectorStore;

/// Fused-hit boost applied before merging with traversal results
const HIT_BOOST: f32 = 1.5;
/// Same-session recency boost
const RECENCY_BOOST: f32 = 1.2;
/// MMR engages at this many candidates
const MMR_MIN_CANDIDATES: usize = 10;
/// Minimum leftover budget worth a truncated tail chunk
const TRUNCATION_MIN_TOKENS: u32 = 100;
/// Segment separator in the assembled text
const SEGMENT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    score: f32,
    source: HitSource,
}

/// Hybrid retriever over every store
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    chunks: ChunkStore,
    clusters: ClusterStore,
    keywords: KeywordStore,
    vectors: Arc<VectorStore>,
    clocks: ClockStore,
    traverser: Traverser,
    config: Arc<EngramConfig>,
}

impl Retriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        chunks: ChunkStore,
        edges: EdgeStore,
        clusters: ClusterStore,
        keywords: KeywordStore,
        vectors: Arc<VectorStore>,
        clocks: ClockStore,
        config: Arc<EngramConfig>,
    ) -> Self {
        Self {
            embedder,
            chunks,
            clusters,
            keywords,
            vectors,
            clocks,
            traverser: Traverser::new(edges),
            config,
        }
    }

    /// Answer a context request within its token budget.
    ///
    /// # Errors
    ///
    /// Returns `DependencyUnavailable` when the embedder cannot encode
    /// the query; every other collaborator failure degrades.
    pub async fn assemble_context(&self, request: ContextRequest) -> Result<ContextResponse> {
        let started = std::time::Instant::now();
        let query_time = Utc::now();
        let budget = request.max_tokens.unwrap_or(self.config.tokens.max_response);

        let query_vector = self
            .embedder
            .embed(&request.query, true)
            .await
            .map_err(|e| EngramError::DependencyUnavailable(format!("embedder: {e}")))?;

        // Vector and keyword searches are independent; run them together.
        let vector_limit = request
            .vector_search_limit
            .unwrap_or(self.config.retrieval.vector_search_limit) as usize;
        let keyword_limit = self.config.retrieval.keyword_search_limit as usize;
        let projects = request.project_filter.as_deref();

        let (vector_hits, keyword_hits) = tokio::join!(
            self.vector_search(&query_vector, projects, vector_limit),
            self.keyword_search(&request.query, projects, keyword_limit),
        );

        let mut candidates = fuse_rrf(
            &vector_hits,
            &keyword_hits,
            self.config.retrieval.vector_weight,
            self.config.retrieval.keyword_weight,
            self.config.retrieval.rrf_k,
        );
        debug!(
            "fused {} vector + {} keyword hits into {} candidates",
            vector_hits.len(),
            keyword_hits.len(),
            candidates.len()
        );

        self.expand_clusters(&mut candidates).await;

        let traversal_hits = self.traverse_from(&candidates, &request, query_time).await?;

        // Merge: fused hits get a flat boost, traversal fills in the rest;
        // an id keeps its first source tag and its maximum weight.
        let mut merged: HashMap<String, Candidate> = HashMap::new();
        for candidate in &candidates {
            let boosted = candidate.score * HIT_BOOST;
            merged
                .entry(candidate.chunk_id.clone())
                .and_modify(|c| c.score = c.score.max(boosted))
                .or_insert_with(|| Candidate {
                    chunk_id: candidate.chunk_id.clone(),
                    score: boosted,
                    source: candidate.source,
                });
        }
        for hit in traversal_hits {
            merged
                .entry(hit.chunk_id.clone())
                .and_modify(|c| c.score = c.score.max(hit.weight))
                .or_insert(Candidate {
                    chunk_id: hit.chunk_id,
                    score: hit.weight,
                    source: HitSource::Graph,
                });
        }

        let mut candidates: Vec<Candidate> = merged.into_values().collect();
        let total_considered = candidates.len() as u32;

        // Load chunk metadata once for recency, MMR, and assembly.
        let ids: Vec<String> = candidates.iter().map(|c| c.chunk_id.clone()).collect();
        let chunk_map: HashMap<String, Chunk> = self
            .chunks
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        // Drop candidates whose chunk row vanished under us.
        candidates.retain(|c| chunk_map.contains_key(&c.chunk_id));

        if let Some(session) = &request.current_session_id {
            for candidate in &mut candidates {
                if chunk_map[&candidate.chunk_id].session_id == *session {
                    candidate.score *= RECENCY_BOOST;
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let ordered = self.mmr_reorder(candidates);

        let (text, token_count, included) = self.assemble(&ordered, &chunk_map, budget);

        // Deferred best-effort access bumps for everything we returned.
        let included_ids: Vec<String> = included.iter().map(|c| c.id.clone()).collect();
        if !included_ids.is_empty() {
            if let Err(e) = self.chunks.bump_last_accessed(&included_ids, query_time).await {
                warn!("last-accessed bump failed: {}", e);
            }
            self.vectors.bump_last_accessed(&included_ids, query_time);
        }

        Ok(ContextResponse {
            text,
            token_count,
            chunks: included,
            total_considered,
            duration_ms: started.elapsed().as_millis() as u32,
        })
    }

    async fn vector_search(
        &self,
        query: &[f32],
        projects: Option<&[String]>,
        limit: usize,
    ) -> Vec<(String, f32)> {
        let result = match projects {
            Some(projects) if !projects.is_empty() => {
                self.vectors.search_by_project(query, projects, limit)
            }
            _ => self.vectors.search(query, limit),
        };
        match result {
            // Angular distance in [0, 2] becomes a score in [0, 1].
            Ok(hits) => hits
                .into_iter()
                .map(|(id, dist)| (id, (1.0 - dist).max(0.0)))
                .collect(),
            Err(e) => {
                warn!("vector search degraded to empty: {}", e);
                Vec::new()
            }
        }
    }

    async fn keyword_search(
        &self,
        query: &str,
        projects: Option<&[String]>,
        limit: usize,
    ) -> Vec<(String, f32)> {
        match projects {
            Some(projects) if !projects.is_empty() => {
                self.keywords.search_by_project(query, projects, limit).await
            }
            _ => self.keywords.search(query, limit).await,
        }
    }

    /// Pull cluster siblings of the strongest hits into the candidate
    /// pool. Already-present ids keep their original tag and score.
    async fn expand_clusters(&self, candidates: &mut Vec<Candidate>) {
        let max_clusters = self.config.retrieval.max_clusters;
        let max_siblings = self.config.retrieval.max_siblings;
        if max_clusters == 0 || candidates.is_empty() {
            return;
        }

        let mut known: std::collections::HashSet<String> =
            candidates.iter().map(|c| c.chunk_id.clone()).collect();
        let seeds: Vec<String> = candidates
            .iter()
            .take(self.config.retrieval.max_seeds)
            .map(|c| c.chunk_id.clone())
            .collect();

        let mut added = Vec::new();
        for seed in seeds {
            let assignments = match self.clusters.assignments_for_chunk(&seed).await {
                Ok(assignments) => assignments,
                Err(e) => {
                    warn!("cluster expansion skipped for {}: {}", seed, e);
                    continue;
                }
            };
            for assignment in assignments.iter().take(max_clusters) {
                let members = match self.clusters.members(assignment.cluster_id).await {
                    Ok(members) => members,
                    Err(e) => {
                        warn!("cluster member fetch failed: {}", e);
                        continue;
                    }
                };
                let mut taken = 0;
                for member in members {
                    if taken >= max_siblings {
                        break;
                    }
                    if known.contains(&member.chunk_id) {
                        continue;
                    }
                    let score =
                        self.config.retrieval.sibling_boost * (1.0 - member.distance).max(0.0);
                    if score <= 0.0 {
                        continue;
                    }
                    known.insert(member.chunk_id.clone());
                    added.push(Candidate {
                        chunk_id: member.chunk_id,
                        score,
                        source: HitSource::Cluster,
                    });
                    taken += 1;
                }
            }
        }
        if !added.is_empty() {
            debug!("cluster expansion added {} siblings", added.len());
            candidates.extend(added);
        }
    }

    /// Traverse the graph from the strongest fused hits. Direction comes
    /// from the query mode; recall walks both ways and merges.
    async fn traverse_from(
        &self,
        candidates: &[Candidate],
        request: &ContextRequest,
        query_time: chrono::DateTime<Utc>,
    ) -> Result<Vec<crate::traversal::TraversalHit>> {
        let seeds: Vec<(String, f32)> = candidates
            .iter()
            .take(self.config.retrieval.max_seeds)
            .map(|c| (c.chunk_id.clone(), c.score))
            .collect();
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let reference = match request.project_filter.as_deref() {
            Some([single]) => self.clocks.reference_clock(single).await?,
            _ => self.clocks.global_reference().await?,
        };
        let reference = (!reference.is_empty()).then_some(reference);

        let limits = self.limits_for(request);
        let decay = &self.config.decay;

        let directions: &[Direction] = match request.mode {
            QueryMode::Explain => &[Direction::Backward],
            QueryMode::Predict => &[Direction::Forward],
            QueryMode::Recall => &[Direction::Backward, Direction::Forward],
        };

        let mut result_sets = Vec::with_capacity(directions.len());
        for &direction in directions {
            result_sets.push(
                self.traverser
                    .traverse(&seeds, direction, query_time, decay, reference.as_ref(), limits)
                    .await?,
            );
        }
        Ok(dedupe_and_rank(result_sets))
    }

    fn limits_for(&self, request: &ContextRequest) -> TraversalLimits {
        let configured = &self.config.traversal;
        let short = match request.range {
            QueryRange::Short => true,
            QueryRange::Long => false,
            QueryRange::Auto => request.query.split_whitespace().count() < 8,
        };
        TraversalLimits {
            max_depth: if short {
                (configured.max_depth / 2).max(1)
            } else {
                configured.max_depth
            },
            min_weight: configured.min_weight,
            max_visited: configured.max_visited,
        }
    }

    /// Maximal marginal relevance. Below the candidate threshold the
    /// input order stands. Scores are never altered, only order.
    fn mmr_reorder(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if candidates.len() < MMR_MIN_CANDIDATES {
            return candidates;
        }
        let lambda = self.config.retrieval.mmr_lambda;
        let top_score = candidates
            .first()
            .map(|c| c.score)
            .filter(|s| *s > 0.0)
            .unwrap_or(1.0);

        let vectors: HashMap<String, Vec<f32>> = candidates
            .iter()
            .filter_map(|c| self.vectors.get(&c.chunk_id).map(|v| (c.chunk_id.clone(), v)))
            .collect();

        let mut remaining = candidates;
        let mut selected: Vec<Candidate> = Vec::with_capacity(remaining.len());
        // First pick is pure relevance.
        selected.push(remaining.remove(0));

        while !remaining.is_empty() {
            let mut best_index = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (index, candidate) in remaining.iter().enumerate() {
                let relevance = (candidate.score / top_score).clamp(0.0, 1.0);
                let diversity_penalty = vectors
                    .get(&candidate.chunk_id)
                    .map(|candidate_vector| {
                        selected
                            .iter()
                            .filter_map(|s| vectors.get(&s.chunk_id))
                            .filter_map(|sv| cosine_similarity(candidate_vector, sv).ok())
                            .fold(f32::NEG_INFINITY, f32::max)
                    })
                    .filter(|m| m.is_finite())
                    .unwrap_or(0.0);
                let value = lambda * relevance - (1.0 - lambda) * diversity_penalty;
                if value > best_value {
                    best_value = value;
                    best_index = index;
                }
            }
            selected.push(remaining.remove(best_index));
        }
        selected
    }

    /// Walk candidates in final order and emit formatted segments until
    /// the budget runs out; a sufficiently large remainder gets one
    /// truncated tail segment.
    fn assemble(
        &self,
        ordered: &[Candidate],
        chunk_map: &HashMap<String, Chunk>,
        budget: u32,
    ) -> (String, u32, Vec<IncludedChunk>) {
        let top_score = ordered
            .first()
            .map(|c| c.score)
            .filter(|s| *s > 0.0)
            .unwrap_or(1.0);
        let mut segments: Vec<String> = Vec::new();
        let mut included = Vec::new();
        let mut spent: u32 = 0;

        for candidate in ordered {
            let chunk = &chunk_map[&candidate.chunk_id];
            let cost = chunk
                .approx_tokens
                .unwrap_or_else(|| approx_token_len(&chunk.content));
            let relevance_pct = ((candidate.score / top_score) * 100.0).round() as u32;

            if spent + cost <= budget {
                segments.push(format_segment(chunk, relevance_pct, &chunk.content));
                spent += cost;
                included.push(make_included(chunk, candidate));
                continue;
            }

            // The full chunk overflows; emit a truncated tail if the
            // leftover budget is worth it, then stop either way.
            let remaining = budget.saturating_sub(spent);
            if remaining > TRUNCATION_MIN_TOKENS {
                if let Some(cut) = truncate_at_paragraph(&chunk.content, remaining) {
                    let truncated = format!("{cut}\n\n...[truncated]");
                    spent += approx_token_len(&truncated);
                    segments.push(format_segment(chunk, relevance_pct, &truncated));
                    included.push(make_included(chunk, candidate));
                }
            }
            break;
        }

        (segments.join(SEGMENT_SEPARATOR), spent, included)
    }
}

/// Rough token estimate: four characters per token, rounded up
pub fn approx_token_len(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

fn format_segment(chunk: &Chunk, relevance_pct: u32, body: &str) -> String {
    format!(
        "[Session: {} | Date: {} | Relevance: {}%]\n{}",
        chunk.session_slug,
        chunk.start_time.format("%Y-%m-%d"),
        relevance_pct,
        body
    )
}

fn make_included(chunk: &Chunk, candidate: &Candidate) -> IncludedChunk {
    let preview: String = chunk.content.lines().next().unwrap_or("").chars().take(80).collect();
    IncludedChunk {
        id: chunk.id.clone(),
        session_slug: chunk.session_slug.clone(),
        weight: candidate.score,
        preview,
        source: candidate.source,
    }
}

/// Cut text to fit `remaining` tokens, preferring the last paragraph
/// boundary that keeps at least half the allowance. Returns `None` when
/// nothing meaningful fits.
fn truncate_at_paragraph(content: &str, remaining: u32) -> Option<String> {
    // Leave room for the truncation suffix so the estimate stays under
    // the remaining budget.
    let max_chars = (remaining as usize).saturating_mul(4).saturating_sub(24);
    if max_chars == 0 {
        return None;
    }
    if content.len() <= max_chars {
        return Some(content.to_string());
    }
    let window = floor_char_boundary(content, max_chars);
    let half = max_chars / 2;
    let cut = content[..window]
        .rfind("\n\n")
        .filter(|&p| p >= half)
        .unwrap_or(window);
    let slice = content[..cut].trim_end();
    if slice.is_empty() {
        return None;
    }
    Some(slice.to_string())
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Reciprocal rank fusion over the two ranked sources. Each id scores
/// `sum(weight_s / (k + rank_s))` over the sources that returned it; the
/// first contributing source tags it.
fn fuse_rrf(
    vector_hits: &[(String, f32)],
    keyword_hits: &[(String, f32)],
    vector_weight: f32,
    keyword_weight: f32,
    rrf_k: u32,
) -> Vec<Candidate> {
    let mut fused: HashMap<String, Candidate> = HashMap::new();
    let sources = [
        (vector_hits, vector_weight, HitSource::Vector),
        (keyword_hits, keyword_weight, HitSource::Keyword),
    ];
    for (hits, weight, source) in sources {
        for (rank, (id, _)) in hits.iter().enumerate() {
            let contribution = weight / (rrf_k as f32 + (rank + 1) as f32);
            fused
                .entry(id.clone())
                .and_modify(|c| c.score += contribution)
                .or_insert_with(|| Candidate {
                    chunk_id: id.clone(),
                    score: contribution,
                    source,
                });
        }
    }
    let mut candidates: Vec<Candidate> = fused.into_values().collect();
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates
}
