//! Transcript ingestor
//!
//! Consumes already-parsed sessions (the transcript format itself lives
//! outside the engine) and turns them into stored memory: turns are cut
//! into chunks at an approximate token budget, each chunk is embedded
//! and keyword-indexed, causal edges are detected and written through
//! `create_or_boost`, and the project's agent clock ticks once per
//! chunk so later edges can decay by hops instead of wall clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::{ChunkStore, ClockStore, EdgeStore, KeywordStore};
use crate::edge_detect::{detect_causal_edges, detect_subagent_edges, detect_team_edges, AgentTrace};
use crate::embedder::Embedder;
use crate::error::Result;
use crate::retrieval::approx_token_len;
use crate::types::{AssistantBlock, Chunk, ParsedSession, SessionTurn};
use crate::vectors::VectorStore;

/// Target chunk size in approximate tokens
const CHUNK_TARGET_TOKENS: u32 = 400;
/// Tool results longer than this are clipped in the rendered text
const MAX_RESULT_CHARS: usize = 600;
/// Default agent name when the session does not carry one
const DEFAULT_AGENT: &str = "main";

/// Outcome of one ingest pass
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestReport {
    pub chunks_created: usize,
    pub edges_created: usize,
    pub duration_ms: u64,
}

/// Writes parsed sessions into the memory stores
pub struct Ingestor {
    embedder: Arc<dyn Embedder>,
    chunks: ChunkStore,
    edges: EdgeStore,
    keywords: KeywordStore,
    vectors: Arc<VectorStore>,
    clocks: ClockStore,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        chunks: ChunkStore,
        edges: EdgeStore,
        keywords: KeywordStore,
        vectors: Arc<VectorStore>,
        clocks: ClockStore,
    ) -> Self {
        Self {
            embedder,
            chunks,
            edges,
            keywords,
            vectors,
            clocks,
        }
    }

    /// Ingest one session end to end: chunk, embed, index, link.
    pub async fn ingest_session(&self, session: &ParsedSession) -> Result<IngestReport> {
        let started = std::time::Instant::now();
        let chunks = chunk_turns(session);
        if chunks.is_empty() {
            return Ok(IngestReport::default());
        }

        let agent = session.agent_id.as_deref().unwrap_or(DEFAULT_AGENT);
        for _ in &chunks {
            self.clocks.tick(&session.session_slug, agent).await?;
        }
        let clock_snapshot = self.clocks.reference_clock(&session.session_slug).await?;

        self.chunks.bulk_insert(&chunks).await?;
        self.keywords.index_many(&chunks).await?;
        for chunk in &chunks {
            let vector = self.embedder.embed(&chunk.content, false).await?;
            self.vectors.upsert(&chunk.id, &vector, chunk.created_at)?;
        }
        self.vectors.extend_project_index(
            chunks
                .iter()
                .map(|c| (c.id.clone(), c.session_slug.clone())),
        );

        let mut edges = detect_causal_edges(&chunks, &session.turns);
        for edge in &mut edges {
            edge.vector_clock = Some(clock_snapshot.clone());
        }
        let edge_count = edges.len();
        for edge in &edges {
            self.edges.create_or_boost(edge).await?;
        }

        let report = IngestReport {
            chunks_created: chunks.len(),
            edges_created: edge_count,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "ingested session {}: {} chunks, {} edges in {}ms",
            session.session_id, report.chunks_created, report.edges_created, report.duration_ms
        );
        Ok(report)
    }

    /// Link an already-ingested team run: spawn, report, and peer edges
    /// between the lead's chunks and each teammate's. Returns the number
    /// of edges written.
    pub async fn link_team(
        &self,
        lead: &ParsedSession,
        teammates: &[&ParsedSession],
    ) -> Result<usize> {
        let lead_chunks = self.chunks.by_session(&lead.session_id).await?;
        let mut teammate_chunks = Vec::with_capacity(teammates.len());
        for teammate in teammates {
            teammate_chunks.push(self.chunks.by_session(&teammate.session_id).await?);
        }

        let lead_trace = AgentTrace {
            name: lead.agent_id.as_deref().unwrap_or(DEFAULT_AGENT),
            turns: &lead.turns,
            chunks: &lead_chunks,
        };
        let teammate_traces: Vec<AgentTrace<'_>> = teammates
            .iter()
            .zip(teammate_chunks.iter())
            .map(|(session, chunks)| AgentTrace {
                name: session.agent_id.as_deref().unwrap_or(DEFAULT_AGENT),
                turns: &session.turns,
                chunks,
            })
            .collect();

        let edges = detect_team_edges(&lead_trace, &teammate_traces);
        for edge in &edges {
            self.edges.create_or_boost(edge).await?;
        }
        debug!("linked team run: {} edges", edges.len());
        Ok(edges.len())
    }

    /// Link an already-ingested sub-agent run with brief/debrief edges.
    pub async fn link_subagent(
        &self,
        parent: &ParsedSession,
        child: &ParsedSession,
    ) -> Result<usize> {
        let parent_chunks = self.chunks.by_session(&parent.session_id).await?;
        let child_chunks = self.chunks.by_session(&child.session_id).await?;

        let parent_trace = AgentTrace {
            name: parent.agent_id.as_deref().unwrap_or(DEFAULT_AGENT),
            turns: &parent.turns,
            chunks: &parent_chunks,
        };
        let child_trace = AgentTrace {
            name: child.agent_id.as_deref().unwrap_or("subagent"),
            turns: &child.turns,
            chunks: &child_chunks,
        };

        let edges = detect_subagent_edges(&parent_trace, &child_trace);
        for edge in &edges {
            self.edges.create_or_boost(edge).await?;
        }
        Ok(edges.len())
    }
}

// ============================================================================
// Turn chunking
// ============================================================================

/// Cut a session's turns into chunks of roughly `CHUNK_TARGET_TOKENS`.
/// Oversized single turns split at paragraph boundaries, so a chunk can
/// cover several turns or a turn can span several chunks, never both.
pub fn chunk_turns(session: &ParsedSession) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut pending: Vec<(u32, DateTime<Utc>, String, u32, u32)> = Vec::new();
    let mut pending_tokens = 0u32;

    let flush = |pending: &mut Vec<(u32, DateTime<Utc>, String, u32, u32)>,
                 chunks: &mut Vec<Chunk>| {
        if pending.is_empty() {
            return;
        }
        let turn_indices: Vec<u32> = pending.iter().map(|(i, ..)| *i).collect();
        let start_time = pending.first().map(|(_, t, ..)| *t).expect("non-empty");
        let end_time = pending.last().map(|(_, t, ..)| *t).expect("non-empty");
        let content = pending
            .iter()
            .map(|(_, _, text, ..)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let code_blocks: u32 = pending.iter().map(|(.., cb, _)| *cb).sum();
        let tool_uses: u32 = pending.iter().map(|(.., tu)| *tu).sum();
        let now = Utc::now();
        chunks.push(Chunk {
            id: Chunk::new_id(),
            session_id: String::new(),
            session_slug: String::new(),
            agent_id: None,
            turn_indices,
            start_time,
            end_time,
            approx_tokens: Some(approx_token_len(&content)),
            content,
            code_block_count: code_blocks,
            tool_use_count: tool_uses,
            created_at: now,
            last_accessed: now,
        });
        pending.clear();
    };

    for turn in &session.turns {
        let rendered = render_turn(turn);
        if rendered.trim().is_empty() {
            continue;
        }
        let code_blocks = (rendered.matches("```").count() / 2) as u32;
        let tool_uses = turn
            .assistant_blocks
            .iter()
            .filter(|b| matches!(b, AssistantBlock::ToolUse { .. }))
            .count() as u32;
        let tokens = approx_token_len(&rendered);

        if tokens > CHUNK_TARGET_TOKENS * 2 {
            // A huge turn becomes its own run of chunks; the counts land
            // on the first piece only.
            flush(&mut pending, &mut chunks);
            pending_tokens = 0;
            for (i, piece) in split_at_paragraphs(&rendered, CHUNK_TARGET_TOKENS)
                .into_iter()
                .enumerate()
            {
                let (cb, tu) = if i == 0 { (code_blocks, tool_uses) } else { (0, 0) };
                pending.push((turn.index, turn.start_time, piece, cb, tu));
                flush(&mut pending, &mut chunks);
            }
            continue;
        }

        if pending_tokens + tokens > CHUNK_TARGET_TOKENS && !pending.is_empty() {
            flush(&mut pending, &mut chunks);
            pending_tokens = 0;
        }
        pending.push((turn.index, turn.start_time, rendered, code_blocks, tool_uses));
        pending_tokens += tokens;
    }
    flush(&mut pending, &mut chunks);

    for chunk in &mut chunks {
        chunk.session_id = session.session_id.clone();
        chunk.session_slug = session.session_slug.clone();
        chunk.agent_id = session.agent_id.clone();
    }
    chunks
}

/// Render one turn as plain text: user text, assistant prose, tool calls
/// with clipped results.
fn render_turn(turn: &SessionTurn) -> String {
    let mut parts = Vec::new();
    if let Some(user) = &turn.user_text {
        if !user.trim().is_empty() {
            parts.push(format!("User: {user}"));
        }
    }
    for block in &turn.assistant_blocks {
        match block {
            AssistantBlock::Text { text } => {
                if !text.trim().is_empty() {
                    parts.push(format!("Assistant: {text}"));
                }
            }
            AssistantBlock::ToolUse { id, name, input } => {
                let summary = input
                    .get("command")
                    .or_else(|| input.get("prompt"))
                    .or_else(|| input.get("query"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                parts.push(format!("[tool {name} {id}] {summary}"));
            }
        }
    }
    for exchange in &turn.tool_exchanges {
        let clipped: String = exchange.result.chars().take(MAX_RESULT_CHARS).collect();
        parts.push(format!("[result {}] {}", exchange.tool_use_id, clipped));
    }
    parts.join("\n")
}

/// Split text into pieces of at most roughly `target` tokens, cutting at
/// paragraph boundaries when one is available.
fn split_at_paragraphs(text: &str, target: u32) -> Vec<String> {
    let max_chars = (target as usize) * 4;
    let mut pieces = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        // A single oversized paragraph is cut hard.
        if paragraph.len() > max_chars {
            let mut rest = paragraph;
            while rest.len() > max_chars {
                let mut cut = max_chars;
                while cut > 0 && !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                pieces.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current = rest.to_string();
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
