//! Edge detectors
//!
//! Builds the reference graph at ingest time. Adjacent chunks within a
//! session get causal edges unless a topic shift gates them off; the
//! reference type comes from lexical evidence checked in priority order
//! (file paths, code identifiers, propagated error fragments, explicit
//! backreferences, tool-output markers, plain adjacency). Team and
//! sub-agent sessions get spawn/report/message and brief/debrief edges
//! from their tool-call structure.
//!
//! The marker and stoplist tables are versioned constants: changing them
//! changes which edges exist, so a revision is a new constant, not an
//! edit.

use std::collections::HashSet;

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::types::{AssistantBlock, Chunk, Edge, EdgeType, ReferenceType, SessionTurn};

// ============================================================================
// Versioned lexical tables
// ============================================================================

/// Phrases in the next user turn that mark a topic change
pub const TOPIC_SHIFT_MARKERS_V1: &[&str] = &[
    "new topic",
    "different topic",
    "change of topic",
    "changing topics",
    "switching gears",
    "unrelated question",
    "different question",
    "separate issue",
    "on another note",
    "moving on",
    "next task",
    "forget that",
    "start over",
    "start fresh",
    "nevermind that",
];

/// Common words excluded from code-identifier matching
pub const IDENT_STOPLIST_V1: &[&str] = &[
    "about", "after", "again", "align", "because", "before", "below", "between", "build",
    "change", "check", "class", "close", "const", "could", "create", "data", "debug", "delete",
    "error", "false", "file", "first", "function", "import", "index", "input", "large", "line",
    "list", "main", "make", "match", "maybe", "model", "module", "name", "need", "number",
    "object", "only", "open", "order", "other", "output", "print", "println", "public", "query",
    "return", "right", "running", "should", "small", "start", "static", "string", "test", "that",
    "then", "there", "these", "this", "todo", "token", "true", "type", "update", "value",
    "where", "which", "while", "would", "write",
];

/// Phrases that explicitly point back at earlier conversation
const BACKREF_PHRASES: &[&str] = &[
    "as before",
    "like before",
    "as above",
    "as mentioned",
    "you mentioned",
    "we discussed",
    "as we discussed",
    "the previous",
    "that same",
    "same as last time",
    "earlier you",
    "from earlier",
    "like we did",
];

/// Tool names that spawn a sub-agent
const SPAWN_TOOL_NAMES: &[&str] = &["Task", "Agent", "SubAgent"];

/// Gap between turns beyond which adjacency stops implying causality
const MAX_CAUSAL_GAP_MINUTES: i64 = 30;

/// Timestamp slack for matching a sent message to its receipt
const MESSAGE_MATCH_SLACK_SECONDS: i64 = 30;

static FILE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\w./-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|kt|c|h|cpp|hpp|css|html|json|toml|yaml|yml|md|sql|sh|lock)\b")
        .expect("file path regex")
});

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]{4,}\b").expect("identifier regex"));

static ERROR_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:error|exception|panic|failed|failure)\b[:\s].{10,}").expect("error regex")
});

static RECEIVE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"from="([^"]+)""#).expect("receive marker regex"));

// ============================================================================
// Reference classification
// ============================================================================

/// A classified inter-chunk reference with its detection confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceDetection {
    pub reference_type: ReferenceType,
    pub confidence: f32,
}

/// Whether the next chunk should link back to the previous one at all.
/// Topic-shift markers in the user text and long wall-clock gaps both
/// cut the chain.
pub fn should_link(prev: &Chunk, next: &Chunk, next_user_text: Option<&str>) -> bool {
    if let Some(text) = next_user_text {
        let lowered = text.to_lowercase();
        if TOPIC_SHIFT_MARKERS_V1.iter().any(|m| lowered.contains(m)) {
            return false;
        }
    }
    let gap = next.start_time - prev.end_time;
    gap <= Duration::minutes(MAX_CAUSAL_GAP_MINUTES)
}

/// Classify what kind of evidence ties two adjacent chunks together.
/// Checks run in priority order; the first hit wins.
pub fn classify_reference(prev: &Chunk, next: &Chunk) -> ReferenceDetection {
    if !shared_file_paths(&prev.content, &next.content).is_empty() {
        return ReferenceDetection {
            reference_type: ReferenceType::FilePath,
            confidence: 0.9,
        };
    }
    if !shared_identifiers(&prev.content, &next.content).is_empty() {
        return ReferenceDetection {
            reference_type: ReferenceType::CodeEntity,
            confidence: 0.8,
        };
    }
    if has_propagated_error(&prev.content, &next.content) {
        return ReferenceDetection {
            reference_type: ReferenceType::ErrorFragment,
            confidence: 0.85,
        };
    }
    if has_explicit_backref(&next.content) {
        return ReferenceDetection {
            reference_type: ReferenceType::ExplicitBackref,
            confidence: 0.7,
        };
    }
    if has_shared_tool_marker(&prev.content, &next.content) {
        return ReferenceDetection {
            reference_type: ReferenceType::ToolOutput,
            confidence: 0.75,
        };
    }
    ReferenceDetection {
        reference_type: ReferenceType::Adjacent,
        confidence: 0.5,
    }
}

fn shared_file_paths(a: &str, b: &str) -> HashSet<String> {
    let paths_a: HashSet<String> = FILE_PATH_RE.find_iter(a).map(|m| m.as_str().to_string()).collect();
    let paths_b: HashSet<String> = FILE_PATH_RE.find_iter(b).map(|m| m.as_str().to_string()).collect();
    paths_a.intersection(&paths_b).cloned().collect()
}

/// Identifiers that look like code (underscores or mixed case) and clear
/// the stoplist
fn code_identifiers(text: &str) -> HashSet<String> {
    IDENTIFIER_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|ident| {
            let has_underscore = ident.contains('_');
            let mixed_case = ident.chars().any(|c| c.is_lowercase())
                && ident.chars().skip(1).any(|c| c.is_uppercase());
            has_underscore || mixed_case
        })
        // Tool-use markers look like identifiers but classify separately.
        .filter(|ident| !ident.starts_with("toolu_"))
        .filter(|ident| !IDENT_STOPLIST_V1.contains(&ident.to_lowercase().as_str()))
        .map(String::from)
        .collect()
}

fn shared_identifiers(a: &str, b: &str) -> HashSet<String> {
    code_identifiers(a)
        .intersection(&code_identifiers(b))
        .cloned()
        .collect()
}

/// True when an error line from the previous chunk reappears in the next
fn has_propagated_error(prev: &str, next: &str) -> bool {
    for matched in ERROR_LINE_RE.find_iter(prev) {
        let fragment: String = matched.as_str().chars().take(60).collect();
        let fragment = fragment.trim_end();
        if fragment.len() >= 20 && next.contains(fragment) {
            return true;
        }
    }
    false
}

fn has_explicit_backref(text: &str) -> bool {
    let lowered = text.to_lowercase();
    BACKREF_PHRASES.iter().any(|p| lowered.contains(p))
}

static TOOL_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\btoolu_[A-Za-z0-9]{6,}\b").expect("tool marker regex"));

fn has_shared_tool_marker(a: &str, b: &str) -> bool {
    let markers_a: HashSet<&str> = TOOL_MARKER_RE.find_iter(a).map(|m| m.as_str()).collect();
    if markers_a.is_empty() {
        return false;
    }
    TOOL_MARKER_RE.find_iter(b).any(|m| markers_a.contains(m.as_str()))
}

// ============================================================================
// Causal session edges
// ============================================================================

/// Build the causal edges for one session's chunks (in transcript order):
/// intra-turn and inter-turn within-chain links, plus classified
/// backward/forward references between gated adjacent pairs.
pub fn detect_causal_edges(chunks: &[Chunk], turns: &[SessionTurn]) -> Vec<Edge> {
    let mut edges = Vec::new();
    for pair in chunks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);

        // Chunks cut from the same turn always chain structurally.
        let same_turn = prev
            .turn_indices
            .iter()
            .any(|t| next.turn_indices.contains(t));
        if same_turn {
            edges.push(Edge::new(
                &next.id,
                &prev.id,
                EdgeType::WithinChain,
                Some(ReferenceType::WithinChain),
                1.0,
            ));
            continue;
        }

        let user_text = next
            .turn_indices
            .first()
            .and_then(|&t| turns.iter().find(|turn| turn.index == t))
            .and_then(|turn| turn.user_text.as_deref());
        if !should_link(prev, next, user_text) {
            debug!("topic shift between chunks {} and {}", prev.id, next.id);
            continue;
        }

        let detection = classify_reference(prev, next);
        edges.push(Edge::new(
            &next.id,
            &prev.id,
            EdgeType::WithinChain,
            Some(ReferenceType::WithinChain),
            1.0,
        ));
        edges.push(Edge::new(
            &next.id,
            &prev.id,
            EdgeType::Backward,
            Some(detection.reference_type),
            detection.confidence,
        ));
        edges.push(Edge::new(
            &prev.id,
            &next.id,
            EdgeType::Forward,
            Some(detection.reference_type),
            detection.confidence * 0.8,
        ));
    }
    edges
}

// ============================================================================
// Team and sub-agent edges
// ============================================================================

/// One agent's view of a multi-agent run
pub struct AgentTrace<'a> {
    pub name: &'a str,
    pub turns: &'a [SessionTurn],
    pub chunks: &'a [Chunk],
}

impl AgentTrace<'_> {
    /// The chunk covering a given turn index
    fn chunk_for_turn(&self, turn_index: u32) -> Option<&Chunk> {
        self.chunks
            .iter()
            .find(|c| c.turn_indices.contains(&turn_index))
    }

    fn first_chunk(&self) -> Option<&Chunk> {
        self.chunks.first()
    }

    fn last_chunk(&self) -> Option<&Chunk> {
        self.chunks.last()
    }
}

fn tool_uses(turn: &SessionTurn) -> impl Iterator<Item = (&str, &serde_json::Value)> {
    turn.assistant_blocks.iter().filter_map(|b| match b {
        AssistantBlock::ToolUse { name, input, .. } => Some((name.as_str(), input)),
        AssistantBlock::Text { .. } => None,
    })
}

fn string_field<'a>(input: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| input.get(*k).and_then(|v| v.as_str()))
}

/// Team edges for a lead plus its teammates: spawn edges from the lead's
/// `Task` calls, and report/message edges from `SendMessage` calls
/// matched to the recipient's receive marker (or by timestamp within a
/// short slack when no marker is found).
pub fn detect_team_edges(lead: &AgentTrace<'_>, teammates: &[AgentTrace<'_>]) -> Vec<Edge> {
    let mut edges = Vec::new();

    // Spawn edges: a Task call naming a teammate links the lead's chunk
    // to that teammate's first chunk.
    for turn in lead.turns {
        for (tool, input) in tool_uses(turn) {
            if tool != "Task" {
                continue;
            }
            let Some(target) = string_field(input, &["team_name", "name", "teammate"]) else {
                continue;
            };
            let Some(teammate) = teammates.iter().find(|t| t.name == target) else {
                continue;
            };
            if let (Some(from), Some(to)) = (lead.chunk_for_turn(turn.index), teammate.first_chunk())
            {
                edges.push(Edge::new(&from.id, &to.id, EdgeType::TeamSpawn, None, 0.9));
            }
        }
    }

    // Message edges: SendMessage from any member to the lead is a
    // report; to another teammate it is a peer message.
    let mut all: Vec<&AgentTrace<'_>> = Vec::with_capacity(teammates.len() + 1);
    all.push(lead);
    all.extend(teammates.iter());

    for sender in &all {
        for turn in sender.turns {
            for (tool, input) in tool_uses(turn) {
                if tool != "SendMessage" {
                    continue;
                }
                let Some(recipient_name) = string_field(input, &["to", "recipient"]) else {
                    continue;
                };
                let Some(recipient) = all.iter().find(|t| t.name == recipient_name) else {
                    continue;
                };
                if recipient.name == sender.name {
                    continue;
                }
                let Some(from) = sender.chunk_for_turn(turn.index) else {
                    continue;
                };
                let Some(to) = find_receiving_chunk(recipient, sender.name, turn) else {
                    continue;
                };
                let edge_type = if recipient.name == lead.name {
                    EdgeType::TeamReport
                } else {
                    EdgeType::PeerMessage
                };
                edges.push(Edge::new(&from.id, &to.id, edge_type, None, 0.8));
            }
        }
    }
    edges
}

/// Locate the recipient chunk for a sent message: prefer a turn whose
/// text carries the sender's receive marker, else the nearest turn by
/// timestamp within the slack window.
fn find_receiving_chunk<'a>(
    recipient: &'a AgentTrace<'_>,
    sender_name: &str,
    sent_turn: &SessionTurn,
) -> Option<&'a Chunk> {
    for turn in recipient.turns {
        let marker_match = turn
            .user_text
            .as_deref()
            .and_then(|text| RECEIVE_MARKER_RE.captures(text))
            .map(|captures| captures[1] == *sender_name)
            .unwrap_or(false);
        if marker_match {
            return recipient.chunk_for_turn(turn.index);
        }
    }

    let slack = Duration::seconds(MESSAGE_MATCH_SLACK_SECONDS);
    recipient
        .turns
        .iter()
        .filter(|turn| {
            let gap = turn.start_time - sent_turn.start_time;
            gap >= Duration::zero() && gap <= slack
        })
        .min_by_key(|turn| (turn.start_time - sent_turn.start_time).num_milliseconds())
        .and_then(|turn| recipient.chunk_for_turn(turn.index))
}

/// Sub-agent edges: a spawn tool call briefs the child; the child's
/// final chunk debriefs back into the parent chunk that received the
/// tool result.
pub fn detect_subagent_edges(parent: &AgentTrace<'_>, child: &AgentTrace<'_>) -> Vec<Edge> {
    let mut edges = Vec::new();

    for turn in parent.turns {
        for (tool, input) in tool_uses(turn) {
            if !SPAWN_TOOL_NAMES.contains(&tool) {
                continue;
            }
            // A named target must match this child when present.
            if let Some(target) = string_field(input, &["team_name", "name", "teammate"]) {
                if target != child.name {
                    continue;
                }
            }
            if let (Some(from), Some(to)) = (parent.chunk_for_turn(turn.index), child.first_chunk())
            {
                edges.push(Edge::new(&from.id, &to.id, EdgeType::Brief, None, 0.9));
            }

            // Debrief: the child's last chunk points at the parent chunk
            // covering the turn where the tool result came back.
            let tool_use_id = turn.assistant_blocks.iter().find_map(|b| match b {
                AssistantBlock::ToolUse { id, name, .. } if SPAWN_TOOL_NAMES.contains(&name.as_str()) => {
                    Some(id.clone())
                }
                _ => None,
            });
            let receiving_turn = tool_use_id.and_then(|id| {
                parent
                    .turns
                    .iter()
                    .find(|t| t.tool_exchanges.iter().any(|x| x.tool_use_id == id))
            });
            if let Some(receiving) = receiving_turn {
                if let (Some(from), Some(to)) =
                    (child.last_chunk(), parent.chunk_for_turn(receiving.index))
                {
                    edges.push(Edge::new(&from.id, &to.id, EdgeType::Debrief, None, 0.85));
                }
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolExchange;
    use chrono::{Duration, Utc};

    fn chunk(id: &str, content: &str, turn: u32) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: id.to_string(),
            session_id: "s1".into(),
            session_slug: "proj".into(),
            agent_id: None,
            turn_indices: vec![turn],
            start_time: now,
            end_time: now,
            content: content.to_string(),
            approx_tokens: None,
            code_block_count: 0,
            tool_use_count: 0,
            created_at: now,
            last_accessed: now,
        }
    }

    fn turn(index: u32, user_text: Option<&str>) -> SessionTurn {
        SessionTurn {
            index,
            start_time: Utc::now(),
            user_text: user_text.map(String::from),
            assistant_blocks: Vec::new(),
            tool_exchanges: Vec::new(),
        }
    }

    #[test]
    fn test_file_path_priority() {
        let prev = chunk("a", "edited src/auth/session.rs to add checks", 0);
        let next = chunk("b", "tests for src/auth/session.rs now pass with login_flow", 1);
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::FilePath);
        assert!(detection.confidence > 0.8);
    }

    #[test]
    fn test_code_entity_detection() {
        let prev = chunk("a", "refactored validate_token into smaller pieces", 0);
        let next = chunk("b", "now validate_token handles expiry too", 1);
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::CodeEntity);
    }

    #[test]
    fn test_stoplist_filters_common_words() {
        // "should" and "update" are identifiers lexically but stoplisted.
        let prev = chunk("a", "we should_update the docs maybe", 0);
        let next = chunk("b", "should_update sounds fine", 1);
        // should_update has an underscore and is not stoplisted itself.
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::CodeEntity);

        let prev = chunk("c", "the Update value should change", 0);
        let next = chunk("d", "yes the update is needed", 1);
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::Adjacent);
    }

    #[test]
    fn test_error_fragment_detection() {
        let prev = chunk(
            "a",
            "build output:\nerror: cannot borrow `self.rows` as mutable more than once",
            0,
        );
        let next = chunk(
            "b",
            "still seeing error: cannot borrow `self.rows` as mutable more than once after the change",
            1,
        );
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::ErrorFragment);
    }

    #[test]
    fn test_explicit_backref_detection() {
        let prev = chunk("a", "set up the deployment workflow", 0);
        let next = chunk("b", "do it the same as last time please", 1);
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::ExplicitBackref);
    }

    #[test]
    fn test_tool_output_marker_detection() {
        let prev = chunk("a", "ran the build via toolu_01AbCdEf123 and it passed", 0);
        let next = chunk("b", "the output from toolu_01AbCdEf123 shows a warning though", 1);
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::ToolOutput);
    }

    #[test]
    fn test_adjacent_fallback() {
        let prev = chunk("a", "done", 0);
        let next = chunk("b", "ok", 1);
        let detection = classify_reference(&prev, &next);
        assert_eq!(detection.reference_type, ReferenceType::Adjacent);
        assert!((detection.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_topic_shift_gating() {
        let prev = chunk("a", "auth work", 0);
        let next = chunk("b", "styling work", 1);
        assert!(should_link(&prev, &next, Some("continue with the auth bit")));
        assert!(!should_link(&prev, &next, Some("New topic: let's do styling")));
    }

    #[test]
    fn test_time_gap_gating() {
        let prev = chunk("a", "auth work", 0);
        let mut next = chunk("b", "more work", 1);
        next.start_time = prev.end_time + Duration::minutes(31);
        assert!(!should_link(&prev, &next, None));
        next.start_time = prev.end_time + Duration::minutes(5);
        assert!(should_link(&prev, &next, None));
    }

    #[test]
    fn test_causal_edges_inter_turn() {
        let chunks = vec![
            chunk("a", "work on src/main.rs parsing", 0),
            chunk("b", "src/main.rs now compiles", 1),
        ];
        let turns = vec![turn(0, Some("start")), turn(1, Some("continue"))];
        let edges = detect_causal_edges(&chunks, &turns);

        // within-chain + backward + forward
        assert_eq!(edges.len(), 3);
        let backward = edges.iter().find(|e| e.edge_type == EdgeType::Backward).unwrap();
        assert_eq!(backward.source_chunk_id, "b");
        assert_eq!(backward.target_chunk_id, "a");
        assert_eq!(backward.reference_type, Some(ReferenceType::FilePath));
        let forward = edges.iter().find(|e| e.edge_type == EdgeType::Forward).unwrap();
        assert_eq!(forward.source_chunk_id, "a");
        assert!(forward.initial_weight < backward.initial_weight);
    }

    #[test]
    fn test_causal_edges_intra_turn_only_chain() {
        let chunks = vec![chunk("a", "part one", 2), chunk("b", "part two", 2)];
        let turns = vec![turn(2, Some("go"))];
        let edges = detect_causal_edges(&chunks, &turns);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::WithinChain);
        assert_eq!(edges[0].source_chunk_id, "b");
    }

    #[test]
    fn test_causal_edges_respect_topic_shift() {
        let chunks = vec![chunk("a", "auth work", 0), chunk("b", "css work", 1)];
        let turns = vec![
            turn(0, Some("start")),
            turn(1, Some("new topic: styling please")),
        ];
        let edges = detect_causal_edges(&chunks, &turns);
        assert!(edges.is_empty());
    }

    fn tool_use_turn(index: u32, tool: &str, id: &str, input: serde_json::Value) -> SessionTurn {
        SessionTurn {
            index,
            start_time: Utc::now(),
            user_text: None,
            assistant_blocks: vec![AssistantBlock::ToolUse {
                id: id.to_string(),
                name: tool.to_string(),
                input,
            }],
            tool_exchanges: Vec::new(),
        }
    }

    #[test]
    fn test_team_spawn_edge() {
        let lead_chunks = vec![chunk("lead-1", "spawning the researcher", 0)];
        let lead_turns = vec![tool_use_turn(
            0,
            "Task",
            "toolu_spawn1",
            serde_json::json!({"team_name": "researcher", "prompt": "dig in"}),
        )];
        let teammate_chunks = vec![chunk("tm-1", "starting research", 0)];
        let teammate_turns = vec![turn(0, None)];

        let lead = AgentTrace { name: "lead", turns: &lead_turns, chunks: &lead_chunks };
        let teammate =
            AgentTrace { name: "researcher", turns: &teammate_turns, chunks: &teammate_chunks };

        let edges = detect_team_edges(&lead, &[teammate]);
        let spawn = edges.iter().find(|e| e.edge_type == EdgeType::TeamSpawn).unwrap();
        assert_eq!(spawn.source_chunk_id, "lead-1");
        assert_eq!(spawn.target_chunk_id, "tm-1");
    }

    #[test]
    fn test_team_report_via_receive_marker() {
        let lead_chunks = vec![chunk("lead-1", "waiting", 0)];
        let mut lead_receive = turn(0, Some(r#"<message from="researcher" summary="done">"#));
        lead_receive.start_time = Utc::now() + Duration::hours(1); // marker beats timestamps
        let lead_turns = vec![lead_receive];

        let teammate_chunks = vec![chunk("tm-1", "reporting back", 3)];
        let teammate_turns = vec![tool_use_turn(
            3,
            "SendMessage",
            "toolu_msg1",
            serde_json::json!({"to": "lead", "summary": "done"}),
        )];

        let lead = AgentTrace { name: "lead", turns: &lead_turns, chunks: &lead_chunks };
        let teammate =
            AgentTrace { name: "researcher", turns: &teammate_turns, chunks: &teammate_chunks };

        let edges = detect_team_edges(&lead, &[teammate]);
        let report = edges.iter().find(|e| e.edge_type == EdgeType::TeamReport).unwrap();
        assert_eq!(report.source_chunk_id, "tm-1");
        assert_eq!(report.target_chunk_id, "lead-1");
    }

    #[test]
    fn test_peer_message_timestamp_fallback() {
        let base = Utc::now();
        let lead_chunks = vec![chunk("lead-1", "coordinating", 0)];
        let lead_turns = vec![turn(0, None)];

        let alpha_chunks = vec![chunk("alpha-1", "sending over", 0)];
        let mut send = tool_use_turn(
            0,
            "SendMessage",
            "toolu_msg2",
            serde_json::json!({"to": "beta", "summary": "fyi"}),
        );
        send.start_time = base;
        let alpha_turns = vec![send];

        let beta_chunks = vec![chunk("beta-1", "received it", 4)];
        let mut receive = turn(4, Some("plain text, no marker"));
        receive.start_time = base + Duration::seconds(10);
        let beta_turns = vec![receive];

        let lead = AgentTrace { name: "lead", turns: &lead_turns, chunks: &lead_chunks };
        let alpha = AgentTrace { name: "alpha", turns: &alpha_turns, chunks: &alpha_chunks };
        let beta = AgentTrace { name: "beta", turns: &beta_turns, chunks: &beta_chunks };

        let edges = detect_team_edges(&lead, &[alpha, beta]);
        let message = edges.iter().find(|e| e.edge_type == EdgeType::PeerMessage).unwrap();
        assert_eq!(message.source_chunk_id, "alpha-1");
        assert_eq!(message.target_chunk_id, "beta-1");
    }

    #[test]
    fn test_subagent_brief_and_debrief() {
        let mut spawn = tool_use_turn(
            0,
            "Task",
            "toolu_sub1",
            serde_json::json!({"prompt": "explore the codebase"}),
        );
        spawn.tool_exchanges = Vec::new();
        let mut result_turn = turn(2, None);
        result_turn.tool_exchanges = vec![ToolExchange {
            tool_use_id: "toolu_sub1".to_string(),
            result: "exploration summary".to_string(),
        }];

        let parent_chunks = vec![chunk("p-0", "spawning explorer", 0), chunk("p-2", "got results", 2)];
        let parent_turns = vec![spawn, result_turn];
        let child_chunks = vec![chunk("c-0", "exploring", 0), chunk("c-9", "final summary", 9)];
        let child_turns = vec![turn(0, None), turn(9, None)];

        let parent = AgentTrace { name: "main", turns: &parent_turns, chunks: &parent_chunks };
        let child = AgentTrace { name: "explorer", turns: &child_turns, chunks: &child_chunks };

        let edges = detect_subagent_edges(&parent, &child);
        let brief = edges.iter().find(|e| e.edge_type == EdgeType::Brief).unwrap();
        assert_eq!(brief.source_chunk_id, "p-0");
        assert_eq!(brief.target_chunk_id, "c-0");
        let debrief = edges.iter().find(|e| e.edge_type == EdgeType::Debrief).unwrap();
        assert_eq!(debrief.source_chunk_id, "c-9");
        assert_eq!(debrief.target_chunk_id, "p-2");
    }
}
