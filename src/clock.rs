//! Vector clocks and edge decay
//!
//! Per-agent logical clocks measure elapsed "hops" between an edge's
//! creation and the present; decay curves map hops to a weight in [0, 1].
//! When an edge carries no clock (or no reference clock is available) the
//! wall-clock gap is mapped to hops through a configured scale instead.
//! Decay is recomputed at query time; edges are never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Edge;

// ============================================================================
// Vector clock
// ============================================================================

/// Per-agent counters. Backed by a sorted map so serialization is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one agent's counter
    pub fn tick(&mut self, agent_id: &str) {
        *self.0.entry(agent_id.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, agent_id: &str) -> u64 {
        self.0.get(agent_id).copied().unwrap_or(0)
    }

    /// Element-wise max. Commutative, associative, idempotent.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (agent, &count) in &other.0 {
            let entry = merged.entry(agent.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        Self(merged)
    }

    /// Hop distance from this (edge) clock to a reference clock: total
    /// agent ticks elapsed since the edge was stamped. Agents the edge
    /// never saw count from zero; agents the reference never saw count
    /// nothing.
    pub fn hop_distance(&self, reference: &Self) -> u64 {
        reference
            .0
            .iter()
            .map(|(agent, &ref_count)| ref_count.saturating_sub(self.get(agent)))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Decay curves
// ============================================================================

/// Shape of a decay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecayCurveKind {
    #[default]
    Linear,
    Exponential,
    DelayedLinear,
}

/// A decay curve: weight 1 at t = 0, falling toward 0 at `dies_at_hops`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecaySpec {
    pub kind: DecayCurveKind,
    /// Hop count at which the curve reaches (approximately) zero
    pub dies_at_hops: f64,
    /// Flat interval before delayed-linear decay begins
    pub hold_hops: f64,
}

impl Default for DecaySpec {
    fn default() -> Self {
        Self {
            kind: DecayCurveKind::Linear,
            dies_at_hops: 20.0,
            hold_hops: 0.0,
        }
    }
}

impl DecaySpec {
    /// Weight at elapsed time `t` (in hops), in [0, 1]
    pub fn weight_at(&self, t: f64) -> f32 {
        if t <= 0.0 {
            return 1.0;
        }
        let dies_at = self.dies_at_hops.max(f64::EPSILON);
        let w = match self.kind {
            DecayCurveKind::Linear => 1.0 - t / dies_at,
            DecayCurveKind::Exponential => {
                // Rate chosen so the value at dies_at is 0.01.
                let k = (100.0f64).ln() / dies_at;
                (-k * t).exp()
            }
            DecayCurveKind::DelayedLinear => {
                let hold = self.hold_hops.clamp(0.0, dies_at);
                if t <= hold {
                    1.0
                } else {
                    1.0 - (t - hold) / (dies_at - hold).max(f64::EPSILON)
                }
            }
        };
        w.clamp(0.0, 1.0) as f32
    }
}

/// Direction-specific decay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    pub backward: DecaySpec,
    pub forward: DecaySpec,
    /// Wall-clock milliseconds equivalent to one hop, used when either
    /// the edge or the reference clock is missing
    pub ms_per_hop: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            backward: DecaySpec {
                kind: DecayCurveKind::DelayedLinear,
                dies_at_hops: 20.0,
                hold_hops: 3.0,
            },
            forward: DecaySpec {
                kind: DecayCurveKind::Linear,
                dies_at_hops: 10.0,
                hold_hops: 0.0,
            },
            // One hour of wall clock per hop on the fallback path.
            ms_per_hop: 3_600_000.0,
        }
    }
}

impl DecayConfig {
    /// Elapsed hops for an edge at query time: clock hop distance when
    /// both clocks exist, otherwise wall-clock milliseconds over the
    /// configured scale.
    pub fn elapsed_hops(
        &self,
        edge: &Edge,
        query_time: DateTime<Utc>,
        reference: Option<&VectorClock>,
    ) -> f64 {
        match (&edge.vector_clock, reference) {
            (Some(edge_clock), Some(reference)) => edge_clock.hop_distance(reference) as f64,
            _ => {
                let elapsed_ms = (query_time - edge.created_at).num_milliseconds().max(0) as f64;
                elapsed_ms / self.ms_per_hop.max(1.0)
            }
        }
    }
}

/// Repeated-observation boost: `w * (1 + 0.1 * ln(link_count))`
#[inline]
pub fn link_boost(weight: f32, link_count: u32) -> f32 {
    weight * (1.0 + 0.1 * (link_count.max(1) as f32).ln())
}

/// Query-time effective weight of an edge: initial weight through the
/// direction-appropriate decay curve, then the link boost. Pure; the
/// stored row is untouched.
pub fn effective_weight(
    edge: &Edge,
    query_time: DateTime<Utc>,
    decay: &DecayConfig,
    reference: Option<&VectorClock>,
) -> f32 {
    let spec = if edge.edge_type.decays_forward() {
        &decay.forward
    } else {
        &decay.backward
    };
    let t = decay.elapsed_hops(edge, query_time, reference);
    link_boost(edge.initial_weight * spec.weight_at(t), edge.link_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EdgeType;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        VectorClock(pairs.iter().map(|(a, c)| (a.to_string(), *c)).collect())
    }

    #[test]
    fn test_merge_laws() {
        let a = clock(&[("alice", 3), ("bob", 1)]);
        let b = clock(&[("bob", 5), ("carol", 2)]);
        let c = clock(&[("alice", 1), ("carol", 7)]);

        // Idempotent, commutative, associative.
        assert_eq!(a.merge(&a), a);
        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));

        let merged = a.merge(&b);
        assert_eq!(merged.get("alice"), 3);
        assert_eq!(merged.get("bob"), 5);
        assert_eq!(merged.get("carol"), 2);
    }

    #[test]
    fn test_hop_distance() {
        let edge = clock(&[("alice", 2), ("bob", 4)]);
        let reference = clock(&[("alice", 5), ("bob", 4), ("carol", 3)]);
        // alice advanced 3, bob 0, carol 3 (unseen by the edge).
        assert_eq!(edge.hop_distance(&reference), 6);

        // A reference behind the edge contributes nothing.
        let behind = clock(&[("alice", 1)]);
        assert_eq!(edge.hop_distance(&behind), 0);
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let a = clock(&[("zeta", 1), ("alpha", 2), ("mid", 3)]);
        let json = serde_json::to_string(&a).unwrap();
        let json2 = serde_json::to_string(&a.clone()).unwrap();
        assert_eq!(json, json2);
        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        // Sorted map: alpha serializes before zeta.
        assert!(json.find("alpha").unwrap() < json.find("zeta").unwrap());
    }

    #[test]
    fn test_linear_decay() {
        let spec = DecaySpec {
            kind: DecayCurveKind::Linear,
            dies_at_hops: 10.0,
            hold_hops: 0.0,
        };
        assert_eq!(spec.weight_at(0.0), 1.0);
        assert!((spec.weight_at(5.0) - 0.5).abs() < 1e-6);
        assert_eq!(spec.weight_at(10.0), 0.0);
        assert_eq!(spec.weight_at(12.0), 0.0);
    }

    #[test]
    fn test_exponential_decay_calibration() {
        let spec = DecaySpec {
            kind: DecayCurveKind::Exponential,
            dies_at_hops: 10.0,
            hold_hops: 0.0,
        };
        assert_eq!(spec.weight_at(0.0), 1.0);
        assert!((spec.weight_at(10.0) - 0.01).abs() < 1e-4);
    }

    #[test]
    fn test_delayed_linear_decay() {
        let spec = DecaySpec {
            kind: DecayCurveKind::DelayedLinear,
            dies_at_hops: 10.0,
            hold_hops: 4.0,
        };
        assert_eq!(spec.weight_at(2.0), 1.0);
        assert_eq!(spec.weight_at(4.0), 1.0);
        assert!((spec.weight_at(7.0) - 0.5).abs() < 1e-6);
        assert_eq!(spec.weight_at(10.0), 0.0);
    }

    #[test]
    fn test_decay_monotonic_in_t() {
        for kind in [
            DecayCurveKind::Linear,
            DecayCurveKind::Exponential,
            DecayCurveKind::DelayedLinear,
        ] {
            let spec = DecaySpec {
                kind,
                dies_at_hops: 15.0,
                hold_hops: 3.0,
            };
            let mut prev = f32::INFINITY;
            for step in 0..40 {
                let w = spec.weight_at(step as f64 * 0.5);
                assert!(w <= prev, "{:?} not monotonic", kind);
                assert!((0.0..=1.0).contains(&w));
                prev = w;
            }
        }
    }

    #[test]
    fn test_effective_weight_prefers_clock_distance() {
        let mut edge = Edge::new("a", "b", EdgeType::Backward, None, 1.0);
        edge.vector_clock = Some(clock(&[("alice", 2)]));
        edge.created_at = Utc::now() - chrono::Duration::days(365);

        let decay = DecayConfig {
            backward: DecaySpec {
                kind: DecayCurveKind::Linear,
                dies_at_hops: 10.0,
                hold_hops: 0.0,
            },
            ..DecayConfig::default()
        };

        // With a reference clock only 2 hops ahead the edge stays strong,
        // despite a year of wall clock.
        let reference = clock(&[("alice", 4)]);
        let w = effective_weight(&edge, Utc::now(), &decay, Some(&reference));
        assert!((w - 0.8).abs() < 1e-5);

        // Without a reference clock the wall-clock fallback kills it.
        let w_fallback = effective_weight(&edge, Utc::now(), &decay, None);
        assert_eq!(w_fallback, 0.0);
    }

    #[test]
    fn test_link_boost_diminishing() {
        assert_eq!(link_boost(1.0, 1), 1.0);
        let double = link_boost(1.0, 2);
        let ten = link_boost(1.0, 10);
        assert!(double > 1.0);
        assert!(ten > double);
        // Logarithmic growth: ten links is well under 10x two links.
        assert!(ten < 2.0 * double);
    }
}
