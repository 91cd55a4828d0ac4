//! Backend selection: regional preference, performance scoring, weighted random.
//!
//! Selection is a pure function over a candidate list, the request context
//! and an optional metrics snapshot. It never touches registry state, which
//! keeps it trivial to property-test and decouples it from the registry's
//! locking discipline.

use std::collections::HashMap;

use rand::Rng;

use crate::region::preferred_region;
use crate::types::{Backend, Metrics, RequestContext};

/// Score assigned to backends with no recorded traffic.
const NEW_BACKEND_SCORE: f64 = 50.0;

/// Picks one backend from `candidates` for the given request.
///
/// Steps, in order:
/// 1. A single candidate is returned as-is.
/// 2. Candidates are narrowed to the client's preferred region when the
///    country maps to one (exact region match first, then partial).
/// 3. When a non-empty metrics snapshot is supplied, each candidate gets a
///    transient weight derived from its performance score; otherwise the
///    configured weights apply.
/// 4. A weighted random draw picks the winner.
///
/// Ordering within every step preserves the candidates' order, so ties
/// resolve to the earlier-configured backend. Returns `None` only when
/// `candidates` is empty.
pub fn select<'a, R: Rng + ?Sized>(
    candidates: &'a [Backend],
    ctx: &RequestContext,
    metrics: Option<&HashMap<String, Metrics>>,
    rng: &mut R,
) -> Option<&'a Backend> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(&candidates[0]);
    }

    let narrowed = narrow_by_region(candidates, &ctx.country);

    let weights: Vec<u64> = match metrics.filter(|m| !m.is_empty()) {
        Some(snapshot) => performance_weights(&narrowed, snapshot),
        None => narrowed
            .iter()
            .map(|b| u64::from(b.weight.max(1)))
            .collect(),
    };

    Some(weighted_pick(&narrowed, &weights, rng))
}

/// Narrows candidates to the preferred region for `country`.
///
/// Exact region matches win; failing that, backends whose lowercased
/// region contains any `-`-separated part of the preferred region; failing
/// that, all candidates.
fn narrow_by_region<'a>(candidates: &'a [Backend], country: &str) -> Vec<&'a Backend> {
    let preferred = match preferred_region(country) {
        Some(region) => region,
        None => return candidates.iter().collect(),
    };

    let exact: Vec<&Backend> = candidates
        .iter()
        .filter(|b| b.region.eq_ignore_ascii_case(preferred))
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let parts: Vec<&str> = preferred.split('-').collect();
    let partial: Vec<&Backend> = candidates
        .iter()
        .filter(|b| {
            let region = b.region.to_ascii_lowercase();
            parts.iter().any(|part| region.contains(part))
        })
        .collect();
    if !partial.is_empty() {
        return partial;
    }

    candidates.iter().collect()
}

/// Transient weights derived from recorded performance; lower scores get
/// heavier weights. Every weight is at least 1 so no candidate is starved.
fn performance_weights(candidates: &[&Backend], snapshot: &HashMap<String, Metrics>) -> Vec<u64> {
    let scores: Vec<f64> = candidates
        .iter()
        .map(|b| score(snapshot.get(&b.url)))
        .collect();
    let max_score = scores.iter().cloned().fold(f64::MIN, f64::max) + 1.0;
    scores
        .iter()
        .map(|s| (max_score - s).floor().max(1.0) as u64)
        .collect()
}

/// Performance score, lower is better: 70% weighted error rate plus 30%
/// capped average latency. Backends without traffic score a neutral 50.
fn score(metrics: Option<&Metrics>) -> f64 {
    match metrics {
        Some(m) if m.requests > 0 => {
            m.error_rate() * 100.0 * 0.7 + (m.avg_time() / 100.0).min(50.0) * 0.3
        }
        _ => NEW_BACKEND_SCORE,
    }
}

/// Weighted random draw preserving candidate order; the first candidate
/// backs a zero total weight.
fn weighted_pick<'a, R: Rng + ?Sized>(
    candidates: &[&'a Backend],
    weights: &[u64],
    rng: &mut R,
) -> &'a Backend {
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return candidates[0];
    }

    let mut threshold = rng.gen_range(0..total);
    for (backend, weight) in candidates.iter().zip(weights) {
        if threshold < *weight {
            return *backend;
        }
        threshold -= *weight;
    }
    candidates[0]
}
