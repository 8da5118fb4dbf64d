//! Weighted random endpoint selection.
//!
//! Weights are turned into a cumulative array and a single uniform draw
//! in `[0, total)` picks the first bucket whose upper bound exceeds it.

use liquid_core::PlacementKind;

use crate::endpoint::EndpointState;

/// Selection weight of each candidate, in candidate order.
///
/// Outside hybrid placement every candidate uses its configured weight.
/// Under hybrid placement the local endpoint receives `local_weight` of
/// the total mass and remotes share the remainder in proportion to their
/// own weights. When only one side has candidates it receives everything.
pub fn placement_weights(
    kind: PlacementKind,
    local_weight: f64,
    candidates: &[&EndpointState],
) -> Vec<f64> {
    let raw: Vec<f64> = candidates.iter().map(|c| c.config.weight.max(0.0)).collect();
    if kind != PlacementKind::Hybrid {
        return raw;
    }

    let has_local = candidates.iter().any(|c| c.is_local);
    let remote_total: f64 = candidates
        .iter()
        .zip(&raw)
        .filter(|(c, _)| !c.is_local)
        .map(|(_, w)| *w)
        .sum();
    let has_remote = remote_total > 0.0;

    let local_share = match (has_local, has_remote) {
        (true, true) => local_weight.clamp(0.0, 1.0),
        (true, false) => 1.0,
        (false, _) => 0.0,
    };
    let remote_share = 1.0 - local_share;

    candidates
        .iter()
        .zip(raw)
        .map(|(c, w)| {
            if c.is_local {
                local_share
            } else if has_remote {
                remote_share * w / remote_total
            } else {
                0.0
            }
        })
        .collect()
}

/// Index picked by `draw ∈ [0, 1)` over `weights`.
///
/// An all-zero weight vector falls back to a uniform pick. Returns `None`
/// only for an empty slice.
pub fn pick_weighted(weights: &[f64], draw: f64) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        let idx = (draw * weights.len() as f64) as usize;
        return Some(idx.min(weights.len() - 1));
    }

    let mut cumulative = Vec::with_capacity(weights.len());
    let mut running = 0.0;
    for w in weights {
        running += w;
        cumulative.push(running);
    }

    let target = draw * total;
    let idx = cumulative
        .iter()
        .position(|&upper| target < upper)
        .unwrap_or(weights.len() - 1);

    // Skip zero-weight buckets that a rounding edge could land on.
    if weights[idx] > 0.0 {
        Some(idx)
    } else {
        weights.iter().rposition(|w| *w > 0.0)
    }
}
