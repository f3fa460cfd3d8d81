use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::assembly::types::{ItemId, DEFAULT_BASE_WEIGHT};

const MIN_UNIFORM_DRAW: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: ItemId,
    pub weight: f64,
}

impl Candidate {
    pub fn new(id: ItemId, weight: f64) -> Self {
        Self { id, weight }
    }
}

/// Picks the candidate slice to sample from. Exclusion is dropped entirely
/// when honoring it would leave fewer than `k` candidates.
fn apply_exclusion<'a, T>(
    candidates: &'a [T],
    exclude: &HashSet<ItemId>,
    k: usize,
    id_of: impl Fn(&T) -> ItemId,
) -> Vec<&'a T> {
    let unseen: Vec<&T> = candidates
        .iter()
        .filter(|c| !exclude.contains(&id_of(*c)))
        .collect();

    if unseen.len() < k {
        candidates.iter().collect()
    } else {
        unseen
    }
}

/// Weighted sampling without replacement (Efraimidis–Spirakis).
///
/// Each candidate draws `u ~ U(0, 1)` and scores `u^(1/w)`; the `k` highest
/// scores win. A pool no larger than `k` is returned whole, in input order.
pub fn weighted_sample<R: Rng + ?Sized>(
    candidates: &[Candidate],
    exclude: &HashSet<ItemId>,
    k: usize,
    rng: &mut R,
) -> Vec<ItemId> {
    if k == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let pool = apply_exclusion(candidates, exclude, k, |c| c.id);
    if pool.len() <= k {
        return pool.into_iter().map(|c| c.id).collect();
    }

    let mut scored: Vec<(f64, ItemId)> = pool
        .into_iter()
        .map(|c| {
            let weight = if c.weight.is_finite() && c.weight > 0.0 {
                c.weight
            } else {
                DEFAULT_BASE_WEIGHT
            };
            let mut u: f64 = rng.random();
            if u <= 0.0 {
                u = MIN_UNIFORM_DRAW;
            }
            (u.powf(1.0 / weight), c.id)
        })
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(k);
    scored.into_iter().map(|(_, id)| id).collect()
}

/// Uniform sampling without replacement, same exclusion policy as
/// [`weighted_sample`].
pub fn uniform_sample<R: Rng + ?Sized>(
    ids: &[ItemId],
    exclude: &HashSet<ItemId>,
    k: usize,
    rng: &mut R,
) -> Vec<ItemId> {
    if k == 0 || ids.is_empty() {
        return Vec::new();
    }

    let mut pool: Vec<ItemId> = apply_exclusion(ids, exclude, k, |id| *id)
        .into_iter()
        .copied()
        .collect();
    if pool.len() <= k {
        return pool;
    }

    pool.shuffle(rng);
    pool.truncate(k);
    pool
}
