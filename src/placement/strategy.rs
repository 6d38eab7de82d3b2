//! Fragment-to-domain assignment
//!
//! Every strategy respects a per-domain cap of K-1 fragments per set, so no
//! single domain can ever reconstruct a set on its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::DomainId;

/// Strategy for assigning fragments to domains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStrategy {
    /// Round-robin across domains, starting at a rotating offset
    #[default]
    RoundRobin,

    /// Prefer heavier domains, spreading load as they fill
    Weighted,
}

/// Maximum fragments of one set a domain may hold
pub fn per_domain_cap(threshold: usize) -> usize {
    threshold.saturating_sub(1)
}

/// Assign `total` fragments to `domains`
///
/// # Arguments
/// * `offset` - rotation applied to round-robin starting position
/// * `weight` - weight lookup used by the weighted strategy
///
/// # Errors
/// `InvalidParameters` if the domains cannot hold `total` fragments under the cap
pub fn assign<W>(
    strategy: AssignmentStrategy,
    total: usize,
    threshold: usize,
    domains: &[DomainId],
    offset: usize,
    weight: W,
) -> Result<Vec<DomainId>>
where
    W: Fn(DomainId) -> u32,
{
    let cap = per_domain_cap(threshold);
    if domains.is_empty() || domains.len() * cap < total {
        return Err(Error::InvalidParameters(format!(
            "{} usable domains can hold at most {} fragments per set with K={}, need {}",
            domains.len(),
            domains.len() * cap,
            threshold,
            total
        )));
    }

    let assignment = match strategy {
        AssignmentStrategy::RoundRobin => assign_round_robin(total, domains, offset),
        AssignmentStrategy::Weighted => assign_weighted(total, cap, domains, weight),
    };
    Ok(assignment)
}

/// Round-robin assignment across domains
fn assign_round_robin(total: usize, domains: &[DomainId], offset: usize) -> Vec<DomainId> {
    let n = domains.len();
    (0..total).map(|i| domains[(offset + i) % n]).collect()
}

/// Weighted assignment: each fragment goes to the domain with the highest
/// weight per held fragment that is still under the cap
fn assign_weighted<W>(total: usize, cap: usize, domains: &[DomainId], weight: W) -> Vec<DomainId>
where
    W: Fn(DomainId) -> u32,
{
    let mut load: HashMap<DomainId, usize> = HashMap::new();
    let mut out = Vec::with_capacity(total);

    for _ in 0..total {
        let chosen = domains
            .iter()
            .copied()
            .filter(|d| load.get(d).copied().unwrap_or(0) < cap)
            .max_by(|a, b| {
                let score_a = weight(*a) as f64 / (load.get(a).copied().unwrap_or(0) + 1) as f64;
                let score_b = weight(*b) as f64 / (load.get(b).copied().unwrap_or(0) + 1) as f64;
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lower ID wins ties
                    .then_with(|| b.cmp(a))
            });

        // Capacity was checked up front, so a domain is always available
        if let Some(domain) = chosen {
            *load.entry(domain).or_insert(0) += 1;
            out.push(domain);
        }
    }
    out
}

/// Pick a single target domain for a substitute write or a hop
///
/// Candidates must be below the cap for this set; among them the least
/// occupied wins, then the heaviest, then the lowest ID.
pub fn pick_target<W>(
    candidates: &[DomainId],
    occupancy: &HashMap<DomainId, usize>,
    threshold: usize,
    weight: W,
) -> Option<DomainId>
where
    W: Fn(DomainId) -> u32,
{
    let cap = per_domain_cap(threshold);
    candidates
        .iter()
        .copied()
        .filter(|d| occupancy.get(d).copied().unwrap_or(0) < cap)
        .min_by(|a, b| {
            let load_a = occupancy.get(a).copied().unwrap_or(0);
            let load_b = occupancy.get(b).copied().unwrap_or(0);
            load_a
                .cmp(&load_b)
                .then_with(|| weight(*b).cmp(&weight(*a)))
                .then_with(|| a.cmp(b))
        })
}
