use super::config::{SamplingConfig, SamplingStrategy};
use super::error::EngineError;
use crate::core::models::frame::{StateAssignments, Trajectory};
use crate::core::models::ids::FrameId;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const STATE_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Representative {
    pub frame: FrameId,
    /// Membership of the frame in the state it represents.
    pub membership: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRepresentatives {
    pub state: usize,
    pub frames: Vec<Representative>,
}

impl StateRepresentatives {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

struct Candidate<'a> {
    id: FrameId,
    features: &'a [f64],
    membership: f64,
}

impl Candidate<'_> {
    fn to_representative(&self) -> Representative {
        Representative {
            frame: self.id,
            membership: self.membership,
        }
    }
}

/// Seed of the per-state generator used by stratified sampling.
pub fn state_seed(seed: u64, state: usize) -> u64 {
    seed ^ (state as u64 + 1).wrapping_mul(STATE_SEED_MIX)
}

/// Chooses up to `samples_per_state` representative frames for every state.
///
/// Candidates of a state are the frames whose dominant state it is. States
/// without candidates get an empty set, which the ensemble stage rejects.
#[instrument(skip_all, name = "representative_sampling", fields(strategy = %config.strategy))]
pub fn select_representatives(
    trajectories: &[Trajectory],
    assignments: &[StateAssignments],
    num_states: usize,
    config: &SamplingConfig,
    seed: u64,
) -> Result<Vec<StateRepresentatives>, EngineError> {
    let candidates = collect_candidates(trajectories, assignments, num_states)?;

    #[cfg(not(feature = "parallel"))]
    let iterator = candidates.into_iter().enumerate();

    #[cfg(feature = "parallel")]
    let iterator = candidates.into_par_iter().enumerate();

    let selected: Vec<StateRepresentatives> = iterator
        .map(|(state, pool)| {
            if pool.is_empty() {
                warn!(state, "State has no candidate frames; its representative set is empty");
            }
            let frames = select_for_state(pool, config, state_seed(seed, state));
            debug!(state, picked = frames.len(), "Selected representatives");
            StateRepresentatives { state, frames }
        })
        .collect();
    Ok(selected)
}

fn collect_candidates<'a>(
    trajectories: &'a [Trajectory],
    assignments: &[StateAssignments],
    num_states: usize,
) -> Result<Vec<Vec<Candidate<'a>>>, EngineError> {
    if trajectories.len() != assignments.len() {
        return Err(EngineError::InvalidInput(format!(
            "{} trajectories but {} state assignments",
            trajectories.len(),
            assignments.len()
        )));
    }
    let mut pools: Vec<Vec<Candidate<'a>>> = (0..num_states).map(|_| Vec::new()).collect();
    for (traj, assigned) in trajectories.iter().zip(assignments) {
        if traj.replica() != assigned.replica || traj.len() != assigned.memberships.len() {
            return Err(EngineError::InvalidInput(format!(
                "assignments of replica {} do not match its trajectory",
                assigned.replica
            )));
        }
        for (frame, m) in traj.frames().iter().zip(&assigned.memberships) {
            let state = m.dominant_state();
            if state >= num_states {
                return Err(EngineError::InvalidInput(format!(
                    "{} is assigned to state {}, only {} states exist",
                    frame.id, state, num_states
                )));
            }
            pools[state].push(Candidate {
                id: frame.id,
                features: frame.features(),
                membership: m.get(state),
            });
        }
    }
    Ok(pools)
}

fn select_for_state(
    mut pool: Vec<Candidate<'_>>,
    config: &SamplingConfig,
    state_seed: u64,
) -> Vec<Representative> {
    let n = config.samples_per_state.min(pool.len());
    match config.strategy {
        SamplingStrategy::Medoid => {
            let costs = medoid_costs(&pool);
            let mut order: Vec<usize> = (0..pool.len()).collect();
            order.sort_by(|&a, &b| {
                costs[a]
                    .partial_cmp(&costs[b])
                    .unwrap_or(Ordering::Equal)
                    .then(pool[a].id.cmp(&pool[b].id))
            });
            order.iter().take(n).map(|&i| pool[i].to_representative()).collect()
        }
        SamplingStrategy::TopProbability => {
            pool.sort_by(|a, b| {
                b.membership
                    .partial_cmp(&a.membership)
                    .unwrap_or(Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
            pool.iter().take(n).map(Candidate::to_representative).collect()
        }
        SamplingStrategy::Stratified { bins } => stratified(&pool, n, bins, state_seed),
    }
}

/// Membership-weighted total distance of every candidate to the whole pool.
fn medoid_costs(pool: &[Candidate<'_>]) -> Vec<f64> {
    let cost = |c: &Candidate<'_>| -> f64 {
        pool.iter()
            .map(|o| o.membership * distance(c.features, o.features))
            .sum()
    };

    #[cfg(not(feature = "parallel"))]
    let costs = pool.iter().map(cost).collect();

    #[cfg(feature = "parallel")]
    let costs = pool.par_iter().map(cost).collect();

    costs
}

fn stratified(pool: &[Candidate<'_>], n: usize, bins: usize, seed: u64) -> Vec<Representative> {
    if pool.is_empty() || n == 0 {
        return Vec::new();
    }
    let dim = pool[0].features.len();
    let total_mass: f64 = pool.iter().map(|c| c.membership).sum();
    let mut centroid = vec![0.0; dim];
    for c in pool {
        for (acc, x) in centroid.iter_mut().zip(c.features) {
            *acc += c.membership * x / total_mass;
        }
    }

    let mut order: Vec<(f64, usize)> = pool
        .iter()
        .enumerate()
        .map(|(i, c)| (distance(c.features, &centroid), i))
        .collect();
    order.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(pool[a.1].id.cmp(&pool[b.1].id))
    });

    let bins = bins.min(pool.len());
    let strata: Vec<&[(f64, usize)]> = split_even(&order, bins);
    let quotas = allocate_quotas(&strata.iter().map(|s| s.len()).collect::<Vec<_>>(), n);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = Vec::with_capacity(n);
    for (stratum, quota) in strata.iter().zip(quotas) {
        let mut chosen: Vec<&Candidate<'_>> = stratum
            .choose_multiple(&mut rng, quota)
            .map(|&(_, i)| &pool[i])
            .collect();
        chosen.sort_by_key(|c| c.id);
        picked.extend(chosen.into_iter().map(Candidate::to_representative));
    }
    picked
}

/// Splits `items` into `parts` contiguous chunks whose sizes differ by at most one.
fn split_even<T>(items: &[T], parts: usize) -> Vec<&[T]> {
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        chunks.push(&items[start..start + len]);
        start += len;
    }
    chunks
}

/// Spreads `n` draws over strata, remainder to the first ones, never exceeding
/// a stratum's size.
fn allocate_quotas(sizes: &[usize], n: usize) -> Vec<usize> {
    let parts = sizes.len();
    let mut quotas: Vec<usize> = (0..parts)
        .map(|i| (n / parts + usize::from(i < n % parts)).min(sizes[i]))
        .collect();
    let mut missing = n.saturating_sub(quotas.iter().sum());
    for (quota, &size) in quotas.iter_mut().zip(sizes) {
        if missing == 0 {
            break;
        }
        let spare = (size - *quota).min(missing);
        *quota += spare;
        missing -= spare;
    }
    quotas
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
