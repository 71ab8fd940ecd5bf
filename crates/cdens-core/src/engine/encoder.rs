use super::config::EncoderConfig;
use super::error::EngineError;
use crate::core::linalg::covariance::{LaggedMoments, VampDecomposition};
use crate::core::models::frame::{Membership, StateAssignments, Trajectory};
use nalgebra::DVector;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Trained mapping from feature vectors to soft state memberships.
///
/// Features are projected onto the leading VAMP singular functions of the
/// training data, then softly assigned to `K` cluster centers in that
/// slow-coordinate space. One trained instance encodes every replica.
#[derive(Debug, Clone)]
pub struct StateEncoder {
    dimension: usize,
    num_states: usize,
    latent_dim: usize,
    stiffness: f64,
    vamp: VampDecomposition,
    centers: Vec<DVector<f64>>,
    training_score: f64,
}

struct Candidate {
    centers: Vec<DVector<f64>>,
    score: f64,
}

impl StateEncoder {
    #[instrument(skip_all, name = "state_encoder_fit", fields(num_states = config.num_states, lag = lag))]
    pub fn fit(
        trajectories: &[Trajectory],
        config: &EncoderConfig,
        lag: usize,
        seed: u64,
    ) -> Result<Self, EngineError> {
        let dimension = validate_trajectories(trajectories)?;
        let num_states = config.num_states;

        let moments = accumulate_moments(trajectories, dimension, lag);
        if moments.count() < 2 {
            return Err(EngineError::InvalidInput(format!(
                "need at least 2 time-lagged pairs at lag {}, found {}",
                lag,
                moments.count()
            )));
        }
        let cov = moments
            .covariances()
            .ok_or_else(|| EngineError::Internal("no lagged pairs accumulated".to_string()))?;
        let vamp = VampDecomposition::new(&cov, config.regularization);
        if vamp.available_dimensions() == 0 {
            return Err(EngineError::DegenerateEncoding {
                reason: "features carry no variance above the regularization cutoff".to_string(),
            });
        }

        let latent_dim = config
            .latent_dim
            .unwrap_or(num_states - 1)
            .min(vamp.available_dimensions())
            .max(1);
        debug!(
            rank = vamp.rank_instantaneous,
            latent_dim,
            singular_values = ?vamp.singular_values,
            "Computed VAMP decomposition of the features"
        );

        let latent: Vec<Vec<DVector<f64>>> = trajectories
            .iter()
            .map(|t| {
                t.frames()
                    .iter()
                    .map(|f| vamp.project(f.features(), latent_dim))
                    .collect()
            })
            .collect();
        let points: Vec<&DVector<f64>> = latent.iter().flatten().collect();

        let mut best: Option<Candidate> = None;
        let mut last_reason = String::from("no restarts were run");
        for restart in 0..config.restarts {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(restart as u64));
            let centers = soft_kmeans(&points, num_states, config, &mut rng);

            match score_candidate(&latent, &centers, config, lag) {
                Ok(score) => {
                    debug!(restart, score, "Restart produced a valid encoding");
                    if best.as_ref().map_or(true, |b| score > b.score) {
                        best = Some(Candidate { centers, score });
                    }
                }
                Err(reason) => {
                    warn!(restart, "Degenerate encoding candidate: {}", reason);
                    last_reason = reason;
                }
            }
        }

        let best = best.ok_or(EngineError::DegenerateEncoding {
            reason: last_reason,
        })?;
        info!(
            vamp2 = best.score,
            "State encoder trained on {} frames",
            points.len()
        );

        Ok(Self {
            dimension,
            num_states,
            latent_dim,
            stiffness: config.stiffness,
            vamp,
            centers: best.centers,
            training_score: best.score,
        })
    }

    pub fn encode(&self, features: &[f64]) -> Result<Membership, EngineError> {
        if features.len() != self.dimension {
            return Err(EngineError::InvalidInput(format!(
                "feature vector has dimension {}, encoder expects {}",
                features.len(),
                self.dimension
            )));
        }
        let z = self.vamp.project(features, self.latent_dim);
        Ok(Membership::new(soft_assign(&z, &self.centers, self.stiffness))?)
    }

    pub fn encode_trajectory(&self, trajectory: &Trajectory) -> Result<StateAssignments, EngineError> {
        let memberships = trajectory
            .frames()
            .iter()
            .map(|f| self.encode(f.features()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StateAssignments {
            replica: trajectory.replica(),
            memberships,
        })
    }

    #[instrument(skip_all, name = "state_encoder_encode_all")]
    pub fn encode_all(&self, trajectories: &[Trajectory]) -> Result<Vec<StateAssignments>, EngineError> {
        #[cfg(not(feature = "parallel"))]
        let iterator = trajectories.iter();

        #[cfg(feature = "parallel")]
        let iterator = trajectories.par_iter();

        iterator.map(|t| self.encode_trajectory(t)).collect()
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// VAMP-2 score of the output memberships of the selected candidate.
    pub fn vamp2_score(&self) -> f64 {
        self.training_score
    }

    /// Singular values of the feature-level Koopman matrix, descending.
    pub fn feature_singular_values(&self) -> &[f64] {
        &self.vamp.singular_values
    }
}

fn validate_trajectories(trajectories: &[Trajectory]) -> Result<usize, EngineError> {
    let first = trajectories
        .first()
        .ok_or_else(|| EngineError::InvalidInput("no trajectories supplied".to_string()))?;
    let dimension = first.dimension();
    if dimension == 0 {
        return Err(EngineError::InvalidInput(
            "frames have no features".to_string(),
        ));
    }
    for t in trajectories {
        if t.dimension() != dimension {
            return Err(EngineError::InvalidInput(format!(
                "replica {} has {} features per frame, replica {} has {}",
                t.replica(),
                t.dimension(),
                first.replica(),
                dimension
            )));
        }
    }
    Ok(dimension)
}

fn accumulate_moments(trajectories: &[Trajectory], dimension: usize, lag: usize) -> LaggedMoments {
    #[cfg(not(feature = "parallel"))]
    let iterator = trajectories.iter();

    #[cfg(feature = "parallel")]
    let iterator = trajectories.par_iter();

    let per_trajectory = iterator.map(|t| {
        let mut m = LaggedMoments::new(dimension);
        for (x0, x1) in t.lagged_pairs(lag) {
            m.add(x0, x1);
        }
        m
    });

    #[cfg(not(feature = "parallel"))]
    let total = per_trajectory.fold(LaggedMoments::new(dimension), LaggedMoments::merge);

    #[cfg(feature = "parallel")]
    let total = per_trajectory.reduce(|| LaggedMoments::new(dimension), LaggedMoments::merge);

    total
}

/// Softmax of negative scaled squared distances to every center.
fn soft_assign(z: &DVector<f64>, centers: &[DVector<f64>], stiffness: f64) -> Vec<f64> {
    let d2: Vec<f64> = centers.iter().map(|c| (z - c).norm_squared()).collect();
    let min = d2.iter().copied().fold(f64::INFINITY, f64::min);
    let mut weights: Vec<f64> = d2.iter().map(|d| (-stiffness * (d - min)).exp()).collect();
    let total: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }
    weights
}

fn kmeans_plus_plus(points: &[&DVector<f64>], k: usize, rng: &mut StdRng) -> Vec<DVector<f64>> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())].clone());
    while centers.len() < k {
        let d2: Vec<f64> = points
            .iter()
            .map(|p| {
                centers
                    .iter()
                    .map(|c| (*p - c).norm_squared())
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let next = match WeightedIndex::new(&d2) {
            Ok(dist) => dist.sample(rng),
            // Every point coincides with a center already.
            Err(_) => rng.gen_range(0..points.len()),
        };
        centers.push(points[next].clone());
    }
    centers
}

fn soft_kmeans(
    points: &[&DVector<f64>],
    k: usize,
    config: &EncoderConfig,
    rng: &mut StdRng,
) -> Vec<DVector<f64>> {
    let mut centers = kmeans_plus_plus(points, k, rng);
    let dim = centers[0].len();

    for iteration in 0..config.max_iterations {
        let mut sums = vec![DVector::<f64>::zeros(dim); k];
        let mut mass = vec![0.0; k];
        for p in points {
            for (s, m) in soft_assign(p, &centers, config.stiffness).into_iter().enumerate() {
                sums[s].axpy(m, *p, 1.0);
                mass[s] += m;
            }
        }

        let mut shift = 0.0_f64;
        for s in 0..k {
            if mass[s] > f64::EPSILON {
                let updated = &sums[s] / mass[s];
                shift = shift.max((&updated - &centers[s]).norm());
                centers[s] = updated;
            }
        }
        if shift < config.convergence_threshold {
            debug!(iteration, "Soft clustering converged");
            break;
        }
    }
    centers
}

/// VAMP-2 score of the memberships induced by `centers`, or the reason the
/// candidate is degenerate.
fn score_candidate(
    latent: &[Vec<DVector<f64>>],
    centers: &[DVector<f64>],
    config: &EncoderConfig,
    lag: usize,
) -> Result<f64, String> {
    let k = centers.len();
    let memberships: Vec<Vec<Vec<f64>>> = latent
        .iter()
        .map(|traj| {
            traj.iter()
                .map(|z| soft_assign(z, centers, config.stiffness))
                .collect()
        })
        .collect();

    let total_frames: usize = memberships.iter().map(Vec::len).sum();
    let mut mass = vec![0.0; k];
    for m in memberships.iter().flatten() {
        for (s, v) in m.iter().enumerate() {
            mass[s] += v;
        }
    }
    let threshold = config.min_state_population * total_frames as f64;
    if let Some(state) = mass.iter().position(|&m| m < threshold) {
        return Err(format!(
            "state {} carries membership mass {:.3}, below the minimum {:.3}",
            state, mass[state], threshold
        ));
    }

    let mut moments = LaggedMoments::new(k);
    for traj in &memberships {
        if traj.len() > lag {
            for t in 0..traj.len() - lag {
                moments.add(&traj[t], &traj[t + lag]);
            }
        }
    }
    let cov = moments
        .covariances()
        .ok_or_else(|| "no lagged membership pairs".to_string())?;
    let vamp = VampDecomposition::new(&cov, config.regularization);
    if vamp.rank_instantaneous < k - 1 {
        return Err(format!(
            "membership covariance has rank {}, expected {}",
            vamp.rank_instantaneous,
            k - 1
        ));
    }
    Ok(vamp.vamp2_score())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::PipelineConfigBuilder;
    use crate::core::models::ids::BasisSetId;

    fn config(k: usize) -> EncoderConfig {
        PipelineConfigBuilder::new()
            .num_states(k)
            .lag_time(1)
            .basis_set(BasisSetId::from("test"))
            .build()
            .unwrap()
            .encoder
    }

    /// Two metastable wells at x = ±2 with small noise, switching every 40 frames.
    fn two_well_trajectory(replica: usize, offset: usize, rng: &mut StdRng) -> Trajectory {
        let rows = (0..400)
            .map(|t| {
                let well = if ((t + offset) / 40) % 2 == 0 { 2.0 } else { -2.0 };
                vec![
                    well + rng.gen_range(-0.2..0.2),
                    rng.gen_range(-0.5..0.5),
                ]
            })
            .collect();
        Trajectory::from_features(replica, rows).unwrap()
    }

    #[test]
    fn recovers_two_metastable_wells() {
        let mut rng = StdRng::seed_from_u64(7);
        let trajs = vec![
            two_well_trajectory(0, 0, &mut rng),
            two_well_trajectory(1, 20, &mut rng),
        ];
        let encoder = StateEncoder::fit(&trajs, &config(2), 1, 42).unwrap();
        assert_eq!(encoder.latent_dim(), 1);
        assert!(encoder.vamp2_score() > 1.5);
        assert!(encoder.feature_singular_values()[0] > 0.8);

        let upper = encoder.encode(&[2.0, 0.0]).unwrap().dominant_state();
        let lower = encoder.encode(&[-2.0, 0.0]).unwrap().dominant_state();
        assert_ne!(upper, lower);

        let assignments = encoder.encode_all(&trajs).unwrap();
        for (traj, assigned) in trajs.iter().zip(&assignments) {
            assert_eq!(assigned.replica, traj.replica());
            for (frame, m) in traj.frames().iter().zip(&assigned.memberships) {
                let expected = if frame.features()[0] > 0.0 { upper } else { lower };
                assert_eq!(m.dominant_state(), expected);
            }
        }
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let mut rng = StdRng::seed_from_u64(3);
        let trajs = vec![two_well_trajectory(0, 0, &mut rng)];
        let a = StateEncoder::fit(&trajs, &config(2), 1, 11).unwrap();
        let b = StateEncoder::fit(&trajs, &config(2), 1, 11).unwrap();
        assert_eq!(
            a.encode(&[0.3, 0.1]).unwrap(),
            b.encode(&[0.3, 0.1]).unwrap()
        );
    }

    #[test]
    fn unreachable_population_is_degenerate() {
        let mut rng = StdRng::seed_from_u64(5);
        let trajs = vec![two_well_trajectory(0, 0, &mut rng)];
        let mut cfg = config(2);
        // Two states cannot both hold 60% of the mass.
        cfg.min_state_population = 0.6;
        let result = StateEncoder::fit(&trajs, &cfg, 1, 1);
        assert!(matches!(result, Err(EngineError::DegenerateEncoding { .. })));
    }

    #[test]
    fn constant_features_are_degenerate() {
        let trajs = vec![Trajectory::from_features(0, vec![vec![1.0, 1.0]; 20]).unwrap()];
        let result = StateEncoder::fit(&trajs, &config(2), 1, 1);
        assert!(matches!(result, Err(EngineError::DegenerateEncoding { .. })));
    }

    #[test]
    fn rejects_too_few_pairs_and_wrong_dimension() {
        let short = vec![Trajectory::from_features(0, vec![vec![1.0], vec![2.0]]).unwrap()];
        assert!(matches!(
            StateEncoder::fit(&short, &config(2), 1, 1),
            Err(EngineError::InvalidInput(_))
        ));

        let mut rng = StdRng::seed_from_u64(9);
        let trajs = vec![two_well_trajectory(0, 0, &mut rng)];
        let encoder = StateEncoder::fit(&trajs, &config(2), 1, 1).unwrap();
        assert!(matches!(
            encoder.encode(&[1.0]),
            Err(EngineError::InvalidInput(_))
        ));
    }
}
