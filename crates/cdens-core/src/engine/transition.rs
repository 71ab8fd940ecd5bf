use super::config::CountingMode;
use super::error::EngineError;
use crate::core::linalg::graph::strongly_connected_components;
use crate::core::models::frame::StateAssignments;
use nalgebra::{Complex, DMatrix, DVector, Schur};
use std::cmp::Ordering;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const SCHUR_MAX_ITERATIONS: usize = 10_000;

/// Ergodic Markov model of state-to-state transitions at one lag time.
///
/// Instances only come out of [`estimate`] or [`TransitionModel::from_counts`],
/// both of which reject empty rows, disconnected graphs and reducible matrices,
/// so the stationary distribution is always unique.
#[derive(Debug, Clone)]
pub struct TransitionModel {
    lag: usize,
    counts: DMatrix<f64>,
    transition: DMatrix<f64>,
    stationary: Vec<f64>,
    eigenvalues: Vec<Complex<f64>>,
}

impl TransitionModel {
    #[instrument(skip_all, fields(lag = lag, states = counts.nrows()))]
    pub fn from_counts(
        counts: DMatrix<f64>,
        lag: usize,
        tolerance: f64,
    ) -> Result<Self, EngineError> {
        let k = counts.nrows();
        if k == 0 || counts.ncols() != k {
            return Err(EngineError::InvalidInput(format!(
                "count matrix must be square and non-empty, got {}x{}",
                counts.nrows(),
                counts.ncols()
            )));
        }

        let row_sums: Vec<f64> = counts.row_iter().map(|r| r.sum()).collect();
        let empty: Vec<usize> = (0..k).filter(|&i| row_sums[i] <= 0.0).collect();
        if !empty.is_empty() {
            return Err(EngineError::EmptyTransitionRows { states: empty });
        }

        let components = strongly_connected_components(&counts);
        if components.len() > 1 {
            return Err(EngineError::DisconnectedTransitionModel { components });
        }

        let mut transition = counts.clone();
        for (i, mut row) in transition.row_iter_mut().enumerate() {
            row /= row_sums[i];
        }

        let eigenvalues = sorted_eigenvalues(&transition)?;
        let unit_eigenvalues = count_unit_eigenvalues(&eigenvalues, tolerance);
        if unit_eigenvalues > 1 {
            return Err(EngineError::ReducibleTransitionModel { unit_eigenvalues });
        }

        let stationary = stationary_distribution(&transition, tolerance)?;
        let model = Self {
            lag,
            counts,
            transition,
            stationary,
            eigenvalues,
        };
        model.check_invariants(tolerance)?;
        debug!(stationary = ?model.stationary, "Estimated transition model");
        Ok(model)
    }

    fn check_invariants(&self, tolerance: f64) -> Result<(), EngineError> {
        for (i, row) in self.transition.row_iter().enumerate() {
            let sum = row.sum();
            if (sum - 1.0).abs() > tolerance {
                return Err(EngineError::Internal(format!(
                    "row {} of the transition matrix sums to {}",
                    i, sum
                )));
            }
        }
        let pi = DVector::from_column_slice(&self.stationary);
        let propagated = self.transition.transpose() * &pi;
        let residual = (propagated - pi).amax();
        if residual > tolerance {
            return Err(EngineError::InvalidStationaryDistribution {
                reason: format!("|piT - pi| = {:e} exceeds tolerance {:e}", residual, tolerance),
            });
        }
        Ok(())
    }

    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn num_states(&self) -> usize {
        self.counts.nrows()
    }

    pub fn counts(&self) -> &DMatrix<f64> {
        &self.counts
    }

    pub fn transition_matrix(&self) -> &DMatrix<f64> {
        &self.transition
    }

    pub fn stationary_distribution(&self) -> &[f64] {
        &self.stationary
    }

    /// Eigenvalues of T sorted by decreasing modulus; the first is 1.
    pub fn eigenvalues(&self) -> &[Complex<f64>] {
        &self.eigenvalues
    }

    /// `t_i = -lag / ln|λ_i|` for every non-stationary eigenvalue.
    ///
    /// `None` where the timescale is undefined (|λ| ≥ 1 or λ = 0).
    pub fn implied_timescales(&self) -> Vec<Option<f64>> {
        self.eigenvalues
            .iter()
            .skip(1)
            .map(|l| {
                let modulus = l.norm();
                (modulus > 0.0 && modulus < 1.0).then(|| -(self.lag as f64) / modulus.ln())
            })
            .collect()
    }
}

/// Counts transitions at `lag` within each trajectory and sums them.
pub fn count_transitions(
    assignments: &[StateAssignments],
    num_states: usize,
    lag: usize,
    mode: CountingMode,
) -> DMatrix<f64> {
    #[cfg(not(feature = "parallel"))]
    let iterator = assignments.iter();

    #[cfg(feature = "parallel")]
    let iterator = assignments.par_iter();

    let per_trajectory = iterator.map(|a| count_single(a, num_states, lag, mode));

    #[cfg(not(feature = "parallel"))]
    let total = per_trajectory.fold(DMatrix::zeros(num_states, num_states), |acc, c| acc + c);

    #[cfg(feature = "parallel")]
    let total = per_trajectory.reduce(|| DMatrix::zeros(num_states, num_states), |acc, c| acc + c);

    total
}

fn count_single(
    assignments: &StateAssignments,
    num_states: usize,
    lag: usize,
    mode: CountingMode,
) -> DMatrix<f64> {
    let mut counts = DMatrix::zeros(num_states, num_states);
    let m = &assignments.memberships;
    if lag == 0 || m.len() <= lag {
        return counts;
    }
    for t in 0..m.len() - lag {
        let (from, to) = (&m[t], &m[t + lag]);
        match mode {
            CountingMode::Hard => {
                counts[(from.dominant_state(), to.dominant_state())] += 1.0;
            }
            CountingMode::Soft => {
                for (i, &a) in from.values().iter().enumerate() {
                    for (j, &b) in to.values().iter().enumerate() {
                        counts[(i, j)] += a * b;
                    }
                }
            }
        }
    }
    counts
}

/// Estimates the transition model at `lag` from per-trajectory memberships.
#[instrument(skip_all, name = "transition_estimate", fields(lag = lag, states = num_states))]
pub fn estimate(
    assignments: &[StateAssignments],
    num_states: usize,
    lag: usize,
    counting: CountingMode,
    tolerance: f64,
) -> Result<TransitionModel, EngineError> {
    if let Some(bad) = assignments
        .iter()
        .flat_map(|a| a.memberships.iter())
        .find(|m| m.num_states() != num_states)
    {
        return Err(EngineError::InvalidInput(format!(
            "membership over {} states, expected {}",
            bad.num_states(),
            num_states
        )));
    }
    let counts = count_transitions(assignments, num_states, lag, counting);
    info!(
        transitions = counts.sum(),
        "Counted transitions ({:?} counting)",
        counting
    );
    TransitionModel::from_counts(counts, lag, tolerance)
}

/// Implied timescales of a model estimated at one lag, or why estimation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimescaleEstimate {
    pub lag: usize,
    pub timescales: Vec<Option<f64>>,
    pub error: Option<String>,
}

/// Estimates a model per lag for the implied-timescale diagnostic. Failures
/// are reported, never propagated.
pub fn implied_timescale_scan(
    assignments: &[StateAssignments],
    num_states: usize,
    lags: &[usize],
    counting: CountingMode,
    tolerance: f64,
) -> Vec<TimescaleEstimate> {
    lags.iter()
        .map(
            |&lag| match estimate(assignments, num_states, lag, counting, tolerance) {
                Ok(model) => TimescaleEstimate {
                    lag,
                    timescales: model.implied_timescales(),
                    error: None,
                },
                Err(e) => {
                    warn!(lag, "Implied timescale estimation failed: {}", e);
                    TimescaleEstimate {
                        lag,
                        timescales: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            },
        )
        .collect()
}

fn sorted_eigenvalues(transition: &DMatrix<f64>) -> Result<Vec<Complex<f64>>, EngineError> {
    let schur = Schur::try_new(transition.clone(), f64::EPSILON, SCHUR_MAX_ITERATIONS).ok_or_else(|| {
        EngineError::Internal("Schur decomposition of the transition matrix did not converge".to_string())
    })?;
    let mut eigenvalues: Vec<Complex<f64>> = schur.complex_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| b.norm().partial_cmp(&a.norm()).unwrap_or(Ordering::Equal));
    Ok(eigenvalues)
}

fn count_unit_eigenvalues(eigenvalues: &[Complex<f64>], tolerance: f64) -> usize {
    eigenvalues
        .iter()
        .filter(|l| (*l - Complex::new(1.0, 0.0)).norm() <= tolerance.max(1e-10))
        .count()
}

/// Solves `π(T - I) = 0` with `Σπ = 1` by replacing one balance equation with
/// the normalization.
fn stationary_distribution(transition: &DMatrix<f64>, tolerance: f64) -> Result<Vec<f64>, EngineError> {
    let k = transition.nrows();
    let mut a = transition.transpose() - DMatrix::identity(k, k);
    a.row_mut(k - 1).fill(1.0);
    let mut b = DVector::zeros(k);
    b[k - 1] = 1.0;

    let pi = a.lu().solve(&b).ok_or_else(|| EngineError::InvalidStationaryDistribution {
        reason: "balance equations are singular".to_string(),
    })?;

    if let Some((state, value)) = pi.iter().enumerate().find(|(_, v)| **v < -tolerance) {
        return Err(EngineError::InvalidStationaryDistribution {
            reason: format!("state {} has probability {:e}", state, value),
        });
    }
    let clamped: Vec<f64> = pi.iter().map(|v| v.max(0.0)).collect();
    let total: f64 = clamped.iter().sum();
    Ok(clamped.into_iter().map(|v| v / total).collect())
}
