use super::ids::FrameId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MEMBERSHIP_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum TrajectoryError {
    #[error("Trajectory of replica {replica} contains no frames")]
    Empty { replica: usize },
    #[error("Frame {frame} has {found} features, expected {expected}")]
    DimensionMismatch {
        frame: FrameId,
        expected: usize,
        found: usize,
    },
    #[error("Frame {frame} contains a non-finite feature value")]
    NonFinite { frame: FrameId },
    #[error("Invalid membership vector: {0}")]
    InvalidMembership(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: FrameId,
    features: Vec<f64>,
}

impl Frame {
    pub fn new(id: FrameId, features: Vec<f64>) -> Self {
        Self { id, features }
    }

    #[inline]
    pub fn features(&self) -> &[f64] {
        &self.features
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.features.len()
    }
}

/// Time-ordered frames of a single replica.
///
/// Order is significant: consecutive frames define the transition pairs used by
/// the encoder and the transition model estimator. Frames of different
/// trajectories are never paired.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    replica: usize,
    frames: Vec<Frame>,
}

impl Trajectory {
    /// Builds a trajectory from per-frame feature rows, assigning time indices
    /// from the row order.
    pub fn from_features(replica: usize, rows: Vec<Vec<f64>>) -> Result<Self, TrajectoryError> {
        if rows.is_empty() {
            return Err(TrajectoryError::Empty { replica });
        }
        let expected = rows[0].len();
        let mut frames = Vec::with_capacity(rows.len());
        for (time, features) in rows.into_iter().enumerate() {
            let id = FrameId::new(replica, time);
            if features.len() != expected {
                return Err(TrajectoryError::DimensionMismatch {
                    frame: id,
                    expected,
                    found: features.len(),
                });
            }
            if features.iter().any(|v| !v.is_finite()) {
                return Err(TrajectoryError::NonFinite { frame: id });
            }
            frames.push(Frame::new(id, features));
        }
        Ok(Self { replica, frames })
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.frames.first().map_or(0, Frame::dimension)
    }

    /// Iterates over `(x_t, x_{t+lag})` feature pairs of this trajectory only.
    pub fn lagged_pairs(&self, lag: usize) -> impl Iterator<Item = (&[f64], &[f64])> {
        let n = if lag == 0 { 0 } else { self.frames.len().saturating_sub(lag) };
        (0..n).map(move |t| (self.frames[t].features(), self.frames[t + lag].features()))
    }
}

/// Soft assignment of one frame to the discrete states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Membership(Vec<f64>);

impl Membership {
    /// Validates non-negativity and unit sum.
    pub fn new(values: Vec<f64>) -> Result<Self, TrajectoryError> {
        if values.is_empty() {
            return Err(TrajectoryError::InvalidMembership(
                "membership vector is empty".to_string(),
            ));
        }
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(TrajectoryError::InvalidMembership(format!(
                "entries must be finite and non-negative: {:?}",
                values
            )));
        }
        let sum: f64 = values.iter().sum();
        if (sum - 1.0).abs() > MEMBERSHIP_SUM_TOLERANCE {
            return Err(TrajectoryError::InvalidMembership(format!(
                "entries sum to {}, expected 1",
                sum
            )));
        }
        Ok(Self(values))
    }

    /// One-hot membership for a hard assignment.
    pub fn one_hot(state: usize, num_states: usize) -> Self {
        let mut values = vec![0.0; num_states];
        values[state] = 1.0;
        Self(values)
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn get(&self, state: usize) -> f64 {
        self.0.get(state).copied().unwrap_or(0.0)
    }

    /// Hardened assignment: the arg-max state, lowest index on ties.
    pub fn dominant_state(&self) -> usize {
        let mut best = 0;
        for (idx, &value) in self.0.iter().enumerate().skip(1) {
            if value > self.0[best] {
                best = idx;
            }
        }
        best
    }
}

/// Memberships of every frame of one trajectory, in time order.
#[derive(Debug, Clone, PartialEq)]
pub struct StateAssignments {
    pub replica: usize,
    pub memberships: Vec<Membership>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_features_assigns_time_indices() {
        let traj = Trajectory::from_features(3, vec![vec![0.0, 1.0], vec![2.0, 3.0]]).unwrap();
        assert_eq!(traj.replica(), 3);
        assert_eq!(traj.dimension(), 2);
        assert_eq!(traj.frames()[1].id, FrameId::new(3, 1));
    }

    #[test]
    fn from_features_rejects_ragged_rows() {
        let result = Trajectory::from_features(0, vec![vec![0.0, 1.0], vec![2.0]]);
        assert!(matches!(
            result,
            Err(TrajectoryError::DimensionMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn from_features_rejects_empty_and_non_finite_input() {
        assert!(matches!(
            Trajectory::from_features(0, vec![]),
            Err(TrajectoryError::Empty { replica: 0 })
        ));
        assert!(matches!(
            Trajectory::from_features(0, vec![vec![f64::NAN]]),
            Err(TrajectoryError::NonFinite { .. })
        ));
    }

    #[test]
    fn lagged_pairs_stay_within_the_trajectory() {
        let traj =
            Trajectory::from_features(0, vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let pairs: Vec<_> = traj.lagged_pairs(2).map(|(a, b)| (a[0], b[0])).collect();
        assert_eq!(pairs, vec![(0.0, 2.0), (1.0, 3.0)]);
        assert_eq!(traj.lagged_pairs(4).count(), 0);
        assert_eq!(traj.lagged_pairs(0).count(), 0);
    }

    #[test]
    fn membership_validation_rejects_bad_vectors() {
        assert!(Membership::new(vec![0.5, 0.5]).is_ok());
        assert!(Membership::new(vec![0.7, 0.7]).is_err());
        assert!(Membership::new(vec![-0.1, 1.1]).is_err());
        assert!(Membership::new(vec![]).is_err());
    }

    #[test]
    fn dominant_state_prefers_lowest_index_on_ties() {
        let m = Membership::new(vec![0.25, 0.375, 0.375]).unwrap();
        assert_eq!(m.dominant_state(), 1);
        assert_eq!(Membership::one_hot(2, 3).dominant_state(), 2);
    }
}
