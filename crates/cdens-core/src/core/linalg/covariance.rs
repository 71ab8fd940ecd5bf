use nalgebra::{DMatrix, DVector, SymmetricEigen};
use std::cmp::Ordering;

/// Running sums for the instantaneous and time-lagged covariance matrices of
/// `(x_t, x_{t+τ})` pairs.
///
/// Accumulators of independent trajectories can be built in parallel and
/// combined with [`LaggedMoments::merge`].
#[derive(Debug, Clone)]
pub struct LaggedMoments {
    count: usize,
    sum0: DVector<f64>,
    sum1: DVector<f64>,
    s00: DMatrix<f64>,
    s01: DMatrix<f64>,
    s11: DMatrix<f64>,
}

impl LaggedMoments {
    pub fn new(dimension: usize) -> Self {
        Self {
            count: 0,
            sum0: DVector::zeros(dimension),
            sum1: DVector::zeros(dimension),
            s00: DMatrix::zeros(dimension, dimension),
            s01: DMatrix::zeros(dimension, dimension),
            s11: DMatrix::zeros(dimension, dimension),
        }
    }

    pub fn dimension(&self) -> usize {
        self.sum0.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn add(&mut self, x0: &[f64], x1: &[f64]) {
        let a = DVector::from_column_slice(x0);
        let b = DVector::from_column_slice(x1);
        self.sum0 += &a;
        self.sum1 += &b;
        self.s00.ger(1.0, &a, &a, 1.0);
        self.s01.ger(1.0, &a, &b, 1.0);
        self.s11.ger(1.0, &b, &b, 1.0);
        self.count += 1;
    }

    pub fn merge(mut self, other: LaggedMoments) -> LaggedMoments {
        self.count += other.count;
        self.sum0 += other.sum0;
        self.sum1 += other.sum1;
        self.s00 += other.s00;
        self.s01 += other.s01;
        self.s11 += other.s11;
        self
    }

    /// Mean-free covariance estimates normalized by the number of pairs.
    pub fn covariances(&self) -> Option<LaggedCovariances> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean0 = &self.sum0 / n;
        let mean1 = &self.sum1 / n;
        let c00 = &self.s00 / n - &mean0 * mean0.transpose();
        let c01 = &self.s01 / n - &mean0 * mean1.transpose();
        let c11 = &self.s11 / n - &mean1 * mean1.transpose();
        Some(LaggedCovariances {
            mean0,
            mean1,
            c00: symmetrize(c00),
            c01,
            c11: symmetrize(c11),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LaggedCovariances {
    pub mean0: DVector<f64>,
    pub mean1: DVector<f64>,
    pub c00: DMatrix<f64>,
    pub c01: DMatrix<f64>,
    pub c11: DMatrix<f64>,
}

fn symmetrize(m: DMatrix<f64>) -> DMatrix<f64> {
    (&m + m.transpose()) * 0.5
}

/// Rank-truncated inverse square root of a symmetric positive semi-definite
/// matrix: returns `W` (d × r) with `Wᵀ C W = I_r`.
///
/// Eigen-directions whose eigenvalue is below `relative_epsilon` times the
/// largest eigenvalue are discarded; the retained rank `r` may be zero.
pub fn whitening_transform(c: &DMatrix<f64>, relative_epsilon: f64) -> DMatrix<f64> {
    let dim = c.nrows();
    let eigen = SymmetricEigen::new(c.clone());
    let max_eigenvalue = eigen.eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    let cutoff = (max_eigenvalue * relative_epsilon).max(f64::MIN_POSITIVE);

    let mut retained: Vec<usize> = (0..dim)
        .filter(|&i| eigen.eigenvalues[i] > cutoff)
        .collect();
    retained.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut w = DMatrix::zeros(dim, retained.len());
    for (col, &idx) in retained.iter().enumerate() {
        let scale = 1.0 / eigen.eigenvalues[idx].sqrt();
        w.set_column(col, &(eigen.eigenvectors.column(idx) * scale));
    }
    w
}

/// Solution of the VAMP variational problem for one set of lagged covariances.
///
/// The singular values of the whitened Koopman matrix
/// `K = C00^{-1/2} C01 C11^{-1/2}` are the generalized eigenvalues of the
/// time-lagged problem; the left singular vectors define the slow coordinates.
#[derive(Debug, Clone)]
pub struct VampDecomposition {
    pub mean0: DVector<f64>,
    whitening0: DMatrix<f64>,
    left_singular_vectors: DMatrix<f64>,
    pub singular_values: Vec<f64>,
    pub rank_instantaneous: usize,
    pub rank_lagged: usize,
}

impl VampDecomposition {
    pub fn new(cov: &LaggedCovariances, relative_epsilon: f64) -> Self {
        let w0 = whitening_transform(&cov.c00, relative_epsilon);
        let w1 = whitening_transform(&cov.c11, relative_epsilon);
        let rank_instantaneous = w0.ncols();
        let rank_lagged = w1.ncols();

        if rank_instantaneous == 0 || rank_lagged == 0 {
            return Self {
                mean0: cov.mean0.clone(),
                whitening0: w0,
                left_singular_vectors: DMatrix::zeros(rank_instantaneous, 0),
                singular_values: Vec::new(),
                rank_instantaneous,
                rank_lagged,
            };
        }

        let koopman = w0.transpose() * &cov.c01 * &w1;
        let svd = koopman.svd(true, false);
        let u = svd.u.unwrap_or_else(|| DMatrix::zeros(rank_instantaneous, 0));

        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| {
            svd.singular_values[b]
                .partial_cmp(&svd.singular_values[a])
                .unwrap_or(Ordering::Equal)
        });

        let mut left = DMatrix::zeros(rank_instantaneous, order.len());
        let mut singular_values = Vec::with_capacity(order.len());
        for (col, &idx) in order.iter().enumerate() {
            left.set_column(col, &u.column(idx));
            singular_values.push(svd.singular_values[idx]);
        }

        Self {
            mean0: cov.mean0.clone(),
            whitening0: w0,
            left_singular_vectors: left,
            singular_values,
            rank_instantaneous,
            rank_lagged,
        }
    }

    /// VAMP-2 score including the constant singular function.
    pub fn vamp2_score(&self) -> f64 {
        1.0 + self.singular_values.iter().map(|s| s * s).sum::<f64>()
    }

    /// Number of slow coordinates available for projection.
    pub fn available_dimensions(&self) -> usize {
        self.singular_values.len()
    }

    /// Projects a feature vector onto the leading `dims` slow coordinates.
    pub fn project(&self, x: &[f64], dims: usize) -> DVector<f64> {
        let dims = dims.min(self.available_dimensions());
        let centered = DVector::from_column_slice(x) - &self.mean0;
        let whitened = self.whitening0.transpose() * centered;
        self.left_singular_vectors.columns(0, dims).transpose() * whitened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moments_from(series: &[Vec<f64>], lag: usize) -> LaggedMoments {
        let mut m = LaggedMoments::new(series[0].len());
        for t in 0..series.len() - lag {
            m.add(&series[t], &series[t + lag]);
        }
        m
    }

    #[test]
    fn covariances_of_a_known_series() {
        let series = vec![vec![1.0], vec![-1.0], vec![1.0], vec![-1.0], vec![1.0]];
        let cov = moments_from(&series, 1).covariances().unwrap();
        assert!((cov.mean0[0] - 0.0).abs() < 1e-12);
        assert!((cov.c00[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((cov.c01[(0, 0)] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn merge_matches_single_accumulation() {
        let a = vec![vec![0.0, 1.0], vec![1.0, 3.0], vec![2.0, 2.0]];
        let b = vec![vec![5.0, -1.0], vec![4.0, 0.5], vec![3.5, 1.5]];
        let merged = moments_from(&a, 1).merge(moments_from(&b, 1));

        let mut single = LaggedMoments::new(2);
        for s in [&a, &b] {
            for t in 0..s.len() - 1 {
                single.add(&s[t], &s[t + 1]);
            }
        }
        let c1 = merged.covariances().unwrap();
        let c2 = single.covariances().unwrap();
        assert_eq!(merged.count(), 4);
        assert!((c1.c01 - c2.c01).abs().max() < 1e-12);
    }

    #[test]
    fn whitening_transform_whitens_and_truncates_rank() {
        let c = DMatrix::from_row_slice(3, 3, &[4.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let w = whitening_transform(&c, 1e-10);
        assert_eq!(w.ncols(), 2);
        let identity = w.transpose() * &c * &w;
        assert!((identity - DMatrix::identity(2, 2)).abs().max() < 1e-10);
    }

    #[test]
    fn slow_coordinate_has_largest_singular_value() {
        // First coordinate flips every 50 steps; the second has zero lag-1 autocorrelation.
        let series: Vec<Vec<f64>> = (0..200)
            .map(|t| {
                let slow = if (t / 50) % 2 == 0 { 1.0 } else { -1.0 };
                let fast = [0.3, 0.3, -0.3, -0.3][t % 4];
                vec![slow, fast]
            })
            .collect();
        let cov = moments_from(&series, 1).covariances().unwrap();
        let vamp = VampDecomposition::new(&cov, 1e-10);
        assert_eq!(vamp.rank_instantaneous, 2);
        assert!(vamp.singular_values[0] > 0.9);
        assert!(vamp.vamp2_score() > 1.8);

        let z_hi = vamp.project(&[1.0, 0.0], 1);
        let z_lo = vamp.project(&[-1.0, 0.0], 1);
        assert!((z_hi[0] - z_lo[0]).abs() > 1.0);
    }
}
