use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative threshold on the predictor variance below which the regression is
/// considered underdetermined.
const MIN_RELATIVE_VARIANCE: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum RegressionError {
    #[error("Affine fit is underdetermined: {points} point(s), predictor variance {variance:e}")]
    Underdetermined { points: usize, variance: f64 },
    #[error("Input series have different lengths ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },
}

/// `y ≈ scale · x + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineFit {
    pub scale: f64,
    pub offset: f64,
}

impl AffineFit {
    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        self.scale * x + self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    pub points: usize,
    pub rmse: f64,
    pub chi_squared: f64,
    pub r_squared: f64,
}

/// Closed-form least squares for `min Σ (a·x + b − y)²`.
pub fn fit_affine(x: &[f64], y: &[f64]) -> Result<AffineFit, RegressionError> {
    if x.len() != y.len() {
        return Err(RegressionError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    let n = x.len();
    if n < 2 {
        return Err(RegressionError::Underdetermined {
            points: n,
            variance: 0.0,
        });
    }
    let nf = n as f64;
    let x_mean = x.iter().sum::<f64>() / nf;
    let y_mean = y.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        let dx = xi - x_mean;
        sxx += dx * dx;
        sxy += dx * (yi - y_mean);
    }

    let scale_ref = x.iter().map(|v| v * v).sum::<f64>().max(1.0);
    if sxx <= MIN_RELATIVE_VARIANCE * scale_ref {
        return Err(RegressionError::Underdetermined {
            points: n,
            variance: sxx / nf,
        });
    }

    let scale = sxy / sxx;
    Ok(AffineFit {
        scale,
        offset: y_mean - scale * x_mean,
    })
}

/// Goodness-of-fit of `fit` on the given points; `weights` are χ² weights
/// (1/σ²), one per point.
pub fn evaluate_metrics(fit: &AffineFit, x: &[f64], y: &[f64], weights: &[f64]) -> FitMetrics {
    let n = x.len();
    if n == 0 {
        return FitMetrics {
            points: 0,
            rmse: f64::NAN,
            chi_squared: f64::NAN,
            r_squared: f64::NAN,
        };
    }
    let y_mean = y.iter().sum::<f64>() / n as f64;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    let mut chi_squared = 0.0;
    for i in 0..n {
        let residual = fit.apply(x[i]) - y[i];
        ss_res += residual * residual;
        ss_tot += (y[i] - y_mean) * (y[i] - y_mean);
        chi_squared += residual * residual * weights.get(i).copied().unwrap_or(1.0);
    }

    let tiny = f64::EPSILON * y.iter().map(|v| v * v).sum::<f64>().max(1.0);
    let r_squared = if ss_tot <= tiny {
        if ss_res <= tiny { 1.0 } else { 0.0 }
    } else {
        1.0 - ss_res / ss_tot
    };

    FitMetrics {
        points: n,
        rmse: (ss_res / n as f64).sqrt(),
        chi_squared,
        r_squared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_exact_affine_relationship() {
        let x: Vec<f64> = (0..20).map(|i| (i as f64 * 0.37).sin() * 3.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.5 * v + 1.0).collect();
        let fit = fit_affine(&x, &y).unwrap();
        assert!((fit.scale - 2.5).abs() < 1e-10);
        assert!((fit.offset - 1.0).abs() < 1e-10);

        let metrics = evaluate_metrics(&fit, &x, &y, &vec![1.0; x.len()]);
        assert!(metrics.rmse < 1e-10);
        assert!((metrics.r_squared - 1.0).abs() < 1e-10);
        assert_eq!(metrics.points, 20);
    }

    #[test]
    fn single_point_is_underdetermined() {
        assert!(matches!(
            fit_affine(&[1.0], &[2.0]),
            Err(RegressionError::Underdetermined { points: 1, .. })
        ));
    }

    #[test]
    fn constant_predictor_is_underdetermined() {
        assert!(matches!(
            fit_affine(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0]),
            Err(RegressionError::Underdetermined { points: 3, .. })
        ));
    }

    #[test]
    fn chi_squared_uses_weights_and_defaults_to_sum_of_squares() {
        let fit = AffineFit {
            scale: 1.0,
            offset: 0.0,
        };
        let x = [0.0, 1.0];
        let y = [1.0, 3.0];
        let unweighted = evaluate_metrics(&fit, &x, &y, &[1.0, 1.0]);
        assert!((unweighted.chi_squared - 5.0).abs() < 1e-12);
        let weighted = evaluate_metrics(&fit, &x, &y, &[4.0, 1.0]);
        assert!((weighted.chi_squared - 8.0).abs() < 1e-12);
    }
}
