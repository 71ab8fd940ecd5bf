use crate::core::models::spectrum::{Spectrum, SpectrumError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interpolation {
    #[default]
    Linear,
    Nearest,
    /// Natural cubic spline (zero second derivative at both ends).
    CubicSpline,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Interpolation::Linear => "linear",
            Interpolation::Nearest => "nearest",
            Interpolation::CubicSpline => "cubic-spline",
        };
        f.write_str(name)
    }
}

/// Evaluates `spectrum` at every wavelength of `grid`.
///
/// Never extrapolates: any grid point outside the spectrum's wavelength range
/// is an error reporting both ranges.
pub fn interpolate(
    spectrum: &Spectrum,
    grid: &[f64],
    rule: Interpolation,
) -> Result<Vec<f64>, SpectrumError> {
    if grid.is_empty() {
        return Ok(Vec::new());
    }
    let available = spectrum.range();
    let requested_min = grid.iter().copied().fold(f64::INFINITY, f64::min);
    let requested_max = grid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if requested_min < available.min_nm || requested_max > available.max_nm {
        return Err(SpectrumError::Extrapolation {
            requested_min,
            requested_max,
            available_min: available.min_nm,
            available_max: available.max_nm,
        });
    }

    let xs = spectrum.wavelengths();
    let ys = spectrum.values();
    if xs.len() == 1 {
        return Ok(vec![ys[0]; grid.len()]);
    }

    let values = match rule {
        Interpolation::Linear => grid.iter().map(|&x| linear_at(xs, ys, x)).collect(),
        Interpolation::Nearest => grid.iter().map(|&x| nearest_at(xs, ys, x)).collect(),
        Interpolation::CubicSpline if xs.len() < 3 => {
            grid.iter().map(|&x| linear_at(xs, ys, x)).collect()
        }
        Interpolation::CubicSpline => {
            let second = natural_spline_second_derivatives(xs, ys);
            grid.iter()
                .map(|&x| spline_at(xs, ys, &second, x))
                .collect()
        }
    };
    Ok(values)
}

/// Index `i` of the interval `[xs[i], xs[i + 1]]` containing `x`.
fn bracket(xs: &[f64], x: f64) -> usize {
    let upper = xs.partition_point(|&v| v <= x);
    upper.saturating_sub(1).min(xs.len() - 2)
}

fn linear_at(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let i = bracket(xs, x);
    let t = (x - xs[i]) / (xs[i + 1] - xs[i]);
    ys[i] + t * (ys[i + 1] - ys[i])
}

fn nearest_at(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let i = bracket(xs, x);
    if (x - xs[i]) <= (xs[i + 1] - x) {
        ys[i]
    } else {
        ys[i + 1]
    }
}

fn natural_spline_second_derivatives(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let mut second = vec![0.0; n];
    let mut u = vec![0.0; n];
    for i in 1..n - 1 {
        let sig = (xs[i] - xs[i - 1]) / (xs[i + 1] - xs[i - 1]);
        let p = sig * second[i - 1] + 2.0;
        second[i] = (sig - 1.0) / p;
        let slope_diff = (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])
            - (ys[i] - ys[i - 1]) / (xs[i] - xs[i - 1]);
        u[i] = (6.0 * slope_diff / (xs[i + 1] - xs[i - 1]) - sig * u[i - 1]) / p;
    }
    second[n - 1] = 0.0;
    for k in (0..n - 1).rev() {
        second[k] = second[k] * second[k + 1] + u[k];
    }
    second
}

fn spline_at(xs: &[f64], ys: &[f64], second: &[f64], x: f64) -> f64 {
    let i = bracket(xs, x);
    let h = xs[i + 1] - xs[i];
    let a = (xs[i + 1] - x) / h;
    let b = (x - xs[i]) / h;
    a * ys[i]
        + b * ys[i + 1]
        + ((a * a * a - a) * second[i] + (b * b * b - b) * second[i + 1]) * (h * h) / 6.0
}
