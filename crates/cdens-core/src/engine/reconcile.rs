use super::config::FitWindow;
use super::error::EngineError;
use crate::core::models::spectrum::{ExperimentalSpectrum, Spectrum, SpectrumError, WavelengthRange};
use crate::core::spectral::interpolation::{Interpolation, interpolate};
use crate::core::spectral::regression::{AffineFit, FitMetrics, RegressionError, evaluate_metrics, fit_affine};
use serde::Serialize;
use tracing::{debug, instrument};

/// Theory and experiment evaluated on the experimental wavelengths of a window.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledGrid {
    pub wavelengths: Vec<f64>,
    pub theory: Vec<f64>,
    pub experiment: Vec<f64>,
    pub weights: Vec<f64>,
}

impl ReconciledGrid {
    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    /// Bounds of the points actually used.
    pub fn range(&self) -> Option<WavelengthRange> {
        Some(WavelengthRange::new(
            *self.wavelengths.first()?,
            *self.wavelengths.last()?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    pub window: FitWindow,
    pub range: WavelengthRange,
    pub fit: AffineFit,
    pub metrics: FitMetrics,
}

/// Places `theory` on the experimental grid restricted to `window`.
///
/// `Full` uses the overlap of both ranges; an explicit range must lie within
/// the theoretical range, since values are never extrapolated.
pub fn reconcile(
    theory: &Spectrum,
    experiment: &ExperimentalSpectrum,
    window: FitWindow,
    interpolation: Interpolation,
    configuration: &str,
) -> Result<ReconciledGrid, EngineError> {
    let available = theory.range();
    let window_range = match window {
        FitWindow::Full => available
            .intersect(&experiment.spectrum.range())
            .ok_or_else(|| EngineError::ExtrapolationRequested {
                configuration: configuration.to_string(),
                requested: experiment.spectrum.range(),
                available,
            })?,
        FitWindow::Range { min_nm, max_nm } => WavelengthRange::new(min_nm, max_nm),
    };

    let indices: Vec<usize> = experiment
        .spectrum
        .wavelengths()
        .iter()
        .enumerate()
        .filter(|(_, w)| window_range.contains(**w))
        .map(|(i, _)| i)
        .collect();

    let wavelengths: Vec<f64> = indices
        .iter()
        .map(|&i| experiment.spectrum.wavelengths()[i])
        .collect();
    let theory_values = if theory.same_grid(&experiment.spectrum) {
        indices.iter().map(|&i| theory.values()[i]).collect()
    } else {
        interpolate(theory, &wavelengths, interpolation).map_err(|e| match e {
            SpectrumError::Extrapolation {
                requested_min,
                requested_max,
                ..
            } => EngineError::ExtrapolationRequested {
                configuration: configuration.to_string(),
                requested: WavelengthRange::new(requested_min, requested_max),
                available,
            },
            other => EngineError::from(other),
        })?
    };

    Ok(ReconciledGrid {
        theory: theory_values,
        experiment: indices
            .iter()
            .map(|&i| experiment.spectrum.values()[i])
            .collect(),
        weights: indices.iter().map(|&i| experiment.weight(i)).collect(),
        wavelengths,
    })
}

/// Fits `experiment ≈ a · theory + b` on one window and scores the fit.
#[instrument(skip_all, name = "spectral_fit", fields(configuration = configuration, window = %window))]
pub fn fit_spectrum(
    theory: &Spectrum,
    experiment: &ExperimentalSpectrum,
    window: FitWindow,
    interpolation: Interpolation,
    configuration: &str,
) -> Result<FitResult, EngineError> {
    let grid = reconcile(theory, experiment, window, interpolation, configuration)?;
    let fit = fit_affine(&grid.theory, &grid.experiment).map_err(|e| match e {
        RegressionError::Underdetermined { points, .. } => EngineError::UnderdeterminedFit {
            points,
            configuration: configuration.to_string(),
        },
        RegressionError::LengthMismatch { .. } => EngineError::Internal(e.to_string()),
    })?;
    let metrics = evaluate_metrics(&fit, &grid.theory, &grid.experiment, &grid.weights);
    let range = grid.range().ok_or_else(|| EngineError::UnderdeterminedFit {
        points: 0,
        configuration: configuration.to_string(),
    })?;
    debug!(
        scale = fit.scale,
        offset = fit.offset,
        rmse = metrics.rmse,
        "Fitted {} points",
        metrics.points
    );
    Ok(FitResult {
        window,
        range,
        fit,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn theory_line() -> Spectrum {
        Spectrum::from_pairs((0..=20).map(|i| {
            let w = 190.0 + i as f64 * 2.0;
            (w, (w - 200.0) / 10.0)
        }))
        .unwrap()
    }

    fn experiment_from(theory: &Spectrum, scale: f64, offset: f64, grid: &[f64]) -> ExperimentalSpectrum {
        let values = interpolate(theory, grid, Interpolation::Linear).unwrap();
        let spectrum =
            Spectrum::new(grid.to_vec(), values.iter().map(|v| scale * v + offset).collect()).unwrap();
        ExperimentalSpectrum::without_uncertainties(spectrum)
    }

    #[test]
    fn recovers_scale_and_offset_exactly() {
        let theory = theory_line();
        let grid: Vec<f64> = (0..30).map(|i| 195.0 + i as f64).collect();
        let exp = experiment_from(&theory, 2.5, 1.0, &grid);
        let result =
            fit_spectrum(&theory, &exp, FitWindow::Full, Interpolation::Linear, "b").unwrap();
        assert!((result.fit.scale - 2.5).abs() < 1e-9);
        assert!((result.fit.offset - 1.0).abs() < 1e-9);
        assert!(result.metrics.rmse < 1e-9);
        assert!((result.metrics.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(result.metrics.points, 30);
    }

    #[test]
    fn full_window_uses_the_overlap() {
        let theory = theory_line();
        let grid: Vec<f64> = (0..40).map(|i| 210.0 + i as f64).collect();
        let exp = ExperimentalSpectrum::without_uncertainties(
            Spectrum::new(grid.clone(), grid.iter().map(|w| w * 0.1).collect()).unwrap(),
        );
        let reconciled =
            reconcile(&theory, &exp, FitWindow::Full, Interpolation::Linear, "b").unwrap();
        assert_eq!(reconciled.range(), Some(WavelengthRange::new(210.0, 230.0)));
        assert_eq!(reconciled.len(), 21);
    }

    #[test]
    fn windows_beyond_theory_fail_at_either_end() {
        let theory = theory_line();
        let grid: Vec<f64> = (0..60).map(|i| 180.0 + i as f64).collect();
        let exp = ExperimentalSpectrum::without_uncertainties(Spectrum::constant(&grid, 1.0).unwrap());

        for window in [
            FitWindow::Range { min_nm: 185.0, max_nm: 210.0 },
            FitWindow::Range { min_nm: 200.0, max_nm: 235.0 },
        ] {
            let result = fit_spectrum(&theory, &exp, window, Interpolation::Linear, "b");
            match result {
                Err(EngineError::ExtrapolationRequested { available, .. }) => {
                    assert_eq!(available, WavelengthRange::new(190.0, 230.0));
                }
                other => panic!("expected extrapolation error, got {:?}", other),
            }
        }
    }

    #[test]
    fn identical_grids_skip_interpolation() {
        let theory = theory_line();
        let exp = ExperimentalSpectrum::without_uncertainties(theory.clone());
        let reconciled = reconcile(
            &theory,
            &exp,
            FitWindow::Range { min_nm: 200.0, max_nm: 210.0 },
            Interpolation::Nearest,
            "b",
        )
        .unwrap();
        assert_eq!(reconciled.wavelengths, vec![200.0, 202.0, 204.0, 206.0, 208.0, 210.0]);
        assert_eq!(reconciled.theory, reconciled.experiment);
    }

    #[test]
    fn flat_theory_is_underdetermined() {
        let theory = Spectrum::constant(&[200.0, 210.0, 220.0], 3.0).unwrap();
        let exp = ExperimentalSpectrum::without_uncertainties(
            Spectrum::from_pairs([(200.0, 1.0), (210.0, 2.0), (220.0, 4.0)]).unwrap(),
        );
        let result = fit_spectrum(&theory, &exp, FitWindow::Full, Interpolation::Linear, "cfg");
        assert!(matches!(
            result,
            Err(EngineError::UnderdeterminedFit { points: 3, .. })
        ));
    }

    #[test]
    fn uncertainties_weight_chi_squared() {
        let theory = Spectrum::from_pairs([(200.0, 0.0), (210.0, 1.0), (220.0, 2.0)]).unwrap();
        let exp_spectrum =
            Spectrum::from_pairs([(200.0, 0.0), (210.0, 2.0), (220.0, 2.0)]).unwrap();
        let plain = ExperimentalSpectrum::without_uncertainties(exp_spectrum.clone());
        let weighted =
            ExperimentalSpectrum::new(exp_spectrum, vec![Some(0.5), Some(0.5), None]).unwrap();

        let a = fit_spectrum(&theory, &plain, FitWindow::Full, Interpolation::Linear, "b").unwrap();
        let b =
            fit_spectrum(&theory, &weighted, FitWindow::Full, Interpolation::Linear, "b").unwrap();
        assert_eq!(a.fit, b.fit);
        assert!(b.metrics.chi_squared > a.metrics.chi_squared);
    }
}
