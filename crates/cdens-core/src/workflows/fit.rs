use crate::core::models::spectrum::{ExperimentalSpectrum, Spectrum};
use crate::core::spectral::interpolation::Interpolation;
use crate::engine::config::FitWindow;
use crate::engine::error::EngineError;
use crate::engine::reconcile::{FitResult, fit_spectrum};
use tracing::{info, instrument};

/// Fits one precomputed theoretical spectrum to an experiment.
#[instrument(skip_all, name = "fit_workflow", fields(window = %window, interpolation = %interpolation))]
pub fn run(
    theory: &Spectrum,
    experiment: &ExperimentalSpectrum,
    window: FitWindow,
    interpolation: Interpolation,
) -> Result<FitResult, EngineError> {
    let result = fit_spectrum(theory, experiment, window, interpolation, "theory")?;
    info!(
        scale = result.fit.scale,
        offset = result.fit.offset,
        rmse = result.metrics.rmse,
        r_squared = result.metrics.r_squared,
        "Fitted theoretical spectrum on {} points.",
        result.metrics.points
    );
    Ok(result)
}
