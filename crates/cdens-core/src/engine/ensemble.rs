use super::config::StateAveraging;
use super::error::EngineError;
use super::prediction::FrameSpectrum;
use crate::core::models::spectrum::Spectrum;
use serde::Serialize;
use tracing::{info, instrument};

/// Probability-weighted ensemble spectrum and the per-state means it is built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleSpectrum {
    pub spectrum: Spectrum,
    pub state_spectra: Vec<Spectrum>,
    pub weights: Vec<f64>,
    pub frames_per_state: Vec<usize>,
    pub averaging: StateAveraging,
}

/// Checks that `stationary` is a probability vector over `num_states` states.
pub fn validate_stationary(
    stationary: &[f64],
    num_states: usize,
    tolerance: f64,
) -> Result<(), EngineError> {
    if stationary.len() != num_states {
        return Err(EngineError::StationaryNormalization {
            reason: format!(
                "{} probabilities given for {} states",
                stationary.len(),
                num_states
            ),
        });
    }
    if let Some((state, p)) = stationary
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_finite() || **p < 0.0)
    {
        return Err(EngineError::StationaryNormalization {
            reason: format!("state {} has probability {}", state, p),
        });
    }
    let total: f64 = stationary.iter().sum();
    if (total - 1.0).abs() > tolerance {
        return Err(EngineError::StationaryNormalization {
            reason: format!("probabilities sum to {}", total),
        });
    }
    Ok(())
}

/// `CD_ens(λ) = Σ_s π_s · mean_s(λ)` over the frame spectra of one configuration.
///
/// Every state needs at least one spectrum and all spectra must share one
/// wavelength grid exactly.
#[instrument(skip_all, name = "ensemble_build", fields(configuration = configuration))]
pub fn build_ensemble(
    spectra: &[FrameSpectrum],
    stationary: &[f64],
    num_states: usize,
    averaging: StateAveraging,
    tolerance: f64,
    configuration: &str,
) -> Result<EnsembleSpectrum, EngineError> {
    validate_stationary(stationary, num_states, tolerance)?;

    if let Some(reference) = spectra.first() {
        if let Some(other) = spectra
            .iter()
            .find(|s| !s.spectrum.same_grid(&reference.spectrum))
        {
            return Err(EngineError::GridMismatch { frame: other.frame });
        }
    }

    let mut groups: Vec<Vec<&FrameSpectrum>> = vec![Vec::new(); num_states];
    for s in spectra {
        let group = groups.get_mut(s.state).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "spectrum of {} belongs to state {}, only {} states exist",
                s.frame, s.state, num_states
            ))
        })?;
        group.push(s);
    }
    if let Some(state) = groups.iter().position(Vec::is_empty) {
        return Err(EngineError::EmptyStateAssignment {
            state,
            configuration: configuration.to_string(),
        });
    }

    let grid_len = spectra[0].spectrum.len();
    let mut state_spectra = Vec::with_capacity(num_states);
    let mut ensemble = vec![0.0; grid_len];
    for (group, &weight) in groups.iter().zip(stationary) {
        let mean = state_mean(group, averaging, grid_len);
        for (acc, v) in ensemble.iter_mut().zip(&mean) {
            *acc += weight * v;
        }
        state_spectra.push(group[0].spectrum.with_values(mean)?);
    }

    info!(
        frames = spectra.len(),
        ?averaging,
        "Built ensemble spectrum over {} states",
        num_states
    );
    Ok(EnsembleSpectrum {
        spectrum: spectra[0].spectrum.with_values(ensemble)?,
        state_spectra,
        weights: stationary.to_vec(),
        frames_per_state: groups.iter().map(Vec::len).collect(),
        averaging,
    })
}

fn state_mean(group: &[&FrameSpectrum], averaging: StateAveraging, grid_len: usize) -> Vec<f64> {
    let weight_of = |s: &FrameSpectrum| match averaging {
        StateAveraging::Arithmetic => 1.0,
        StateAveraging::MembershipWeighted => s.membership,
    };
    let total: f64 = group.iter().map(|&s| weight_of(s)).sum();
    let mut mean = vec![0.0; grid_len];
    for &s in group {
        let w = if total > 0.0 {
            weight_of(s) / total
        } else {
            1.0 / group.len() as f64
        };
        for (acc, v) in mean.iter_mut().zip(s.spectrum.values()) {
            *acc += w * v;
        }
    }
    mean
}
