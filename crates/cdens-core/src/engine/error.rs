use thiserror::Error;

use super::config::ConfigError;
use crate::core::models::frame::TrajectoryError;
use crate::core::models::ids::{BasisSetId, FrameId};
use crate::core::models::spectrum::{SpectrumError, WavelengthRange};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Degenerate state encoding: {reason}")]
    DegenerateEncoding { reason: String },

    #[error("Transition count rows are empty for states {states:?}")]
    EmptyTransitionRows { states: Vec<usize> },

    #[error("Transition graph is not strongly connected: components {components:?}")]
    DisconnectedTransitionModel { components: Vec<Vec<usize>> },

    #[error("Transition matrix is reducible: {unit_eigenvalues} eigenvalues equal to 1")]
    ReducibleTransitionModel { unit_eigenvalues: usize },

    #[error("Stationary distribution is invalid: {reason}")]
    InvalidStationaryDistribution { reason: String },

    #[error("Stationary probabilities are not normalized: {reason}")]
    StationaryNormalization { reason: String },

    #[error("State {state} has no usable spectra for configuration '{configuration}'")]
    EmptyStateAssignment { state: usize, configuration: String },

    #[error("Spectrum of {frame} does not share the wavelength grid of the run")]
    GridMismatch { frame: FrameId },

    #[error(
        "Interpolation for '{configuration}' would extrapolate: requested [{:.3}, {:.3}] nm, theory covers [{:.3}, {:.3}] nm",
        .requested.min_nm, .requested.max_nm, .available.min_nm, .available.max_nm
    )]
    ExtrapolationRequested {
        configuration: String,
        requested: WavelengthRange,
        available: WavelengthRange,
    },

    #[error("Affine fit is underdetermined ({points} points) for '{configuration}'")]
    UnderdeterminedFit { points: usize, configuration: String },

    #[error("Predictor failed for {frame} with basis set '{basis_set}': {message}")]
    ExternalPredictor {
        frame: FrameId,
        basis_set: BasisSetId,
        message: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Spectrum error: {source}")]
    Spectrum {
        #[from]
        source: SpectrumError,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl From<TrajectoryError> for EngineError {
    fn from(err: TrajectoryError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}
