//! # CDENS Core Library
//!
//! Ensemble circular dichroism spectra from molecular dynamics: a library that
//! learns metastable states from featurized trajectories, weights per-frame
//! predicted spectra by the states' stationary probabilities and reconciles the
//! result with an experimental measurement.
//!
//! ## Architectural Philosophy
//!
//! The library keeps the same three layers throughout.
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Trajectory`, `Membership`,
//!   `Spectrum`), dense numerics (lagged covariances, VAMP decomposition, interpolation,
//!   affine regression) and file I/O.
//!
//! - **[`engine`]: The Pipeline Stages.** State encoding, transition-model estimation,
//!   representative sampling, prediction dispatch, ensemble averaging, fitting and ranking,
//!   all driven by one immutable `PipelineConfig`.
//!
//! - **[`workflows`]: The Public API.** Complete procedures built from the engine stages,
//!   such as the full ensemble pipeline and the single-spectrum fit.

pub mod core;
pub mod engine;
pub mod workflows;
