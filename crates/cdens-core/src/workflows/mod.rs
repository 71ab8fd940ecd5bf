//! # Workflows Module
//!
//! End-to-end entry points that tie the [`crate::engine`] stages together.
//!
//! ## Architecture
//!
//! - **Ensemble Workflow** ([`ensemble`]) - Trajectories to ranked, fitted ensemble spectra
//!   for every model configuration.
//! - **Fit Workflow** ([`fit`]) - Affine reconciliation of one precomputed theoretical
//!   spectrum with an experiment.

pub mod ensemble;
pub mod fit;
