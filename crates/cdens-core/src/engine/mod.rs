//! # Engine Module
//!
//! The pipeline stages that turn featurized trajectories into ranked, fitted
//! ensemble spectra.
//!
//! ## Overview
//!
//! Stages run strictly in sequence and exchange immutable artifacts. Work inside
//! a stage (per trajectory, per state, per frame or per configuration) is
//! parallelized with rayon when the `parallel` feature is enabled.
//!
//! ## Architecture
//!
//! - **State Encoding** ([`encoder`]) - VAMP slow coordinates and soft clustering into `K` states
//! - **Transition Model** ([`transition`]) - Lagged counting, ergodicity checks, stationary distribution
//! - **Representative Sampling** ([`sampling`]) - Medoid, top-probability and stratified selection
//! - **Prediction Dispatch** ([`prediction`]) - Retrying calls to an external [`prediction::SpectrumPredictor`]
//! - **Ensemble Averaging** ([`ensemble`]) - Stationary-weighted mean of per-state spectra
//! - **Reconciliation** ([`reconcile`]) - Grid matching, affine fitting and goodness-of-fit metrics
//! - **Ranking** ([`ranking`], [`cross_validation`]) - Robust ordering of model configurations
//! - **Configuration** ([`config`]) - The immutable [`config::PipelineConfig`] and its builder
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress events
//! - **Error Handling** ([`error`]) - The [`error::EngineError`] taxonomy

pub mod config;
pub mod cross_validation;
pub mod encoder;
pub mod ensemble;
pub mod error;
pub mod prediction;
pub mod progress;
pub mod ranking;
pub mod reconcile;
pub mod sampling;
pub mod transition;
