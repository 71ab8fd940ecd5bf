//! # Core Module
//!
//! Stateless building blocks of CDENS: data models, dense numerics and file I/O.
//!
//! ## Architecture
//!
//! - **Data Models** ([`models`]) - Frames, trajectories, soft memberships and spectra
//! - **Linear Algebra** ([`linalg`]) - Lagged covariances, VAMP decomposition, graph connectivity
//! - **Spectral Numerics** ([`spectral`]) - Grid interpolation and affine regression
//! - **File I/O** ([`io`]) - Spectrum column files and per-replica feature tables
//!
//! Nothing in this module keeps state between calls; the pipeline stages built on
//! top of it live in [`crate::engine`].

pub mod io;
pub mod linalg;
pub mod models;
pub mod spectral;
