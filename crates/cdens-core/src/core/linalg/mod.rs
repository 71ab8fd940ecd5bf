//! Dense linear algebra used by the encoder and the transition model.
//!
//! - [`covariance`]: time-lagged moment accumulation, whitening and the VAMP
//!   decomposition of the resulting Koopman matrix.
//! - [`graph`]: connectivity analysis of count matrices.

pub mod covariance;
pub mod graph;
