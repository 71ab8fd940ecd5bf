//! Stateless spectral numerics: grid interpolation and affine regression.

pub mod interpolation;
pub mod regression;
