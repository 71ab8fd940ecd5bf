//! Data models shared by every pipeline stage.
//!
//! - [`ids`]: frame and basis-set identifiers.
//! - [`frame`]: featurized frames, replica trajectories and soft state memberships.
//! - [`spectrum`]: validated theoretical and experimental spectra.

pub mod frame;
pub mod ids;
pub mod spectrum;
