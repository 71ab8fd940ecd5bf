//! File I/O for the pipeline's inputs and outputs.
//!
//! - [`traits`]: the [`traits::SpectrumFile`] read/write interface.
//! - [`dat`]: column text files for theoretical and experimental spectra.
//! - [`features`]: CSV feature tables, one per replica trajectory.

pub mod dat;
pub mod features;
pub mod traits;
