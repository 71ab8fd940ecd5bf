use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SpectrumError {
    #[error("Spectrum has no data points")]
    Empty,
    #[error("Spectrum has {wavelengths} wavelengths but {values} signal values")]
    LengthMismatch { wavelengths: usize, values: usize },
    #[error("Wavelengths must be strictly ascending (violated at index {index}: {previous} nm -> {current} nm)")]
    NotAscending {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("Spectrum contains a non-finite value at index {index}")]
    NonFinite { index: usize },
    #[error(
        "Requested wavelengths [{requested_min:.3}, {requested_max:.3}] nm exceed the available range [{available_min:.3}, {available_max:.3}] nm"
    )]
    Extrapolation {
        requested_min: f64,
        requested_max: f64,
        available_min: f64,
        available_max: f64,
    },
}

/// Closed wavelength interval in nanometres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavelengthRange {
    pub min_nm: f64,
    pub max_nm: f64,
}

impl WavelengthRange {
    pub fn new(min_nm: f64, max_nm: f64) -> Self {
        Self { min_nm, max_nm }
    }

    #[inline]
    pub fn contains(&self, wavelength: f64) -> bool {
        wavelength >= self.min_nm && wavelength <= self.max_nm
    }

    /// Intersection of two ranges, `None` when they do not overlap.
    pub fn intersect(&self, other: &WavelengthRange) -> Option<WavelengthRange> {
        let min_nm = self.min_nm.max(other.min_nm);
        let max_nm = self.max_nm.min(other.max_nm);
        (min_nm <= max_nm).then_some(WavelengthRange { min_nm, max_nm })
    }
}

/// Ordered wavelength → signal mapping.
///
/// Wavelengths are strictly ascending and every value is finite; both are
/// checked on construction so downstream numerics never re-validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    wavelengths: Vec<f64>,
    values: Vec<f64>,
}

impl Spectrum {
    pub fn new(wavelengths: Vec<f64>, values: Vec<f64>) -> Result<Self, SpectrumError> {
        if wavelengths.len() != values.len() {
            return Err(SpectrumError::LengthMismatch {
                wavelengths: wavelengths.len(),
                values: values.len(),
            });
        }
        if wavelengths.is_empty() {
            return Err(SpectrumError::Empty);
        }
        for (index, (w, v)) in wavelengths.iter().zip(values.iter()).enumerate() {
            if !w.is_finite() || !v.is_finite() {
                return Err(SpectrumError::NonFinite { index });
            }
        }
        for index in 1..wavelengths.len() {
            if wavelengths[index] <= wavelengths[index - 1] {
                return Err(SpectrumError::NotAscending {
                    index,
                    previous: wavelengths[index - 1],
                    current: wavelengths[index],
                });
            }
        }
        Ok(Self {
            wavelengths,
            values,
        })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, f64)>) -> Result<Self, SpectrumError> {
        let (wavelengths, values) = pairs.into_iter().unzip();
        Self::new(wavelengths, values)
    }

    /// Spectrum with the same signal at every wavelength of `grid`.
    pub fn constant(grid: &[f64], value: f64) -> Result<Self, SpectrumError> {
        Self::new(grid.to_vec(), vec![value; grid.len()])
    }

    #[inline]
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    pub fn range(&self) -> WavelengthRange {
        WavelengthRange::new(self.wavelengths[0], self.wavelengths[self.len() - 1])
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.wavelengths
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    /// Exact grid equality. No tolerance: grids produced by one predictor
    /// configuration are expected to be bit-identical.
    pub fn same_grid(&self, other: &Spectrum) -> bool {
        self.wavelengths == other.wavelengths
    }

    /// Replaces the signal while keeping the grid.
    pub fn with_values(&self, values: Vec<f64>) -> Result<Self, SpectrumError> {
        Self::new(self.wavelengths.clone(), values)
    }
}

/// Measured spectrum with optional per-wavelength uncertainties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentalSpectrum {
    pub spectrum: Spectrum,
    uncertainties: Vec<Option<f64>>,
}

impl ExperimentalSpectrum {
    pub fn new(spectrum: Spectrum, uncertainties: Vec<Option<f64>>) -> Result<Self, SpectrumError> {
        if uncertainties.len() != spectrum.len() {
            return Err(SpectrumError::LengthMismatch {
                wavelengths: spectrum.len(),
                values: uncertainties.len(),
            });
        }
        Ok(Self {
            spectrum,
            uncertainties,
        })
    }

    pub fn without_uncertainties(spectrum: Spectrum) -> Self {
        let uncertainties = vec![None; spectrum.len()];
        Self {
            spectrum,
            uncertainties,
        }
    }

    pub fn uncertainties(&self) -> &[Option<f64>] {
        &self.uncertainties
    }

    /// χ² weight for one point: 1/σ², or 1 when σ is absent or unusable.
    pub fn weight(&self, index: usize) -> f64 {
        match self.uncertainties.get(index).copied().flatten() {
            Some(sigma) if sigma.is_finite() && sigma > 0.0 => 1.0 / (sigma * sigma),
            _ => 1.0,
        }
    }

    pub fn has_uncertainties(&self) -> bool {
        self.uncertainties.iter().any(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_unsorted_grid() {
        let result = Spectrum::new(vec![200.0, 210.0, 205.0], vec![0.0, 1.0, 2.0]);
        assert!(matches!(
            result,
            Err(SpectrumError::NotAscending { index: 2, .. })
        ));
    }

    #[test]
    fn new_rejects_duplicate_wavelengths_and_length_mismatch() {
        assert!(Spectrum::new(vec![200.0, 200.0], vec![0.0, 1.0]).is_err());
        assert!(matches!(
            Spectrum::new(vec![200.0, 201.0], vec![0.0]),
            Err(SpectrumError::LengthMismatch { .. })
        ));
        assert_eq!(Spectrum::new(vec![], vec![]), Err(SpectrumError::Empty));
    }

    #[test]
    fn range_and_grid_comparison() {
        let a = Spectrum::from_pairs([(190.0, 1.0), (200.0, 2.0), (250.0, 0.5)]).unwrap();
        let b = a.with_values(vec![0.0, 0.0, 0.0]).unwrap();
        assert_eq!(a.range(), WavelengthRange::new(190.0, 250.0));
        assert!(a.same_grid(&b));
    }

    #[test]
    fn range_intersection() {
        let a = WavelengthRange::new(190.0, 260.0);
        let b = WavelengthRange::new(200.0, 300.0);
        assert_eq!(a.intersect(&b), Some(WavelengthRange::new(200.0, 260.0)));
        assert_eq!(a.intersect(&WavelengthRange::new(270.0, 280.0)), None);
    }

    #[test]
    fn missing_uncertainties_weigh_one() {
        let spectrum = Spectrum::from_pairs([(200.0, 1.0), (201.0, 2.0), (202.0, 3.0)]).unwrap();
        let exp =
            ExperimentalSpectrum::new(spectrum, vec![Some(0.5), None, Some(0.0)]).unwrap();
        assert_eq!(exp.weight(0), 4.0);
        assert_eq!(exp.weight(1), 1.0);
        assert_eq!(exp.weight(2), 1.0);
        assert!(exp.has_uncertainties());
    }
}
