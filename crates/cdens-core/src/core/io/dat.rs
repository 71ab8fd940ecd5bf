use crate::core::io::traits::SpectrumFile;
use crate::core::models::spectrum::{ExperimentalSpectrum, Spectrum, SpectrumError};
use std::io::{self, BufRead, Write};
use thiserror::Error;

const COMMENT_PREFIXES: [char; 3] = ['#', '%', '!'];

#[derive(Debug, Error)]
pub enum DatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error on line {line}: {kind}")]
    Parse { line: usize, kind: DatParseErrorKind },
    #[error("Invalid spectrum: {0}")]
    Spectrum(#[from] SpectrumError),
}

#[derive(Debug, Error, PartialEq)]
pub enum DatParseErrorKind {
    #[error("expected 2 or 3 columns, found {0}")]
    ColumnCount(usize),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
}

/// One parsed data line: wavelength, signal and optional uncertainty.
type Row = (f64, f64, Option<f64>);

fn parse_rows(reader: &mut impl BufRead) -> Result<Vec<Row>, DatError> {
    let mut rows = Vec::new();
    for (line_num, line_res) in reader.lines().enumerate() {
        let line = line_res?;
        let line_num = line_num + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(COMMENT_PREFIXES) {
            continue;
        }

        let tokens: Vec<&str> = trimmed
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty())
            .collect();
        if !(2..=3).contains(&tokens.len()) {
            return Err(DatError::Parse {
                line: line_num,
                kind: DatParseErrorKind::ColumnCount(tokens.len()),
            });
        }

        let parse = |token: &str| -> Result<f64, DatError> {
            token.parse::<f64>().map_err(|_| DatError::Parse {
                line: line_num,
                kind: DatParseErrorKind::InvalidNumber(token.to_string()),
            })
        };
        let wavelength = parse(tokens[0])?;
        let signal = parse(tokens[1])?;
        let uncertainty = tokens.get(2).map(|&t| parse(t)).transpose()?;
        rows.push((wavelength, signal, uncertainty));
    }

    // Instruments commonly scan from long to short wavelength.
    if rows.len() > 1 && rows[0].0 > rows[rows.len() - 1].0 {
        rows.reverse();
    }
    Ok(rows)
}

/// Two-column `wavelength signal` text file for theoretical spectra.
pub struct SpectrumDatFile;

impl SpectrumFile for SpectrumDatFile {
    type Data = Spectrum;
    type Error = DatError;

    fn read_from(reader: &mut impl BufRead) -> Result<Spectrum, DatError> {
        let rows = parse_rows(reader)?;
        Ok(Spectrum::from_pairs(rows.into_iter().map(|(w, s, _)| (w, s)))?)
    }

    fn write_to(data: &Spectrum, writer: &mut impl Write) -> Result<(), DatError> {
        writeln!(writer, "# wavelength_nm signal")?;
        for (w, s) in data.iter() {
            writeln!(writer, "{:.4} {:.8e}", w, s)?;
        }
        Ok(())
    }
}

/// Experimental spectrum file with an optional third uncertainty column.
///
/// The third column may be present on some lines only; missing values stay
/// `None` and are weighted as 1 when computing χ².
pub struct ExperimentalDatFile;

impl SpectrumFile for ExperimentalDatFile {
    type Data = ExperimentalSpectrum;
    type Error = DatError;

    fn read_from(reader: &mut impl BufRead) -> Result<ExperimentalSpectrum, DatError> {
        let rows = parse_rows(reader)?;
        let uncertainties = rows.iter().map(|r| r.2).collect();
        let spectrum = Spectrum::from_pairs(rows.into_iter().map(|(w, s, _)| (w, s)))?;
        Ok(ExperimentalSpectrum::new(spectrum, uncertainties)?)
    }

    fn write_to(data: &ExperimentalSpectrum, writer: &mut impl Write) -> Result<(), DatError> {
        writeln!(writer, "# wavelength_nm signal uncertainty")?;
        for ((w, s), sigma) in data.spectrum.iter().zip(data.uncertainties()) {
            match sigma {
                Some(sigma) => writeln!(writer, "{:.4} {:.8e} {:.8e}", w, s, sigma)?,
                None => writeln!(writer, "{:.4} {:.8e}", w, s)?,
            }
        }
        Ok(())
    }
}
