use crate::error::{CliError, Result};
use cdens::core::io::dat::SpectrumDatFile;
use cdens::core::io::traits::SpectrumFile;
use cdens::engine::config::{FitWindow, ModelConfiguration, StateAveraging};
use cdens::engine::prediction::PredictionFailure;
use cdens::engine::ranking::RankedConfiguration;
use cdens::engine::reconcile::FitResult;
use cdens::engine::sampling::StateRepresentatives;
use cdens::engine::transition::{TimescaleEstimate, TransitionModel};
use cdens::workflows::ensemble::{ConfigurationOutcome, ConfigurationReport, PipelineResult};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const TRANSITION_MODEL_FILE: &str = "transition_model.json";
pub const REPRESENTATIVES_FILE: &str = "representatives.csv";
pub const FITS_FILE: &str = "fits.csv";
pub const RANKING_FILE: &str = "ranking.csv";
pub const REPORT_FILE: &str = "report.json";

/// Replaces everything but ASCII alphanumerics and `-` so a label can be used
/// in a file name.
pub fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

pub fn ensemble_file_name(label: &str) -> String {
    format!("ensemble_{}.dat", file_safe(label))
}

#[derive(Serialize)]
struct ComplexValue {
    re: f64,
    im: f64,
}

#[derive(Serialize)]
struct TimescaleRecord<'a> {
    lag: usize,
    timescales: &'a [Option<f64>],
    error: Option<&'a str>,
}

impl<'a> From<&'a TimescaleEstimate> for TimescaleRecord<'a> {
    fn from(estimate: &'a TimescaleEstimate) -> Self {
        Self {
            lag: estimate.lag,
            timescales: &estimate.timescales,
            error: estimate.error.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct TransitionModelRecord<'a> {
    lag: usize,
    num_states: usize,
    counts: Vec<Vec<f64>>,
    transition_matrix: Vec<Vec<f64>>,
    stationary_distribution: &'a [f64],
    eigenvalues: Vec<ComplexValue>,
    implied_timescales: Vec<Option<f64>>,
    timescale_scan: Vec<TimescaleRecord<'a>>,
}

impl<'a> TransitionModelRecord<'a> {
    fn new(model: &'a TransitionModel, scan: &'a [TimescaleEstimate]) -> Self {
        let counts = model.counts();
        let transition = model.transition_matrix();
        Self {
            lag: model.lag(),
            num_states: model.num_states(),
            counts: matrix_rows(counts.nrows(), counts.ncols(), |i, j| counts[(i, j)]),
            transition_matrix: matrix_rows(transition.nrows(), transition.ncols(), |i, j| {
                transition[(i, j)]
            }),
            stationary_distribution: model.stationary_distribution(),
            eigenvalues: model
                .eigenvalues()
                .iter()
                .map(|z| ComplexValue { re: z.re, im: z.im })
                .collect(),
            implied_timescales: model.implied_timescales(),
            timescale_scan: scan.iter().map(Into::into).collect(),
        }
    }
}

fn matrix_rows(nrows: usize, ncols: usize, at: impl Fn(usize, usize) -> f64) -> Vec<Vec<f64>> {
    (0..nrows)
        .map(|i| (0..ncols).map(|j| at(i, j)).collect())
        .collect()
}

#[derive(Serialize)]
struct RepresentativeRow {
    state: usize,
    rank: usize,
    replica: usize,
    frame: usize,
    membership: f64,
}

#[derive(Serialize)]
struct FitRow<'a> {
    configuration: &'a str,
    window: String,
    min_nm: f64,
    max_nm: f64,
    points: usize,
    scale: f64,
    offset: f64,
    rmse: f64,
    chi_squared: f64,
    r_squared: f64,
}

#[derive(Serialize)]
struct RankingRow<'a> {
    rank: usize,
    configuration: &'a str,
    primary_window: String,
    primary_metric: f64,
    rank_changes: usize,
    windows: usize,
    cv_score: Option<f64>,
    window_variance: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
enum ConfigurationStatus {
    Succeeded,
    Failed,
}

#[derive(Serialize)]
struct ConfigurationRecord<'a> {
    label: &'a str,
    configuration: &'a ModelConfiguration,
    status: ConfigurationStatus,
    error: Option<String>,
    ensemble_file: Option<String>,
    averaging: Option<StateAveraging>,
    state_weights: Option<&'a [f64]>,
    frames_per_state: Option<&'a [usize]>,
    fits: &'a [FitResult],
    cv_score: Option<f64>,
    failures: &'a [PredictionFailure],
    warnings: &'a [String],
}

impl<'a> From<&'a ConfigurationReport> for ConfigurationRecord<'a> {
    fn from(report: &'a ConfigurationReport) -> Self {
        let mut record = Self {
            label: &report.label,
            configuration: &report.configuration,
            status: ConfigurationStatus::Failed,
            error: None,
            ensemble_file: None,
            averaging: None,
            state_weights: None,
            frames_per_state: None,
            fits: &[],
            cv_score: None,
            failures: &report.failures,
            warnings: &report.warnings,
        };
        match &report.outcome {
            ConfigurationOutcome::Succeeded {
                ensemble,
                fits,
                cv_score,
            } => {
                record.status = ConfigurationStatus::Succeeded;
                record.ensemble_file = Some(ensemble_file_name(&report.label));
                record.averaging = Some(ensemble.averaging);
                record.state_weights = Some(ensemble.weights.as_slice());
                record.frames_per_state = Some(ensemble.frames_per_state.as_slice());
                record.fits = fits.as_slice();
                record.cv_score = *cv_score;
            }
            ConfigurationOutcome::Failed { error } => {
                record.error = Some(error.to_string());
            }
        }
        record
    }
}

#[derive(Serialize)]
struct EncoderRecord<'a> {
    vamp2_score: f64,
    feature_singular_values: &'a [f64],
}

#[derive(Serialize)]
struct Report<'a> {
    version: &'static str,
    encoder: EncoderRecord<'a>,
    transition_model: TransitionModelRecord<'a>,
    representatives: &'a [StateRepresentatives],
    configurations: Vec<ConfigurationRecord<'a>>,
    ranking: &'a [RankedConfiguration],
}

fn window_bounds(fit: &FitResult) -> (f64, f64) {
    match fit.window {
        FitWindow::Range { min_nm, max_nm } => (min_nm, max_nm),
        FitWindow::Full => (fit.range.min_nm, fit.range.max_nm),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| CliError::Output {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    writer.flush()?;
    Ok(())
}

fn write_csv<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let to_output_error = |e: csv::Error| CliError::Output {
        path: path.to_path_buf(),
        source: e.into(),
    };
    let mut writer = csv::Writer::from_path(path).map_err(to_output_error)?;
    for row in rows {
        writer.serialize(row).map_err(to_output_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes every artifact of a pipeline run into `dir` and returns the paths written.
pub fn write_artifacts(dir: &Path, result: &PipelineResult) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    let path = dir.join(TRANSITION_MODEL_FILE);
    write_json(&path, &TransitionModelRecord::new(&result.model, &result.timescales))?;
    written.push(path);

    let path = dir.join(REPRESENTATIVES_FILE);
    write_csv(
        &path,
        result.representatives.iter().flat_map(|state| {
            state
                .frames
                .iter()
                .enumerate()
                .map(move |(rank, rep)| RepresentativeRow {
                    state: state.state,
                    rank: rank + 1,
                    replica: rep.frame.replica,
                    frame: rep.frame.time,
                    membership: rep.membership,
                })
        }),
    )?;
    written.push(path);

    for report in &result.configurations {
        if let ConfigurationOutcome::Succeeded { ensemble, .. } = &report.outcome {
            let path = dir.join(ensemble_file_name(&report.label));
            SpectrumDatFile::write_to_path(&ensemble.spectrum, &path).map_err(|e| {
                CliError::Output {
                    path: path.clone(),
                    source: e.into(),
                }
            })?;
            written.push(path);
        }
    }

    let path = dir.join(FITS_FILE);
    write_csv(
        &path,
        result.configurations.iter().flat_map(|report| {
            let fits: &[FitResult] = match &report.outcome {
                ConfigurationOutcome::Succeeded { fits, .. } => fits.as_slice(),
                ConfigurationOutcome::Failed { .. } => &[],
            };
            fits.iter().map(move |fit| {
                let (min_nm, max_nm) = window_bounds(fit);
                FitRow {
                    configuration: &report.label,
                    window: fit.window.to_string(),
                    min_nm,
                    max_nm,
                    points: fit.metrics.points,
                    scale: fit.fit.scale,
                    offset: fit.fit.offset,
                    rmse: fit.metrics.rmse,
                    chi_squared: fit.metrics.chi_squared,
                    r_squared: fit.metrics.r_squared,
                }
            })
        }),
    )?;
    written.push(path);

    let path = dir.join(RANKING_FILE);
    write_csv(
        &path,
        result.ranking.iter().map(|r| RankingRow {
            rank: r.rank,
            configuration: &r.label,
            primary_window: r.primary_window.to_string(),
            primary_metric: r.primary_metric,
            rank_changes: r.rank_changes,
            windows: r.windows,
            cv_score: r.cv_score,
            window_variance: r.window_variance,
        }),
    )?;
    written.push(path);

    let path = dir.join(REPORT_FILE);
    let report = Report {
        version: env!("CARGO_PKG_VERSION"),
        encoder: EncoderRecord {
            vamp2_score: result.encoder_score,
            feature_singular_values: &result.feature_singular_values,
        },
        transition_model: TransitionModelRecord::new(&result.model, &result.timescales),
        representatives: &result.representatives,
        configurations: result.configurations.iter().map(Into::into).collect(),
        ranking: &result.ranking,
    };
    write_json(&path, &report)?;
    written.push(path);

    info!(dir = %dir.display(), files = written.len(), "Wrote output artifacts.");
    Ok(written)
}
