use crate::error::{CliError, Result};
use cdens::core::spectral::interpolation::Interpolation;
use cdens::engine::config as core_config;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub features: Option<Vec<PathBuf>>,
    pub basis_sets: Option<Vec<String>>,
    pub configurations: Option<Vec<FileModelConfiguration>>,
    pub num_states: Option<usize>,
    pub lag_time: Option<usize>,
    pub seed: Option<u64>,
    pub tolerance: Option<f64>,
    pub encoder: Option<FileEncoderConfig>,
    pub transition: Option<FileTransitionConfig>,
    pub sampling: Option<FileSamplingConfig>,
    pub ensemble: Option<FileEnsembleConfig>,
    pub fitting: Option<FileFittingConfig>,
    pub retry: Option<FileRetryConfig>,
    pub predictor: Option<FilePredictorConfig>,
}

/// A basis set with its own primary fitting window.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileModelConfiguration {
    pub basis_set: String,
    pub min_nm: Option<f64>,
    pub max_nm: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileEncoderConfig {
    pub latent_dim: Option<usize>,
    pub regularization: Option<f64>,
    pub stiffness: Option<f64>,
    pub max_iterations: Option<usize>,
    pub convergence_threshold: Option<f64>,
    pub restarts: Option<usize>,
    pub min_state_population: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileCountingMode {
    Hard,
    Soft,
}

impl From<FileCountingMode> for core_config::CountingMode {
    fn from(mode: FileCountingMode) -> Self {
        match mode {
            FileCountingMode::Hard => Self::Hard,
            FileCountingMode::Soft => Self::Soft,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileTransitionConfig {
    pub counting: Option<FileCountingMode>,
    pub timescale_lags: Option<Vec<usize>>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileSamplingStrategy {
    Medoid,
    TopProbability,
    Stratified,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileSamplingConfig {
    pub strategy: Option<FileSamplingStrategy>,
    /// Membership bins, only read by the stratified strategy.
    pub bins: Option<usize>,
    pub samples_per_state: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileStateAveraging {
    Arithmetic,
    MembershipWeighted,
}

impl From<FileStateAveraging> for core_config::StateAveraging {
    fn from(averaging: FileStateAveraging) -> Self {
        match averaging {
            FileStateAveraging::Arithmetic => Self::Arithmetic,
            FileStateAveraging::MembershipWeighted => Self::MembershipWeighted,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileEnsembleConfig {
    pub averaging: Option<FileStateAveraging>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileRankingMetric {
    Rmse,
    ChiSquared,
    RSquared,
}

impl From<FileRankingMetric> for core_config::RankingMetric {
    fn from(metric: FileRankingMetric) -> Self {
        match metric {
            FileRankingMetric::Rmse => Self::Rmse,
            FileRankingMetric::ChiSquared => Self::ChiSquared,
            FileRankingMetric::RSquared => Self::RSquared,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileFittingConfig {
    pub min_nm: Option<f64>,
    pub max_nm: Option<f64>,
    /// `[min, max]` pairs in nm.
    pub robustness_windows: Option<Vec<[f64; 2]>>,
    pub interpolation: Option<Interpolation>,
    pub metric: Option<FileRankingMetric>,
    pub tie_tolerance: Option<f64>,
    pub cross_validation_folds: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileRetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub timeout_secs: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields
)]
pub enum FilePredictorConfig {
    /// External program run once per frame and basis set.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    },
    /// Spectra computed ahead of time, one file per frame and basis set.
    Precomputed { path_template: String },
}

/// Reads a config file into an untyped table so that `--set` overrides can
/// be applied before deserialization.
pub fn load_table(path: &Path) -> Result<toml::Table> {
    debug!("Loading configuration from file: {:?}", path);
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

impl FileConfig {
    pub fn from_table(table: toml::Table, origin: &Path) -> Result<Self> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| CliError::FileParsing {
                path: origin.to_path_buf(),
                source: e.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<FileConfig> {
        let table: toml::Table = toml::from_str(content).unwrap();
        FileConfig::from_table(table, Path::new("test.toml"))
    }

    #[test]
    fn parses_a_complete_file() {
        let config = parse(
            r#"
            features = ["r0.csv", "r1.csv"]
            basis-sets = ["svp"]
            num-states = 3
            lag-time = 10

            [[configurations]]
            basis-set = "tzvp"
            min-nm = 190.0
            max-nm = 240.0

            [transition]
            counting = "soft"
            timescale-lags = [5, 20]

            [sampling]
            strategy = "stratified"
            bins = 4

            [ensemble]
            averaging = "membership-weighted"

            [fitting]
            robustness-windows = [[200.0, 250.0], [210.0, 260.0]]
            interpolation = "cubic-spline"
            metric = "r-squared"

            [predictor]
            type = "command"
            program = "predict-cd"
            args = ["--basis", "{basis}", "--out", "{output}"]
            "#,
        )
        .unwrap();

        assert_eq!(config.features.unwrap().len(), 2);
        assert_eq!(config.configurations.unwrap()[0].basis_set, "tzvp");
        assert_eq!(
            config.transition.unwrap().counting,
            Some(FileCountingMode::Soft)
        );
        let sampling = config.sampling.unwrap();
        assert_eq!(sampling.strategy, Some(FileSamplingStrategy::Stratified));
        assert_eq!(sampling.bins, Some(4));
        let fitting = config.fitting.unwrap();
        assert_eq!(fitting.robustness_windows.unwrap()[1], [210.0, 260.0]);
        assert_eq!(fitting.interpolation, Some(Interpolation::CubicSpline));
        assert_eq!(fitting.metric, Some(FileRankingMetric::RSquared));
        match config.predictor.unwrap() {
            FilePredictorConfig::Command { program, args, .. } => {
                assert_eq!(program, "predict-cd");
                assert_eq!(args.len(), 4);
            }
            other => panic!("unexpected predictor: {:?}", other),
        }
    }

    #[test]
    fn precomputed_predictor_uses_kebab_case_fields() {
        let config = parse(
            r#"
            [predictor]
            type = "precomputed"
            path-template = "spectra/{basis}/{replica}_{frame}.dat"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.predictor,
            Some(FilePredictorConfig::Precomputed {
                path_template: "spectra/{basis}/{replica}_{frame}.dat".to_string()
            })
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            parse("num-state = 3"),
            Err(CliError::FileParsing { .. })
        ));
        assert!(parse("[sampling]\nstrategy = \"random\"").is_err());
    }

    #[test]
    fn load_table_reports_syntax_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "num-states = ").unwrap();
        match load_table(&path) {
            Err(CliError::FileParsing { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
