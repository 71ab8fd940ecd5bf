use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "CDENS CLI - Markov-state weighted ensemble circular dichroism spectra from molecular dynamics, fitted against experiment.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline: state encoding, transition model, per-frame prediction,
    /// ensemble averaging, fitting and ranking.
    Run(RunArgs),
    /// Fit a single theoretical spectrum to an experimental one.
    Fit(FitArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    // --- Core Arguments ---
    /// Path to the pipeline configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Path to the experimental spectrum (wavelength, signal[, uncertainty]).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub experiment: PathBuf,

    /// Directory for the output artifacts. Created if missing.
    #[arg(short, long, required = true, value_name = "DIR")]
    pub output: PathBuf,

    /// Feature table of one replica trajectory (CSV). Repeat for several replicas;
    /// replaces the `features` list of the config file.
    #[arg(short = 'f', long = "features", value_name = "PATH")]
    pub features: Vec<PathBuf>,

    // --- Model Overrides ---
    /// Override the number of metastable states.
    #[arg(short = 'k', long, value_name = "INT")]
    pub num_states: Option<usize>,

    /// Override the lag time, in frames.
    #[arg(short = 'l', long = "lag", value_name = "INT")]
    pub lag_time: Option<usize>,

    /// Override the random seed.
    #[arg(long, value_name = "INT")]
    pub seed: Option<u64>,

    /// Basis set to predict spectra with. Repeat for several; replaces the
    /// `basis-sets` list of the config file.
    #[arg(short = 'b', long = "basis-set", value_name = "NAME")]
    pub basis_sets: Vec<String>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S sampling.samples-per-state=8
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `fit` subcommand.
#[derive(Args, Debug)]
pub struct FitArgs {
    /// Path to the theoretical spectrum (wavelength, signal).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub theory: PathBuf,

    /// Path to the experimental spectrum (wavelength, signal[, uncertainty]).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub experiment: PathBuf,

    /// Lower bound of the fitting window in nm. Requires --max-nm.
    #[arg(long, value_name = "FLOAT", requires = "max_nm")]
    pub min_nm: Option<f64>,

    /// Upper bound of the fitting window in nm. Requires --min-nm.
    #[arg(long, value_name = "FLOAT", requires = "min_nm")]
    pub max_nm: Option<f64>,

    /// Interpolation used when the two wavelength grids differ.
    #[arg(long, value_enum, default_value_t = InterpolationArg::Linear)]
    pub interpolation: InterpolationArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationArg {
    Linear,
    Nearest,
    CubicSpline,
}

impl From<InterpolationArg> for cdens::core::spectral::interpolation::Interpolation {
    fn from(arg: InterpolationArg) -> Self {
        match arg {
            InterpolationArg::Linear => Self::Linear,
            InterpolationArg::Nearest => Self::Nearest,
            InterpolationArg::CubicSpline => Self::CubicSpline,
        }
    }
}
