use crate::core::models::ids::BasisSetId;
use crate::core::models::spectrum::WavelengthRange;
use crate::core::spectral::interpolation::Interpolation;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub num_states: usize,
    /// Slow coordinates used for clustering; defaults to `num_states - 1`.
    pub latent_dim: Option<usize>,
    /// Relative eigenvalue cutoff for covariance whitening.
    pub regularization: f64,
    /// Inverse temperature of the soft assignment in slow-coordinate space.
    pub stiffness: f64,
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub restarts: usize,
    /// Minimum fraction of total membership mass every state must carry.
    pub min_state_population: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CountingMode {
    /// Count transitions between arg-max states.
    #[default]
    Hard,
    /// Accumulate outer products of soft memberships.
    Soft,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransitionConfig {
    pub counting: CountingMode,
    /// Additional lag times for the implied-timescale diagnostic.
    pub timescale_lags: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum SamplingStrategy {
    Medoid,
    TopProbability,
    Stratified { bins: usize },
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingStrategy::Medoid => f.write_str("medoid"),
            SamplingStrategy::TopProbability => f.write_str("top-probability"),
            SamplingStrategy::Stratified { bins } => write!(f, "stratified ({} bins)", bins),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub strategy: SamplingStrategy,
    pub samples_per_state: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateAveraging {
    /// Unweighted mean over a state's representative frames.
    #[default]
    Arithmetic,
    /// Mean weighted by each representative's membership in the state.
    MembershipWeighted,
}

const MAX_BACKOFF_EXPONENT: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Per-call timeout handed to the predictor.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Longest delay between two attempts.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

    /// Delay before retry number `attempt` (1-based count of failed attempts),
    /// capped at [`RetryPolicy::MAX_BACKOFF`].
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(Self::MAX_BACKOFF)
            .min(Self::MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum FitWindow {
    /// Overlap of the theoretical and experimental wavelength ranges.
    Full,
    Range { min_nm: f64, max_nm: f64 },
}

impl FitWindow {
    pub fn as_range(&self) -> Option<WavelengthRange> {
        match *self {
            FitWindow::Full => None,
            FitWindow::Range { min_nm, max_nm } => Some(WavelengthRange::new(min_nm, max_nm)),
        }
    }
}

impl fmt::Display for FitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWindow::Full => f.write_str("full"),
            FitWindow::Range { min_nm, max_nm } => write!(f, "{}-{} nm", min_nm, max_nm),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingMetric {
    #[default]
    Rmse,
    ChiSquared,
    /// Ranked descending.
    RSquared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittingConfig {
    pub window: FitWindow,
    pub robustness_windows: Vec<FitWindow>,
    pub interpolation: Interpolation,
    pub metric: RankingMetric,
    pub tie_tolerance: f64,
    pub cross_validation_folds: Option<usize>,
}

impl Default for FittingConfig {
    fn default() -> Self {
        Self {
            window: FitWindow::Full,
            robustness_windows: Vec::new(),
            interpolation: Interpolation::Linear,
            metric: RankingMetric::Rmse,
            tie_tolerance: 1e-6,
            cross_validation_folds: None,
        }
    }
}

/// A basis set and an optional primary-window override. Configurations are
/// fitted and ranked independently, never merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfiguration {
    pub basis_set: BasisSetId,
    pub window: Option<FitWindow>,
}

impl ModelConfiguration {
    pub fn new(basis_set: BasisSetId) -> Self {
        Self {
            basis_set,
            window: None,
        }
    }

    pub fn with_window(mut self, window: FitWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn label(&self) -> String {
        match &self.window {
            None => self.basis_set.to_string(),
            Some(window) => format!("{}@{}", self.basis_set, window),
        }
    }
}

/// Immutable configuration threaded through every pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub lag_time: usize,
    pub encoder: EncoderConfig,
    pub transition: TransitionConfig,
    pub sampling: SamplingConfig,
    pub averaging: StateAveraging,
    pub configurations: Vec<ModelConfiguration>,
    pub fitting: FittingConfig,
    pub retry: RetryPolicy,
    pub seed: u64,
    /// Numerical tolerance for stochasticity and normalization checks.
    pub tolerance: f64,
}

impl PipelineConfig {
    pub fn num_states(&self) -> usize {
        self.encoder.num_states
    }

    /// Primary window first, then the robustness windows, without duplicates.
    pub fn windows_for(&self, configuration: &ModelConfiguration) -> Vec<FitWindow> {
        let primary = configuration.window.unwrap_or(self.fitting.window);
        let mut windows = vec![primary];
        for w in &self.fitting.robustness_windows {
            if !windows.contains(w) {
                windows.push(*w);
            }
        }
        windows
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    num_states: Option<usize>,
    lag_time: Option<usize>,
    configurations: Vec<ModelConfiguration>,
    latent_dim: Option<usize>,
    regularization: Option<f64>,
    stiffness: Option<f64>,
    max_iterations: Option<usize>,
    convergence_threshold: Option<f64>,
    restarts: Option<usize>,
    min_state_population: Option<f64>,
    transition: Option<TransitionConfig>,
    sampling_strategy: Option<SamplingStrategy>,
    samples_per_state: Option<usize>,
    averaging: Option<StateAveraging>,
    fitting: Option<FittingConfig>,
    retry: Option<RetryPolicy>,
    seed: Option<u64>,
    tolerance: Option<f64>,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_states(mut self, k: usize) -> Self {
        self.num_states = Some(k);
        self
    }
    pub fn lag_time(mut self, lag: usize) -> Self {
        self.lag_time = Some(lag);
        self
    }
    pub fn basis_set(mut self, basis_set: BasisSetId) -> Self {
        self.configurations.push(ModelConfiguration::new(basis_set));
        self
    }
    pub fn configuration(mut self, configuration: ModelConfiguration) -> Self {
        self.configurations.push(configuration);
        self
    }
    pub fn latent_dim(mut self, dim: usize) -> Self {
        self.latent_dim = Some(dim);
        self
    }
    pub fn regularization(mut self, epsilon: f64) -> Self {
        self.regularization = Some(epsilon);
        self
    }
    pub fn stiffness(mut self, beta: f64) -> Self {
        self.stiffness = Some(beta);
        self
    }
    pub fn max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = Some(iterations);
        self
    }
    pub fn convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = Some(threshold);
        self
    }
    pub fn restarts(mut self, restarts: usize) -> Self {
        self.restarts = Some(restarts);
        self
    }
    pub fn min_state_population(mut self, fraction: f64) -> Self {
        self.min_state_population = Some(fraction);
        self
    }
    pub fn transition(mut self, transition: TransitionConfig) -> Self {
        self.transition = Some(transition);
        self
    }
    pub fn sampling_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.sampling_strategy = Some(strategy);
        self
    }
    pub fn samples_per_state(mut self, n: usize) -> Self {
        self.samples_per_state = Some(n);
        self
    }
    pub fn averaging(mut self, averaging: StateAveraging) -> Self {
        self.averaging = Some(averaging);
        self
    }
    pub fn fitting(mut self, fitting: FittingConfig) -> Self {
        self.fitting = Some(fitting);
        self
    }
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let num_states = self
            .num_states
            .ok_or(ConfigError::MissingParameter("num_states"))?;
        let lag_time = self
            .lag_time
            .ok_or(ConfigError::MissingParameter("lag_time"))?;
        if self.configurations.is_empty() {
            return Err(ConfigError::MissingParameter("basis_sets"));
        }

        let encoder = EncoderConfig {
            num_states,
            latent_dim: self.latent_dim,
            regularization: self.regularization.unwrap_or(1e-10),
            stiffness: self.stiffness.unwrap_or(4.0),
            max_iterations: self.max_iterations.unwrap_or(200),
            convergence_threshold: self.convergence_threshold.unwrap_or(1e-6),
            restarts: self.restarts.unwrap_or(5),
            min_state_population: self.min_state_population.unwrap_or(1e-3),
        };
        let config = PipelineConfig {
            lag_time,
            encoder,
            transition: self.transition.unwrap_or_default(),
            sampling: SamplingConfig {
                strategy: self.sampling_strategy.unwrap_or(SamplingStrategy::Medoid),
                samples_per_state: self.samples_per_state.unwrap_or(5),
            },
            averaging: self.averaging.unwrap_or_default(),
            configurations: self.configurations,
            fitting: self.fitting.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            seed: self.seed.unwrap_or(42),
            tolerance: self.tolerance.unwrap_or(1e-8),
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &PipelineConfig) -> Result<(), ConfigError> {
    let enc = &config.encoder;
    if enc.num_states < 2 {
        return Err(invalid("num_states", "at least two states are required"));
    }
    if config.lag_time == 0 {
        return Err(invalid("lag_time", "lag time must be at least one frame"));
    }
    if enc.latent_dim == Some(0) {
        return Err(invalid("latent_dim", "must be positive"));
    }
    if !(enc.regularization >= 0.0 && enc.regularization.is_finite()) {
        return Err(invalid("regularization", "must be finite and non-negative"));
    }
    if !(enc.convergence_threshold >= 0.0 && enc.convergence_threshold.is_finite()) {
        return Err(invalid("convergence_threshold", "must be finite and non-negative"));
    }
    if !(enc.stiffness > 0.0) {
        return Err(invalid("stiffness", "must be positive"));
    }
    if enc.restarts == 0 {
        return Err(invalid("restarts", "at least one restart is required"));
    }
    if !(0.0..1.0).contains(&enc.min_state_population) {
        return Err(invalid("min_state_population", "must lie in [0, 1)"));
    }
    if config.transition.timescale_lags.contains(&0) {
        return Err(invalid("timescale_lags", "lag times must be positive"));
    }
    if config.sampling.samples_per_state == 0 {
        return Err(invalid("samples_per_state", "must be positive"));
    }
    if let SamplingStrategy::Stratified { bins: 0 } = config.sampling.strategy {
        return Err(invalid("bins", "stratified sampling needs at least one bin"));
    }
    if let Some(folds) = config.fitting.cross_validation_folds {
        if folds < 2 {
            return Err(invalid("cross_validation_folds", "needs at least two folds"));
        }
    }
    if !(config.tolerance > 0.0) {
        return Err(invalid("tolerance", "must be positive"));
    }
    if !(config.fitting.tie_tolerance >= 0.0 && config.fitting.tie_tolerance.is_finite()) {
        return Err(invalid("tie_tolerance", "must be finite and non-negative"));
    }
    if config.retry.max_attempts == 0 {
        return Err(invalid("max_attempts", "at least one attempt is required"));
    }
    if !(config.retry.backoff_multiplier >= 1.0 && config.retry.backoff_multiplier.is_finite()) {
        return Err(invalid("backoff_multiplier", "must be finite and at least 1"));
    }
    let windows = std::iter::once(&config.fitting.window)
        .chain(&config.fitting.robustness_windows)
        .chain(config.configurations.iter().filter_map(|c| c.window.as_ref()));
    for window in windows {
        if let FitWindow::Range { min_nm, max_nm } = *window {
            if !(min_nm < max_nm) {
                return Err(invalid(
                    "window",
                    format!("empty wavelength window {}-{} nm", min_nm, max_nm),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
            .num_states(3)
            .lag_time(10)
            .basis_set(BasisSetId::from("ab-initio"))
    }

    #[test]
    fn build_applies_defaults() {
        let config = minimal().build().unwrap();
        assert_eq!(config.num_states(), 3);
        assert_eq!(config.sampling.strategy, SamplingStrategy::Medoid);
        assert_eq!(config.averaging, StateAveraging::Arithmetic);
        assert_eq!(config.fitting.window, FitWindow::Full);
        assert_eq!(config.configurations.len(), 1);
    }

    #[test]
    fn build_reports_missing_parameters() {
        let result = PipelineConfigBuilder::new().lag_time(1).build();
        assert_eq!(result, Err(ConfigError::MissingParameter("num_states")));
        let result = PipelineConfigBuilder::new().num_states(2).lag_time(1).build();
        assert_eq!(result, Err(ConfigError::MissingParameter("basis_sets")));
    }

    #[test]
    fn build_rejects_invalid_values() {
        assert!(minimal().num_states(1).build().is_err());
        assert!(minimal().lag_time(0).build().is_err());
        assert!(
            minimal()
                .sampling_strategy(SamplingStrategy::Stratified { bins: 0 })
                .build()
                .is_err()
        );
        let fitting = FittingConfig {
            window: FitWindow::Range {
                min_nm: 250.0,
                max_nm: 200.0,
            },
            ..FittingConfig::default()
        };
        assert!(minimal().fitting(fitting).build().is_err());
    }

    #[test]
    fn windows_for_puts_primary_first_without_duplicates() {
        let narrow = FitWindow::Range {
            min_nm: 200.0,
            max_nm: 250.0,
        };
        let fitting = FittingConfig {
            robustness_windows: vec![FitWindow::Full, narrow],
            ..FittingConfig::default()
        };
        let config = minimal().fitting(fitting).build().unwrap();
        let windows = config.windows_for(&config.configurations[0]);
        assert_eq!(windows, vec![FitWindow::Full, narrow]);

        let overridden = ModelConfiguration::new(BasisSetId::from("x")).with_window(narrow);
        assert_eq!(config.windows_for(&overridden), vec![narrow, FitWindow::Full]);
        assert_eq!(overridden.label(), "x@200-250 nm");
    }

    #[test]
    fn backoff_grows_geometrically() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped_for_long_retry_sequences() {
        let policy = RetryPolicy {
            max_attempts: 80,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(79), RetryPolicy::MAX_BACKOFF);
        assert_eq!(policy.backoff_for(u32::MAX), RetryPolicy::MAX_BACKOFF);

        let unbounded = RetryPolicy {
            backoff_multiplier: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert_eq!(unbounded.backoff_for(2), RetryPolicy::MAX_BACKOFF);
    }

    #[test]
    fn build_rejects_non_finite_or_negative_tolerances() {
        let retry = |multiplier: f64| RetryPolicy {
            backoff_multiplier: multiplier,
            ..RetryPolicy::default()
        };
        assert!(minimal().retry(retry(f64::INFINITY)).build().is_err());
        assert!(minimal().retry(retry(0.5)).build().is_err());
        assert!(minimal().retry(retry(f64::NAN)).build().is_err());
        assert!(minimal().retry(retry(1.0)).build().is_ok());

        assert!(minimal().regularization(f64::NAN).build().is_err());
        assert!(minimal().regularization(-1e-6).build().is_err());
        assert!(minimal().convergence_threshold(f64::INFINITY).build().is_err());
        assert!(minimal().convergence_threshold(-1.0).build().is_err());

        let fitting = |tie_tolerance: f64| FittingConfig {
            tie_tolerance,
            ..FittingConfig::default()
        };
        assert!(minimal().fitting(fitting(f64::NAN)).build().is_err());
        assert!(minimal().fitting(fitting(-0.1)).build().is_err());
        assert!(minimal().fitting(fitting(0.0)).build().is_ok());
    }
}
