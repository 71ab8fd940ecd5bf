use super::file::{
    FileConfig, FileFittingConfig, FilePredictorConfig, FileRetryConfig, FileSamplingConfig,
    FileSamplingStrategy, load_table,
};
use super::models::{AppConfig, PredictorSettings};
use crate::cli::RunArgs;
use crate::error::{CliError, Result};
use cdens::core::models::ids::BasisSetId;
use cdens::engine::config as core_config;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Merges the config file, `--set` overrides and dedicated CLI flags (in
/// increasing precedence) into the pipeline configuration.
pub fn build_config(args: &RunArgs) -> Result<AppConfig> {
    let mut table = load_table(&args.config)?;
    apply_set_values(&mut table, &args.set_values)?;
    let file_config = FileConfig::from_table(table, &args.config)?;
    let base_dir = args
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let features = if args.features.is_empty() {
        file_config
            .features
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|p| resolve_relative(&base_dir, p))
            .collect()
    } else {
        args.features.clone()
    };
    if features.is_empty() {
        return Err(CliError::Config(
            "No feature tables given. Use --features or the `features` list in the config file."
                .to_string(),
        ));
    }

    let predictor = match file_config.predictor.clone() {
        Some(FilePredictorConfig::Command {
            program,
            args,
            working_dir,
        }) => PredictorSettings::Command {
            program,
            args,
            working_dir: working_dir.map(|dir| resolve_relative(&base_dir, dir)),
        },
        Some(FilePredictorConfig::Precomputed { path_template }) => {
            let template = resolve_relative(&base_dir, PathBuf::from(path_template));
            PredictorSettings::Precomputed {
                path_template: template.to_string_lossy().into_owned(),
            }
        }
        None => {
            return Err(CliError::Config(
                "`[predictor]` section is required.".to_string(),
            ));
        }
    };

    let core_config = build_core_config(args, file_config)?;
    debug!(?core_config, "Final pipeline configuration");

    Ok(AppConfig {
        features,
        predictor,
        core_config,
    })
}

fn build_core_config(args: &RunArgs, file: FileConfig) -> Result<core_config::PipelineConfig> {
    let mut builder = core_config::PipelineConfigBuilder::new();

    if let Some(k) = args.num_states.or(file.num_states) {
        builder = builder.num_states(k);
    }
    if let Some(lag) = args.lag_time.or(file.lag_time) {
        builder = builder.lag_time(lag);
    }
    if let Some(seed) = args.seed.or(file.seed) {
        builder = builder.seed(seed);
    }
    if let Some(tolerance) = file.tolerance {
        builder = builder.tolerance(tolerance);
    }

    for configuration in merge_configurations(args, &file)? {
        builder = builder.configuration(configuration);
    }

    if let Some(enc) = file.encoder {
        if let Some(v) = enc.latent_dim {
            builder = builder.latent_dim(v);
        }
        if let Some(v) = enc.regularization {
            builder = builder.regularization(v);
        }
        if let Some(v) = enc.stiffness {
            builder = builder.stiffness(v);
        }
        if let Some(v) = enc.max_iterations {
            builder = builder.max_iterations(v);
        }
        if let Some(v) = enc.convergence_threshold {
            builder = builder.convergence_threshold(v);
        }
        if let Some(v) = enc.restarts {
            builder = builder.restarts(v);
        }
        if let Some(v) = enc.min_state_population {
            builder = builder.min_state_population(v);
        }
    }

    if let Some(transition) = file.transition {
        builder = builder.transition(core_config::TransitionConfig {
            counting: transition.counting.map(Into::into).unwrap_or_default(),
            timescale_lags: transition.timescale_lags.unwrap_or_default(),
        });
    }

    if let Some(sampling) = file.sampling {
        if let Some(n) = sampling.samples_per_state {
            builder = builder.samples_per_state(n);
        }
        if let Some(strategy) = merge_sampling_strategy(&sampling)? {
            builder = builder.sampling_strategy(strategy);
        }
    }

    if let Some(averaging) = file.ensemble.and_then(|e| e.averaging) {
        builder = builder.averaging(averaging.into());
    }

    if let Some(fitting) = file.fitting {
        builder = builder.fitting(merge_fitting(fitting)?);
    }

    if let Some(retry) = file.retry {
        builder = builder.retry(merge_retry(retry)?);
    }

    builder.build().map_err(|e| CliError::Config(e.to_string()))
}

fn merge_configurations(
    args: &RunArgs,
    file: &FileConfig,
) -> Result<Vec<core_config::ModelConfiguration>> {
    if !args.basis_sets.is_empty() {
        return Ok(args
            .basis_sets
            .iter()
            .map(|name| core_config::ModelConfiguration::new(BasisSetId::new(name.as_str())))
            .collect());
    }

    let mut configurations: Vec<core_config::ModelConfiguration> = file
        .basis_sets
        .iter()
        .flatten()
        .map(|name| core_config::ModelConfiguration::new(BasisSetId::new(name.as_str())))
        .collect();
    for entry in file.configurations.iter().flatten() {
        let mut configuration =
            core_config::ModelConfiguration::new(BasisSetId::new(entry.basis_set.as_str()));
        if let Some(window) = window_from_bounds(entry.min_nm, entry.max_nm, "configurations")? {
            configuration = configuration.with_window(window);
        }
        configurations.push(configuration);
    }
    Ok(configurations)
}

fn merge_sampling_strategy(
    sampling: &FileSamplingConfig,
) -> Result<Option<core_config::SamplingStrategy>> {
    let strategy = match sampling.strategy {
        None => None,
        Some(FileSamplingStrategy::Medoid) => Some(core_config::SamplingStrategy::Medoid),
        Some(FileSamplingStrategy::TopProbability) => {
            Some(core_config::SamplingStrategy::TopProbability)
        }
        Some(FileSamplingStrategy::Stratified) => {
            let bins = sampling.bins.ok_or_else(|| {
                CliError::Config("`sampling.strategy = \"stratified\"` requires `bins`".to_string())
            })?;
            Some(core_config::SamplingStrategy::Stratified { bins })
        }
    };
    Ok(strategy)
}

fn merge_fitting(partial: FileFittingConfig) -> Result<core_config::FittingConfig> {
    let defaults = core_config::FittingConfig::default();
    let window = window_from_bounds(partial.min_nm, partial.max_nm, "fitting")?
        .unwrap_or(defaults.window);
    let robustness_windows = partial
        .robustness_windows
        .unwrap_or_default()
        .into_iter()
        .map(|[min_nm, max_nm]| {
            window_from_bounds(Some(min_nm), Some(max_nm), "fitting.robustness-windows")
                .map(|w| w.unwrap_or(core_config::FitWindow::Full))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(core_config::FittingConfig {
        window,
        robustness_windows,
        interpolation: partial.interpolation.unwrap_or(defaults.interpolation),
        metric: partial.metric.map(Into::into).unwrap_or(defaults.metric),
        tie_tolerance: partial.tie_tolerance.unwrap_or(defaults.tie_tolerance),
        cross_validation_folds: partial.cross_validation_folds,
    })
}

fn merge_retry(partial: FileRetryConfig) -> Result<core_config::RetryPolicy> {
    let defaults = core_config::RetryPolicy::default();
    let timeout = match partial.timeout_secs {
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
            CliError::Config(format!("`retry.timeout-secs` must be non-negative, got {}", secs))
        })?,
        None => defaults.timeout,
    };
    Ok(core_config::RetryPolicy {
        max_attempts: partial.max_attempts.unwrap_or(defaults.max_attempts),
        initial_backoff: partial
            .initial_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff),
        backoff_multiplier: partial
            .backoff_multiplier
            .unwrap_or(defaults.backoff_multiplier),
        timeout,
    })
}

fn window_from_bounds(
    min_nm: Option<f64>,
    max_nm: Option<f64>,
    section: &str,
) -> Result<Option<core_config::FitWindow>> {
    match (min_nm, max_nm) {
        (None, None) => Ok(None),
        (Some(min_nm), Some(max_nm)) if min_nm < max_nm => {
            Ok(Some(core_config::FitWindow::Range { min_nm, max_nm }))
        }
        (Some(min_nm), Some(max_nm)) => Err(CliError::Config(format!(
            "Invalid window in `{}`: min-nm ({}) must be below max-nm ({})",
            section, min_nm, max_nm
        ))),
        _ => Err(CliError::Config(format!(
            "`{}` needs both min-nm and max-nm",
            section
        ))),
    }
}

fn resolve_relative(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Applies `KEY=VALUE` overrides to the raw config table. Dotted keys address
/// nested tables; values are read as TOML and fall back to plain strings.
fn apply_set_values(table: &mut toml::Table, set_values: &[String]) -> Result<()> {
    for kv_pair in set_values {
        let (key, value_str) = kv_pair.split_once('=').ok_or_else(|| {
            CliError::Config(format!(
                "Invalid --set format: '{}'. Expected KEY=VALUE.",
                kv_pair
            ))
        })?;
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(CliError::Config(format!(
                "Invalid --set key: '{}'",
                key
            )));
        }
        set_dotted(table, key, parse_value(value_str.trim()))?;
    }
    Ok(())
}

fn parse_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn set_dotted(table: &mut toml::Table, key: &str, value: toml::Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts.pop().unwrap_or(key);
    let mut current = table;
    for part in parts {
        if !current.contains_key(part) {
            current.insert(part.to_string(), toml::Value::Table(toml::Table::new()));
        }
        current = match current.get_mut(part) {
            Some(toml::Value::Table(inner)) => inner,
            _ => {
                return Err(CliError::Config(format!(
                    "Cannot set '{}': '{}' is not a table",
                    key, part
                )));
            }
        };
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}
