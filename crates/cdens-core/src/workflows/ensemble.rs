use crate::core::models::frame::Trajectory;
use crate::core::models::spectrum::ExperimentalSpectrum;
use crate::engine::config::{ModelConfiguration, PipelineConfig};
use crate::engine::cross_validation::{CrossValidation, cross_validation_score};
use crate::engine::encoder::StateEncoder;
use crate::engine::ensemble::{EnsembleSpectrum, build_ensemble};
use crate::engine::error::EngineError;
use crate::engine::prediction::{
    FrameSpectrum, PredictionFailure, SpectrumPredictor, dispatch_predictions,
};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::ranking::{RankedConfiguration, RankingInput, rank_configurations};
use crate::engine::reconcile::{FitResult, fit_spectrum};
use crate::engine::sampling::{StateRepresentatives, select_representatives};
use crate::engine::transition::{self, TimescaleEstimate, TransitionModel};
use tracing::{info, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug)]
pub enum ConfigurationOutcome {
    Succeeded {
        ensemble: EnsembleSpectrum,
        /// Primary window first, then every robustness window that could be fitted.
        fits: Vec<FitResult>,
        cv_score: Option<f64>,
    },
    Failed {
        error: EngineError,
    },
}

impl ConfigurationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConfigurationOutcome::Succeeded { .. })
    }
}

#[derive(Debug)]
pub struct ConfigurationReport {
    pub configuration: ModelConfiguration,
    pub label: String,
    pub outcome: ConfigurationOutcome,
    pub failures: Vec<PredictionFailure>,
    pub warnings: Vec<String>,
}

impl ConfigurationReport {
    /// True when frames were excluded or a robustness window could not be fitted.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty() || !self.warnings.is_empty()
    }
}

#[derive(Debug)]
pub struct PipelineResult {
    pub encoder_score: f64,
    pub feature_singular_values: Vec<f64>,
    pub model: TransitionModel,
    pub timescales: Vec<TimescaleEstimate>,
    pub representatives: Vec<StateRepresentatives>,
    pub configurations: Vec<ConfigurationReport>,
    pub ranking: Vec<RankedConfiguration>,
}

/// Intermediate state of a configuration between prediction and fitting.
struct Predicted {
    configuration: ModelConfiguration,
    label: String,
    spectra: Vec<FrameSpectrum>,
    failures: Vec<PredictionFailure>,
    ensemble: Result<EnsembleSpectrum, EngineError>,
}

/// Runs the whole pipeline: encoding, transition model, representative
/// selection, per-configuration ensembles and fits, and the final ranking.
///
/// Encoder and transition-model failures abort the run. Failures local to a
/// configuration are recorded in its report and the other configurations
/// proceed.
#[instrument(skip_all, name = "ensemble_workflow")]
pub fn run(
    trajectories: &[Trajectory],
    experiment: &ExperimentalSpectrum,
    predictor: &dyn SpectrumPredictor,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<PipelineResult, EngineError> {
    let k = config.num_states();
    info!(
        trajectories = trajectories.len(),
        states = k,
        lag = config.lag_time,
        configurations = config.configurations.len(),
        "Starting ensemble workflow."
    );

    // === Phase 1: State encoding ===
    let (encoder, assignments) = reporter.phase("State Encoding", || {
        let encoder = StateEncoder::fit(trajectories, &config.encoder, config.lag_time, config.seed)?;
        let assignments = encoder.encode_all(trajectories)?;
        Ok::<_, EngineError>((encoder, assignments))
    })?;

    // === Phase 2: Transition model and implied timescales ===
    let (model, timescales) = reporter.phase("Transition Model", || {
        let model = transition::estimate(
            &assignments,
            k,
            config.lag_time,
            config.transition.counting,
            config.tolerance,
        )?;
        let timescales = transition::implied_timescale_scan(
            &assignments,
            k,
            &config.transition.timescale_lags,
            config.transition.counting,
            config.tolerance,
        );
        Ok::<_, EngineError>((model, timescales))
    })?;
    info!(stationary = ?model.stationary_distribution(), "Transition model estimated.");

    // === Phase 3: Representative selection ===
    let representatives = reporter.phase("Representative Sampling", || {
        select_representatives(trajectories, &assignments, k, &config.sampling, config.seed)
    })?;

    // === Phase 4: Per-frame prediction and ensemble averaging ===
    let predicted: Vec<Predicted> = config
        .configurations
        .iter()
        .map(|configuration| {
            predict_configuration(
                configuration,
                trajectories,
                &representatives,
                predictor,
                &model,
                config,
                reporter,
            )
        })
        .collect();

    // === Phase 5: Fitting ===
    let reports = reporter.phase("Fitting", || fit_configurations(predicted, experiment, &model, config));

    // === Phase 6: Ranking ===
    let ranking = reporter.phase("Ranking", || {
        let inputs: Vec<RankingInput> = reports
            .iter()
            .filter_map(|r| match &r.outcome {
                ConfigurationOutcome::Succeeded { fits, cv_score, .. } => Some(RankingInput {
                    label: r.label.clone(),
                    fits: fits.clone(),
                    cv_score: *cv_score,
                }),
                ConfigurationOutcome::Failed { .. } => None,
            })
            .collect();
        rank_configurations(&inputs, config.fitting.metric, config.fitting.tie_tolerance)
    });

    let failed = reports.iter().filter(|r| !r.outcome.is_success()).count();
    if failed > 0 {
        reporter.report(Progress::Message(format!(
            "{} of {} configurations failed",
            failed,
            reports.len()
        )));
    }
    info!(
        ranked = ranking.len(),
        failed,
        "Ensemble workflow complete."
    );

    Ok(PipelineResult {
        encoder_score: encoder.vamp2_score(),
        feature_singular_values: encoder.feature_singular_values().to_vec(),
        model,
        timescales,
        representatives,
        configurations: reports,
        ranking,
    })
}

fn predict_configuration(
    configuration: &ModelConfiguration,
    trajectories: &[Trajectory],
    representatives: &[StateRepresentatives],
    predictor: &dyn SpectrumPredictor,
    model: &TransitionModel,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Predicted {
    let label = configuration.label();
    reporter.report(Progress::PhaseStart {
        name: "Predicting Spectra",
    });
    reporter.report(Progress::StatusUpdate {
        text: format!("Basis set {}", configuration.basis_set),
    });

    let dispatched = dispatch_predictions(
        predictor,
        trajectories,
        representatives,
        &configuration.basis_set,
        &config.retry,
        reporter,
    );
    reporter.report(Progress::PhaseFinish);

    let (spectra, failures, ensemble) = match dispatched {
        Ok(outcome) => {
            let ensemble = if outcome.spectra.is_empty() && !outcome.failures.is_empty() {
                Err(outcome.failures[0].to_engine_error())
            } else {
                build_ensemble(
                    &outcome.spectra,
                    model.stationary_distribution(),
                    config.num_states(),
                    config.averaging,
                    config.tolerance,
                    &label,
                )
            };
            (outcome.spectra, outcome.failures, ensemble)
        }
        Err(e) => (Vec::new(), Vec::new(), Err(e)),
    };

    if let Err(e) = &ensemble {
        warn!(configuration = %label, "Configuration failed: {}", e);
    }
    Predicted {
        configuration: configuration.clone(),
        label,
        spectra,
        failures,
        ensemble,
    }
}

fn fit_configurations(
    predicted: Vec<Predicted>,
    experiment: &ExperimentalSpectrum,
    model: &TransitionModel,
    config: &PipelineConfig,
) -> Vec<ConfigurationReport> {
    if let Some(first) = config.configurations.first() {
        if config.windows_for(first).len() < 2 {
            warn!("Fewer than two distinct fitting windows; ranking robustness cannot be assessed.");
        }
    }

    #[cfg(not(feature = "parallel"))]
    let iterator = predicted.into_iter();

    #[cfg(feature = "parallel")]
    let iterator = predicted.into_par_iter();

    iterator
        .map(|p| fit_configuration(p, experiment, model, config))
        .collect()
}

fn fit_configuration(
    predicted: Predicted,
    experiment: &ExperimentalSpectrum,
    model: &TransitionModel,
    config: &PipelineConfig,
) -> ConfigurationReport {
    let Predicted {
        configuration,
        label,
        spectra,
        failures,
        ensemble,
    } = predicted;
    let mut warnings = Vec::new();
    if !failures.is_empty() {
        warnings.push(format!(
            "{} representative frame(s) excluded after predictor failures",
            failures.len()
        ));
    }

    let outcome = match ensemble {
        Err(error) => ConfigurationOutcome::Failed { error },
        Ok(ensemble) => {
            let windows = config.windows_for(&configuration);
            let interpolation = config.fitting.interpolation;
            match fit_spectrum(&ensemble.spectrum, experiment, windows[0], interpolation, &label) {
                Err(error) => {
                    warn!(configuration = %label, "Primary window fit failed: {}", error);
                    ConfigurationOutcome::Failed { error }
                }
                Ok(primary) => {
                    let mut fits = vec![primary];
                    for &window in &windows[1..] {
                        match fit_spectrum(&ensemble.spectrum, experiment, window, interpolation, &label)
                        {
                            Ok(fit) => fits.push(fit),
                            Err(e) => {
                                warn!(configuration = %label, %window, "Robustness fit failed: {}", e);
                                warnings.push(format!("window {}: {}", window, e));
                            }
                        }
                    }
                    let cv_score = config.fitting.cross_validation_folds.and_then(|folds| {
                        let settings = CrossValidation {
                            stationary: model.stationary_distribution(),
                            num_states: config.num_states(),
                            averaging: config.averaging,
                            window: windows[0],
                            interpolation,
                            tolerance: config.tolerance,
                        };
                        cross_validation_score(&spectra, experiment, &settings, folds, &label)
                    });
                    ConfigurationOutcome::Succeeded {
                        ensemble,
                        fits,
                        cv_score,
                    }
                }
            }
        }
    };

    ConfigurationReport {
        configuration,
        label,
        outcome,
        failures,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::BasisSetId;
    use crate::core::models::spectrum::Spectrum;
    use crate::engine::config::{FitWindow, FittingConfig, PipelineConfigBuilder, RetryPolicy};
    use crate::engine::prediction::{PredictionError, PredictionRequest};
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use std::time::Duration;

    const GRID: [f64; 6] = [190.0, 200.0, 210.0, 220.0, 230.0, 240.0];

    /// Spectrum shape depends on the well a frame sits in; the "broken" basis
    /// set rejects frames of the lower well.
    struct WellPredictor;

    impl SpectrumPredictor for WellPredictor {
        fn predict(&self, request: &PredictionRequest<'_>) -> Result<Spectrum, PredictionError> {
            let upper = request.frame.features()[0] > 0.0;
            if request.basis_set.as_str() == "broken" && !upper {
                return Err(PredictionError::Permanent("SCF did not converge".into()));
            }
            let values: Vec<f64> = GRID
                .iter()
                .map(|w| {
                    let x = (w - 215.0) / 25.0;
                    if upper { x } else { x * x }
                })
                .collect();
            Spectrum::new(GRID.to_vec(), values).map_err(|e| PredictionError::Permanent(e.to_string()))
        }
    }

    fn trajectories() -> Vec<Trajectory> {
        let mut rng = StdRng::seed_from_u64(21);
        (0..2)
            .map(|replica| {
                let rows = (0..300)
                    .map(|t| {
                        let well = if ((t + replica * 15) / 30) % 2 == 0 { 1.5 } else { -1.5 };
                        vec![well + rng.gen_range(-0.1..0.1), rng.gen_range(-0.3..0.3)]
                    })
                    .collect();
                Trajectory::from_features(replica, rows).unwrap()
            })
            .collect()
    }

    fn experiment() -> ExperimentalSpectrum {
        // 3 × (0.5 · upper + 0.5 · lower) + 0.2
        let values = GRID
            .iter()
            .map(|w| {
                let x = (w - 215.0) / 25.0;
                3.0 * (0.5 * x + 0.5 * x * x) + 0.2
            })
            .collect();
        ExperimentalSpectrum::without_uncertainties(Spectrum::new(GRID.to_vec(), values).unwrap())
    }

    fn config() -> PipelineConfig {
        PipelineConfigBuilder::new()
            .num_states(2)
            .lag_time(1)
            .basis_set(BasisSetId::from("good"))
            .basis_set(BasisSetId::from("broken"))
            .samples_per_state(3)
            .retry(RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::ZERO,
                ..RetryPolicy::default()
            })
            .fitting(FittingConfig {
                robustness_windows: vec![FitWindow::Range {
                    min_nm: 200.0,
                    max_nm: 240.0,
                }],
                cross_validation_folds: Some(3),
                ..FittingConfig::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn failing_configuration_does_not_stop_its_siblings() {
        let result = run(
            &trajectories(),
            &experiment(),
            &WellPredictor,
            &config(),
            &ProgressReporter::new(),
        )
        .unwrap();

        let pi = result.model.stationary_distribution();
        assert!((pi.iter().sum::<f64>() - 1.0).abs() < 1e-10);
        assert!(pi.iter().all(|&p| p > 0.3 && p < 0.7));
        assert_eq!(result.representatives.len(), 2);

        let good = &result.configurations[0];
        let broken = &result.configurations[1];
        assert!(good.outcome.is_success());
        assert!(matches!(
            broken.outcome,
            ConfigurationOutcome::Failed {
                error: EngineError::EmptyStateAssignment { .. }
            }
        ));
        assert!(broken.is_degraded());
        assert_eq!(broken.failures.len(), 3);

        match &good.outcome {
            ConfigurationOutcome::Succeeded { fits, cv_score, .. } => {
                assert_eq!(fits.len(), 2);
                assert!(fits[0].metrics.r_squared > 0.9);
                assert!(cv_score.is_some());
            }
            ConfigurationOutcome::Failed { error } => panic!("unexpected failure: {}", error),
        }

        assert_eq!(result.ranking.len(), 1);
        assert_eq!(result.ranking[0].label, "good");
    }

    #[test]
    fn run_is_reproducible_for_a_seed() {
        let trajs = trajectories();
        let a = run(&trajs, &experiment(), &WellPredictor, &config(), &ProgressReporter::new())
            .unwrap();
        let b = run(&trajs, &experiment(), &WellPredictor, &config(), &ProgressReporter::new())
            .unwrap();
        assert_eq!(a.representatives, b.representatives);
        assert_eq!(a.ranking[0].label, b.ranking[0].label);
    }
}
