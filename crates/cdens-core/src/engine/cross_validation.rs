use super::config::{FitWindow, StateAveraging};
use super::ensemble::build_ensemble;
use super::prediction::FrameSpectrum;
use super::reconcile::{fit_spectrum, reconcile};
use crate::core::models::spectrum::ExperimentalSpectrum;
use crate::core::spectral::interpolation::Interpolation;
use tracing::{debug, instrument};

/// Settings shared by every fold of one configuration.
#[derive(Debug, Clone, Copy)]
pub struct CrossValidation<'a> {
    pub stationary: &'a [f64],
    pub num_states: usize,
    pub averaging: StateAveraging,
    pub window: FitWindow,
    pub interpolation: Interpolation,
    pub tolerance: f64,
}

/// Held-out RMSE averaged over `folds` folds of representative frames.
///
/// Representatives of each state are dealt round-robin into folds. A fold's
/// affine parameters come from the ensemble of the remaining frames and are
/// scored on the ensemble of the held-out ones. `None` when no fold could be
/// evaluated.
#[instrument(skip_all, name = "cross_validation", fields(configuration = configuration, folds = folds))]
pub fn cross_validation_score(
    spectra: &[FrameSpectrum],
    experiment: &ExperimentalSpectrum,
    settings: &CrossValidation<'_>,
    folds: usize,
    configuration: &str,
) -> Option<f64> {
    if folds < 2 {
        return None;
    }
    let mut by_state: Vec<Vec<&FrameSpectrum>> = vec![Vec::new(); settings.num_states];
    for s in spectra {
        by_state.get_mut(s.state)?.push(s);
    }
    for group in &mut by_state {
        group.sort_by_key(|s| s.frame);
    }

    let mut scores = Vec::with_capacity(folds);
    for fold in 0..folds {
        let mut training = Vec::new();
        let mut held_out = Vec::new();
        for group in &by_state {
            let (test, train): (Vec<_>, Vec<_>) = group
                .iter()
                .enumerate()
                .partition(|(i, _)| i % folds == fold);
            let test: Vec<FrameSpectrum> = test.into_iter().map(|(_, s)| (*s).clone()).collect();
            let train: Vec<FrameSpectrum> = train.into_iter().map(|(_, s)| (*s).clone()).collect();
            match (train.is_empty(), test.is_empty()) {
                (true, _) => {
                    training.extend(test.iter().cloned());
                    held_out.extend(test);
                }
                (false, true) => {
                    held_out.extend(train.iter().cloned());
                    training.extend(train);
                }
                (false, false) => {
                    training.extend(train);
                    held_out.extend(test);
                }
            }
        }

        match score_fold(&training, &held_out, experiment, settings, configuration) {
            Some(score) => scores.push(score),
            None => debug!(fold, "Cross-validation fold could not be evaluated"),
        }
    }

    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

fn score_fold(
    training: &[FrameSpectrum],
    held_out: &[FrameSpectrum],
    experiment: &ExperimentalSpectrum,
    settings: &CrossValidation<'_>,
    configuration: &str,
) -> Option<f64> {
    let build = |spectra: &[FrameSpectrum]| {
        build_ensemble(
            spectra,
            settings.stationary,
            settings.num_states,
            settings.averaging,
            settings.tolerance,
            configuration,
        )
        .ok()
    };
    let train_ensemble = build(training)?;
    let held_ensemble = build(held_out)?;

    let fit = fit_spectrum(
        &train_ensemble.spectrum,
        experiment,
        settings.window,
        settings.interpolation,
        configuration,
    )
    .ok()?;
    let grid = reconcile(
        &held_ensemble.spectrum,
        experiment,
        settings.window,
        settings.interpolation,
        configuration,
    )
    .ok()?;
    if grid.is_empty() {
        return None;
    }
    let sse: f64 = grid
        .theory
        .iter()
        .zip(&grid.experiment)
        .map(|(&t, &e)| (fit.fit.apply(t) - e).powi(2))
        .sum();
    Some((sse / grid.len() as f64).sqrt())
}
