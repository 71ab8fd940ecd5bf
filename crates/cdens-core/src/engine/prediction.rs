use super::config::RetryPolicy;
use super::error::EngineError;
use super::progress::{Progress, ProgressReporter};
use super::sampling::StateRepresentatives;
use crate::core::models::frame::{Frame, Trajectory};
use crate::core::models::ids::{BasisSetId, FrameId};
use crate::core::models::spectrum::Spectrum;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// One call to the external spectrum predictor.
#[derive(Debug, Clone)]
pub struct PredictionRequest<'a> {
    pub frame: &'a Frame,
    pub basis_set: &'a BasisSetId,
    /// Upper bound on the call's wall time; enforcing it is up to the predictor.
    pub timeout: Duration,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictionError {
    /// Worth retrying: timeouts, crashed workers, busy resources.
    #[error("transient predictor failure: {0}")]
    Transient(String),
    #[error("permanent predictor failure: {0}")]
    Permanent(String),
}

/// Per-frame CD prediction for one basis set.
pub trait SpectrumPredictor: Sync {
    fn predict(&self, request: &PredictionRequest<'_>) -> Result<Spectrum, PredictionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// A frame excluded from an ensemble because its prediction failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionFailure {
    pub frame: FrameId,
    pub state: usize,
    pub basis_set: BasisSetId,
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

impl PredictionFailure {
    pub fn to_engine_error(&self) -> EngineError {
        EngineError::ExternalPredictor {
            frame: self.frame,
            basis_set: self.basis_set.clone(),
            message: self.message.clone(),
        }
    }
}

/// Predicted spectrum of one representative frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSpectrum {
    pub frame: FrameId,
    pub state: usize,
    pub membership: f64,
    pub spectrum: Spectrum,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionOutcome {
    pub spectra: Vec<FrameSpectrum>,
    pub failures: Vec<PredictionFailure>,
}

impl PredictionOutcome {
    /// True when at least one representative had to be excluded.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Calls the predictor, retrying transient failures with exponential backoff.
///
/// Returns the spectrum, or the last error together with the number of
/// attempts made.
pub fn predict_with_retry(
    predictor: &dyn SpectrumPredictor,
    request: &PredictionRequest<'_>,
    policy: &RetryPolicy,
) -> Result<Spectrum, (PredictionError, u32)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match predictor.predict(request) {
            Ok(spectrum) => return Ok(spectrum),
            Err(err @ PredictionError::Permanent(_)) => return Err((err, attempt)),
            Err(err @ PredictionError::Transient(_)) => {
                if attempt >= policy.max_attempts {
                    return Err((err, attempt));
                }
                let delay = policy.backoff_for(attempt);
                debug!(
                    frame = %request.frame.id,
                    attempt,
                    ?delay,
                    "Transient predictor failure, retrying: {}",
                    err
                );
                std::thread::sleep(delay);
            }
        }
    }
}

/// Predicts a spectrum for every representative frame with one basis set.
///
/// Failed frames are excluded and recorded; the caller decides whether the
/// remaining spectra still cover every state.
#[instrument(skip_all, name = "prediction_dispatch", fields(basis_set = %basis_set))]
pub fn dispatch_predictions(
    predictor: &dyn SpectrumPredictor,
    trajectories: &[Trajectory],
    representatives: &[StateRepresentatives],
    basis_set: &BasisSetId,
    policy: &RetryPolicy,
    reporter: &ProgressReporter,
) -> Result<PredictionOutcome, EngineError> {
    let by_replica: HashMap<usize, &Trajectory> =
        trajectories.iter().map(|t| (t.replica(), t)).collect();

    let mut jobs = Vec::new();
    for reps in representatives {
        for rep in &reps.frames {
            let frame = by_replica
                .get(&rep.frame.replica)
                .and_then(|t| t.frames().get(rep.frame.time))
                .ok_or_else(|| {
                    EngineError::InvalidInput(format!("{} is not part of any trajectory", rep.frame))
                })?;
            jobs.push((reps.state, rep.membership, frame));
        }
    }

    reporter.report(Progress::TaskStart {
        total_steps: jobs.len() as u64,
    });

    #[cfg(not(feature = "parallel"))]
    let iterator = jobs.iter();

    #[cfg(feature = "parallel")]
    let iterator = jobs.par_iter();

    let results: Vec<Result<FrameSpectrum, PredictionFailure>> = iterator
        .map(|&(state, membership, frame)| {
            let request = PredictionRequest {
                frame,
                basis_set,
                timeout: policy.timeout,
            };
            let result = predict_with_retry(predictor, &request, policy)
                .map(|spectrum| FrameSpectrum {
                    frame: frame.id,
                    state,
                    membership,
                    spectrum,
                })
                .map_err(|(err, attempts)| {
                    let (kind, message) = match err {
                        PredictionError::Transient(m) => (FailureKind::Transient, m),
                        PredictionError::Permanent(m) => (FailureKind::Permanent, m),
                    };
                    warn!(
                        frame = %frame.id,
                        state,
                        attempts,
                        "Excluding frame after {:?} predictor failure: {}",
                        kind,
                        message
                    );
                    PredictionFailure {
                        frame: frame.id,
                        state,
                        basis_set: basis_set.clone(),
                        kind,
                        attempts,
                        message,
                    }
                });
            reporter.report(Progress::TaskIncrement);
            result
        })
        .collect();
    reporter.report(Progress::TaskFinish);

    let mut outcome = PredictionOutcome::default();
    for result in results {
        match result {
            Ok(spectrum) => outcome.spectra.push(spectrum),
            Err(failure) => outcome.failures.push(failure),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sampling::Representative;
    use std::sync::Mutex;

    /// Fails transiently for the first `failures` calls of every frame.
    struct FlakyPredictor {
        failures: u32,
        calls: Mutex<HashMap<FrameId, u32>>,
    }

    impl SpectrumPredictor for FlakyPredictor {
        fn predict(&self, request: &PredictionRequest<'_>) -> Result<Spectrum, PredictionError> {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(request.frame.id).or_insert(0);
            *count += 1;
            if *count <= self.failures {
                return Err(PredictionError::Transient("busy".into()));
            }
            let value = request.frame.features()[0];
            Ok(Spectrum::constant(&[200.0, 210.0], value).unwrap())
        }
    }

    struct RejectingPredictor {
        calls: Mutex<u32>,
    }

    impl SpectrumPredictor for RejectingPredictor {
        fn predict(&self, _: &PredictionRequest<'_>) -> Result<Spectrum, PredictionError> {
            *self.calls.lock().unwrap() += 1;
            Err(PredictionError::Permanent("unsupported basis".into()))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    fn setup() -> (Vec<Trajectory>, Vec<StateRepresentatives>) {
        let traj = Trajectory::from_features(0, vec![vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let reps = vec![
            StateRepresentatives {
                state: 0,
                frames: vec![Representative {
                    frame: FrameId::new(0, 0),
                    membership: 0.9,
                }],
            },
            StateRepresentatives {
                state: 1,
                frames: vec![Representative {
                    frame: FrameId::new(0, 2),
                    membership: 0.7,
                }],
            },
        ];
        (vec![traj], reps)
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let (trajs, reps) = setup();
        let predictor = FlakyPredictor {
            failures: 2,
            calls: Mutex::new(HashMap::new()),
        };
        let outcome = dispatch_predictions(
            &predictor,
            &trajs,
            &reps,
            &BasisSetId::from("b"),
            &fast_policy(3),
            &ProgressReporter::new(),
        )
        .unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.spectra.len(), 2);
        let state1 = outcome.spectra.iter().find(|s| s.state == 1).unwrap();
        assert_eq!(state1.spectrum.values(), &[3.0, 3.0]);
        assert_eq!(predictor.calls.lock().unwrap()[&FrameId::new(0, 0)], 3);
    }

    #[test]
    fn exhausted_retries_exclude_the_frame() {
        let (trajs, reps) = setup();
        let predictor = FlakyPredictor {
            failures: 5,
            calls: Mutex::new(HashMap::new()),
        };
        let outcome = dispatch_predictions(
            &predictor,
            &trajs,
            &reps,
            &BasisSetId::from("b"),
            &fast_policy(2),
            &ProgressReporter::new(),
        )
        .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(|f| f.kind == FailureKind::Transient && f.attempts == 2));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let (trajs, reps) = setup();
        let predictor = RejectingPredictor {
            calls: Mutex::new(0),
        };
        let outcome = dispatch_predictions(
            &predictor,
            &trajs,
            &reps,
            &BasisSetId::from("b"),
            &fast_policy(4),
            &ProgressReporter::new(),
        )
        .unwrap();
        assert_eq!(*predictor.calls.lock().unwrap(), 2);
        assert!(outcome.spectra.is_empty());
        assert_eq!(outcome.failures[0].kind, FailureKind::Permanent);
        assert!(matches!(
            outcome.failures[0].to_engine_error(),
            EngineError::ExternalPredictor { .. }
        ));
    }

    #[test]
    fn unknown_frames_are_rejected() {
        let (trajs, mut reps) = setup();
        reps[0].frames[0].frame = FrameId::new(3, 0);
        let predictor = RejectingPredictor {
            calls: Mutex::new(0),
        };
        let result = dispatch_predictions(
            &predictor,
            &trajs,
            &reps,
            &BasisSetId::from("b"),
            &fast_policy(1),
            &ProgressReporter::new(),
        );
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }
}
