use super::config::{FitWindow, RankingMetric};
use super::reconcile::FitResult;
use crate::core::spectral::regression::FitMetrics;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, instrument};

/// Fits of one configuration: the primary window first, then every
/// robustness window that could be fitted.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingInput {
    pub label: String,
    pub fits: Vec<FitResult>,
    pub cv_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedConfiguration {
    pub rank: usize,
    pub label: String,
    pub primary_window: FitWindow,
    pub primary_metric: f64,
    /// Windows in which this configuration's rank differs from its primary rank.
    pub rank_changes: usize,
    pub windows: usize,
    pub cv_score: Option<f64>,
    pub window_variance: f64,
}

pub fn metric_value(metrics: &FitMetrics, metric: RankingMetric) -> f64 {
    match metric {
        RankingMetric::Rmse => metrics.rmse,
        RankingMetric::ChiSquared => metrics.chi_squared,
        RankingMetric::RSquared => metrics.r_squared,
    }
}

/// Metric oriented so that lower is better.
fn loss(metrics: &FitMetrics, metric: RankingMetric) -> f64 {
    match metric {
        RankingMetric::RSquared => -metrics.r_squared,
        _ => metric_value(metrics, metric),
    }
}

fn compare_with_tolerance(a: f64, b: f64, tolerance: f64) -> Ordering {
    if (a - b).abs() <= tolerance {
        Ordering::Equal
    } else {
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    }
}

fn population_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// 1 + number of entries strictly better than `value` by more than `tolerance`.
fn rank_among(value: f64, all: &[f64], tolerance: f64) -> usize {
    1 + all.iter().filter(|&&other| other < value - tolerance).count()
}

struct Scored<'a> {
    input: &'a RankingInput,
    primary_loss: f64,
    rank_changes: usize,
    window_variance: f64,
}

/// Orders configurations by primary metric, robustness across windows,
/// cross-validation score, window-to-window variance and finally label.
///
/// Only the primary window's metric is compared directly; the other windows
/// contribute through rank consistency and variance.
#[instrument(skip_all, name = "rank_configurations", fields(configurations = inputs.len(), metric = ?metric))]
pub fn rank_configurations(
    inputs: &[RankingInput],
    metric: RankingMetric,
    tie_tolerance: f64,
) -> Vec<RankedConfiguration> {
    let candidates: Vec<&RankingInput> = inputs.iter().filter(|i| !i.fits.is_empty()).collect();

    let primary_losses: Vec<f64> = candidates
        .iter()
        .map(|c| loss(&c.fits[0].metrics, metric))
        .collect();

    let scored: Vec<Scored> = candidates
        .iter()
        .zip(&primary_losses)
        .map(|(&input, &primary_loss)| {
            let primary_rank = rank_among(primary_loss, &primary_losses, tie_tolerance);
            let rank_changes = input.fits[1..]
                .iter()
                .filter(|fit| {
                    let peers: Vec<f64> = candidates
                        .iter()
                        .filter_map(|c| c.fits.iter().find(|f| f.window == fit.window))
                        .map(|f| loss(&f.metrics, metric))
                        .collect();
                    rank_among(loss(&fit.metrics, metric), &peers, tie_tolerance) != primary_rank
                })
                .count();
            let values: Vec<f64> = input
                .fits
                .iter()
                .map(|f| metric_value(&f.metrics, metric))
                .collect();
            Scored {
                input,
                primary_loss,
                rank_changes,
                window_variance: population_variance(&values),
            }
        })
        .collect();

    let compare = |a: &Scored, b: &Scored| -> Ordering {
        compare_with_tolerance(a.primary_loss, b.primary_loss, tie_tolerance)
            .then(a.rank_changes.cmp(&b.rank_changes))
            .then_with(|| match (a.input.cv_score, b.input.cv_score) {
                (Some(x), Some(y)) => compare_with_tolerance(x, y, tie_tolerance),
                _ => Ordering::Equal,
            })
            .then_with(|| {
                a.window_variance
                    .partial_cmp(&b.window_variance)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.input.label.cmp(&b.input.label))
    };

    // Tolerance comparisons are not transitive, so pick the best remaining
    // entry each round instead of sorting.
    let mut remaining: Vec<&Scored> = scored.iter().collect();
    let mut ranked = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let mut best = 0;
        for i in 1..remaining.len() {
            if compare(remaining[i], remaining[best]) == Ordering::Less {
                best = i;
            }
        }
        let s = remaining.remove(best);
        let primary = &s.input.fits[0];
        ranked.push(RankedConfiguration {
            rank: ranked.len() + 1,
            label: s.input.label.clone(),
            primary_window: primary.window,
            primary_metric: metric_value(&primary.metrics, metric),
            rank_changes: s.rank_changes,
            windows: s.input.fits.len(),
            cv_score: s.input.cv_score,
            window_variance: s.window_variance,
        });
    }
    debug!(order = ?ranked.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(), "Ranked configurations");
    ranked
}
