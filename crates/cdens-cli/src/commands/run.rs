use crate::cli::RunArgs;
use crate::config;
use crate::error::{CliError, Result};
use crate::output;
use crate::predictors;
use crate::ui::{CliProgressHandler, UiEvent};
use cdens::core::io::dat::ExperimentalDatFile;
use cdens::core::io::features::read_feature_table;
use cdens::core::io::traits::SpectrumFile;
use cdens::core::models::frame::Trajectory;
use cdens::engine::config::RankingMetric;
use cdens::engine::progress::ProgressReporter;
use cdens::workflows::{self, ensemble::ConfigurationOutcome, ensemble::PipelineResult};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run(args: RunArgs, ui_sender: mpsc::Sender<UiEvent>) -> Result<()> {
    info!("Merging configuration from file and CLI arguments...");
    let app_config = config::build_config(&args)?;

    info!("Loading experimental spectrum from {:?}", &args.experiment);
    let experiment = ExperimentalDatFile::read_from_path(&args.experiment).map_err(|e| {
        CliError::FileParsing {
            path: args.experiment.clone(),
            source: e.into(),
        }
    })?;

    let trajectories = load_trajectories(&app_config.features)?;
    std::fs::create_dir_all(&args.output)?;
    let predictor =
        predictors::from_settings(&app_config.predictor, &args.output, Handle::current())?;

    let progress_handler = CliProgressHandler::new(ui_sender);
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    info!("Invoking the core ensemble workflow...");
    let result = tokio::task::block_in_place(|| {
        workflows::ensemble::run(
            &trajectories,
            &experiment,
            predictor.as_ref(),
            &app_config.core_config,
            &reporter,
        )
    })?;

    let written = output::write_artifacts(&args.output, &result)?;
    for path in &written {
        info!("Wrote {}", path.display());
    }

    print!(
        "{}",
        format_summary(&result, app_config.core_config.fitting.metric)
    );
    println!("Artifacts written to: {}", args.output.display());

    if result.ranking.is_empty() {
        warn!("No configuration could be ranked.");
        return Err(CliError::Other(anyhow::anyhow!(
            "Every model configuration failed; see {} for details.",
            args.output.join(output::REPORT_FILE).display()
        )));
    }
    Ok(())
}

/// Replica index = position in `paths`.
fn load_trajectories(paths: &[PathBuf]) -> Result<Vec<Trajectory>> {
    paths
        .iter()
        .enumerate()
        .map(|(replica, path)| {
            info!(replica, "Loading feature table {:?}", path);
            read_feature_table(path, replica).map_err(|e| CliError::FileParsing {
                path: path.clone(),
                source: e.into(),
            })
        })
        .collect()
}

fn metric_name(metric: RankingMetric) -> &'static str {
    match metric {
        RankingMetric::Rmse => "RMSE",
        RankingMetric::ChiSquared => "chi^2",
        RankingMetric::RSquared => "R^2",
    }
}

fn format_summary(result: &PipelineResult, metric: RankingMetric) -> String {
    let mut out = String::new();
    let pi: Vec<String> = result
        .model
        .stationary_distribution()
        .iter()
        .map(|p| format!("{:.3}", p))
        .collect();
    let _ = writeln!(
        out,
        "✓ {} states, VAMP-2 score {:.3}, stationary distribution [{}]",
        result.model.num_states(),
        result.encoder_score,
        pi.join(", ")
    );

    if !result.ranking.is_empty() {
        let _ = writeln!(
            out,
            "\n{:>4}  {:<28} {:>12} {:>8} {:>8} {:>12}",
            "rank",
            "configuration",
            metric_name(metric),
            "changes",
            "windows",
            "cv"
        );
        for r in &result.ranking {
            let cv = r
                .cv_score
                .map(|v| format!("{:.4e}", v))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:>4}  {:<28} {:>12.4e} {:>8} {:>8} {:>12}",
                r.rank, r.label, r.primary_metric, r.rank_changes, r.windows, cv
            );
        }
    }

    for report in &result.configurations {
        match &report.outcome {
            ConfigurationOutcome::Failed { error } => {
                let _ = writeln!(out, "✗ {} failed: {}", report.label, error);
            }
            ConfigurationOutcome::Succeeded { .. } if report.is_degraded() => {
                let _ = writeln!(
                    out,
                    "! {} is degraded: {}",
                    report.label,
                    report.warnings.join("; ")
                );
            }
            ConfigurationOutcome::Succeeded { .. } => {}
        }
    }
    out
}
