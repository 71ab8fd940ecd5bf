use cdens::engine::config as core_config;
use std::path::PathBuf;

/// Which [`SpectrumPredictor`](cdens::engine::prediction::SpectrumPredictor)
/// the `run` command hands to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictorSettings {
    Command {
        program: String,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    },
    Precomputed {
        path_template: String,
    },
}

pub struct AppConfig {
    pub features: Vec<PathBuf>,
    pub predictor: PredictorSettings,
    pub core_config: core_config::PipelineConfig,
}
