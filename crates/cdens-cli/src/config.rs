//! Run configuration: a kebab-case TOML file, `--set KEY=VALUE` overrides and
//! dedicated CLI flags merged into one [`AppConfig`].

mod builder;
mod file;
mod models;

pub use builder::build_config;
pub use models::{AppConfig, PredictorSettings};
