use crate::cli::FitArgs;
use crate::error::{CliError, Result};
use cdens::core::io::dat::{ExperimentalDatFile, SpectrumDatFile};
use cdens::core::io::traits::SpectrumFile;
use cdens::engine::config::FitWindow;
use cdens::engine::reconcile::FitResult;
use cdens::workflows;
use std::path::Path;
use tracing::info;

fn read_file<F: SpectrumFile>(path: &Path) -> Result<F::Data>
where
    F::Error: Send + Sync + 'static,
{
    info!("Loading spectrum from {:?}", path);
    F::read_from_path(path).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn window_from_args(args: &FitArgs) -> Result<FitWindow> {
    match (args.min_nm, args.max_nm) {
        (Some(min_nm), Some(max_nm)) if min_nm < max_nm => Ok(FitWindow::Range { min_nm, max_nm }),
        (Some(min_nm), Some(max_nm)) => Err(CliError::Argument(format!(
            "--min-nm ({}) must be below --max-nm ({})",
            min_nm, max_nm
        ))),
        _ => Ok(FitWindow::Full),
    }
}

pub async fn run(args: FitArgs) -> Result<()> {
    let window = window_from_args(&args)?;
    let theory = read_file::<SpectrumDatFile>(&args.theory)?;
    let experiment = read_file::<ExperimentalDatFile>(&args.experiment)?;

    let result = workflows::fit::run(&theory, &experiment, window, args.interpolation.into())?;
    print!("{}", format_fit(&result));
    Ok(())
}

fn format_fit(result: &FitResult) -> String {
    format!(
        "✓ Fitted {} points in window {} ({:.1}-{:.1} nm)\n  \
         scale a  = {:.6e}\n  \
         offset b = {:.6e}\n  \
         RMSE     = {:.6e}\n  \
         chi^2    = {:.6e}\n  \
         R^2      = {:.6}\n",
        result.metrics.points,
        result.window,
        result.range.min_nm,
        result.range.max_nm,
        result.fit.scale,
        result.fit.offset,
        result.metrics.rmse,
        result.metrics.chi_squared,
        result.metrics.r_squared
    )
}
