use crate::config::PredictorSettings;
use crate::error::{CliError, Result};
use crate::output::file_safe;
use cdens::core::io::dat::SpectrumDatFile;
use cdens::core::io::traits::SpectrumFile;
use cdens::core::models::spectrum::Spectrum;
use cdens::engine::prediction::{PredictionError, PredictionRequest, SpectrumPredictor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// Substitutes `{replica}`, `{frame}`, `{basis}` and, when given, `{output}`.
fn render_template(template: &str, request: &PredictionRequest<'_>, output: Option<&Path>) -> String {
    let mut rendered = template
        .replace("{replica}", &request.frame.id.replica.to_string())
        .replace("{frame}", &request.frame.id.time.to_string())
        .replace("{basis}", request.basis_set.as_str());
    if let Some(output) = output {
        rendered = rendered.replace("{output}", &output.to_string_lossy());
    }
    rendered
}

fn read_spectrum(path: &Path) -> std::result::Result<Spectrum, PredictionError> {
    SpectrumDatFile::read_from_path(path).map_err(|e| {
        PredictionError::Permanent(format!("cannot read spectrum '{}': {}", path.display(), e))
    })
}

/// Runs an external program once per frame and basis set. The program writes
/// its spectrum to the `{output}` path.
///
/// A non-zero exit or an expired timeout is transient; a program that cannot
/// be started or leaves no readable spectrum behind is permanent.
pub struct CommandPredictor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    scratch_dir: PathBuf,
    runtime: Handle,
}

impl CommandPredictor {
    pub fn new(
        program: String,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
        scratch_dir: PathBuf,
        runtime: Handle,
    ) -> Self {
        Self {
            program,
            args,
            working_dir,
            scratch_dir,
            runtime,
        }
    }

    fn output_path(&self, request: &PredictionRequest<'_>) -> PathBuf {
        self.scratch_dir.join(format!(
            "{}_r{}_t{}.dat",
            file_safe(request.basis_set.as_str()),
            request.frame.id.replica,
            request.frame.id.time
        ))
    }

    async fn execute(
        &self,
        request: &PredictionRequest<'_>,
        output: &Path,
    ) -> std::result::Result<(), PredictionError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| render_template(arg, request, Some(output)))
            .collect();
        trace!(program = %self.program, ?args, "Spawning predictor");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let result = tokio::time::timeout(request.timeout, command.output()).await;
        match result {
            Err(_) => Err(PredictionError::Transient(format!(
                "'{}' timed out after {:.1}s",
                self.program,
                request.timeout.as_secs_f64()
            ))),
            Ok(Err(e)) => Err(PredictionError::Permanent(format!(
                "failed to start '{}': {}",
                self.program, e
            ))),
            Ok(Ok(out)) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let detail = stderr.lines().last().unwrap_or("").trim().to_string();
                Err(PredictionError::Transient(format!(
                    "'{}' exited with {}{}",
                    self.program,
                    out.status,
                    if detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", detail)
                    }
                )))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

impl SpectrumPredictor for CommandPredictor {
    fn predict(&self, request: &PredictionRequest<'_>) -> std::result::Result<Spectrum, PredictionError> {
        let output = self.output_path(request);
        // A stale file from an earlier attempt must not pass for this one.
        if output.exists() {
            std::fs::remove_file(&output).map_err(|e| {
                PredictionError::Transient(format!("cannot clear '{}': {}", output.display(), e))
            })?;
        }
        self.runtime.block_on(self.execute(request, &output))?;
        let spectrum = read_spectrum(&output)?;
        debug!(frame = %request.frame.id, basis = %request.basis_set, points = spectrum.len(), "Predicted spectrum");
        Ok(spectrum)
    }
}

/// Reads spectra computed ahead of time from files named by a path template.
pub struct PrecomputedPredictor {
    path_template: String,
}

impl PrecomputedPredictor {
    pub fn new(path_template: String) -> Self {
        Self { path_template }
    }
}

impl SpectrumPredictor for PrecomputedPredictor {
    fn predict(&self, request: &PredictionRequest<'_>) -> std::result::Result<Spectrum, PredictionError> {
        let path = PathBuf::from(render_template(&self.path_template, request, None));
        if !path.is_file() {
            return Err(PredictionError::Permanent(format!(
                "no precomputed spectrum at '{}'",
                path.display()
            )));
        }
        read_spectrum(&path)
    }
}

/// Builds the predictor named in the configuration. Command outputs land in
/// `<output_dir>/predictions`.
pub fn from_settings(
    settings: &PredictorSettings,
    output_dir: &Path,
    runtime: Handle,
) -> Result<Box<dyn SpectrumPredictor>> {
    match settings {
        PredictorSettings::Command {
            program,
            args,
            working_dir,
        } => {
            if !args.iter().any(|a| a.contains("{output}")) {
                return Err(CliError::Config(
                    "The command predictor's `args` must contain an `{output}` placeholder."
                        .to_string(),
                ));
            }
            let scratch_dir = output_dir.join("predictions");
            std::fs::create_dir_all(&scratch_dir)?;
            Ok(Box::new(CommandPredictor::new(
                program.clone(),
                args.clone(),
                working_dir.clone(),
                scratch_dir,
                runtime,
            )))
        }
        PredictorSettings::Precomputed { path_template } => {
            Ok(Box::new(PrecomputedPredictor::new(path_template.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdens::core::models::frame::Frame;
    use cdens::core::models::ids::{BasisSetId, FrameId};
    use std::fs;
    use std::time::Duration;

    fn request<'a>(frame: &'a Frame, basis: &'a BasisSetId, timeout: Duration) -> PredictionRequest<'a> {
        PredictionRequest {
            frame,
            basis_set: basis,
            timeout,
        }
    }

    #[test]
    fn templates_substitute_frame_coordinates() {
        let frame = Frame::new(FrameId::new(2, 17), vec![0.0]);
        let basis = BasisSetId::new("def2-SVP");
        let req = request(&frame, &basis, Duration::from_secs(1));
        assert_eq!(
            render_template("{basis}/{replica}_{frame}.dat", &req, None),
            "def2-SVP/2_17.dat"
        );
        assert_eq!(
            render_template("--out={output}", &req, Some(Path::new("/tmp/x.dat"))),
            "--out=/tmp/x.dat"
        );
        assert_eq!(render_template("{output}", &req, None), "{output}");
    }

    #[test]
    fn precomputed_predictor_reads_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svp_0_3.dat"), "200 1.5\n210 -0.5\n").unwrap();
        let template = dir.path().join("{basis}_{replica}_{frame}.dat");
        let predictor = PrecomputedPredictor::new(template.to_string_lossy().into_owned());
        let basis = BasisSetId::new("svp");

        let present = Frame::new(FrameId::new(0, 3), vec![0.0]);
        let spectrum = predictor
            .predict(&request(&present, &basis, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(spectrum.values(), &[1.5, -0.5]);

        let missing = Frame::new(FrameId::new(0, 4), vec![0.0]);
        assert!(matches!(
            predictor.predict(&request(&missing, &basis, Duration::from_secs(1))),
            Err(PredictionError::Permanent(_))
        ));
    }

    #[test]
    fn malformed_precomputed_file_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.dat"), "200 abc\n").unwrap();
        let predictor =
            PrecomputedPredictor::new(dir.path().join("bad.dat").to_string_lossy().into_owned());
        let frame = Frame::new(FrameId::new(0, 0), vec![0.0]);
        let basis = BasisSetId::new("svp");
        assert!(matches!(
            predictor.predict(&request(&frame, &basis, Duration::from_secs(1))),
            Err(PredictionError::Permanent(_))
        ));
    }

    #[test]
    fn command_predictor_requires_output_placeholder() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let settings = PredictorSettings::Command {
            program: "predict".to_string(),
            args: vec!["{frame}".to_string()],
            working_dir: None,
        };
        assert!(matches!(
            from_settings(&settings, dir.path(), rt.handle().clone()),
            Err(CliError::Config(_))
        ));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn shell_predictor(script: &str, scratch: &Path, rt: &tokio::runtime::Runtime) -> CommandPredictor {
            CommandPredictor::new(
                "sh".to_string(),
                vec!["-c".to_string(), script.to_string()],
                None,
                scratch.to_path_buf(),
                rt.handle().clone(),
            )
        }

        #[test]
        fn successful_command_output_is_parsed() {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let predictor = shell_predictor(
                "printf '200 {frame}\\n210 {replica}\\n' > {output}",
                dir.path(),
                &rt,
            );
            let frame = Frame::new(FrameId::new(1, 5), vec![0.0]);
            let basis = BasisSetId::new("svp");
            let spectrum = predictor
                .predict(&request(&frame, &basis, Duration::from_secs(10)))
                .unwrap();
            assert_eq!(spectrum.wavelengths(), &[200.0, 210.0]);
            assert_eq!(spectrum.values(), &[5.0, 1.0]);
            assert!(dir.path().join("svp_r1_t5.dat").exists());
        }

        #[test]
        fn non_zero_exit_is_transient() {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let predictor = shell_predictor("echo busy >&2; exit 3 # {output}", dir.path(), &rt);
            let frame = Frame::new(FrameId::new(0, 0), vec![0.0]);
            let basis = BasisSetId::new("svp");
            match predictor.predict(&request(&frame, &basis, Duration::from_secs(10))) {
                Err(PredictionError::Transient(msg)) => assert!(msg.contains("busy")),
                other => panic!("unexpected result: {:?}", other),
            }
        }

        #[test]
        fn timeout_is_transient() {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let predictor = shell_predictor("sleep 5; touch {output}", dir.path(), &rt);
            let frame = Frame::new(FrameId::new(0, 0), vec![0.0]);
            let basis = BasisSetId::new("svp");
            assert!(matches!(
                predictor.predict(&request(&frame, &basis, Duration::from_millis(100))),
                Err(PredictionError::Transient(_))
            ));
        }

        #[test]
        fn missing_output_is_permanent() {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let predictor = shell_predictor("true {output}", dir.path(), &rt);
            let frame = Frame::new(FrameId::new(0, 0), vec![0.0]);
            let basis = BasisSetId::new("svp");
            assert!(matches!(
                predictor.predict(&request(&frame, &basis, Duration::from_secs(10))),
                Err(PredictionError::Permanent(_))
            ));
        }
    }
}
