use cdens::engine::progress::{Progress, ProgressCallback};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::warn;

const EVENT_BUFFER: usize = 1024;
const SPINNER_TICK: Duration = Duration::from_millis(80);

#[derive(Debug)]
pub enum UiEvent {
    Progress(Progress),
    Log(String),
}

/// Renders pipeline progress on stderr from a dedicated tokio task.
///
/// The pipeline runs on blocking threads and only pushes events into the
/// channel; every bar is owned by this task.
pub struct UiManager {
    mp: MultiProgress,
    phase: Option<ActivePhase>,
    completed: Vec<String>,
    event_receiver: mpsc::Receiver<UiEvent>,
    shutdown_receiver: watch::Receiver<bool>,
}

struct ActivePhase {
    name: String,
    bar: ProgressBar,
    started: Instant,
}

impl UiManager {
    pub fn new() -> (Self, mpsc::Sender<UiEvent>, watch::Sender<bool>) {
        let (event_sender, event_receiver) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(12));
        let manager = Self {
            mp,
            phase: None,
            completed: Vec::new(),
            event_receiver,
            shutdown_receiver,
        };
        (manager, event_sender, shutdown_sender)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.event_receiver.recv() => self.handle_event(event),
                result = self.shutdown_receiver.changed() => {
                    if result.is_err() || *self.shutdown_receiver.borrow() {
                        break;
                    }
                }
            }
        }
        // Events queued before shutdown still get drawn.
        while let Ok(event) = self.event_receiver.try_recv() {
            self.handle_event(event);
        }
        if let Some(phase) = self.phase.take() {
            phase.bar.finish_and_clear();
        }
    }

    fn handle_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::Log(msg) => {
                self.mp.println(msg).ok();
            }
            UiEvent::Progress(progress) => self.handle_progress(progress),
        }
    }

    fn handle_progress(&mut self, progress: Progress) {
        match progress {
            Progress::PhaseStart { name } => self.start_phase(name),
            Progress::PhaseFinish => self.finish_phase(),
            Progress::TaskStart { total_steps } => {
                if let Some(phase) = &self.phase {
                    phase.bar.disable_steady_tick();
                    phase.bar.set_style(task_style());
                    phase.bar.set_length(total_steps);
                    phase.bar.set_position(0);
                }
            }
            Progress::TaskIncrement => {
                if let Some(phase) = &self.phase {
                    phase.bar.inc(1);
                }
            }
            Progress::TaskFinish => {
                if let Some(phase) = &self.phase {
                    if let Some(len) = phase.bar.length() {
                        phase.bar.set_position(len);
                    }
                    phase.bar.finish();
                }
            }
            Progress::StatusUpdate { text } => {
                if let Some(phase) = &self.phase {
                    phase.bar.set_message(format!("{} ({})", phase.name, text));
                }
            }
            Progress::Message(msg) => {
                self.mp.println(format!("  {}", msg)).ok();
            }
        }
    }

    /// A new phase replaces a phase that never reported its end.
    fn start_phase(&mut self, name: &str) {
        if let Some(previous) = self.phase.take() {
            previous.bar.finish_and_clear();
        }
        let bar = self.mp.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.enable_steady_tick(SPINNER_TICK);
        bar.set_message(name.to_string());
        self.phase = Some(ActivePhase {
            name: name.to_string(),
            bar,
            started: Instant::now(),
        });
    }

    fn finish_phase(&mut self) {
        let Some(phase) = self.phase.take() else {
            return;
        };
        phase.bar.finish_and_clear();
        self.mp
            .println(format!(
                "✓ {} ({:.1}s)",
                phase.name,
                phase.started.elapsed().as_secs_f64()
            ))
            .ok();
        self.completed.push(phase.name);
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
}

fn task_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:<40} [{bar:40.cyan/blue}] {pos}/{len} frames ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸ ")
}

/// Turns engine progress events into UI events on the channel.
#[derive(Clone)]
pub struct CliProgressHandler {
    sender: mpsc::Sender<UiEvent>,
}

impl CliProgressHandler {
    pub fn new(sender: mpsc::Sender<UiEvent>) -> Self {
        Self { sender }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let sender = self.sender.clone();
        Box::new(move |progress: Progress| {
            if let Err(e) = sender.try_send(UiEvent::Progress(progress)) {
                warn!("Failed to send progress update to UI channel: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE_PHASES: [&str; 6] = [
        "State Encoding",
        "Transition Model",
        "Representative Sampling",
        "Predicting Spectra",
        "Fitting",
        "Ranking",
    ];

    fn hidden_manager() -> UiManager {
        let (manager, _, _) = UiManager::new();
        manager.mp.set_draw_target(ProgressDrawTarget::hidden());
        manager
    }

    fn send(manager: &mut UiManager, progress: Progress) {
        manager.handle_event(UiEvent::Progress(progress));
    }

    fn active_message(manager: &UiManager) -> String {
        manager.phase.as_ref().unwrap().bar.message().to_string()
    }

    #[test]
    fn pipeline_phases_complete_in_order() {
        let mut manager = hidden_manager();
        for name in PIPELINE_PHASES {
            send(&mut manager, Progress::PhaseStart { name });
            assert_eq!(active_message(&manager), name);
            send(&mut manager, Progress::PhaseFinish);
            assert!(manager.phase.is_none());
        }
        assert_eq!(manager.completed, PIPELINE_PHASES);
    }

    #[test]
    fn unfinished_phase_is_replaced_without_completing() {
        let mut manager = hidden_manager();
        send(&mut manager, Progress::PhaseStart { name: "State Encoding" });
        send(&mut manager, Progress::PhaseStart { name: "Transition Model" });

        assert_eq!(active_message(&manager), "Transition Model");
        assert!(manager.completed.is_empty());
    }

    #[test]
    fn prediction_phase_drives_a_frame_bar() {
        let mut manager = hidden_manager();
        send(&mut manager, Progress::PhaseStart { name: "Predicting Spectra" });
        send(&mut manager, Progress::StatusUpdate { text: "Basis set svp".into() });
        assert_eq!(active_message(&manager), "Predicting Spectra (Basis set svp)");

        send(&mut manager, Progress::TaskStart { total_steps: 12 });
        for _ in 0..3 {
            send(&mut manager, Progress::TaskIncrement);
        }
        {
            let bar = &manager.phase.as_ref().unwrap().bar;
            assert_eq!(bar.length(), Some(12));
            assert_eq!(bar.position(), 3);
        }

        send(&mut manager, Progress::TaskFinish);
        let bar = &manager.phase.as_ref().unwrap().bar;
        assert!(bar.is_finished());
        assert_eq!(bar.position(), 12);

        send(&mut manager, Progress::PhaseFinish);
        assert_eq!(manager.completed, ["Predicting Spectra"]);
    }

    #[test]
    fn events_outside_a_phase_are_ignored() {
        let mut manager = hidden_manager();
        send(&mut manager, Progress::TaskIncrement);
        send(&mut manager, Progress::PhaseFinish);
        send(&mut manager, Progress::Message("1 of 2 configurations failed".into()));
        manager.handle_event(UiEvent::Log("log line".into()));
        assert!(manager.phase.is_none());
        assert!(manager.completed.is_empty());
    }

    #[tokio::test]
    async fn progress_handler_forwards_events() {
        let (sender, mut receiver) = mpsc::channel(1);
        let callback = CliProgressHandler::new(sender).get_callback();

        callback(Progress::PhaseStart { name: "Ranking" });

        match receiver.recv().await {
            Some(UiEvent::Progress(Progress::PhaseStart { name })) => assert_eq!(name, "Ranking"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn run_drains_queued_events_before_exiting() {
        let (manager, sender, shutdown) = UiManager::new();
        manager.mp.set_draw_target(ProgressDrawTarget::hidden());
        let handle = tokio::spawn(manager.run());

        for name in PIPELINE_PHASES {
            sender.send(UiEvent::Progress(Progress::PhaseStart { name })).await.unwrap();
            sender.send(UiEvent::Progress(Progress::PhaseFinish)).await.unwrap();
        }
        shutdown.send(true).unwrap();

        handle.await.unwrap();
    }
}
