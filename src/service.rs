//! The assistant's lifecycle state machine and activation cycle.
//!
//! [`JarvisService`] wires the audio, wake-word, speech, AI and system
//! components together and owns the only mutable service state. The
//! state is a single tagged enum rather than a set of boolean flags, so
//! invalid combinations (active while not running, stopping while idle)
//! are unrepresentable, and every change goes through one transition
//! function.
//!
//! All state mutation happens on the task driving [`JarvisService::run`]:
//! wake-word detections arrive over a bounded channel from the detector
//! task, so the service remains a single-writer system even though the
//! detector polls concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::agent::{Agent, CommandContext};
use crate::audio::AudioManager;
use crate::config::Config;
use crate::jarvis_io::{self, JarvisIO};
use crate::speech::Transcriber;
use crate::system::SystemManager;
use crate::tts_engine::Voice;
use crate::wake_word::WakeWordDetector;

/// Escalation window for a graceful stop before the emergency path is
/// forced.
const SHUTDOWN_ESCALATION: Duration = Duration::from_secs(30);

const GREETING: &str = "Yes? How can I help you?";
const NO_COMMAND: &str = "I didn't hear a command. Please try again.";
const TURN_ERROR: &str = "I apologize, but I encountered an error. Please try again.";

/// The service lifecycle. `Emergency` is distinct from `Idle`: both are
/// stopped, but `Emergency` records that the last shutdown was forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Listening,
    Active,
    Stopping,
    Emergency,
}

impl ServiceState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Listening | Self::Active | Self::Stopping)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Stopping)
    }

    pub fn is_emergency(self) -> bool {
        matches!(self, Self::Emergency)
    }
}

/// Events accepted by the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Started,
    WakeDetected,
    TurnFinished,
    StopRequested,
    StopCompleted,
    EmergencyStop,
}

/// The single place service state changes. Invalid pairings leave the
/// state unchanged, which is what makes duplicate or late events safe.
pub fn transition(state: ServiceState, event: StateEvent) -> ServiceState {
    use ServiceState::*;
    use StateEvent::*;
    match (state, event) {
        (Idle | Emergency, Started) => Listening,
        (Listening, WakeDetected) => Active,
        (Active, TurnFinished) => Listening,
        (Listening | Active, StopRequested) => Stopping,
        (Stopping, StopCompleted) => Idle,
        (_, EmergencyStop) => Emergency,
        (unchanged, _) => unchanged,
    }
}

/// How a spoken command should be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Graceful shutdown intent.
    Shutdown,
    /// Immediate forced shutdown.
    Emergency,
    /// Everything else goes to the language model.
    Conversation,
}

/// Classifies a spoken command. Pluggable so the brittle phrase
/// matching below can be replaced without touching the state machine.
pub trait CommandClassifier: Send {
    fn classify(&self, command: &str) -> CommandClass;
}

const SHUTDOWN_PHRASES: &[&str] = &[
    "shutdown",
    "power off",
    "turn off",
    "exit",
    "quit",
    "stop jarvis",
    "jarvis shutdown",
    "jarvis stop",
    "jarvis exit",
];

const EMERGENCY_PHRASES: &[&str] = &[
    "emergency stop",
    "emergency shutdown",
    "force stop",
    "abort",
    "jarvis emergency",
];

/// Substring matching against fixed phrase lists. Emergency phrases
/// take precedence over shutdown phrases when both match.
#[derive(Default)]
pub struct PhraseClassifier;

impl CommandClassifier for PhraseClassifier {
    fn classify(&self, command: &str) -> CommandClass {
        let lower = command.to_lowercase();
        if EMERGENCY_PHRASES.iter().any(|p| lower.contains(p)) {
            return CommandClass::Emergency;
        }
        if SHUTDOWN_PHRASES.iter().any(|p| lower.contains(p)) {
            return CommandClass::Shutdown;
        }
        CommandClass::Conversation
    }
}

/// Fixed table mapping phrases in the model's answer to system actions.
const RESPONSE_TRIGGERS: &[(&[&str], &str)] = &[(&["system time", "current time"], "date")];

/// Scan an AI response for trigger phrases and return the shell
/// commands they map to.
pub fn extract_system_actions(response: &str) -> Vec<&'static str> {
    let lower = response.to_lowercase();
    RESPONSE_TRIGGERS
        .iter()
        .filter(|(phrases, _)| phrases.iter().any(|p| lower.contains(p)))
        .map(|(_, action)| *action)
        .collect()
}

/// How a graceful cleanup sequence ended.
#[derive(Debug)]
enum StopOutcome {
    Clean,
    Failed(anyhow::Error),
    /// The escalation window elapsed before cleanup finished.
    Escalated,
}

/// Bound a cleanup sequence by the escalation window.
async fn run_cleanup(
    window: Duration,
    cleanup: impl std::future::Future<Output = Result<()>>,
) -> StopOutcome {
    match tokio::time::timeout(window, cleanup).await {
        Ok(Ok(())) => StopOutcome::Clean,
        Ok(Err(e)) => StopOutcome::Failed(e),
        Err(_) => StopOutcome::Escalated,
    }
}

/// The response owed when a command window closes without speech. A
/// turn must always end with an audible outcome.
fn silent_turn_reply(transcript: &str) -> Option<&'static str> {
    if transcript.trim().is_empty() {
        Some(NO_COMMAND)
    } else {
        None
    }
}

/// Point-in-time view of the service for the status surface.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStatus {
    pub running: bool,
    pub active: bool,
    pub shutting_down: bool,
    pub emergency: bool,
    pub detecting: bool,
    pub listening: bool,
}

pub struct JarvisService {
    config: Config,
    state: ServiceState,
    audio: Arc<AudioManager>,
    detector: WakeWordDetector,
    system: SystemManager,
    agent: Option<Agent>,
    transcriber: Box<dyn Transcriber>,
    voice: Box<dyn Voice>,
    classifier: Box<dyn CommandClassifier>,
    io: JarvisIO,
    wake_tx: mpsc::Sender<()>,
    wake_rx: mpsc::Receiver<()>,
}

impl JarvisService {
    pub fn new(
        config: Config,
        transcriber: Box<dyn Transcriber>,
        voice: Box<dyn Voice>,
        io: JarvisIO,
    ) -> Result<Self> {
        let audio = Arc::new(AudioManager::new(&config.audio)?);
        let detector = WakeWordDetector::new(&config.jarvis, Arc::clone(&audio));
        let system = SystemManager::new(&config.jarvis, &config.system);
        // Capacity 1: a wake detected while a turn is in flight is
        // dropped, not queued.
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            state: ServiceState::Idle,
            audio,
            detector,
            system,
            agent: None,
            transcriber,
            voice,
            classifier: Box::new(PhraseClassifier),
            io,
            wake_tx,
            wake_rx,
        })
    }

    /// Replace the default phrase classifier.
    pub fn with_classifier(mut self, classifier: Box<dyn CommandClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.state.is_running(),
            active: self.state.is_active(),
            shutting_down: self.state.is_shutting_down(),
            emergency: self.state.is_emergency(),
            detecting: self.detector.is_detecting(),
            listening: self.audio.is_listening(),
        }
    }

    /// Initialize the AI agent, register the wake callback and begin
    /// detection. A failed agent initialization propagates and leaves
    /// the service idle; callers must not assume a partial start.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.is_shutting_down() {
            log::warn!("Service is shutting down, cannot start");
            return Ok(());
        }
        if self.state.is_running() {
            log::warn!("Service is already running");
            return Ok(());
        }

        log::info!("Starting JARVIS service...");
        self.agent = Some(
            Agent::new(&self.config.ai)
                .await
                .context("failed to initialize AI agent")?,
        );

        let tx = self.wake_tx.clone();
        self.detector.on_wake_word(Box::new(move || {
            // A full channel means a turn is already in flight.
            let _ = tx.try_send(());
        }));
        self.detector.start_detection()?;

        self.state = transition(self.state, StateEvent::Started);
        self.io.write_status(jarvis_io::STATUS_LISTENING);
        log::info!("JARVIS service started successfully");
        log::info!("Wake word: \"{}\"", self.config.jarvis.wake_word);
        log::info!("Say the wake word to activate the assistant!");
        log::info!(
            "To shutdown safely, say: \"{} shutdown\"",
            self.config.jarvis.wake_word
        );
        Ok(())
    }

    /// Drive the service until it stops: either `shutdown` resolves (a
    /// process signal) or a spoken command ends the run.
    pub async fn run(&mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                maybe_wake = self.wake_rx.recv() => {
                    match maybe_wake {
                        Some(()) => self.handle_wake_word().await,
                        None => break,
                    }
                    // Wake words heard during the turn are stale now.
                    while self.wake_rx.try_recv().is_ok() {}
                }
                _ = &mut shutdown => {
                    self.stop().await?;
                    break;
                }
            }
            if !self.state.is_running() {
                break;
            }
        }
        Ok(())
    }

    /// Graceful stop with escalation: the cleanup sequence gets a fixed
    /// window, after which the emergency path forces all flags down.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.state.is_running() || self.state.is_shutting_down() {
            return Ok(());
        }

        log::info!("Stopping JARVIS service...");
        self.state = transition(self.state, StateEvent::StopRequested);
        self.io.write_status(jarvis_io::STATUS_STOPPING);

        match run_cleanup(SHUTDOWN_ESCALATION, self.shutdown_sequence()).await {
            StopOutcome::Clean => {
                self.state = transition(self.state, StateEvent::StopCompleted);
                self.io.write_status(jarvis_io::STATUS_IDLE);
                log::info!("JARVIS service stopped successfully");
                Ok(())
            }
            StopOutcome::Failed(e) => {
                // Never leave the flags in an in-between state.
                log::error!("Failed to stop JARVIS service: {e}");
                self.force_shutdown();
                Err(e)
            }
            StopOutcome::Escalated => {
                log::warn!("Shutdown timeout reached, forcing emergency shutdown");
                self.force_shutdown();
                Ok(())
            }
        }
    }

    async fn shutdown_sequence(&mut self) -> Result<()> {
        self.detector.stop_detection().await;
        if self.audio.is_listening() {
            self.audio.stop_listening();
        }
        Ok(())
    }

    /// Unconditional reset with no cleanup guarantees beyond aborting
    /// the detector task.
    pub fn emergency_stop(&mut self) {
        log::warn!("Emergency stop initiated");
        self.force_shutdown();
    }

    fn force_shutdown(&mut self) {
        log::warn!("Forcing emergency shutdown...");
        self.detector.abort_detection();
        self.audio.stop_listening();
        self.state = transition(self.state, StateEvent::EmergencyStop);
        self.io.write_status(jarvis_io::STATUS_IDLE);
        log::info!("Emergency shutdown completed");
    }

    /// One activation: greet, capture a command, dispatch it. The
    /// active state is unconditionally cleared when the turn ends,
    /// including on error paths.
    async fn handle_wake_word(&mut self) {
        if self.state.is_active() {
            log::debug!("Already active, ignoring wake word");
            return;
        }
        if !matches!(self.state, ServiceState::Listening) {
            log::debug!("Service is not listening, ignoring wake word");
            return;
        }

        log::info!("Wake word detected, activating JARVIS...");
        self.state = transition(self.state, StateEvent::WakeDetected);
        self.io.write_status(jarvis_io::STATUS_ACTIVE);

        self.respond(GREETING).await;
        self.listen_for_command().await;

        if self.state.is_active() {
            self.state = transition(self.state, StateEvent::TurnFinished);
            self.io.write_status(jarvis_io::STATUS_LISTENING);
        }
    }

    async fn listen_for_command(&mut self) {
        log::info!("Listening for command...");
        let window = Duration::from_millis(self.config.jarvis.listening_timeout);

        // The recording itself is the command timer: it resolves on
        // end-of-speech or when the window elapses, so a silent window
        // surfaces as an empty transcript rather than a raced timeout.
        let buffer = match self.audio.record(window).await {
            Ok(buffer) => buffer,
            Err(e) => {
                log::error!("Error recording command audio: {e}");
                self.respond(TURN_ERROR).await;
                return;
            }
        };

        let command = match self.transcriber.transcribe(&buffer).await {
            Ok(command) => command,
            Err(e) => {
                log::error!("Error transcribing command audio: {e}");
                self.respond(TURN_ERROR).await;
                return;
            }
        };

        if let Some(reply) = silent_turn_reply(&command) {
            log::info!("No command detected");
            self.respond(reply).await;
            return;
        }

        log::info!("Command received: {}", command);
        self.io.write_heard(&command);
        self.process_command(command.trim()).await;
    }

    async fn process_command(&mut self, command: &str) {
        if !self.state.is_running() || self.state.is_shutting_down() {
            log::debug!("Service is shutting down, not processing command");
            return;
        }
        log::info!("Processing command: {}", command);

        match self.classifier.classify(command) {
            CommandClass::Emergency => {
                log::warn!("Emergency stop command detected");
                self.respond("Emergency shutdown initiated!").await;
                self.emergency_stop();
            }
            CommandClass::Shutdown => self.handle_shutdown_command(command).await,
            CommandClass::Conversation => self.handle_conversation(command).await,
        }
    }

    /// A graceful stop must name the wake word; a bare "shutdown" gets
    /// a phrasing hint instead so loose talk cannot kill the service.
    async fn handle_shutdown_command(&mut self, command: &str) {
        log::info!("Shutdown command detected");
        let wake_word = self.config.jarvis.wake_word.to_lowercase();
        if command.to_lowercase().contains(&wake_word) {
            self.respond("Shutting down JARVIS service. Goodbye!").await;
            if let Err(e) = self.stop().await {
                log::error!("Error during spoken shutdown: {e}");
            }
        } else {
            let hint = format!(
                "To shutdown {}, please say \"{} shutdown\"",
                self.config.jarvis.name, self.config.jarvis.wake_word
            );
            self.respond(&hint).await;
        }
    }

    async fn handle_conversation(&mut self, command: &str) {
        let context = CommandContext {
            timestamp: chrono::Local::now().to_rfc3339(),
            is_active: self.state.is_active(),
            system: self.system.system_info(),
        };

        let response = match self.agent.as_mut() {
            Some(agent) => agent.process_command(command, &context).await,
            None => {
                log::error!("Agent not initialized while processing a command");
                TURN_ERROR.to_string()
            }
        };

        self.io.write_spoken(&response);
        self.respond(&response).await;
        self.execute_triggered_actions(&response);
    }

    /// Run any system actions the response text triggers. Gate refusals
    /// and execution failures are logged; they never end the turn.
    fn execute_triggered_actions(&mut self, response: &str) {
        for action in extract_system_actions(response) {
            match self.system.execute(action) {
                Ok(outcome) if outcome.success => {
                    log::info!("Executed system action '{}': {}", action, outcome.stdout)
                }
                Ok(outcome) => {
                    log::warn!("System action '{}' failed: {}", action, outcome.stderr)
                }
                Err(e) => log::warn!("System action '{}' refused: {e}", action),
            }
        }
    }

    /// Speak a response, degrading to console output if the voice
    /// backend fails. Responding must never crash the service.
    async fn respond(&mut self, message: &str) {
        log::info!("Responding: {}", message);
        if let Err(e) = self.voice.speak(message).await {
            log::error!("Error responding: {e}");
            println!("JARVIS: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceState::*;
    use StateEvent::*;

    #[test]
    fn start_stop_cycle_reaches_the_expected_states() {
        let mut state = Idle;
        state = transition(state, Started);
        assert_eq!(state, Listening);
        state = transition(state, WakeDetected);
        assert_eq!(state, Active);
        state = transition(state, TurnFinished);
        assert_eq!(state, Listening);
        state = transition(state, StopRequested);
        assert_eq!(state, Stopping);
        state = transition(state, StopCompleted);
        assert_eq!(state, Idle);
    }

    #[test]
    fn active_never_holds_without_running() {
        // Exhaustive walk over event sequences of bounded length: the
        // invariant "active implies running" must hold along every path.
        let events = [
            Started,
            WakeDetected,
            TurnFinished,
            StopRequested,
            StopCompleted,
            EmergencyStop,
        ];
        let mut frontier = vec![Idle];
        for _ in 0..5 {
            let mut next = Vec::new();
            for state in frontier {
                for event in events {
                    let after = transition(state, event);
                    assert!(
                        !(after.is_active() && !after.is_running()),
                        "active while not running after {:?} on {:?}",
                        event,
                        state
                    );
                    assert!(
                        !(after.is_active() && after.is_shutting_down()),
                        "active while shutting down"
                    );
                    next.push(after);
                }
            }
            next.sort_by_key(|s| *s as u8);
            next.dedup();
            frontier = next;
        }
    }

    #[test]
    fn stop_when_idle_changes_nothing() {
        assert_eq!(transition(Idle, StopRequested), Idle);
        assert_eq!(transition(Idle, StopCompleted), Idle);
    }

    #[test]
    fn wake_is_ignored_outside_listening() {
        assert_eq!(transition(Idle, WakeDetected), Idle);
        assert_eq!(transition(Stopping, WakeDetected), Stopping);
        assert_eq!(transition(Active, WakeDetected), Active);
        assert_eq!(transition(Emergency, WakeDetected), Emergency);
    }

    #[test]
    fn emergency_wins_from_every_state() {
        for state in [Idle, Listening, Active, Stopping, Emergency] {
            let after = transition(state, EmergencyStop);
            assert_eq!(after, Emergency);
            assert!(!after.is_running());
            assert!(!after.is_active());
            assert!(!after.is_shutting_down());
            assert!(after.is_emergency());
        }
    }

    #[test]
    fn start_clears_a_previous_emergency() {
        let state = transition(Emergency, Started);
        assert_eq!(state, Listening);
        assert!(!state.is_emergency());
    }

    #[test]
    fn classifier_recognises_shutdown_phrases() {
        let classifier = PhraseClassifier;
        assert_eq!(classifier.classify("jarvis shutdown"), CommandClass::Shutdown);
        assert_eq!(classifier.classify("shutdown"), CommandClass::Shutdown);
        assert_eq!(classifier.classify("please turn off now"), CommandClass::Shutdown);
        assert_eq!(
            classifier.classify("what time is it"),
            CommandClass::Conversation
        );
    }

    #[test]
    fn emergency_takes_precedence_over_shutdown() {
        let classifier = PhraseClassifier;
        assert_eq!(classifier.classify("emergency stop"), CommandClass::Emergency);
        // Matches both phrase lists; emergency must win.
        assert_eq!(
            classifier.classify("jarvis emergency shutdown"),
            CommandClass::Emergency
        );
    }

    #[test]
    fn classification_is_case_insensitive() {
        let classifier = PhraseClassifier;
        assert_eq!(classifier.classify("JARVIS Shutdown"), CommandClass::Shutdown);
        assert_eq!(classifier.classify("ABORT"), CommandClass::Emergency);
    }

    #[test]
    fn a_silent_command_window_owes_the_no_command_reply() {
        // A turn with no recognised speech must still end audibly.
        assert_eq!(silent_turn_reply(""), Some(NO_COMMAND));
        assert_eq!(silent_turn_reply("   "), Some(NO_COMMAND));
        assert_eq!(silent_turn_reply("what time is it"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_cleanup_finishes_within_the_window() {
        let outcome = run_cleanup(Duration::from_secs(30), async { Ok(()) }).await;
        assert!(matches!(outcome, StopOutcome::Clean));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cleanup_escalates_to_emergency() {
        let outcome = run_cleanup(Duration::from_secs(30), async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        })
        .await;
        assert!(matches!(outcome, StopOutcome::Escalated));

        // The escalated path forces the emergency state: every flag
        // down, the forced shutdown observable afterwards.
        let state = transition(Stopping, EmergencyStop);
        assert!(!state.is_running());
        assert!(!state.is_active());
        assert!(!state.is_shutting_down());
        assert!(state.is_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cleanup_reports_the_error() {
        let outcome = run_cleanup(Duration::from_secs(30), async {
            Err(anyhow::anyhow!("detector refused to stop"))
        })
        .await;
        assert!(matches!(outcome, StopOutcome::Failed(_)));
    }

    #[test]
    fn response_triggers_map_to_actions() {
        assert_eq!(
            extract_system_actions("I'll get the system time for you"),
            vec!["date"]
        );
        assert_eq!(
            extract_system_actions("The current time is on its way"),
            vec!["date"]
        );
        assert!(extract_system_actions("The weather is nice").is_empty());
    }
}
