//! Entry point for the jarvisd assistant service.
//!
//! The binary has two faces behind one clap interface:
//!
//!  * `jarvisd run` executes the service in the foreground: it polls
//!    the microphone for the wake word, records spoken commands,
//!    consults a local language model via Ollama and speaks responses
//!    back, until an interrupt or terminate signal (or a spoken
//!    shutdown command) stops it.
//!  * `start`, `stop`, `restart`, `status` and `emergency-stop`
//!    control a backgrounded instance through the pid and status files
//!    the daemon maintains under `~/.jarvis`.
//!
//! Configuration comes from `config/jarvis.json` (override the path
//! with `--config`) plus the environment overrides documented in
//! `config.rs`. `VOSK_MODEL_PATH` selects the offline recognition
//! model; without it the service falls back to a fixed-transcript
//! stand-in. `MIC_INDEX`/`MIC_NAME_KEYWORD` pick the microphone and
//! `VOICE_NAME` the TTS voice.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use jarvisd::config::{self, Config};
use jarvisd::jarvis_io::{self, JarvisIO};
use jarvisd::service::JarvisService;
use jarvisd::speech::{FixedTranscriber, Transcriber, VoskTranscriber};
use jarvisd::tts_engine::{ConsoleVoice, SystemVoice, Voice};

#[derive(Parser)]
#[command(name = "jarvisd")]
#[command(about = "JARVIS - voice-activated background assistant", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config/jarvis.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service in the foreground.
    Run,
    /// Start the service in the background.
    Start,
    /// Stop the background service gracefully.
    Stop,
    /// Restart the background service.
    Restart,
    /// Report the service status.
    Status,
    /// Force the background service to stop (emergency only).
    EmergencyStop,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from `.env` if present.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run) => run_service(&cli.config).await,
        Some(Commands::Start) => start_daemon(&cli.config),
        Some(Commands::Stop) => stop_daemon(false),
        Some(Commands::Restart) => {
            if let Err(e) = stop_daemon(false) {
                eprintln!("{e}");
            }
            std::thread::sleep(Duration::from_secs(1));
            start_daemon(&cli.config)
        }
        Some(Commands::Status) => show_status(),
        Some(Commands::EmergencyStop) => stop_daemon(true),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

async fn run_service(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    init_logging(&config.logging)?;

    log::info!("Starting JARVIS Background Service...");

    let io = JarvisIO::new()?;
    io.write_pid();
    io.write_status(jarvis_io::STATUS_IDLE);

    let transcriber = build_transcriber()?;
    let voice = build_voice();

    let mut service = JarvisService::new(config, transcriber, voice, JarvisIO::new()?)?;
    service.start().await?;

    let result = service.run(shutdown_signal()).await;

    io.write_status(jarvis_io::STATUS_IDLE);
    io.clear_pid();
    log::info!("JARVIS Background Service exited");
    result
}

/// Resolves when the process receives an interrupt or terminate signal.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl-C: {e}");
                }
                return;
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    log::error!("Failed to listen for Ctrl-C: {e}");
                }
                log::info!("Received SIGINT, shutting down gracefully...");
            }
            _ = term.recv() => {
                log::info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
        }
        log::info!("Received Ctrl-C, shutting down gracefully...");
    }
}

fn init_logging(logging: &config::LoggingConfig) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(&logging.level);
    let mut builder = env_logger::Builder::from_env(env);
    if logging.log_to_file {
        let log_dir = PathBuf::from(&logging.log_dir);
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log directory '{}'", log_dir.display()))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("jarvisd.log"))
            .context("failed to open log file")?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Offline recognition when a model is configured, otherwise the
/// fixed-transcript stand-in so the activation cycle still works.
fn build_transcriber() -> Result<Box<dyn Transcriber>> {
    match std::env::var("VOSK_MODEL_PATH") {
        Ok(path) => {
            log::info!("Loading Vosk model from '{}'", path);
            Ok(Box::new(VoskTranscriber::new(&path)?))
        }
        Err(_) => {
            log::warn!("VOSK_MODEL_PATH is not set; using the simulated transcriber");
            Ok(Box::new(FixedTranscriber::new("what time is it")))
        }
    }
}

fn build_voice() -> Box<dyn Voice> {
    match SystemVoice::new() {
        Ok(voice) => Box::new(voice),
        Err(e) => {
            log::warn!("No speech backend available ({e}); responses go to the console");
            Box::new(ConsoleVoice)
        }
    }
}

fn start_daemon(config_path: &std::path::Path) -> Result<()> {
    let io = JarvisIO::new()?;
    if let Some(pid) = io.read_pid() {
        if pid_is_alive(pid) {
            bail!("JARVIS service is already running (pid {pid})");
        }
    }

    println!("Starting JARVIS service...");
    let exe = std::env::current_exe().context("failed to locate the jarvisd binary")?;
    let child = Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("run")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn the JARVIS service")?;
    println!("JARVIS service started (pid {})", child.id());
    Ok(())
}

fn stop_daemon(emergency: bool) -> Result<()> {
    let io = JarvisIO::new()?;
    let pid = match io.read_pid() {
        Some(pid) => pid,
        None => bail!("JARVIS service is not running (no pid file)"),
    };

    if emergency {
        println!("EMERGENCY STOP - forcing JARVIS service (pid {pid}) to stop...");
    } else {
        println!("Stopping JARVIS service (pid {pid})...");
    }

    let status = kill_command(pid, emergency)
        .status()
        .context("failed to signal the JARVIS service")?;
    if !status.success() {
        bail!("failed to stop JARVIS service (pid {pid})");
    }

    if emergency {
        // The daemon had no chance to clean up after itself.
        io.clear_pid();
        io.write_status(jarvis_io::STATUS_IDLE);
        println!("JARVIS service force stopped");
    } else {
        println!("Stop signal sent");
    }
    Ok(())
}

fn show_status() -> Result<()> {
    let io = JarvisIO::new()?;
    match io.read_pid() {
        Some(pid) if pid_is_alive(pid) => {
            let status = io.current_status().unwrap_or_else(|| "unknown".to_string());
            println!("JARVIS service is running (pid {pid}, status: {status})");
        }
        Some(pid) => {
            println!("JARVIS service is not running (stale pid file: {pid})");
        }
        None => {
            println!("JARVIS service is not running");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn kill_command(pid: u32, emergency: bool) -> Command {
    let mut cmd = Command::new("kill");
    if emergency {
        cmd.arg("-9");
    }
    cmd.arg(pid.to_string());
    cmd
}

#[cfg(windows)]
fn kill_command(pid: u32, emergency: bool) -> Command {
    let mut cmd = Command::new("taskkill");
    if emergency {
        cmd.arg("/F");
    }
    cmd.args(["/PID", &pid.to_string()]);
    cmd
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn pid_is_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
