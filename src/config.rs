//! Configuration loading for the assistant service.
//!
//! Configuration lives in a JSON document (`config/jarvis.json` by
//! default) with five sections: `jarvis` (wake word and activation
//! timing), `audio` (capture format), `system` (the command allow-list),
//! `ai` (language model parameters) and `logging`. A handful of
//! environment variables override individual fields after the file is
//! parsed, which is convenient for service managers that inject
//! settings through unit files. The loaded [`Config`] is immutable for
//! the lifetime of the process; reloading produces a fresh instance.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub jarvis: JarvisConfig,
    pub audio: AudioConfig,
    pub system: SystemConfig,
    pub ai: AiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JarvisConfig {
    pub name: String,
    pub wake_word: String,
    /// Multiplier applied to the base energy threshold; higher values
    /// make the detector less sensitive.
    pub wake_word_sensitivity: f64,
    /// Milliseconds the service listens for a command after activation.
    pub listening_timeout: u64,
    /// Milliseconds allowed for an executed system command.
    pub response_timeout: u64,
    pub max_response_length: usize,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub encoding: String,
    /// Absolute sample value below which a chunk counts as silence.
    pub silence_threshold: i16,
    /// Milliseconds of silence after speech that end a timed recording.
    pub silence_duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    pub log_level: String,
    pub enable_system_access: bool,
    /// First tokens of shell commands the assistant may execute.
    pub allowed_commands: Vec<String>,
    pub max_command_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub enable_memory: bool,
    /// Number of user/assistant exchanges retained in history.
    pub memory_retention: usize,
    /// Character cap on a cleaned answer before it is replaced with a
    /// clarification message.
    pub max_response_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub max_files: u32,
    pub max_size: String,
    pub log_to_file: bool,
    pub log_to_console: bool,
    pub log_dir: String,
}

impl Default for JarvisConfig {
    fn default() -> Self {
        Self {
            name: "JARVIS".to_string(),
            wake_word: "jarvis".to_string(),
            wake_word_sensitivity: 0.5,
            listening_timeout: 10_000,
            response_timeout: 30_000,
            max_response_length: 300,
            language: "en".to_string(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
            encoding: "signed-integer".to_string(),
            silence_threshold: 500,
            silence_duration: 800,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_system_access: false,
            allowed_commands: vec![
                "date".to_string(),
                "uptime".to_string(),
                "ls".to_string(),
                "pwd".to_string(),
                "whoami".to_string(),
            ],
            max_command_length: 256,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "qwen3:1.7b".to_string(),
            temperature: 0.7,
            max_tokens: 500,
            system_prompt: "You are JARVIS, a helpful voice assistant. \
                            Answer briefly in plain sentences without Markdown."
                .to_string(),
            enable_memory: true,
            memory_retention: 10,
            max_response_length: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_files: 5,
            max_size: "10m".to_string(),
            log_to_file: false,
            log_to_console: true,
            log_dir: "logs".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jarvis: JarvisConfig::default(),
            audio: AudioConfig::default(),
            system: SystemConfig::default(),
            ai: AiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the given JSON file and apply environment
    /// variable overrides. Fails if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file '{}'", path.display()))?;
        let mut config: Config = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse configuration file '{}'", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to the
    /// built-in defaults (still honouring environment overrides).
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::warn!(
                "Configuration file '{}' not found, using defaults",
                path.display()
            );
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(rate) = env_parse::<u32>("AUDIO_SAMPLE_RATE") {
            self.audio.sample_rate = rate;
        }
        if let Some(channels) = env_parse::<u16>("AUDIO_CHANNELS") {
            self.audio.channels = channels;
        }
        if let Ok(value) = env::var("ENABLE_SYSTEM_ACCESS") {
            self.system.enable_system_access = value == "true";
        }
        if let Some(len) = env_parse::<usize>("MAX_COMMAND_LENGTH") {
            self.system.max_command_length = len;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(dir) = env::var("LOG_DIR") {
            self.logging.log_dir = dir;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard};

    // Environment variables are process-global and cargo runs tests in
    // parallel, so every test that reads or writes them takes this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_partial_file_with_defaults() {
        let _env = env_guard();
        let file = write_config(
            r#"{ "jarvis": { "wakeWord": "friday", "listeningTimeout": 5000 } }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.jarvis.wake_word, "friday");
        assert_eq!(config.jarvis.listening_timeout, 5000);
        // Untouched sections keep their defaults.
        assert_eq!(config.audio.sample_rate, 16_000);
        assert!(!config.system.enable_system_access);
    }

    #[test]
    fn rejects_malformed_json() {
        let file = write_config("{ not json");
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/jarvis.json"));
        assert!(err.is_err());
    }

    #[test]
    fn env_overrides_apply_after_parse() {
        let _env = env_guard();
        let file = write_config(r#"{ "audio": { "sampleRate": 8000 } }"#);
        env::set_var("AUDIO_SAMPLE_RATE", "44100");
        env::set_var("ENABLE_SYSTEM_ACCESS", "true");
        env::set_var("LOG_LEVEL", "debug");
        let config = Config::load(file.path()).unwrap();
        env::remove_var("AUDIO_SAMPLE_RATE");
        env::remove_var("ENABLE_SYSTEM_ACCESS");
        env::remove_var("LOG_LEVEL");
        assert_eq!(config.audio.sample_rate, 44_100);
        assert!(config.system.enable_system_access);
        assert_eq!(config.logging.level, "debug");
    }
}
