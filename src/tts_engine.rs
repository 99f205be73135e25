//! Text-to-speech behind a pluggable [`Voice`] seam.
//!
//! [`SystemVoice`] delegates synthesis to the operating system via the
//! [`tts`] crate (Speech Dispatcher on Linux, SAPI on Windows,
//! AVFoundation on macOS). [`ConsoleVoice`] prints the line instead and
//! doubles as the degraded fallback when no speech backend is
//! available. The `VOICE_NAME` environment variable selects a specific
//! system voice by partial, case-insensitive name match.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tts::Tts;

/// Speaks a response to the user.
#[async_trait(?Send)]
pub trait Voice {
    async fn speak(&self, text: &str) -> Result<()>;
}

/// System speech synthesis via the [`tts`] crate.
pub struct SystemVoice {
    tts: Tts,
}

impl SystemVoice {
    /// Initialise the system speech backend. Returns an error when the
    /// host platform has none available.
    pub fn new() -> Result<Self> {
        let tts = Tts::default().context("failed to initialise text-to-speech engine")?;
        let mut voice = Self { tts };
        if let Ok(name) = std::env::var("VOICE_NAME") {
            match voice.set_voice_by_name(&name) {
                Ok(_) => log::info!("Using voice: {}", name),
                Err(e) => log::warn!(
                    "Failed to set voice '{}': {e}. Falling back to default.",
                    name
                ),
            }
        }
        Ok(voice)
    }

    /// Choose a voice by name, matched case-insensitively against the
    /// available voices. On no match the previous voice stays active.
    pub fn set_voice_by_name(&mut self, name: &str) -> Result<()> {
        let available = self.tts.voices().context("failed to enumerate voices")?;
        let target = name.to_lowercase();
        for voice in available {
            if voice.name().to_lowercase().contains(&target) {
                self.tts
                    .set_voice(&voice)
                    .context("failed to set TTS voice")?;
                return Ok(());
            }
        }
        Err(anyhow!(format!("no voice matching '{name}' found")))
    }
}

#[async_trait(?Send)]
impl Voice for SystemVoice {
    /// Speak the provided text, interrupting any utterance still
    /// playing. The blocking `tts` call runs on a blocking thread so
    /// synthesis does not stall the runtime.
    async fn speak(&self, text: &str) -> Result<()> {
        let text_owned = text.to_owned();
        let tts = self.tts.clone();
        tokio::task::spawn_blocking(move || {
            let mut tts = tts;
            // Stop any existing utterance; errors here are irrelevant
            // because a new speak call follows immediately.
            let _ = tts.stop();
            tts.speak(&text_owned, true)
                .map_err(|e| anyhow!(format!("TTS speak failed: {e:?}")))
        })
        .await
        .context("failed to join blocking TTS task")??;
        Ok(())
    }
}

/// Prints responses instead of speaking them. Used in tests and as the
/// fallback when no speech backend initialises.
#[derive(Default)]
pub struct ConsoleVoice;

#[async_trait(?Send)]
impl Voice for ConsoleVoice {
    async fn speak(&self, text: &str) -> Result<()> {
        println!("JARVIS: {}", text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_voice_never_fails() {
        let voice = ConsoleVoice;
        voice.speak("Yes? How can I help you?").await.unwrap();
    }
}
