//! Speech-to-text behind a pluggable [`Transcriber`] seam.
//!
//! Recognition is the point where real functionality attaches, so it is
//! a trait with two implementations: [`VoskTranscriber`] runs offline
//! recognition over a recorded buffer via the [`vosk`] crate, and
//! [`FixedTranscriber`] returns a constant transcript after a short
//! simulated delay. The service picks Vosk when `VOSK_MODEL_PATH`
//! points at a model directory and falls back to the stand-in
//! otherwise, which keeps the activation cycle exercisable on machines
//! without a model installed.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use vosk::{Model, Recognizer};

use crate::audio::AudioBuffer;

/// Converts a recorded audio buffer into a command string. An empty
/// string means no speech was recognised.
#[async_trait(?Send)]
pub trait Transcriber {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String>;
}

/// Offline recognition with a Vosk model loaded from disk.
pub struct VoskTranscriber {
    model: Model,
}

impl VoskTranscriber {
    pub fn new(model_path: &str) -> Result<Self> {
        let model = Model::new(model_path)
            .with_context(|| format!("failed to load Vosk model from '{}'", model_path))?;
        Ok(Self { model })
    }
}

#[async_trait(?Send)]
impl Transcriber for VoskTranscriber {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        // Vosk expects the capture rate as floating point.
        let mut recognizer = Recognizer::new(&self.model, audio.sample_rate() as f32)
            .context("failed to create Vosk recognizer")?;
        recognizer.set_words(false);
        recognizer.set_max_alternatives(0);

        recognizer.accept_waveform(audio.samples())?;
        let final_result = recognizer.final_result();
        if let Some(single) = final_result.single() {
            let text = single.text.to_string();
            log::debug!("Recognised transcript: {}", text);
            return Ok(text);
        }
        Ok(String::new())
    }
}

/// Stand-in recogniser that answers with a fixed transcript after a
/// simulated processing delay, regardless of the audio content.
pub struct FixedTranscriber {
    transcript: String,
    delay: Duration,
}

impl FixedTranscriber {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            delay: Duration::from_millis(1000),
        }
    }

    #[cfg(test)]
    pub fn instant(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            delay: Duration::from_millis(0),
        }
    }
}

#[async_trait(?Send)]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String> {
        log::debug!("Converting audio to text (simulated)");
        tokio::time::sleep(self.delay).await;
        if audio.is_empty() {
            return Ok(String::new());
        }
        Ok(self.transcript.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_transcriber_returns_its_transcript() {
        let transcriber = FixedTranscriber::instant("what time is it");
        let buffer = AudioBuffer::new(vec![1000; 64], 16_000);
        let text = transcriber.transcribe(&buffer).await.unwrap();
        assert_eq!(text, "what time is it");
    }

    #[tokio::test]
    async fn fixed_transcriber_treats_empty_audio_as_silence() {
        let transcriber = FixedTranscriber::instant("anything");
        let buffer = AudioBuffer::new(Vec::new(), 16_000);
        let text = transcriber.transcribe(&buffer).await.unwrap();
        assert!(text.is_empty());
    }
}
