//! Audio capture and playback built on [`cpal`].
//!
//! [`AudioManager`] owns the input and output devices and exposes three
//! capture modes: a timed [`record`](AudioManager::record) that returns
//! one completed buffer (used by both the wake-word loop and command
//! capture), a continuous listening toggle, and raw buffer playback.
//! Captured audio is down-mixed to mono `i16` regardless of the
//! device's native format, mirroring what the recognition stage
//! expects.
//!
//! The environment variables `MIC_INDEX` and `MIC_NAME_KEYWORD` control
//! which microphone is selected at construction time. If `MIC_INDEX`
//! parses as a `usize` the device at that index is chosen; otherwise
//! the first device whose name contains `MIC_NAME_KEYWORD` (case
//! insensitive) is used; otherwise the default input device.
//!
//! Timed capture is a single-owner resource: an internal async lock
//! guarantees the wake-word loop has fully released the recorder before
//! command capture acquires it.

use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;

use crate::config::AudioConfig;

/// A mono 16-bit audio clip plus the rate it was captured at.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Serialize as raw 16-bit little-endian PCM.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Parse raw 16-bit little-endian PCM. A trailing odd byte is
    /// rejected rather than silently dropped.
    pub fn from_bytes(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            return Err(anyhow!("PCM data has an odd number of bytes"));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self {
            samples,
            sample_rate,
        })
    }
}

pub struct AudioManager {
    input: cpal::Device,
    output: Option<cpal::Device>,
    config: AudioConfig,
    /// Serializes timed recordings; held for the whole capture. Shared
    /// so the guard can move into the blocking task and outlive a
    /// cancelled `record` future.
    capture_lock: Arc<tokio::sync::Mutex<()>>,
    listening: Arc<AtomicBool>,
    listen_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl AudioManager {
    /// Select input and output devices and remember the audio format
    /// configuration. Fails if no input device is available; a missing
    /// output device only disables playback.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let devices: Vec<cpal::Device> = host
            .input_devices()
            .context("failed to enumerate input audio devices")?
            .collect();

        let mic_index = env::var("MIC_INDEX")
            .ok()
            .and_then(|s| s.parse::<usize>().ok());
        let mic_keyword = env::var("MIC_NAME_KEYWORD").ok();

        let mut selected: Option<cpal::Device> = None;
        if let Some(idx) = mic_index {
            if idx < devices.len() {
                selected = Some(devices[idx].clone());
            }
        }
        if selected.is_none() {
            if let Some(keyword) = mic_keyword {
                let keyword = keyword.to_lowercase();
                for dev in &devices {
                    if let Ok(name) = dev.name() {
                        if name.to_lowercase().contains(&keyword) {
                            selected = Some(dev.clone());
                            break;
                        }
                    }
                }
            }
        }
        if selected.is_none() {
            selected = host.default_input_device();
        }
        let input = selected.ok_or_else(|| anyhow!("no input audio device found"))?;
        if let Ok(name) = input.name() {
            log::info!("Using microphone: {}", name);
        }

        let output = host.default_output_device();
        if output.is_none() {
            log::warn!("No output audio device found; playback disabled");
        }

        Ok(Self {
            input,
            output,
            config: config.clone(),
            capture_lock: Arc::new(tokio::sync::Mutex::new(())),
            listening: Arc::new(AtomicBool::new(false)),
            listen_thread: std::sync::Mutex::new(None),
        })
    }

    /// Record until end-of-speech or `timeout`, whichever comes first,
    /// and return the completed buffer. Recording ends early once
    /// speech has been heard and the configured silence window elapses.
    pub async fn record(&self, timeout: Duration) -> Result<AudioBuffer> {
        let guard = Arc::clone(&self.capture_lock).lock_owned().await;
        let device = self.input.clone();
        let config = self.config.clone();
        // The guard travels with the blocking task: dropping this
        // future cannot release the recorder while the capture is
        // still holding the input stream open.
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            capture_blocking(&device, &config, timeout)
        })
        .await
        .context("audio capture task panicked")?
    }

    /// Begin continuous capture on a background thread. The captured
    /// chunks are discarded; this mode only keeps the input stream
    /// open. A second call while listening warns and returns.
    pub fn start_listening(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            log::warn!("Already listening");
            return Ok(());
        }
        log::info!("Starting continuous audio listening");
        let device = self.input.clone();
        let flag = Arc::clone(&self.listening);
        let handle = std::thread::spawn(move || {
            let (tx, rx) = mpsc::channel::<Vec<i16>>();
            let stream = match build_capture_stream(&device, tx) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Failed to open continuous capture stream: {e}");
                    flag.store(false, Ordering::SeqCst);
                    return;
                }
            };
            if let Err(e) = stream.play() {
                log::error!("Failed to start continuous capture stream: {e}");
                flag.store(false, Ordering::SeqCst);
                return;
            }
            while flag.load(Ordering::SeqCst) {
                // Drain and discard; recv_timeout doubles as the stop poll.
                let _ = rx.recv_timeout(Duration::from_millis(200));
            }
            drop(stream);
        });
        *self
            .listen_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop continuous capture. No-op when not listening.
    pub fn stop_listening(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping continuous audio listening");
        let handle = self
            .listen_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Play a buffer through the output device, returning once playback
    /// completes.
    pub async fn play(&self, buffer: &AudioBuffer) -> Result<()> {
        let device = self
            .output
            .clone()
            .ok_or_else(|| anyhow!("no output audio device available"))?;
        let samples = buffer.samples.to_vec();
        let sample_rate = buffer.sample_rate;
        tokio::task::spawn_blocking(move || playback_blocking(&device, &samples, sample_rate))
            .await
            .context("audio playback task panicked")?
    }

    pub fn save_to_file(&self, buffer: &AudioBuffer, path: &Path) -> Result<()> {
        save_buffer(buffer, path)
    }

    pub fn load_from_file(&self, path: &Path) -> Result<AudioBuffer> {
        load_buffer(path, self.config.sample_rate)
    }
}

pub fn save_buffer(buffer: &AudioBuffer, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create '{}'", parent.display()))?;
    }
    std::fs::write(path, buffer.to_bytes())
        .with_context(|| format!("failed to save audio to '{}'", path.display()))?;
    log::info!("Audio saved to file: {}", path.display());
    Ok(())
}

pub fn load_buffer(path: &Path, sample_rate: u32) -> Result<AudioBuffer> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to load audio from '{}'", path.display()))?;
    AudioBuffer::from_bytes(&bytes, sample_rate)
}

/// Build a mono `i16` capture stream that pushes chunks into `tx`. Each
/// callback down-mixes by taking the first sample of every interleaved
/// frame. Send failures mean the receiver is gone and are ignored.
fn build_capture_stream(device: &cpal::Device, tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream> {
    let config = device
        .default_input_config()
        .context("failed to get default input configuration")?;
    let channels = config.channels() as usize;

    let err_fn = |err| {
        log::error!("An error occurred on the input audio stream: {}", err);
    };

    let stream = match config.sample_format() {
        SampleFormat::I16 => device.build_input_stream(
            &config.into(),
            move |data: &[i16], _| {
                let mut mono = Vec::with_capacity(data.len() / channels);
                for frame in data.chunks(channels) {
                    mono.push(frame[0]);
                }
                let _ = tx.send(mono);
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config.into(),
            move |data: &[u16], _| {
                let mut mono = Vec::with_capacity(data.len() / channels);
                for frame in data.chunks(channels) {
                    // Shift the unsigned midpoint down to zero.
                    let s = frame[0] as i32 - 32768;
                    mono.push(s as i16);
                }
                let _ = tx.send(mono);
            },
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config.into(),
            move |data: &[f32], _| {
                let mut mono = Vec::with_capacity(data.len() / channels);
                for frame in data.chunks(channels) {
                    let s = (frame[0] * 32768.0).clamp(-32768.0, 32767.0) as i16;
                    mono.push(s);
                }
                let _ = tx.send(mono);
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(anyhow!(format!("unsupported sample format: {:?}", other)));
        }
    };
    Ok(stream)
}

fn capture_blocking(
    device: &cpal::Device,
    config: &AudioConfig,
    duration: Duration,
) -> Result<AudioBuffer> {
    let input_config = device
        .default_input_config()
        .context("failed to get default input configuration")?;
    let sample_rate = input_config.sample_rate().0;

    let (tx, rx) = mpsc::channel::<Vec<i16>>();
    let stream = build_capture_stream(device, tx)?;
    stream
        .play()
        .context("failed to start audio input stream")?;

    log::debug!("Recording audio for up to {:?}", duration);

    let start_time = Instant::now();
    let mut samples: Vec<i16> = Vec::new();
    // Stop early after speech followed by a configured window of
    // silence, but never before a minimum warm-up period.
    let silence_threshold = config.silence_threshold;
    let silence_timeout = Duration::from_millis(config.silence_duration);
    let min_capture_time = Duration::from_millis(1000);
    let mut last_speech = Instant::now();
    let mut speech_started = false;

    while start_time.elapsed() < duration {
        let timeout = duration
            .checked_sub(start_time.elapsed())
            .unwrap_or_else(|| Duration::from_millis(0));
        match rx.recv_timeout(timeout) {
            Ok(chunk) => {
                let has_speech = chunk.iter().any(|s| s.wrapping_abs() > silence_threshold);
                samples.extend_from_slice(&chunk);
                if has_speech {
                    speech_started = true;
                    last_speech = Instant::now();
                }
                if speech_started
                    && start_time.elapsed() > min_capture_time
                    && last_speech.elapsed() > silence_timeout
                {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    log::debug!("Recording completed, {} samples", samples.len());
    Ok(AudioBuffer::new(samples, sample_rate))
}

fn playback_blocking(device: &cpal::Device, samples: &[i16], sample_rate: u32) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    let output_config = device
        .default_output_config()
        .context("failed to get default output configuration")?;
    let channels = output_config.channels() as usize;

    // The playback callbacks pull from a shared cursor over the clip;
    // once exhausted they emit silence and signal completion exactly once.
    let queue: Arc<std::sync::Mutex<(Vec<i16>, usize)>> =
        Arc::new(std::sync::Mutex::new((samples.to_vec(), 0)));
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let done_tx = Arc::new(std::sync::Mutex::new(Some(done_tx)));

    let err_fn = |err| {
        log::error!("An error occurred on the output audio stream: {}", err);
    };

    let stream = match output_config.sample_format() {
        SampleFormat::I16 => {
            let queue = Arc::clone(&queue);
            let done_tx = Arc::clone(&done_tx);
            device.build_output_stream(
                &output_config.into(),
                move |data: &mut [i16], _| fill_frames(data, channels, &queue, &done_tx, |s| s),
                err_fn,
                None,
            )?
        }
        SampleFormat::U16 => {
            let queue = Arc::clone(&queue);
            let done_tx = Arc::clone(&done_tx);
            device.build_output_stream(
                &output_config.into(),
                move |data: &mut [u16], _| {
                    fill_frames(data, channels, &queue, &done_tx, |s| (s as i32 + 32768) as u16)
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::F32 => {
            let queue = Arc::clone(&queue);
            let done_tx = Arc::clone(&done_tx);
            device.build_output_stream(
                &output_config.into(),
                move |data: &mut [f32], _| {
                    fill_frames(data, channels, &queue, &done_tx, |s| s as f32 / 32768.0)
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(anyhow!(format!("unsupported sample format: {:?}", other)));
        }
    };

    stream
        .play()
        .context("failed to start audio output stream")?;

    // Wait for the cursor to drain, bounded by the clip's duration plus
    // a margin so a stalled device cannot hang us.
    let clip_secs = samples.len() as u64 / sample_rate.max(1) as u64;
    let wait = Duration::from_secs(clip_secs + 5);
    match done_rx.recv_timeout(wait) {
        Ok(()) => {}
        Err(_) => log::warn!("Playback did not signal completion within {:?}", wait),
    }
    drop(stream);
    Ok(())
}

/// Advance the shared playback cursor into one output callback's frame
/// buffer, converting each mono sample for every channel slot. Signals
/// `done` exactly once when the clip is exhausted; silence follows.
fn fill_frames<T: Copy>(
    data: &mut [T],
    channels: usize,
    queue: &std::sync::Mutex<(Vec<i16>, usize)>,
    done: &std::sync::Mutex<Option<mpsc::Sender<()>>>,
    convert: impl Fn(i16) -> T,
) {
    let mut queue = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let (clip, pos) = &mut *queue;
    for frame in data.chunks_mut(channels.max(1)) {
        let sample = if *pos < clip.len() {
            let s = clip[*pos];
            *pos += 1;
            s
        } else {
            0
        };
        let value = convert(sample);
        for slot in frame.iter_mut() {
            *slot = value;
        }
    }
    if *pos >= clip.len() {
        if let Some(tx) = done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip_is_identical() {
        let buffer = AudioBuffer::new(vec![0, 1, -1, i16::MAX, i16::MIN, 12345], 16_000);
        let restored = AudioBuffer::from_bytes(&buffer.to_bytes(), 16_000).unwrap();
        assert_eq!(restored, buffer);
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        assert!(AudioBuffer::from_bytes(&[0x01, 0x02, 0x03], 16_000).is_err());
    }

    #[test]
    fn file_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.pcm");
        let buffer = AudioBuffer::new((-500..500).collect(), 16_000);
        save_buffer(&buffer, &path).unwrap();
        let restored = load_buffer(&path, 16_000).unwrap();
        assert_eq!(restored, buffer);
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("clip.pcm");
        let buffer = AudioBuffer::new(vec![7; 32], 8_000);
        save_buffer(&buffer, &path).unwrap();
        assert_eq!(load_buffer(&path, 8_000).unwrap(), buffer);
    }
}
