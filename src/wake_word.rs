//! Energy-threshold wake word detection.
//!
//! [`WakeWordDetector`] runs a serial polling loop: record a short
//! sample, compute its mean squared 16-bit magnitude, and fire the
//! registered callbacks when the energy clears the configured
//! sensitivity threshold. This is deliberately a placeholder heuristic
//! (any loud speech will trigger it); swapping in a real model such as
//! Porcupine only requires replacing [`sample_energy`] and the
//! comparison in the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::audio::{AudioBuffer, AudioManager};
use crate::config::JarvisConfig;

/// Length of each polling sample.
const SAMPLE_WINDOW: Duration = Duration::from_millis(2000);
/// Yield between iterations so the loop never busy-spins.
const POLL_DELAY: Duration = Duration::from_millis(100);
/// Backoff after a recording error before retrying.
const ERROR_BACKOFF: Duration = Duration::from_millis(1000);

/// Base scale applied to the configured sensitivity. A sensitivity of
/// 0.5 means a mean squared sample magnitude of 500 000 trips the
/// detector.
const ENERGY_SCALE: f64 = 1_000_000.0;

pub type WakeCallback = Box<dyn Fn() + Send + Sync>;

pub struct WakeWordDetector {
    audio: Arc<AudioManager>,
    wake_word: String,
    threshold: f64,
    detecting: Arc<AtomicBool>,
    callbacks: Arc<std::sync::Mutex<Vec<WakeCallback>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WakeWordDetector {
    pub fn new(config: &JarvisConfig, audio: Arc<AudioManager>) -> Self {
        Self {
            audio,
            wake_word: config.wake_word.clone(),
            threshold: config.wake_word_sensitivity * ENERGY_SCALE,
            detecting: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(std::sync::Mutex::new(Vec::new())),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Register a callback fired once per qualifying sample, in
    /// registration order.
    pub fn on_wake_word(&self, callback: WakeCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(callback);
    }

    /// Spawn the polling loop. A second call while already detecting
    /// warns and returns.
    pub fn start_detection(&self) -> Result<()> {
        if self.detecting.swap(true, Ordering::SeqCst) {
            log::warn!("Wake word detection already running");
            return Ok(());
        }

        log::info!("Starting wake word detection for: \"{}\"", self.wake_word);
        let audio = Arc::clone(&self.audio);
        let detecting = Arc::clone(&self.detecting);
        let callbacks = Arc::clone(&self.callbacks);
        let wake_word = self.wake_word.clone();
        let threshold = self.threshold;

        let handle = tokio::spawn(async move {
            while detecting.load(Ordering::SeqCst) {
                match audio.record(SAMPLE_WINDOW).await {
                    Ok(buffer) => {
                        if sample_energy(&buffer) > threshold {
                            log::info!("Wake word \"{}\" detected!", wake_word);
                            notify(&callbacks);
                        }
                        tokio::time::sleep(POLL_DELAY).await;
                    }
                    Err(e) => {
                        log::error!("Error during wake word detection: {e}");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
            log::debug!("Wake word detection loop exited");
        });
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the polling loop and wait for it to release the recorder.
    /// No-op when not detecting.
    pub async fn stop_detection(&self) {
        if !self.detecting.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping wake word detection...");
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Wake word detection task ended abnormally: {e}");
            }
        }
        log::info!("Wake word detection stopped");
    }

    /// Emergency variant of [`stop_detection`](Self::stop_detection):
    /// aborts the loop task without waiting for the current sample.
    pub fn abort_detection(&self) {
        self.detecting.store(false, Ordering::SeqCst);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting.load(Ordering::SeqCst)
    }
}

/// Mean squared sample magnitude of the buffer. Returns 0 for an empty
/// buffer so silence never trips the threshold.
pub fn sample_energy(buffer: &AudioBuffer) -> f64 {
    let samples = buffer.samples();
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f64 = samples
        .iter()
        .map(|&s| {
            let s = s as f64;
            s * s
        })
        .sum();
    energy / samples.len() as f64
}

fn notify(callbacks: &std::sync::Mutex<Vec<WakeCallback>>) {
    let callbacks = callbacks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for callback in callbacks.iter() {
        // A panicking callback must not unwind the detection loop.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback()));
        if result.is_err() {
            log::error!("Wake word callback panicked; detection continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn buffer_of(value: i16, len: usize) -> AudioBuffer {
        AudioBuffer::new(vec![value; len], 16_000)
    }

    #[test]
    fn energy_of_silence_is_zero() {
        assert_eq!(sample_energy(&buffer_of(0, 1024)), 0.0);
        assert_eq!(sample_energy(&AudioBuffer::new(Vec::new(), 16_000)), 0.0);
    }

    #[test]
    fn energy_is_mean_of_squares() {
        // Constant amplitude 1000 -> mean squared magnitude 1_000_000.
        let buffer = buffer_of(1000, 256);
        assert_eq!(sample_energy(&buffer), 1_000_000.0);
        // Sign does not matter.
        assert_eq!(sample_energy(&buffer_of(-1000, 256)), 1_000_000.0);
    }

    #[test]
    fn loud_sample_clears_default_threshold() {
        // Sensitivity 0.5 -> threshold 500_000.
        let threshold = 0.5 * ENERGY_SCALE;
        assert!(sample_energy(&buffer_of(1000, 256)) > threshold);
        assert!(sample_energy(&buffer_of(500, 256)) < threshold);
    }

    #[test]
    fn callbacks_fire_once_per_qualifying_sample_in_order() {
        let order: Arc<std::sync::Mutex<Vec<&'static str>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let first_hits = Arc::new(AtomicUsize::new(0));

        let callbacks: std::sync::Mutex<Vec<WakeCallback>> = std::sync::Mutex::new(Vec::new());
        {
            let order = Arc::clone(&order);
            let first_hits = Arc::clone(&first_hits);
            callbacks.lock().unwrap().push(Box::new(move || {
                order.lock().unwrap().push("first");
                first_hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let order = Arc::clone(&order);
            callbacks.lock().unwrap().push(Box::new(move || {
                order.lock().unwrap().push("second");
            }));
        }

        let threshold = 0.5 * ENERGY_SCALE;
        let loud = buffer_of(1000, 256);
        let quiet = buffer_of(100, 256);

        // One qualifying sample: every callback fires exactly once, in
        // registration order.
        if sample_energy(&loud) > threshold {
            notify(&callbacks);
        }
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        // A quiet sample fires nothing.
        if sample_energy(&quiet) > threshold {
            notify(&callbacks);
        }
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_callback_does_not_stop_the_others() {
        let hits = Arc::new(AtomicUsize::new(0));

        let callbacks: std::sync::Mutex<Vec<WakeCallback>> = std::sync::Mutex::new(Vec::new());
        callbacks
            .lock()
            .unwrap()
            .push(Box::new(|| panic!("callback failure")));
        {
            let hits = Arc::clone(&hits);
            callbacks.lock().unwrap().push(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // The panic is contained; later callbacks still run, and a
        // further notification also reaches them.
        notify(&callbacks);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        notify(&callbacks);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
