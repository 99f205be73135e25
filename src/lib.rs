//! jarvisd - a voice-activated background assistant.
//!
//! The crate is organised around the lifecycle state machine in
//! [`service`], which composes the other components: [`audio`] owns
//! microphone capture and playback, [`wake_word`] polls for the wake
//! word, [`speech`] and [`tts_engine`] are the pluggable recognition
//! and synthesis seams, [`agent`] talks to the local language model,
//! [`system`] gates and executes allow-listed shell commands, and
//! [`jarvis_io`] publishes pid/status files for the control CLI.

pub mod agent;
pub mod audio;
pub mod config;
pub mod jarvis_io;
pub mod service;
pub mod speech;
pub mod system;
pub mod tts_engine;
pub mod wake_word;
