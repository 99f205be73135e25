//! Runtime control files shared between the daemon and the control CLI.
//!
//! The running service publishes its pid and a coarse status string
//! under `~/.jarvis`, alongside transcripts of what was last heard and
//! spoken. The CLI subcommands read these files to report status and to
//! find the process to signal. Writes are best-effort: a failed status
//! update must never take down the service.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Coarse service status mirrored to the status file.
pub const STATUS_IDLE: &str = "idle";
pub const STATUS_LISTENING: &str = "listening";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_STOPPING: &str = "stopping";

pub struct JarvisIO {
    base: PathBuf,
}

impl JarvisIO {
    pub fn new() -> Result<Self> {
        let base = dirs::home_dir()
            .context("could not determine home directory")?
            .join(".jarvis");
        std::fs::create_dir_all(&base)
            .with_context(|| format!("failed to create runtime directory '{}'", base.display()))?;
        Ok(Self { base })
    }

    /// Use an explicit base directory instead of `~/.jarvis`.
    pub fn with_base(base: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base)
            .with_context(|| format!("failed to create runtime directory '{}'", base.display()))?;
        Ok(Self { base })
    }

    pub fn write_status(&self, status: &str) {
        let _ = std::fs::write(self.base.join("jarvis.status"), status);
    }

    pub fn write_spoken(&self, text: &str) {
        let _ = std::fs::write(self.base.join("jarvis.spoken"), text);
    }

    pub fn write_heard(&self, text: &str) {
        let _ = std::fs::write(self.base.join("jarvis.heard"), text);
    }

    pub fn current_status(&self) -> Option<String> {
        std::fs::read_to_string(self.base.join("jarvis.status"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn write_pid(&self) {
        let pid = std::process::id().to_string();
        let _ = std::fs::write(self.base.join("jarvis.pid"), pid);
    }

    /// Pid of the last started daemon, if one was recorded.
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.base.join("jarvis.pid"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
    }

    /// Remove the pid file on clean shutdown so `status` does not report
    /// a stale process.
    pub fn clear_pid(&self) {
        let _ = std::fs::remove_file(self.base.join("jarvis.pid"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let io = JarvisIO::with_base(dir.path().to_path_buf()).unwrap();
        assert_eq!(io.current_status(), None);
        io.write_status(STATUS_LISTENING);
        assert_eq!(io.current_status().as_deref(), Some(STATUS_LISTENING));
        io.write_status(STATUS_IDLE);
        assert_eq!(io.current_status().as_deref(), Some(STATUS_IDLE));
    }

    #[test]
    fn pid_is_recorded_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let io = JarvisIO::with_base(dir.path().to_path_buf()).unwrap();
        assert_eq!(io.read_pid(), None);
        io.write_pid();
        assert_eq!(io.read_pid(), Some(std::process::id()));
        io.clear_pid();
        assert_eq!(io.read_pid(), None);
    }
}
