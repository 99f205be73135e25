//! Allow-listed system command execution and OS inspection.
//!
//! [`SystemManager`] is pure request/response: it holds no state beyond
//! its configuration. Command execution is gated twice before any shell
//! is touched: system access must be enabled, and the command's first
//! token must appear in the configured allow-list. The gate is a token
//! match on the literal command string, not argument-aware. Execution
//! itself runs under the system shell with a timeout and a bounded
//! output buffer, and always returns a structured [`CommandOutcome`] so
//! callers can inspect stdout/stderr even on failure.

use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sysinfo::System;
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::config::{JarvisConfig, SystemConfig};

/// Cap on captured stdout/stderr.
const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

/// Refusals raised by the command gate before any shell is invoked.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SystemError {
    #[error("system access is disabled")]
    AccessDisabled,
    #[error("command '{0}' is not allowed")]
    CommandNotAllowed(String),
    #[error("command exceeds the maximum length of {0} characters")]
    CommandTooLong(usize),
    #[error("no command provided")]
    EmptyCommand,
}

/// Result of an executed shell command. `success` reflects the exit
/// status; stdout and stderr are always populated for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Point-in-time OS snapshot attached to language model requests.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub platform: &'static str,
    pub hostname: String,
    pub uptime_secs: u64,
    pub total_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub cpu_count: usize,
    pub load_average: [f64; 3],
}

/// Uniform process record across platforms.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub cpu_usage: f32,
    pub memory: u64,
}

pub struct SystemManager {
    system: SystemConfig,
    /// Execution timeout for allow-listed commands (milliseconds).
    response_timeout: u64,
}

impl SystemManager {
    pub fn new(jarvis: &JarvisConfig, system: &SystemConfig) -> Self {
        Self {
            system: system.clone(),
            response_timeout: jarvis.response_timeout,
        }
    }

    /// Check a command against the gate without executing it.
    pub fn authorize(&self, command: &str) -> std::result::Result<(), SystemError> {
        if !self.system.enable_system_access {
            return Err(SystemError::AccessDisabled);
        }
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(SystemError::EmptyCommand);
        }
        if trimmed.len() > self.system.max_command_length {
            return Err(SystemError::CommandTooLong(self.system.max_command_length));
        }
        let first_token = trimmed.split_whitespace().next().unwrap_or_default();
        if !self
            .system
            .allowed_commands
            .iter()
            .any(|allowed| allowed == first_token)
        {
            return Err(SystemError::CommandNotAllowed(first_token.to_string()));
        }
        Ok(())
    }

    /// Execute an allow-listed command under the system shell with the
    /// configured timeout. Authorization failures are typed errors;
    /// execution failures come back as a [`CommandOutcome`] with
    /// `success == false`.
    pub fn execute(&self, command: &str) -> std::result::Result<CommandOutcome, SystemError> {
        self.authorize(command)?;
        let trimmed = command.trim();
        log::info!("Executing command: {}", trimmed);
        match self.run_shell(trimmed) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!("Command execution failed: {e}");
                Ok(CommandOutcome {
                    success: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                })
            }
        }
    }

    fn run_shell(&self, command: &str) -> Result<CommandOutcome> {
        #[cfg(target_os = "windows")]
        let mut child = {
            let mut c = Command::new("cmd");
            c.args(["/C", command])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            c.spawn().context("failed to spawn shell command")?
        };
        #[cfg(not(target_os = "windows"))]
        let mut child = {
            let mut c = Command::new("sh");
            c.args(["-c", command])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            c.spawn().context("failed to spawn shell command")?
        };

        let timeout = Duration::from_millis(self.response_timeout);
        match child
            .wait_timeout(timeout)
            .context("failed to wait on shell command")?
        {
            Some(status) => {
                let output = child
                    .wait_with_output()
                    .context("failed to capture command output")?;
                let stdout = bounded_output(&output.stdout);
                let stderr = bounded_output(&output.stderr);
                Ok(CommandOutcome {
                    success: status.success(),
                    stdout,
                    stderr,
                })
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                log::warn!("Command timed out after {:?}: {}", timeout, command);
                Ok(CommandOutcome {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("command timed out after {}ms", self.response_timeout),
                })
            }
        }
    }

    /// Snapshot of the host for language model context.
    pub fn system_info(&self) -> SystemSnapshot {
        let mut sys = System::new_all();
        sys.refresh_all();
        let load = System::load_average();
        SystemSnapshot {
            platform: std::env::consts::OS,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            uptime_secs: System::uptime(),
            total_memory: sys.total_memory(),
            used_memory: sys.used_memory(),
            free_memory: sys.free_memory(),
            cpu_count: sys.cpus().len(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }

    /// Uniform process listing.
    pub fn processes(&self) -> Vec<ProcessRecord> {
        let mut sys = System::new_all();
        sys.refresh_all();
        sys.processes()
            .iter()
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                cpu_usage: process.cpu_usage(),
                memory: process.memory(),
            })
            .collect()
    }

    /// Force-kill a process by pid. Returns false when the process does
    /// not exist or refused the signal.
    pub fn kill_process(&self, pid: u32) -> bool {
        let mut sys = System::new_all();
        sys.refresh_all();
        match sys.process(sysinfo::Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => {
                log::warn!("No such process: {pid}");
                false
            }
        }
    }
}

fn bounded_output(bytes: &[u8]) -> String {
    let capped = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(capped).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(enable: bool, allowed: &[&str]) -> SystemManager {
        let mut system = SystemConfig::default();
        system.enable_system_access = enable;
        system.allowed_commands = allowed.iter().map(|s| s.to_string()).collect();
        SystemManager::new(&JarvisConfig::default(), &system)
    }

    #[test]
    fn disabled_access_rejects_even_allowed_commands() {
        let manager = manager(false, &["date"]);
        assert_eq!(manager.execute("date"), Err(SystemError::AccessDisabled));
    }

    #[test]
    fn unlisted_command_is_rejected_before_the_shell() {
        let manager = manager(true, &["date"]);
        assert_eq!(
            manager.execute("rm -rf /tmp/x"),
            Err(SystemError::CommandNotAllowed("rm".to_string()))
        );
    }

    #[test]
    fn gate_matches_the_first_token_only() {
        let manager = manager(true, &["date"]);
        // Arguments do not affect authorization.
        assert!(manager.authorize("date -u").is_ok());
        // Nor does an allow-listed word later in the command.
        assert!(manager.authorize("sudo date").is_err());
    }

    #[test]
    fn empty_and_oversized_commands_are_rejected() {
        let manager = manager(true, &["date"]);
        assert_eq!(manager.authorize("   "), Err(SystemError::EmptyCommand));
        let long = format!("date {}", "x".repeat(1000));
        assert_eq!(
            manager.authorize(&long),
            Err(SystemError::CommandTooLong(256))
        );
    }

    #[test]
    #[cfg(unix)]
    fn allowed_command_returns_structured_output() {
        let manager = manager(true, &["echo", "false"]);
        let outcome = manager.execute("echo hello").unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stdout, "hello");

        let outcome = manager.execute("false").unwrap();
        assert!(!outcome.success);
    }

    #[test]
    fn output_is_bounded() {
        let big = vec![b'a'; MAX_OUTPUT_BYTES + 100];
        let capped = bounded_output(&big);
        assert_eq!(capped.len(), MAX_OUTPUT_BYTES);
    }

    #[test]
    fn process_listing_includes_this_process() {
        let manager = manager(false, &[]);
        let me = std::process::id();
        let processes = manager.processes();
        assert!(!processes.is_empty());
        assert!(processes.iter().any(|p| p.pid == me));
    }

    #[test]
    fn killing_a_nonexistent_pid_returns_false() {
        let manager = manager(false, &[]);
        // Far above any platform's pid ceiling, yet still a valid i32.
        assert!(!manager.kill_process(2_000_000_000));
    }

    #[test]
    fn snapshot_reports_plausible_values() {
        let manager = manager(false, &[]);
        let info = manager.system_info();
        assert!(info.total_memory > 0);
        assert!(info.cpu_count > 0);
        assert_eq!(info.platform, std::env::consts::OS);
    }
}
