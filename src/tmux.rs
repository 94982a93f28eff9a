use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::{mlog_debug, mlog_trace, mlog_warn, Error, Result};

/// Thin wrapper over the tmux CLI.
///
/// This is the only module that shells out; everything above it talks to
/// agents through the messaging traits. The core does not know or care how
/// tmux multiplexes the underlying terminals.
pub struct Tmux;

impl Tmux {
    pub fn create_session(name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cmd_str = cmd
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        mlog_debug!(
            "Tmux::create_session name={} cwd={} cmd={}",
            name,
            cwd.display(),
            cmd_str
        );
        let output = Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                name,
                "-c",
                &cwd.display().to_string(),
                &cmd_str,
            ])
            .output()?;

        if !output.status.success() {
            let err = format!(
                "Failed to create session '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            );
            mlog_warn!("tmux create_session failed: {}", err);
            return Err(Error::Tmux(err));
        }

        // Keep session alive when command exits
        let _ = Command::new("tmux")
            .args(["set-option", "-t", name, "remain-on-exit", "on"])
            .output();

        mlog_debug!("Tmux session created: {}", name);
        Ok(())
    }

    pub fn kill_session(name: &str) -> Result<()> {
        mlog_debug!("Tmux::kill_session name={}", name);
        let output = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("session not found") {
                mlog_warn!("Failed to kill tmux session '{}': {}", name, stderr);
                return Err(Error::Tmux(format!(
                    "Failed to kill session '{}': {}",
                    name, stderr
                )));
            }
            mlog_debug!("Tmux session '{}' not found (already dead?)", name);
        } else {
            mlog_debug!("Tmux session killed: {}", name);
        }
        Ok(())
    }

    /// Capture only the last N lines of a tmux pane.
    /// This is more efficient than capturing the entire pane and helps avoid
    /// false positives from historical output.
    pub fn capture_pane_tail(name: &str, lines: u16) -> Result<String> {
        // -S -N means "start N lines from the end"
        mlog_trace!("Tmux::capture_pane_tail name={} lines={}", name, lines);
        let start = format!("-{}", lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", name, "-p", "-S", &start])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to capture pane tail '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn session_exists(name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Send `keys` plus Enter to a pane, giving the tmux server at most
    /// `timeout` to accept them. A wedged server gets the child killed and
    /// a `SendTimeout` back instead of a hang.
    pub fn send_keys_enter(name: &str, keys: &str, timeout: Duration) -> Result<()> {
        mlog_debug!(
            "Tmux::send_keys_enter name={} keys={} timeout={:?}",
            name,
            keys,
            timeout
        );
        let mut cmd = Command::new("tmux");
        cmd.args(["send-keys", "-t", name, keys, "Enter"]);
        let status = run_bounded(&mut cmd, name, timeout)?;
        if !status.success() {
            mlog_warn!("Failed to send keys to '{}'", name);
            return Err(Error::Tmux(format!("Failed to send keys to '{}'", name)));
        }
        Ok(())
    }

    pub fn list_sessions() -> Result<Vec<String>> {
        mlog_trace!("Tmux::list_sessions");
        let output = Command::new("tmux")
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()?;
        if !output.status.success() {
            mlog_debug!("No tmux sessions found");
            return Ok(Vec::new());
        }
        let sessions: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect();
        mlog_trace!("list_sessions: found {} sessions", sessions.len());
        Ok(sessions)
    }

    pub fn list_marshal_sessions() -> Result<Vec<String>> {
        let sessions: Vec<String> = Self::list_sessions()?
            .into_iter()
            .filter(|s| s.starts_with("marshal_"))
            .collect();
        mlog_debug!(
            "list_marshal_sessions: found {} marshal sessions",
            sessions.len()
        );
        Ok(sessions)
    }

    /// Get window activity timestamp (Unix timestamp of last activity).
    pub fn pane_activity(name: &str) -> Result<u64> {
        let output = Command::new("tmux")
            .args(["display-message", "-t", name, "-p", "#{window_activity}"])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to get window activity for '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let timestamp_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
        timestamp_str.parse::<u64>().map_err(|_| {
            Error::Tmux(format!(
                "Invalid window activity timestamp: {}",
                timestamp_str
            ))
        })
    }

    pub fn is_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn version() -> Result<String> {
        let output = Command::new("tmux").arg("-V").output()?;
        if !output.status.success() {
            return Err(Error::Tmux("Failed to get tmux version".to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn session_name(project_id: &str, role: &str) -> String {
        format!(
            "marshal_{}_{}",
            sanitize_session_name(project_id),
            sanitize_session_name(role)
        )
    }
}

/// Run a child process with a hard deadline. On expiry the child is
/// killed and the caller gets a `SendTimeout` naming `target`.
fn run_bounded(
    cmd: &mut Command,
    target: &str,
    timeout: Duration,
) -> Result<std::process::ExitStatus> {
    let mut child = cmd.stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            mlog_warn!("'{}' still pending after {:?}", target, timeout);
            return Err(Error::SendTimeout {
                target: target.to_string(),
                timeout,
            });
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn shell_escape(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
