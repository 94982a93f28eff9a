//! Seams to the world outside the store.
//!
//! Three traits cover everything the control plane assumes about its
//! environment: delivering text into an agent's pane, judging whether a
//! project looks finished, and checking whether a session is alive. The
//! production impls shell out to tmux; tests substitute in-memory doubles.

use std::time::Duration;

use crate::agent::AgentRole;
use crate::core::TaskTarget;
use crate::tmux::Tmux;
use crate::{mlog_debug, mlog_trace, Result};

/// Outcome of a message send. `Timeout` is retryable; the transport made
/// no claim about whether the text arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Timeout,
}

/// What the completion judgment said about a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Yes,
    No,
    Unknown,
}

/// A verdict with how sure the oracle is about it, 0.0 to 1.0. Callers
/// treat low-confidence answers the same as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub confidence: f64,
}

impl Assessment {
    pub fn new(verdict: Verdict, confidence: f64) -> Self {
        Self {
            verdict,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Whether this is a confident YES.
    pub fn is_complete(&self) -> bool {
        self.verdict == Verdict::Yes && self.confidence >= 0.5
    }
}

/// Delivers text into an agent's pane.
pub trait AgentMessenger: Send + Sync {
    /// Send `text` to the agent's window, bounded by `timeout`.
    fn send(
        &self,
        project_id: &str,
        role: AgentRole,
        window: u32,
        text: &str,
        timeout: Duration,
    ) -> Result<Delivery>;
}

/// Judges whether a project's work looks finished. A fallible black box;
/// `Unknown` answers are expected and handled upstream.
pub trait CompletionOracle: Send + Sync {
    fn is_project_complete(&self, project_id: &str, recent_output: &str) -> Result<Assessment>;
}

/// Answers observation questions about agent sessions.
pub trait SessionLiveness: Send + Sync {
    fn is_session_alive(&self, session: &str) -> bool;

    /// Unix timestamp of the last pane activity, if the session exists.
    fn last_activity(&self, session: &str) -> Result<Option<u64>>;

    /// Tail of the session's pane output, for completion judgment.
    fn capture_tail(&self, session: &str, lines: u16) -> Result<String>;
}

// ---------- tmux-backed production impls ----------

/// Sends via `tmux send-keys` into the target session's window.
pub struct TmuxMessenger;

impl AgentMessenger for TmuxMessenger {
    fn send(
        &self,
        project_id: &str,
        role: AgentRole,
        window: u32,
        text: &str,
        timeout: Duration,
    ) -> Result<Delivery> {
        let pane = TaskTarget::new(project_id, role, window).pane();
        mlog_debug!("TmuxMessenger::send pane={} len={}", pane, text.len());
        // A transport failure is retryable from the scheduler's view,
        // whether the server refused the keys or took too long.
        match Tmux::send_keys_enter(&pane, text, timeout) {
            Ok(()) => Ok(Delivery::Ack),
            Err(e) => {
                mlog_trace!("send-keys failed for {}: {}", pane, e);
                Ok(Delivery::Timeout)
            }
        }
    }
}

/// Marker-scanning oracle over captured pane output.
///
/// Looks at the tail of the pane for explicit completion or blocker
/// phrases. Confidence reflects how unambiguous the markers are; absent
/// any marker the verdict is Unknown.
pub struct MarkerOracle;

const COMPLETE_MARKERS: &[&str] = &[
    "all tasks complete",
    "project complete",
    "nothing left to do",
    "all done",
    "work is finished",
];

const ACTIVE_MARKERS: &[&str] = &[
    "in progress",
    "working on",
    "still running",
    "blocked on",
    "waiting for",
    "error:",
    "failed",
];

impl CompletionOracle for MarkerOracle {
    fn is_project_complete(&self, project_id: &str, recent_output: &str) -> Result<Assessment> {
        let lower = recent_output.to_lowercase();
        let complete_hits = COMPLETE_MARKERS
            .iter()
            .filter(|m| lower.contains(*m))
            .count();
        let active_hits = ACTIVE_MARKERS.iter().filter(|m| lower.contains(*m)).count();

        let assessment = if complete_hits > 0 && active_hits == 0 {
            Assessment::new(Verdict::Yes, 0.6 + 0.1 * complete_hits.min(3) as f64)
        } else if active_hits > 0 && complete_hits == 0 {
            Assessment::new(Verdict::No, 0.6 + 0.1 * active_hits.min(3) as f64)
        } else {
            // Nothing, or contradictory markers in the same capture.
            Assessment::new(Verdict::Unknown, 0.0)
        };
        mlog_trace!(
            "MarkerOracle project={} verdict={:?} confidence={:.2}",
            project_id,
            assessment.verdict,
            assessment.confidence
        );
        Ok(assessment)
    }
}

/// Liveness via `tmux has-session` and `#{window_activity}`.
pub struct TmuxSessions;

impl SessionLiveness for TmuxSessions {
    fn is_session_alive(&self, session: &str) -> bool {
        Tmux::session_exists(session)
    }

    fn last_activity(&self, session: &str) -> Result<Option<u64>> {
        if !Tmux::session_exists(session) {
            return Ok(None);
        }
        Tmux::pane_activity(session).map(Some)
    }

    fn capture_tail(&self, session: &str, lines: u16) -> Result<String> {
        Tmux::capture_pane_tail(session, lines)
    }
}
