//! Schedule events and cycle detections.
//!
//! Every dispatch appends a `ScheduleEvent`; the cycle detector consumes the
//! stream incrementally and emits a `CycleEvent` whenever a pathological
//! pattern is recognized. Both logs are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::Error;

/// Why a dispatch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Ordinary scheduled check-in.
    Normal,
    /// Unplanned dispatch reacting to a detected problem.
    Emergency,
    /// Dispatch attempting to restore a stuck or failed agent.
    Recovery,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Normal => "normal",
            TriggerKind::Emergency => "emergency",
            TriggerKind::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TriggerKind::Normal),
            "emergency" => Ok(TriggerKind::Emergency),
            "recovery" => Ok(TriggerKind::Recovery),
            other => Err(Error::Validation(format!("Unknown trigger kind: {}", other))),
        }
    }
}

/// One entry in the append-only dispatch log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    /// Store rowid; 0 until persisted.
    pub id: i64,
    pub project_id: String,
    pub agent_role: AgentRole,
    pub fired_at: DateTime<Utc>,
    /// Interval the dispatch asked for next, if recurring.
    pub interval_requested_secs: Option<u64>,
    pub trigger_kind: TriggerKind,
}

impl ScheduleEvent {
    pub fn new(
        project_id: &str,
        agent_role: AgentRole,
        interval_requested_secs: Option<u64>,
        trigger_kind: TriggerKind,
    ) -> Self {
        Self {
            id: 0,
            project_id: project_id.to_string(),
            agent_role,
            fired_at: Utc::now(),
            interval_requested_secs,
            trigger_kind,
        }
    }

    /// Key identifying the (project, agent) the event belongs to.
    pub fn target_key(&self) -> String {
        format!("{}:{}", self.project_id, self.agent_role)
    }
}

/// The pattern class a detection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// Same target rescheduled too many times in a short window.
    RapidReschedule,
    /// Same target firing at an identical interval with no state change.
    FixedIntervalLoop,
    /// Emergency and recovery dispatches alternating without a normal one.
    Oscillation,
    /// Agents blocking each other in the wait graph.
    DependencyCycle,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::RapidReschedule => "rapid_reschedule",
            CycleKind::FixedIntervalLoop => "fixed_interval_loop",
            CycleKind::Oscillation => "oscillation",
            CycleKind::DependencyCycle => "dependency_cycle",
        }
    }
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Corrective action taken when a cycle was detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum CycleAction {
    /// Pending duplicate tasks for the target were disabled.
    CancelledDuplicates { count: usize },
    /// The next interval was jittered away from the repeating value.
    JitteredInterval { from_secs: u64, to_secs: u64 },
    /// Auto-recovery stopped; a supervising role was told to look.
    Escalated { to: AgentRole },
    /// One blocking edge in the wait graph was cleared.
    ClearedEdge {
        blocked: AgentRole,
        blocker: AgentRole,
    },
}

/// A single cycle detection, persisted for audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    pub kind: CycleKind,
    pub project_id: String,
    /// Human-readable account of what was observed.
    pub evidence: String,
    pub action_taken: CycleAction,
    pub detected_at: DateTime<Utc>,
}

impl CycleEvent {
    pub fn new(
        kind: CycleKind,
        project_id: &str,
        evidence: &str,
        action_taken: CycleAction,
    ) -> Self {
        Self {
            kind,
            project_id: project_id.to_string(),
            evidence: evidence.to_string(),
            action_taken,
            detected_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kind_roundtrip() {
        for kind in [
            TriggerKind::Normal,
            TriggerKind::Emergency,
            TriggerKind::Recovery,
        ] {
            let parsed: TriggerKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_trigger_kind_unknown() {
        let result: Result<TriggerKind, _> = "panic".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_schedule_event_target_key() {
        let event = ScheduleEvent::new("billing", AgentRole::Tester, Some(300), TriggerKind::Normal);
        assert_eq!(event.target_key(), "billing:tester");
    }

    #[test]
    fn test_cycle_event_serialization() {
        let event = CycleEvent::new(
            CycleKind::FixedIntervalLoop,
            "billing",
            "3 consecutive dispatches at 300s",
            CycleAction::JitteredInterval {
                from_secs: 300,
                to_secs: 347,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: CycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_cycle_kind_display() {
        assert_eq!(CycleKind::Oscillation.to_string(), "oscillation");
        assert_eq!(
            CycleKind::DependencyCycle.to_string(),
            "dependency_cycle"
        );
    }
}
