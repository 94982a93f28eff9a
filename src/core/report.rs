//! Status reports and conflicts between them.
//!
//! Agents self-report outcomes per category. Reports are append-only; the
//! latest report per (project, agent, category) is the active one. When two
//! active reports contradict each other a `Conflict` is opened, and the
//! resolver later appends a `Resolution` to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentRole;
use crate::Error;

/// Category of a status report.
///
/// Closed enumeration: an unrecognized category string at the store boundary
/// is a hard error so that an unhandled category can never slip through as a
/// silent string fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportCategory {
    Deployment,
    Testing,
    Integration,
    Resource,
    Timeline,
}

impl ReportCategory {
    pub const ALL: [ReportCategory; 5] = [
        ReportCategory::Deployment,
        ReportCategory::Testing,
        ReportCategory::Integration,
        ReportCategory::Resource,
        ReportCategory::Timeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportCategory::Deployment => "deployment",
            ReportCategory::Testing => "testing",
            ReportCategory::Integration => "integration",
            ReportCategory::Resource => "resource",
            ReportCategory::Timeline => "timeline",
        }
    }
}

impl std::fmt::Display for ReportCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReportCategory {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deployment" => Ok(ReportCategory::Deployment),
            "testing" => Ok(ReportCategory::Testing),
            "integration" => Ok(ReportCategory::Integration),
            "resource" => Ok(ReportCategory::Resource),
            "timeline" => Ok(ReportCategory::Timeline),
            other => Err(Error::UnknownCategory(other.to_string())),
        }
    }
}

/// Reported outcome for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Success,
    Failure,
    Blocked,
    InProgress,
}

impl ReportOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Success => "success",
            ReportOutcome::Failure => "failure",
            ReportOutcome::Blocked => "blocked",
            ReportOutcome::InProgress => "in_progress",
        }
    }

    /// Success and failure are the contradictory pair the comparators check.
    pub fn contradicts(&self, other: &ReportOutcome) -> bool {
        matches!(
            (self, other),
            (ReportOutcome::Success, ReportOutcome::Failure)
                | (ReportOutcome::Failure, ReportOutcome::Success)
        )
    }
}

impl std::fmt::Display for ReportOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReportOutcome {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ReportOutcome::Success),
            "failure" => Ok(ReportOutcome::Failure),
            "blocked" => Ok(ReportOutcome::Blocked),
            "in_progress" => Ok(ReportOutcome::InProgress),
            other => Err(Error::Validation(format!("Unknown outcome: {}", other))),
        }
    }
}

/// One agent's self-reported status for a category.
///
/// Never deleted, only superseded. The `subject` carries the structured part
/// of the report: the deliverable a deployment/testing report is about, or
/// the identifier a resource report claims exclusively (e.g. a port).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Store rowid; 0 until persisted.
    pub id: i64,
    pub project_id: String,
    pub agent_role: AgentRole,
    pub category: ReportCategory,
    pub outcome: ReportOutcome,
    /// Deliverable or claimed resource identifier this report is about.
    pub subject: Option<String>,
    /// Free-form outcome description.
    pub detail: String,
    pub reported_at: DateTime<Utc>,
    /// Cleared when a resolution rules against this report.
    pub authoritative: bool,
}

impl StatusReport {
    pub fn new(
        project_id: &str,
        agent_role: AgentRole,
        category: ReportCategory,
        outcome: ReportOutcome,
        subject: Option<&str>,
        detail: &str,
    ) -> Self {
        Self {
            id: 0,
            project_id: project_id.to_string(),
            agent_role,
            category,
            outcome,
            subject: subject.map(String::from),
            detail: detail.to_string(),
            reported_at: Utc::now(),
            authoritative: true,
        }
    }

    /// Whether two reports talk about the same deliverable/resource.
    pub fn same_subject(&self, other: &StatusReport) -> bool {
        self.subject.is_some() && self.subject == other.subject
    }
}

/// Unique identifier for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum Resolution {
    /// A precedence rule picked a winning role; the other reports were
    /// demoted to non-authoritative.
    Precedence {
        winner_role: AgentRole,
        demoted_report_ids: Vec<i64>,
        resolved_at: DateTime<Utc>,
    },
    /// No rule covered this dispute; handed to a supervising role.
    Escalated {
        to: AgentRole,
        resolved_at: DateTime<Utc>,
    },
}

impl Resolution {
    pub fn summary(&self) -> String {
        match self {
            Resolution::Precedence { winner_role, .. } => {
                format!("precedence: {} wins", winner_role)
            }
            Resolution::Escalated { to, .. } => format!("escalated to {}", to),
        }
    }
}

/// A detected contradiction between active reports in one category.
///
/// Immutable once resolved except for the appended `resolution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub project_id: String,
    pub category: ReportCategory,
    /// Participating report ids, in report order.
    pub report_ids: Vec<i64>,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn new(project_id: &str, category: ReportCategory, report_ids: Vec<i64>) -> Self {
        Self {
            id: ConflictId::new(),
            project_id: project_id.to_string(),
            category,
            report_ids,
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}
