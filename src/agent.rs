//! Agent roles and the fixed escalation chain.
//!
//! The system assumes a small closed catalogue of roles. Each role carries a
//! precedence rank used both for conflict resolution and for choosing which
//! wait-graph edge to break, plus a position in the escalation chain that
//! the notification router walks upward.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Role of an agent within a project.
///
/// The catalogue is closed on purpose: an unknown role string at any
/// boundary is a validation error, never a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Top-level supervising hub. All critical traffic is duplicated here.
    Orchestrator,
    /// Coordinates one project's agents.
    ProjectManager,
    /// Implementation role; has code-level visibility.
    Developer,
    /// Verification role; owns test outcomes.
    Tester,
    /// Operational role; deploys and runs infrastructure.
    Ops,
}

impl AgentRole {
    /// All roles, supervising hub first.
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Orchestrator,
        AgentRole::ProjectManager,
        AgentRole::Developer,
        AgentRole::Tester,
        AgentRole::Ops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::ProjectManager => "project_manager",
            AgentRole::Developer => "developer",
            AgentRole::Tester => "tester",
            AgentRole::Ops => "ops",
        }
    }

    /// Precedence rank, higher outranks lower.
    ///
    /// Used to pick which blocking edge to clear when a dependency cycle is
    /// broken. Conflict resolution uses the per-category table in the
    /// resolver instead, since seniority there depends on the dispute.
    pub fn rank(&self) -> u8 {
        match self {
            AgentRole::Orchestrator => 4,
            AgentRole::ProjectManager => 3,
            AgentRole::Developer => 2,
            AgentRole::Tester => 2,
            AgentRole::Ops => 1,
        }
    }

    /// Next role up the fixed escalation chain, `None` at the top.
    pub fn escalation_target(&self) -> Option<AgentRole> {
        match self {
            AgentRole::Orchestrator => None,
            AgentRole::ProjectManager => Some(AgentRole::Orchestrator),
            AgentRole::Developer | AgentRole::Tester | AgentRole::Ops => {
                Some(AgentRole::ProjectManager)
            }
        }
    }

    /// Tmux session name for this role within a project.
    pub fn session_name(&self, project_id: &str) -> String {
        crate::tmux::Tmux::session_name(project_id, self.as_str())
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(AgentRole::Orchestrator),
            "project_manager" => Ok(AgentRole::ProjectManager),
            "developer" => Ok(AgentRole::Developer),
            "tester" => Ok(AgentRole::Tester),
            "ops" => Ok(AgentRole::Ops),
            other => Err(Error::UnknownRole(other.to_string())),
        }
    }
}
