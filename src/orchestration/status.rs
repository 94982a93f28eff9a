//! Status report ledger and conflict resolution.
//!
//! Reports accumulate append-only; the latest per (project, agent,
//! category) is the active one. Detection runs category-specific
//! comparators over the active set and opens at most one conflict per
//! (project, category). Resolution consults a precedence policy: a ruled
//! winner demotes the losing reports to non-authoritative, anything the
//! policy declines goes to the Orchestrator. Resolving twice returns the
//! stored outcome unchanged.

use std::sync::Arc;

use crate::agent::AgentRole;
use crate::core::{Conflict, ConflictId, ReportCategory, Resolution, StatusReport};
use crate::orchestration::notify::{NotificationRouter, Priority};
use crate::store::Store;
use crate::{mlog, mlog_debug, Result};

/// Decides which role's report wins a contradiction in a category.
///
/// Returning `None` means the policy has no rule for this case, which
/// escalates instead of auto-resolving.
pub trait PrecedencePolicy: Send + Sync {
    fn winner(&self, category: ReportCategory, roles: &[AgentRole]) -> Option<AgentRole>;
}

/// The default static table.
///
/// Deployment disputes: the implementation role saw the build and the
/// dependency graph, the operational role only the rollout, so Developer
/// outranks Ops. Test disputes: the verification role outranks the
/// implementation role. Every other category has no rule and escalates.
pub struct RolePrecedence;

impl RolePrecedence {
    fn weight(category: ReportCategory, role: AgentRole) -> u8 {
        match category {
            ReportCategory::Deployment => match role {
                AgentRole::Developer => 2,
                AgentRole::Ops => 1,
                _ => 0,
            },
            ReportCategory::Testing => match role {
                AgentRole::Tester => 2,
                AgentRole::Developer => 1,
                _ => 0,
            },
            _ => 0,
        }
    }
}

impl PrecedencePolicy for RolePrecedence {
    fn winner(&self, category: ReportCategory, roles: &[AgentRole]) -> Option<AgentRole> {
        let mut best: Option<(AgentRole, u8)> = None;
        let mut tied = false;
        for role in roles {
            let w = Self::weight(category, *role);
            if w == 0 {
                // A participant the table says nothing about poisons the
                // ruling; escalate rather than guess.
                return None;
            }
            match best {
                Some((_, bw)) if w == bw => tied = true,
                Some((_, bw)) if w > bw => {
                    best = Some((*role, w));
                    tied = false;
                }
                None => best = Some((*role, w)),
                _ => {}
            }
        }
        if tied {
            return None;
        }
        best.map(|(role, _)| role)
    }
}

/// The append-only report ledger.
pub struct StatusStore {
    store: Arc<Store>,
}

impl StatusStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record a report and return its id. The previous report from the
    /// same (agent, category) is superseded, never deleted.
    pub fn record_report(&self, report: &StatusReport) -> Result<i64> {
        let id = self.store.insert_report(report)?;
        mlog_debug!(
            "Report #{} recorded: {} {} {} {}",
            id,
            report.project_id,
            report.agent_role,
            report.category,
            report.outcome
        );
        Ok(id)
    }

    /// The active (latest per agent+category) reports for a project.
    pub fn get_active_reports(&self, project_id: &str) -> Result<Vec<StatusReport>> {
        self.store.active_reports(project_id)
    }
}

pub struct ConflictResolver {
    store: Arc<Store>,
    policy: Box<dyn PrecedencePolicy>,
    router: Arc<NotificationRouter>,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<Store>,
        policy: Box<dyn PrecedencePolicy>,
        router: Arc<NotificationRouter>,
    ) -> Self {
        Self {
            store,
            policy,
            router,
        }
    }

    /// Scan a project's active reports and open (or extend) conflicts.
    ///
    /// At most one unresolved conflict exists per (project, category); a
    /// report arriving while one is open joins it instead of opening a
    /// second.
    pub fn detect_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>> {
        let active = self.store.active_reports(project_id)?;
        let mut opened = Vec::new();

        for category in ReportCategory::ALL {
            let in_category: Vec<&StatusReport> = active
                .iter()
                .filter(|r| r.category == category && r.authoritative)
                .collect();
            let conflicting = Self::conflicting_reports(category, &in_category);
            if conflicting.len() < 2 {
                continue;
            }
            let ids: Vec<i64> = conflicting.iter().map(|r| r.id).collect();

            match self.store.unresolved_conflict(project_id, category)? {
                Some(mut existing) => {
                    let mut merged = existing.report_ids.clone();
                    let mut grew = false;
                    for id in &ids {
                        if !merged.contains(id) {
                            merged.push(*id);
                            grew = true;
                        }
                    }
                    if grew {
                        self.store.update_conflict_reports(existing.id, &merged)?;
                        existing.report_ids = merged;
                        mlog_debug!(
                            "Conflict {} gained reports, now {:?}",
                            existing.id.short(),
                            existing.report_ids
                        );
                    }
                    opened.push(existing);
                }
                None => {
                    let conflict = Conflict::new(project_id, category, ids);
                    self.store.insert_conflict(&conflict)?;
                    mlog!(
                        "Conflict {} opened: project={} category={} reports={:?}",
                        conflict.id.short(),
                        project_id,
                        category,
                        conflict.report_ids
                    );
                    opened.push(conflict);
                }
            }
        }
        Ok(opened)
    }

    /// The comparator per category family.
    ///
    /// Outcome categories (deployment, testing, integration, timeline)
    /// conflict when two agents contradict each other about the same
    /// subject. The resource category conflicts when two agents claim the
    /// same identifier at all, contradiction or not.
    fn conflicting_reports<'a>(
        category: ReportCategory,
        reports: &[&'a StatusReport],
    ) -> Vec<&'a StatusReport> {
        let mut hits: Vec<&StatusReport> = Vec::new();
        for (i, a) in reports.iter().enumerate() {
            for b in reports.iter().skip(i + 1) {
                if a.agent_role == b.agent_role || !a.same_subject(b) {
                    continue;
                }
                let clash = match category {
                    ReportCategory::Resource => true,
                    _ => a.outcome.contradicts(&b.outcome),
                };
                if clash {
                    if !hits.iter().any(|r| r.id == a.id) {
                        hits.push(a);
                    }
                    if !hits.iter().any(|r| r.id == b.id) {
                        hits.push(b);
                    }
                }
            }
        }
        hits
    }

    /// Resolve a conflict. Idempotent: an already-resolved conflict
    /// returns its stored resolution without side effects.
    pub fn resolve(&self, conflict_id: ConflictId) -> Result<Resolution> {
        let conflict = self.store.get_conflict(conflict_id)?;
        if let Some(existing) = conflict.resolution {
            mlog_debug!(
                "Conflict {} already resolved: {}",
                conflict_id.short(),
                existing.summary()
            );
            return Ok(existing);
        }

        let reports: Vec<StatusReport> = conflict
            .report_ids
            .iter()
            .map(|id| self.store.get_report(*id))
            .collect::<Result<_>>()?;
        let roles: Vec<AgentRole> = reports.iter().map(|r| r.agent_role).collect();

        let resolution = match self.policy.winner(conflict.category, &roles) {
            Some(winner) => {
                let demoted: Vec<i64> = reports
                    .iter()
                    .filter(|r| r.agent_role != winner)
                    .map(|r| r.id)
                    .collect();
                for id in &demoted {
                    self.store.demote_report(*id)?;
                }
                let resolution = Resolution::Precedence {
                    winner_role: winner,
                    demoted_report_ids: demoted.clone(),
                    resolved_at: chrono::Utc::now(),
                };
                self.store.resolve_conflict(conflict.id, &resolution)?;
                mlog!(
                    "Conflict {} resolved by precedence: winner={} demoted={:?}",
                    conflict.id.short(),
                    winner,
                    demoted
                );

                let message = format!(
                    "{} conflict on project {} resolved: {} report stands, yours was \
                     marked non-authoritative",
                    conflict.category, conflict.project_id, winner
                );
                let losers: Vec<AgentRole> = reports
                    .iter()
                    .filter(|r| r.agent_role != winner)
                    .map(|r| r.agent_role)
                    .collect();
                self.router
                    .notify(&conflict.project_id, &losers, Priority::High, &message)?;
                self.router.notify(
                    &conflict.project_id,
                    &[AgentRole::Orchestrator],
                    Priority::Critical,
                    &message,
                )?;
                resolution
            }
            None => {
                let resolution = Resolution::Escalated {
                    to: AgentRole::Orchestrator,
                    resolved_at: chrono::Utc::now(),
                };
                self.store.resolve_conflict(conflict.id, &resolution)?;
                mlog!(
                    "Conflict {} escalated: no precedence rule for {} among {:?}",
                    conflict.id.short(),
                    conflict.category,
                    roles
                );
                self.router.notify(
                    &conflict.project_id,
                    &[AgentRole::Orchestrator],
                    Priority::Critical,
                    &format!(
                        "Unresolvable {} conflict on project {}: no precedence rule \
                         covers {:?}; manual ruling needed",
                        conflict.category, conflict.project_id, roles
                    ),
                )?;
                resolution
            }
        };
        Ok(resolution)
    }

    pub fn open_conflicts(&self) -> Result<Vec<Conflict>> {
        self.store.list_unresolved_conflicts()
    }
}
