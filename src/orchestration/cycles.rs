//! Scheduling-pathology detection over the event log.
//!
//! Four pattern classes, each with a corrective action that runs the
//! moment the pattern is confirmed: rapid reschedule (cancel the
//! duplicates), fixed-interval lockstep (jitter the next interval),
//! emergency/recovery oscillation (stop auto-recovering, escalate), and
//! dependency cycles in the agent wait-graph (break one edge, tell both
//! sides). Every detection persists a `CycleEvent` with the evidence that
//! triggered it; recurrence past the logged record is the operator's cue
//! that the correction is not sticking.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rand::Rng;

use crate::agent::AgentRole;
use crate::config::Config;
use crate::core::{
    CycleAction, CycleEvent, CycleKind, ReportOutcome, ScheduleEvent, TriggerKind,
};
use crate::orchestration::notify::{NotificationRouter, Priority};
use crate::store::Store;
use crate::{mlog, mlog_debug, mlog_warn, Result};

pub struct CycleDetector {
    store: Arc<Store>,
    router: Arc<NotificationRouter>,
    config: Config,
}

impl CycleDetector {
    pub fn new(store: Arc<Store>, router: Arc<NotificationRouter>, config: Config) -> Self {
        Self {
            store,
            router,
            config,
        }
    }

    /// Evaluate every pattern for one (project, agent) after a new event
    /// lands. Returns the detections made on this pass.
    pub fn observe(&self, event: &ScheduleEvent) -> Result<Vec<CycleEvent>> {
        let mut detections = Vec::new();
        let since = Utc::now() - self.config.rapid_window();
        let recent = self
            .store
            .events_for_target_since(&event.project_id, event.agent_role, since)?;

        if let Some(found) = self.check_rapid_reschedule(event, &recent)? {
            detections.push(found);
        }
        if let Some(found) = self.check_fixed_interval(event, &recent)? {
            detections.push(found);
        }
        if let Some(found) = self.check_oscillation(event, &recent)? {
            detections.push(found);
        }
        if let Some(found) = self.check_dependency_cycle(&event.project_id)? {
            detections.push(found);
        }

        for detection in &detections {
            self.store.append_cycle_event(detection)?;
            mlog!(
                "Cycle detected: {} project={} evidence=\"{}\" action={:?}",
                detection.kind,
                detection.project_id,
                detection.evidence,
                detection.action_taken
            );
        }
        Ok(detections)
    }

    /// More than `rapid_reschedule_threshold` events for one target inside
    /// the rolling window. Correction: cancel the pending duplicates,
    /// keeping the earliest.
    fn check_rapid_reschedule(
        &self,
        event: &ScheduleEvent,
        recent: &[ScheduleEvent],
    ) -> Result<Option<CycleEvent>> {
        let threshold = self.config.rapid_reschedule_threshold;
        if recent.len() <= threshold {
            return Ok(None);
        }

        let mut pending = self
            .store
            .pending_tasks_for_agent(&event.project_id, event.agent_role)?;
        if pending.len() <= 1 {
            // Pattern seen but nothing left to cancel; still worth the
            // audit row since the churn itself is the finding.
            return Ok(Some(CycleEvent::new(
                CycleKind::RapidReschedule,
                &event.project_id,
                &format!(
                    "{} events for {} within {}s, no duplicates pending",
                    recent.len(),
                    event.target_key(),
                    self.config.rapid_window_secs
                ),
                CycleAction::CancelledDuplicates { count: 0 },
            )));
        }

        // Keep the earliest, cancel the rest.
        pending.sort_by_key(|t| t.scheduled_at);
        let mut cancelled = 0usize;
        for task in pending.iter_mut().skip(1) {
            task.disable("cancelled as rapid-reschedule duplicate");
            self.store.update_task(task)?;
            cancelled += 1;
        }
        mlog_warn!(
            "Rapid reschedule on {}: cancelled {} duplicate tasks",
            event.target_key(),
            cancelled
        );
        Ok(Some(CycleEvent::new(
            CycleKind::RapidReschedule,
            &event.project_id,
            &format!(
                "{} events for {} within {}s",
                recent.len(),
                event.target_key(),
                self.config.rapid_window_secs
            ),
            CycleAction::CancelledDuplicates { count: cancelled },
        )))
    }

    /// `fixed_interval_threshold` consecutive events requesting the exact
    /// same interval, all normal-kind. Correction: return a jittered
    /// interval for the scheduler to apply to the next recurrence.
    fn check_fixed_interval(
        &self,
        event: &ScheduleEvent,
        recent: &[ScheduleEvent],
    ) -> Result<Option<CycleEvent>> {
        let threshold = self.config.fixed_interval_threshold;
        let interval = match event.interval_requested_secs {
            Some(secs) => secs,
            None => return Ok(None),
        };

        let run = recent
            .iter()
            .rev()
            .take_while(|e| {
                e.interval_requested_secs == Some(interval)
                    && e.trigger_kind == TriggerKind::Normal
            })
            .count();
        if run < threshold {
            return Ok(None);
        }

        let jittered = Self::jitter_interval(interval);
        mlog_debug!(
            "Fixed-interval lockstep on {}: {}x {}s, jittering to {}s",
            event.target_key(),
            run,
            interval,
            jittered
        );
        Ok(Some(CycleEvent::new(
            CycleKind::FixedIntervalLoop,
            &event.project_id,
            &format!(
                "{} consecutive {}s intervals for {}",
                run,
                interval,
                event.target_key()
            ),
            CycleAction::JitteredInterval {
                from_secs: interval,
                to_secs: jittered,
            },
        )))
    }

    /// Perturb an interval by up to ±20%, clamped to at least a second.
    fn jitter_interval(interval: u64) -> u64 {
        let spread = (interval / 5).max(1);
        let offset = rand::rng().random_range(0..=spread * 2) as i64 - spread as i64;
        (interval as i64 + offset).max(1) as u64
    }

    /// Alternating emergency/recovery triggers past the threshold with no
    /// normal-kind event in between. Auto-recovery is clearly not fixing
    /// the root cause; hand it upward.
    fn check_oscillation(
        &self,
        event: &ScheduleEvent,
        recent: &[ScheduleEvent],
    ) -> Result<Option<CycleEvent>> {
        let threshold = self.config.oscillation_threshold;
        let mut alternations = 0usize;
        let mut prev: Option<TriggerKind> = None;
        for e in recent.iter().rev() {
            match e.trigger_kind {
                TriggerKind::Normal => break,
                kind => {
                    if let Some(p) = prev {
                        if p != kind {
                            alternations += 1;
                        }
                    }
                    prev = Some(kind);
                }
            }
        }
        if alternations < threshold {
            return Ok(None);
        }

        let to = event
            .agent_role
            .escalation_target()
            .unwrap_or(AgentRole::Orchestrator);
        self.router.notify(
            &event.project_id,
            &[to],
            Priority::Critical,
            &format!(
                "Emergency/recovery oscillation on {}: {} alternations without a \
                 normal dispatch; auto-recovery suspended pending review",
                event.target_key(),
                alternations
            ),
        )?;
        Ok(Some(CycleEvent::new(
            CycleKind::Oscillation,
            &event.project_id,
            &format!(
                "{} emergency/recovery alternations for {}",
                alternations,
                event.target_key()
            ),
            CycleAction::Escalated { to },
        )))
    }

    /// Cycle search over the blocking wait-graph.
    ///
    /// An authoritative report with outcome `Blocked` whose subject names
    /// another role is a directed edge reporter -> blocker. Any strongly
    /// connected component larger than one node is a deadlock; the edge
    /// leaving the lowest-ranked member is cleared (its Blocked report is
    /// demoted) and both endpoints are told.
    fn check_dependency_cycle(&self, project_id: &str) -> Result<Option<CycleEvent>> {
        let reports = self.store.active_reports(project_id)?;
        let mut graph: DiGraph<AgentRole, i64> = DiGraph::new();
        let mut nodes: HashMap<AgentRole, NodeIndex> = HashMap::new();

        for report in &reports {
            if report.outcome != ReportOutcome::Blocked || !report.authoritative {
                continue;
            }
            let blocker = match report.subject.as_deref().and_then(|s| s.parse().ok()) {
                Some(role) if role != report.agent_role => role,
                _ => continue,
            };
            let from = *nodes
                .entry(report.agent_role)
                .or_insert_with(|| graph.add_node(report.agent_role));
            let to = *nodes
                .entry(blocker)
                .or_insert_with(|| graph.add_node(blocker));
            graph.add_edge(from, to, report.id);
        }

        let cycle: Vec<NodeIndex> = match tarjan_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1)
        {
            Some(scc) => scc,
            None => return Ok(None),
        };
        let members: Vec<AgentRole> = cycle.iter().map(|n| graph[*n]).collect();

        // Break the edge leaving the lowest-ranked member of the cycle.
        let weakest = *cycle
            .iter()
            .min_by_key(|n| graph[**n].rank())
            .ok_or_else(|| crate::Error::Validation("empty cycle component".into()))?;
        let (blocker_node, report_id) = graph
            .edges(weakest)
            .find(|e| cycle.contains(&e.target()))
            .map(|e| (e.target(), *e.weight()))
            .ok_or_else(|| crate::Error::Validation("cycle member without edge".into()))?;
        let blocked = graph[weakest];
        let blocker = graph[blocker_node];
        self.store.demote_report(report_id)?;

        mlog_warn!(
            "Dependency cycle among {:?}: cleared {} -> {} (report #{})",
            members,
            blocked,
            blocker,
            report_id
        );
        self.router.notify(
            project_id,
            &[blocked, blocker],
            Priority::High,
            &format!(
                "Wait cycle detected among {:?}; the {} -> {} blocking claim was \
                 cleared, re-report if still stuck",
                members, blocked, blocker
            ),
        )?;
        Ok(Some(CycleEvent::new(
            CycleKind::DependencyCycle,
            project_id,
            &format!("wait cycle among {:?}", members),
            CycleAction::ClearedEdge { blocked, blocker },
        )))
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<CycleEvent>> {
        self.store.recent_cycle_events(limit)
    }
}
