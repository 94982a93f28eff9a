//! Priority-routed notifications between agents.
//!
//! Every message carries a priority on a fixed ladder. CRITICAL and above
//! always land on the Orchestrator too, whether or not it was addressed.
//! A delivery that times out walks the escalation chain upward with the
//! priority bumped one step per hop, so a stuck agent cannot swallow an
//! alert. Every attempt, delivered or not, goes to the audit table.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentRole;
use crate::core::{ScheduleEvent, TriggerKind};
use crate::orchestration::messaging::{AgentMessenger, Delivery};
use crate::store::Store;
use crate::{mlog, mlog_debug, mlog_warn, Result};

/// The priority ladder. Ordering is total: LOW < MEDIUM < HIGH < CRITICAL
/// < EMERGENCY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
            Priority::Emergency => "EMERGENCY",
        }
    }

    /// One step up the ladder; EMERGENCY stays EMERGENCY.
    pub fn bump(&self) -> Priority {
        match self {
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High => Priority::Critical,
            Priority::Critical => Priority::Emergency,
            Priority::Emergency => Priority::Emergency,
        }
    }

    /// CRITICAL and above is always duplicated to the supervising hub.
    pub fn requires_hub(&self) -> bool {
        *self >= Priority::Critical
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct NotificationRouter {
    store: Arc<Store>,
    messenger: Arc<dyn AgentMessenger>,
    send_timeout: Duration,
}

impl NotificationRouter {
    pub fn new(store: Arc<Store>, messenger: Arc<dyn AgentMessenger>, send_timeout: Duration) -> Self {
        Self {
            store,
            messenger,
            send_timeout,
        }
    }

    /// Deliver `message` to each recipient at `priority`.
    ///
    /// The effective recipient set is deduplicated and, at CRITICAL or
    /// above, always includes the Orchestrator. Each recipient gets its
    /// own escalation chain; one stuck recipient never blocks the others.
    pub fn notify(
        &self,
        project_id: &str,
        recipients: &[AgentRole],
        priority: Priority,
        message: &str,
    ) -> Result<()> {
        let mut targets: Vec<AgentRole> = Vec::new();
        for role in recipients {
            if !targets.contains(role) {
                targets.push(*role);
            }
        }
        if priority.requires_hub() && !targets.contains(&AgentRole::Orchestrator) {
            targets.push(AgentRole::Orchestrator);
        }

        mlog_debug!(
            "notify project={} priority={} recipients={:?}",
            project_id,
            priority,
            targets
        );
        for role in &targets {
            self.deliver_escalating(project_id, *role, priority, message)?;
        }
        Ok(())
    }

    /// Send to one recipient, walking the escalation chain on timeout.
    fn deliver_escalating(
        &self,
        project_id: &str,
        first: AgentRole,
        priority: Priority,
        message: &str,
    ) -> Result<()> {
        let mut role = first;
        let mut level = priority;
        loop {
            let text = format!("[{}] {}", level, message);
            let delivery =
                self.messenger
                    .send(project_id, role, 0, &text, self.send_timeout)?;
            match delivery {
                Delivery::Ack => {
                    self.store
                        .append_notification(level, &[role], message, "ack")?;
                    if level == Priority::Emergency {
                        // An emergency intervention reaching an agent is an
                        // emergency trigger of that agent; the cycle
                        // detector watches for these alternating with
                        // recovery dispatches.
                        self.store.append_schedule_event(&ScheduleEvent::new(
                            project_id,
                            role,
                            None,
                            TriggerKind::Emergency,
                        ))?;
                    }
                    return Ok(());
                }
                Delivery::Timeout => {
                    self.store
                        .append_notification(level, &[role], message, "timeout")?;
                    match role.escalation_target() {
                        Some(next) => {
                            mlog!(
                                "Notification to {} timed out; escalating to {} at {}",
                                role,
                                next,
                                level.bump()
                            );
                            role = next;
                            level = level.bump();
                        }
                        None => {
                            // Top of the chain unreachable. Nothing above
                            // to wake; the audit row is the record.
                            mlog_warn!(
                                "Notification undelivered at top of chain (project={}, priority={}): {}",
                                project_id,
                                level,
                                message
                            );
                            self.store
                                .append_notification(level, &[role], message, "undelivered")?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<String>> {
        self.store.recent_notifications(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    /// Scripted messenger: records every send and answers from a per-role
    /// script, defaulting to Ack.
    struct ScriptedMessenger {
        log: Mutex<Vec<(AgentRole, String)>>,
        timeouts: Vec<AgentRole>,
    }

    impl ScriptedMessenger {
        fn new(timeouts: Vec<AgentRole>) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                timeouts,
            }
        }

        fn sends(&self) -> Vec<(AgentRole, String)> {
            self.log.lock().unwrap().clone()
        }
    }

    impl AgentMessenger for ScriptedMessenger {
        fn send(
            &self,
            _project_id: &str,
            role: AgentRole,
            _window: u32,
            text: &str,
            _timeout: Duration,
        ) -> Result<Delivery> {
            self.log
                .lock()
                .map_err(|_| Error::Validation("poisoned".into()))?
                .push((role, text.to_string()));
            if self.timeouts.contains(&role) {
                Ok(Delivery::Timeout)
            } else {
                Ok(Delivery::Ack)
            }
        }
    }

    fn router(messenger: Arc<ScriptedMessenger>) -> (NotificationRouter, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        (
            NotificationRouter::new(store.clone(), messenger, Duration::from_secs(5)),
            store,
        )
    }

    // ========== Priority Tests ==========

    #[test]
    fn test_priority_ladder_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert!(Priority::Critical < Priority::Emergency);
    }

    #[test]
    fn test_bump_saturates_at_emergency() {
        assert_eq!(Priority::High.bump(), Priority::Critical);
        assert_eq!(Priority::Emergency.bump(), Priority::Emergency);
    }

    #[test]
    fn test_hub_threshold() {
        assert!(!Priority::High.requires_hub());
        assert!(Priority::Critical.requires_hub());
        assert!(Priority::Emergency.requires_hub());
    }

    // ========== Routing Tests ==========

    #[test]
    fn test_low_priority_goes_only_to_recipient() {
        let messenger = Arc::new(ScriptedMessenger::new(vec![]));
        let (router, _) = router(messenger.clone());
        router
            .notify("billing", &[AgentRole::Developer], Priority::Low, "build green")
            .unwrap();

        let sends = messenger.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, AgentRole::Developer);
        assert!(sends[0].1.starts_with("[LOW] "));
    }

    #[test]
    fn test_critical_duplicates_to_orchestrator() {
        let messenger = Arc::new(ScriptedMessenger::new(vec![]));
        let (router, _) = router(messenger.clone());
        router
            .notify(
                "billing",
                &[AgentRole::Ops],
                Priority::Critical,
                "deployment report overruled",
            )
            .unwrap();

        let roles: Vec<AgentRole> = messenger.sends().iter().map(|(r, _)| *r).collect();
        assert_eq!(roles, vec![AgentRole::Ops, AgentRole::Orchestrator]);
    }

    #[test]
    fn test_critical_to_orchestrator_not_duplicated() {
        let messenger = Arc::new(ScriptedMessenger::new(vec![]));
        let (router, _) = router(messenger.clone());
        router
            .notify("billing", &[AgentRole::Orchestrator], Priority::Emergency, "breaker open")
            .unwrap();
        assert_eq!(messenger.sends().len(), 1);
    }

    #[test]
    fn test_duplicate_recipients_collapse() {
        let messenger = Arc::new(ScriptedMessenger::new(vec![]));
        let (router, _) = router(messenger.clone());
        router
            .notify(
                "billing",
                &[AgentRole::Tester, AgentRole::Tester],
                Priority::Medium,
                "rerun flake suite",
            )
            .unwrap();
        assert_eq!(messenger.sends().len(), 1);
    }

    // ========== Escalation Tests ==========

    #[test]
    fn test_timeout_escalates_up_chain_with_bump() {
        // Developer and ProjectManager both unresponsive; Orchestrator acks.
        let messenger = Arc::new(ScriptedMessenger::new(vec![
            AgentRole::Developer,
            AgentRole::ProjectManager,
        ]));
        let (router, store) = router(messenger.clone());
        router
            .notify("billing", &[AgentRole::Developer], Priority::High, "merge conflict")
            .unwrap();

        let sends = messenger.sends();
        assert_eq!(sends.len(), 3);
        assert_eq!(sends[0].0, AgentRole::Developer);
        assert!(sends[0].1.starts_with("[HIGH] "));
        assert_eq!(sends[1].0, AgentRole::ProjectManager);
        assert!(sends[1].1.starts_with("[CRITICAL] "));
        assert_eq!(sends[2].0, AgentRole::Orchestrator);
        assert!(sends[2].1.starts_with("[EMERGENCY] "));

        // Three audit rows: two timeouts and a final ack.
        let audit = store.recent_notifications(10).unwrap();
        assert_eq!(audit.len(), 3);
    }

    #[test]
    fn test_emergency_delivery_recorded_as_trigger() {
        let messenger = Arc::new(ScriptedMessenger::new(vec![]));
        let (router, store) = router(messenger);
        router
            .notify("billing", &[AgentRole::Ops], Priority::Emergency, "rollback now")
            .unwrap();

        let since = chrono::Utc::now() - chrono::Duration::seconds(30);
        let ops_events = store
            .events_for_target_since("billing", AgentRole::Ops, since)
            .unwrap();
        assert_eq!(ops_events.len(), 1);
        assert_eq!(ops_events[0].trigger_kind, TriggerKind::Emergency);
    }

    #[test]
    fn test_chain_exhaustion_records_undelivered() {
        let messenger = Arc::new(ScriptedMessenger::new(vec![AgentRole::Orchestrator]));
        let (router, store) = router(messenger.clone());
        router
            .notify("billing", &[AgentRole::Orchestrator], Priority::High, "hub check")
            .unwrap();

        let audit = store.recent_notifications(10).unwrap();
        // One timeout row plus the undelivered terminal row.
        assert_eq!(audit.len(), 2);
        assert!(audit[0].contains("undelivered"));
    }
}
