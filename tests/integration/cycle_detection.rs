//! Pathology detection driven through the real dispatch path and the
//! event log, with the corrective actions checked against the store.

use chrono::Utc;
use marshal::agent::AgentRole;
use marshal::core::{
    CycleAction, CycleKind, ReportCategory, ReportOutcome, ScheduleEvent, StatusReport,
    TriggerKind,
};
use marshal::orchestration::CycleDetector;

use crate::fixtures::{target, Harness};

#[test]
fn five_minute_lockstep_gets_jittered() {
    let h = Harness::new();
    let id = h
        .scheduler
        .enqueue(
            target("billing", AgentRole::Developer),
            Utc::now() - chrono::Duration::seconds(1),
            Some(300),
            "check in",
        )
        .unwrap();

    // Three dispatches at the same 300s interval; the wall clock is
    // simulated by pulling the task due again after each one.
    for _ in 0..3 {
        h.scheduler.tick().unwrap();
        let mut task = h.store.get_task(id).unwrap();
        task.scheduled_at = Utc::now() - chrono::Duration::seconds(1);
        h.store.update_task(&task).unwrap();
    }

    let detections = h.store.recent_cycle_events(10).unwrap();
    let jitter = detections
        .iter()
        .find(|d| d.kind == CycleKind::FixedIntervalLoop)
        .expect("lockstep not detected");
    match jitter.action_taken {
        CycleAction::JitteredInterval { from_secs, to_secs } => {
            assert_eq!(from_secs, 300);
            assert!((240..=360).contains(&to_secs));
        }
        ref other => panic!("expected jitter, got {:?}", other),
    }
    // The recurrence now carries the perturbed interval.
    let task = h.store.get_task(id).unwrap();
    let interval = task.interval_secs.unwrap();
    assert!((240..=360).contains(&interval));
}

#[test]
fn rapid_reschedule_cancels_pending_duplicates() {
    let h = Harness::new();
    let detector = CycleDetector::new(h.store.clone(), h.router.clone(), h.config.clone());

    for window in 0..3 {
        h.scheduler
            .enqueue(
                marshal::core::TaskTarget::new("billing", AgentRole::Developer, window),
                Utc::now() + chrono::Duration::seconds(60 + window as i64),
                None,
                "check in",
            )
            .unwrap();
    }
    let mut last = ScheduleEvent::new("billing", AgentRole::Developer, None, TriggerKind::Normal);
    h.store.append_schedule_event(&last).unwrap();
    for _ in 0..5 {
        last = ScheduleEvent::new("billing", AgentRole::Developer, None, TriggerKind::Normal);
        h.store.append_schedule_event(&last).unwrap();
    }

    let detections = detector.observe(&last).unwrap();
    let rapid = detections
        .iter()
        .find(|d| d.kind == CycleKind::RapidReschedule)
        .expect("rapid reschedule not detected");
    assert_eq!(
        rapid.action_taken,
        CycleAction::CancelledDuplicates { count: 2 }
    );
    assert_eq!(
        h.store
            .pending_tasks_for_agent("billing", AgentRole::Developer)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn emergency_recovery_oscillation_escalates() {
    let h = Harness::new();
    let detector = CycleDetector::new(h.store.clone(), h.router.clone(), h.config.clone());

    let kinds = [
        TriggerKind::Emergency,
        TriggerKind::Recovery,
        TriggerKind::Emergency,
        TriggerKind::Recovery,
        TriggerKind::Emergency,
    ];
    let mut last = ScheduleEvent::new("billing", AgentRole::Developer, None, kinds[0]);
    h.store.append_schedule_event(&last).unwrap();
    for kind in &kinds[1..] {
        last = ScheduleEvent::new("billing", AgentRole::Developer, None, *kind);
        h.store.append_schedule_event(&last).unwrap();
    }

    let detections = detector.observe(&last).unwrap();
    let osc = detections
        .iter()
        .find(|d| d.kind == CycleKind::Oscillation)
        .expect("oscillation not detected");
    assert_eq!(
        osc.action_taken,
        CycleAction::Escalated {
            to: AgentRole::ProjectManager
        }
    );
    // The escalation went out at CRITICAL, which also reaches the hub.
    assert!(!h.messenger.sent_to(AgentRole::ProjectManager).is_empty());
    assert!(!h.messenger.sent_to(AgentRole::Orchestrator).is_empty());
}

#[test]
fn mutual_blocking_reports_break_one_edge() {
    let h = Harness::new();
    let detector = CycleDetector::new(h.store.clone(), h.router.clone(), h.config.clone());

    for (from, on) in [
        (AgentRole::Developer, AgentRole::Tester),
        (AgentRole::Tester, AgentRole::Developer),
    ] {
        h.store
            .insert_report(&StatusReport::new(
                "billing",
                from,
                ReportCategory::Integration,
                ReportOutcome::Blocked,
                Some(on.as_str()),
                "waiting on handoff",
            ))
            .unwrap();
    }
    let event = ScheduleEvent::new("billing", AgentRole::Developer, None, TriggerKind::Normal);
    h.store.append_schedule_event(&event).unwrap();

    let detections = detector.observe(&event).unwrap();
    assert!(detections
        .iter()
        .any(|d| d.kind == CycleKind::DependencyCycle));

    // Exactly one Blocked claim was cleared, and both sides were told.
    let still_blocked = h
        .store
        .active_reports("billing")
        .unwrap()
        .into_iter()
        .filter(|r| r.outcome == ReportOutcome::Blocked && r.authoritative)
        .count();
    assert_eq!(still_blocked, 1);
    assert!(!h.messenger.sent_to(AgentRole::Developer).is_empty());
    assert!(!h.messenger.sent_to(AgentRole::Tester).is_empty());
}

#[test]
fn detections_are_persisted_for_audit() {
    let h = Harness::new();
    let detector = CycleDetector::new(h.store.clone(), h.router.clone(), h.config.clone());

    let mut last = ScheduleEvent::new("billing", AgentRole::Ops, None, TriggerKind::Normal);
    h.store.append_schedule_event(&last).unwrap();
    for _ in 0..5 {
        last = ScheduleEvent::new("billing", AgentRole::Ops, None, TriggerKind::Normal);
        h.store.append_schedule_event(&last).unwrap();
    }
    detector.observe(&last).unwrap();

    let recent = h.store.recent_cycle_events(10).unwrap();
    assert!(!recent.is_empty());
    assert!(recent.iter().all(|e| e.project_id == "billing"));
}
