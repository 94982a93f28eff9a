//! End-to-end dispatch behavior: dedup, retry backoff, disable, phantom
//! flagging, breaker, and durability across a process restart.

use chrono::Utc;
use marshal::agent::AgentRole;
use marshal::core::{ScheduleEvent, TaskStatus, TriggerKind};
use marshal::orchestration::{SchedulerEvent, Verdict};

use crate::fixtures::{target, Harness};

#[test]
fn enqueue_is_idempotent_within_dedup_window() {
    let h = Harness::new();
    let at = Utc::now() + chrono::Duration::seconds(30);
    let first = h
        .scheduler
        .enqueue(target("billing", AgentRole::Developer), at, None, "check in")
        .unwrap();
    let second = h
        .scheduler
        .enqueue(
            target("billing", AgentRole::Developer),
            at + chrono::Duration::seconds(20),
            None,
            "check in",
        )
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.scheduler.list(None, None).unwrap().len(), 1);
}

#[test]
fn failed_sends_back_off_then_disable_with_notification() {
    let mut h = Harness::new();
    h.messenger.timeout_for(AgentRole::Developer);
    let id = h
        .scheduler
        .enqueue(
            target("billing", AgentRole::Developer),
            Utc::now() - chrono::Duration::seconds(1),
            None,
            "check in",
        )
        .unwrap();

    // Three failed dispatches: rescheduled 10s, 20s, 40s out.
    for expected in [10i64, 20, 40] {
        let mut task = h.store.get_task(id).unwrap();
        task.scheduled_at = Utc::now() - chrono::Duration::seconds(1);
        h.store.update_task(&task).unwrap();
        h.scheduler.tick().unwrap();

        let task = h.store.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let delta = (task.scheduled_at - Utc::now()).num_seconds();
        assert!(
            (delta - expected).abs() <= 2,
            "expected ~{}s backoff, got {}s",
            expected,
            delta
        );
    }

    // Fourth failure exhausts the budget of 3.
    let mut task = h.store.get_task(id).unwrap();
    task.scheduled_at = Utc::now() - chrono::Duration::seconds(1);
    h.store.update_task(&task).unwrap();
    h.scheduler.tick().unwrap();

    let task = h.store.get_task(id).unwrap();
    assert!(matches!(task.status, TaskStatus::Disabled { .. }));
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SchedulerEvent::Disabled { task_id, .. } if *task_id == id)));
    // The failure notification reached the escalation target.
    let to_pm = h.messenger.sent_to(AgentRole::ProjectManager);
    assert!(to_pm.iter().any(|m| m.contains("disabled")), "{:?}", to_pm);
    assert!(!h.store.recent_notifications(10).unwrap().is_empty());
}

#[test]
fn pending_tasks_survive_restart() {
    let h = Harness::new();
    let id = h
        .scheduler
        .enqueue(
            target("billing", AgentRole::Developer),
            Utc::now() + chrono::Duration::seconds(60),
            Some(300),
            "check in",
        )
        .unwrap();

    let reopened = h.reopen();
    let task = reopened.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.interval_secs, Some(300));
    assert_eq!(task.note, "check in");
}

#[test]
fn oracle_yes_ends_recurrence_without_a_send() {
    let mut h = Harness::new();
    h.oracle.set(Verdict::Yes, 0.9);
    let id = h
        .scheduler
        .enqueue(
            target("billing", AgentRole::Developer),
            Utc::now() - chrono::Duration::seconds(1),
            Some(300),
            "check in",
        )
        .unwrap();

    h.scheduler.tick().unwrap();

    assert_eq!(
        h.store.get_task(id).unwrap().status,
        TaskStatus::Completed
    );
    assert!(h.messenger.sent().is_empty());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SchedulerEvent::Completed { task_id } if *task_id == id)));
}

#[test]
fn breaker_suspends_recovery_and_escalates() {
    let mut h = Harness::new();
    for _ in 0..3 {
        h.store
            .append_schedule_event(&ScheduleEvent::new(
                "billing",
                AgentRole::Developer,
                None,
                TriggerKind::Recovery,
            ))
            .unwrap();
    }
    let id = h
        .scheduler
        .enqueue(
            target("billing", AgentRole::Developer),
            Utc::now() - chrono::Duration::seconds(1),
            None,
            "check in",
        )
        .unwrap();
    let mut task = h.store.get_task(id).unwrap();
    task.retry_count = 1;
    h.store.update_task(&task).unwrap();

    h.scheduler.tick().unwrap();

    // Parked, not dispatched, and the hub was told at EMERGENCY.
    let task = h.store.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.scheduled_at > Utc::now() + chrono::Duration::seconds(60));
    assert!(h.messenger.sent_to(AgentRole::Developer).is_empty());
    let to_hub = h.messenger.sent_to(AgentRole::Orchestrator);
    assert!(
        to_hub.iter().any(|m| m.starts_with("[EMERGENCY]")),
        "{:?}",
        to_hub
    );
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SchedulerEvent::BreakerOpen { project_id } if project_id == "billing")));
}

#[test]
fn disable_during_flight_wins_over_reenqueue() {
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
    // The operator disables before the loop reaches the task.
    let mut task = h.store.get_task(id).unwrap();
    task.disable("operator hold");
    h.store.update_task(&task).unwrap();

    h.scheduler.tick().unwrap();

    assert!(h.messenger.sent().is_empty());
    assert!(matches!(
        h.store.get_task(id).unwrap().status,
        TaskStatus::Disabled { .. }
    ));
}

#[test]
fn completion_during_flight_wins_over_reenqueue() {
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
    // The operator force-completes while the send is in flight; the
    // recurrence must not resurrect the task afterwards.
    let store = h.store.clone();
    h.messenger.on_next_send(move || {
        let mut task = store.get_task(id).unwrap();
        task.complete();
        store.update_task(&task).unwrap();
    });

    h.scheduler.tick().unwrap();

    assert_eq!(h.messenger.sent().len(), 1);
    assert_eq!(h.store.get_task(id).unwrap().status, TaskStatus::Completed);
}
