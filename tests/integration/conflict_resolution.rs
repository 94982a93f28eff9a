//! The contradictory-report flow end to end: detection, precedence
//! ruling, demotion, and who hears about it.

use marshal::agent::AgentRole;
use marshal::core::{ReportCategory, ReportOutcome, Resolution, StatusReport};

use crate::fixtures::Harness;

fn deployment_report(role: AgentRole, outcome: ReportOutcome) -> StatusReport {
    StatusReport::new(
        "billing",
        role,
        ReportCategory::Deployment,
        outcome,
        Some("api-v2"),
        "deployment status",
    )
}

#[test]
fn deployment_dispute_resolves_for_implementation_role() {
    let h = Harness::new();
    let reports = h.reports();
    let resolver = h.resolver();

    // The operational agent says the deploy went out; the implementation
    // agent says the build it shipped is broken.
    let ops_id = reports
        .record_report(&deployment_report(AgentRole::Ops, ReportOutcome::Success))
        .unwrap();
    reports
        .record_report(&deployment_report(
            AgentRole::Developer,
            ReportOutcome::Failure,
        ))
        .unwrap();

    let opened = resolver.detect_conflicts("billing").unwrap();
    assert_eq!(opened.len(), 1);
    let conflict = &opened[0];
    assert_eq!(conflict.category, ReportCategory::Deployment);

    let resolution = resolver.resolve(conflict.id).unwrap();
    match &resolution {
        Resolution::Precedence {
            winner_role,
            demoted_report_ids,
            ..
        } => {
            assert_eq!(*winner_role, AgentRole::Developer);
            assert_eq!(demoted_report_ids, &vec![ops_id]);
        }
        other => panic!("expected precedence ruling, got {:?}", other),
    }

    // The SUCCESS report no longer stands.
    assert!(!h.store.get_report(ops_id).unwrap().authoritative);

    // The loser hears at HIGH; the hub gets the CRITICAL duplicate.
    let to_ops = h.messenger.sent_to(AgentRole::Ops);
    assert!(
        to_ops.iter().any(|m| m.starts_with("[HIGH]")),
        "{:?}",
        to_ops
    );
    let to_hub = h.messenger.sent_to(AgentRole::Orchestrator);
    assert!(
        to_hub.iter().any(|m| m.starts_with("[CRITICAL]")),
        "{:?}",
        to_hub
    );

    // And the audit log kept every attempt.
    assert!(h.store.recent_notifications(10).unwrap().len() >= 2);
}

#[test]
fn at_most_one_open_conflict_per_project_category() {
    let h = Harness::new();
    let reports = h.reports();
    let resolver = h.resolver();

    reports
        .record_report(&deployment_report(AgentRole::Ops, ReportOutcome::Success))
        .unwrap();
    reports
        .record_report(&deployment_report(
            AgentRole::Developer,
            ReportOutcome::Failure,
        ))
        .unwrap();
    resolver.detect_conflicts("billing").unwrap();

    // A third contradictory voice joins the existing conflict.
    reports
        .record_report(&deployment_report(
            AgentRole::Tester,
            ReportOutcome::Success,
        ))
        .unwrap();
    let opened = resolver.detect_conflicts("billing").unwrap();

    assert_eq!(resolver.open_conflicts().unwrap().len(), 1);
    assert_eq!(opened.len(), 1);
    assert!(opened[0].report_ids.len() >= 3);
}

#[test]
fn resolve_twice_returns_same_ruling_without_new_messages() {
    let h = Harness::new();
    let reports = h.reports();
    let resolver = h.resolver();

    reports
        .record_report(&deployment_report(AgentRole::Ops, ReportOutcome::Success))
        .unwrap();
    reports
        .record_report(&deployment_report(
            AgentRole::Developer,
            ReportOutcome::Failure,
        ))
        .unwrap();
    let conflict = resolver.detect_conflicts("billing").unwrap().remove(0);

    let first = resolver.resolve(conflict.id).unwrap();
    let sends_after_first = h.messenger.sent().len();
    let second = resolver.resolve(conflict.id).unwrap();

    assert_eq!(first, second);
    assert_eq!(h.messenger.sent().len(), sends_after_first);
}

#[test]
fn unknown_precedence_escalates_to_hub() {
    let h = Harness::new();
    let reports = h.reports();
    let resolver = h.resolver();

    for (role, outcome) in [
        (AgentRole::Developer, ReportOutcome::Success),
        (AgentRole::Ops, ReportOutcome::Failure),
    ] {
        reports
            .record_report(&StatusReport::new(
                "billing",
                role,
                ReportCategory::Timeline,
                outcome,
                Some("milestone-3"),
                "timeline status",
            ))
            .unwrap();
    }
    let conflict = resolver.detect_conflicts("billing").unwrap().remove(0);

    let resolution = resolver.resolve(conflict.id).unwrap();
    assert!(matches!(
        resolution,
        Resolution::Escalated {
            to: AgentRole::Orchestrator,
            ..
        }
    ));
    assert!(!h.messenger.sent_to(AgentRole::Orchestrator).is_empty());
}

#[test]
fn conflicts_survive_restart_unresolved() {
    let h = Harness::new();
    let reports = h.reports();
    let resolver = h.resolver();

    reports
        .record_report(&deployment_report(AgentRole::Ops, ReportOutcome::Success))
        .unwrap();
    reports
        .record_report(&deployment_report(
            AgentRole::Developer,
            ReportOutcome::Failure,
        ))
        .unwrap();
    let conflict = resolver.detect_conflicts("billing").unwrap().remove(0);

    let reopened = h.reopen();
    let open = reopened.list_unresolved_conflicts().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, conflict.id);
}
