//! Relationship ledger, analytics façade, and lifecycle surfaces.

mod common;

use calfed_core::analytics::OutcomeKind;
use calfed_core::constraint::ConstraintKind;
use calfed_core::event::ProviderDelta;
use calfed_core::ids::AccountId;
use calfed_engine::relationships::{NewMilestone, NewRelationship, RelationshipUpdate, TimelineKind};
use calfed_engine::testing::{attendee, provider_event};
use serde_json::json;

use common::TestEngine;

fn acc(raw: &str) -> AccountId {
    AccountId::new(raw)
}

fn ada() -> NewRelationship {
    NewRelationship {
        email: "ada@example.com".to_string(),
        display_name: "Ada".to_string(),
        city: Some("Lisbon".to_string()),
        cadence_days: Some(30),
    }
}

#[tokio::test]
async fn duplicate_relationship_conflicts() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.create_relationship(ada()).await.unwrap();
    let error = user.create_relationship(ada()).await.unwrap_err();
    assert_eq!(error.code(), "conflict");
}

#[tokio::test]
async fn outcomes_feed_reputation_and_timeline() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let rel = user.create_relationship(ada()).await.unwrap();

    user.mark_outcome(rel.relationship_id.clone(), OutcomeKind::Honored, None)
        .await
        .unwrap();
    user.mark_outcome(
        rel.relationship_id.clone(),
        OutcomeKind::Cancelled,
        Some("flu".to_string()),
    )
    .await
    .unwrap();

    let reputation = user.get_reputation(rel.relationship_id.clone()).await.unwrap();
    assert_eq!(reputation.honored, 1);
    assert_eq!(reputation.cancelled, 1);
    assert!(reputation.score < 100);

    let mut event = provider_event("Coffee", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z");
    event.attendees.push(attendee("ada@example.com", "Ada"));
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event,
        }],
    )
    .await
    .unwrap();

    let timeline = user.get_timeline(rel.relationship_id.clone()).await.unwrap();
    assert_eq!(timeline.len(), 3);
    assert!(timeline.iter().any(|t| t.kind == TimelineKind::Event));
    assert!(timeline
        .iter()
        .any(|t| t.kind == TimelineKind::Outcome && t.summary.contains("flu")));

    let outcomes = user.list_outcomes(rel.relationship_id.clone()).await.unwrap();
    assert_eq!(outcomes.len(), 2);
}

#[tokio::test]
async fn drift_and_reconnections() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let rel = user.create_relationship(ada()).await.unwrap();
    user.create_relationship(NewRelationship {
        email: "grace@example.com".to_string(),
        display_name: "Grace".to_string(),
        city: Some("Berlin".to_string()),
        cadence_days: None,
    })
    .await
    .unwrap();

    // Ada has a 30-day cadence and no interactions: overdue.
    let drift = user.get_drift_report().await.unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].relationship_id, rel.relationship_id.to_string());

    // A Lisbon trip biases reconnections toward Ada.
    let trip = user
        .create_constraint(
            ConstraintKind::Trip,
            json!({
                "destination": "Lisbon",
                "start_date": "2026-03-02",
                "end_date": "2026-03-04",
            }),
            None,
            None,
        )
        .await
        .unwrap();
    let suggestions = user
        .get_reconnection_suggestions(None, Some(trip.constraint_id.clone()))
        .await
        .unwrap();
    assert_eq!(suggestions[0].display_name, "Ada");
    assert!(suggestions[0].reason.contains("Lisbon"));
}

#[tokio::test]
async fn relationship_update_and_delete() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let rel = user.create_relationship(ada()).await.unwrap();

    let updated = user
        .update_relationship(
            rel.relationship_id.clone(),
            RelationshipUpdate {
                display_name: "Ada Lovelace".to_string(),
                city: Some("Porto".to_string()),
                cadence_days: Some(14),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.display_name, "Ada Lovelace");
    assert_eq!(updated.cadence_days, Some(14));

    user.delete_relationship(rel.relationship_id.clone())
        .await
        .unwrap();
    let error = user.get_relationship(rel.relationship_id).await.unwrap_err();
    assert_eq!(error.code(), "not_found");
}

#[tokio::test]
async fn upcoming_milestones_expand_recurring_years() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.create_milestone(NewMilestone {
        relationship_id: None,
        title: "Launch anniversary".to_string(),
        month: 1,
        day: 15,
        year: None,
        recurring: true,
    })
    .await
    .unwrap();

    // 400 days always reaches the next January 15th.
    let upcoming = user.list_upcoming_milestones(400).await.unwrap();
    assert!(!upcoming.is_empty());
    assert_eq!(upcoming[0].milestone.title, "Launch anniversary");
    assert!(upcoming[0].in_days <= 400);

    let all = user.list_milestones().await.unwrap();
    assert_eq!(all.len(), 1);
    user.delete_milestone(all[0].milestone_id.clone()).await.unwrap();
    assert!(user.list_milestones().await.unwrap().is_empty());
}

#[tokio::test]
async fn load_switches_and_deep_work() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.apply_provider_delta(
        acc("acc_a"),
        vec![
            ProviderDelta::Created {
                origin_event_id: "g1".to_string(),
                event: provider_event("Standup", "2026-02-16T09:00:00Z", "2026-02-16T09:30:00Z"),
            },
            ProviderDelta::Created {
                origin_event_id: "g2".to_string(),
                event: provider_event("1:1", "2026-02-16T12:00:00Z", "2026-02-16T13:00:00Z"),
            },
        ],
    )
    .await
    .unwrap();
    user.apply_provider_delta(
        acc("acc_b"),
        vec![ProviderDelta::Created {
            origin_event_id: "m1".to_string(),
            event: provider_event("Review", "2026-02-16T09:35:00Z", "2026-02-16T10:00:00Z"),
        }],
    )
    .await
    .unwrap();

    let load = user
        .get_cognitive_load("2026-02-16T00:00:00Z", "2026-02-17T00:00:00Z")
        .await
        .unwrap();
    assert_eq!(load.len(), 1);
    assert_eq!(load[0].meeting_count, 3);
    assert_eq!(load[0].context_switches, 1);

    let switches = user
        .get_context_switches("2026-02-16T00:00:00Z", "2026-02-17T00:00:00Z")
        .await
        .unwrap();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].from_account, "acc_a");
    assert_eq!(switches[0].to_account, "acc_b");

    let deep = user
        .get_deep_work("2026-02-16T00:00:00Z", "2026-02-17T00:00:00Z")
        .await
        .unwrap();
    assert!(deep.iter().any(|w| w.minutes >= 90));

    let risks = user
        .get_risk_scores("2026-02-16T00:00:00Z", "2026-02-17T00:00:00Z")
        .await
        .unwrap();
    assert_eq!(risks.len(), 1);

    let grid = user.get_probabilistic_availability(4).await.unwrap();
    assert_eq!(grid.len(), 7 * 24);
}

#[tokio::test]
async fn purge_user_removes_database() {
    let engine = TestEngine::start();
    let user = engine.user("usr_gone").await;
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Note", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();

    engine.registry.purge_user("usr_gone", false).await.unwrap();

    // A fresh actor starts from an empty store.
    let reborn = engine.user("usr_gone").await;
    let snapshot = reborn.build_simulation_snapshot().await.unwrap();
    assert!(snapshot.events.is_empty());
}
