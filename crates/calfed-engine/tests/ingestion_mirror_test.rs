//! End-to-end ingestion and mirror write-back behavior.

mod common;

use calfed_core::classify::{TAG_CANONICAL_EVENT_ID, TAG_ENGINE, TAG_MANAGED};
use calfed_core::event::{EventSource, ProviderDelta};
use calfed_core::ids::{AccountId, CalendarId, EventId, MirrorId};
use calfed_engine::provider::ProviderWriteError;
use calfed_engine::testing::{attendee, provider_event, InMemoryProvider};
use calfed_engine::MirrorState;

use common::{add_edge, TestEngine};

fn acc(raw: &str) -> AccountId {
    AccountId::new(raw)
}

fn cal(raw: &str) -> CalendarId {
    CalendarId::new(raw)
}

#[tokio::test]
async fn cross_provider_busy_block() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();

    let summary = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![ProviderDelta::Created {
                origin_event_id: "g1".to_string(),
                event: provider_event(
                    "Team Sync",
                    "2026-02-16T14:00:00Z",
                    "2026-02-16T15:00:00Z",
                ),
            }],
        )
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert!(summary.mirrors_enqueued >= 1);
    assert!(summary.errors.is_empty());

    engine.settle(&user).await;

    let mirrored = engine.provider.events_on(&acc("acc_b"), &cal("primary"));
    assert_eq!(mirrored.len(), 1);
    let (_, payload) = &mirrored[0];
    assert_eq!(payload.title, "Busy");
    assert_eq!(payload.tags.get(TAG_ENGINE).map(String::as_str), Some("true"));
    assert_eq!(payload.tags.get(TAG_MANAGED).map(String::as_str), Some("true"));
    assert!(payload.tags.contains_key(TAG_CANONICAL_EVENT_ID));

    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.mirrors.len(), 1);
    assert_eq!(snapshot.mirrors[0].state, MirrorState::Live);
    assert!(snapshot.mirrors[0].provider_event_id.is_some());
}

#[tokio::test]
async fn mirror_echo_is_discarded() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;

    // Feed the provider-side mirror back in as if the B sync observed it.
    let mirrored = engine.provider.events_on(&acc("acc_b"), &cal("primary"));
    let (provider_event_id, payload) = &mirrored[0];
    let echo = InMemoryProvider::as_provider_event(payload);
    let summary = user
        .apply_provider_delta(
            acc("acc_b"),
            vec![ProviderDelta::Created {
                origin_event_id: provider_event_id.clone(),
                event: echo,
            }],
        )
        .await
        .unwrap();

    assert_eq!(summary.created, 0);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.mirrors_enqueued, 0);
    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.events.len(), 1);
}

#[tokio::test]
async fn update_propagates_to_mirror() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;

    let summary = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![ProviderDelta::Updated {
                origin_event_id: "g1".to_string(),
                event: provider_event(
                    "Team Sync",
                    "2026-02-16T14:30:00Z",
                    "2026-02-16T15:30:00Z",
                ),
            }],
        )
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);
    engine.settle(&user).await;

    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.events[0].version, 2);
    assert_eq!(snapshot.events[0].start_ts, "2026-02-16T14:30:00Z");
    assert_eq!(snapshot.mirrors[0].state, MirrorState::Live);

    let mirrored = engine.provider.events_on(&acc("acc_b"), &cal("primary"));
    assert_eq!(mirrored[0].1.start_ts, "2026-02-16T14:30:00Z");

    // Journal carries the full history.
    let event_id = snapshot.events[0].canonical_event_id.clone();
    let journal = user.get_journal(event_id).await.unwrap();
    assert_eq!(journal.len(), 2);
}

#[tokio::test]
async fn delete_tears_the_mirror_down() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;

    let summary = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![ProviderDelta::Deleted {
                origin_event_id: "g1".to_string(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(summary.deleted, 1);
    engine.settle(&user).await;

    assert!(engine
        .provider
        .events_on(&acc("acc_b"), &cal("primary"))
        .is_empty());
    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.mirrors[0].state, MirrorState::Deleted);
    assert_eq!(
        snapshot.events[0].status,
        calfed_core::event::EventStatus::Cancelled
    );
}

#[tokio::test]
async fn zero_edges_means_zero_jobs() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let summary = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![ProviderDelta::Created {
                origin_event_id: "g1".to_string(),
                event: provider_event("Solo", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
            }],
        )
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.mirrors_enqueued, 0);
}

#[tokio::test]
async fn duplicate_delta_is_a_noop_update() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let event = provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z");
    let summary = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![
                ProviderDelta::Created {
                    origin_event_id: "g1".to_string(),
                    event: event.clone(),
                },
                ProviderDelta::Created {
                    origin_event_id: "g1".to_string(),
                    event,
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.updated, 1);

    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(snapshot.events[0].version, 1);
}

#[tokio::test]
async fn retryable_failures_back_off_then_succeed() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();

    engine
        .provider
        .fail_next(ProviderWriteError::retryable("provider 503"));
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();

    engine.settle(&user).await;
    assert_eq!(
        engine
            .provider
            .events_on(&acc("acc_b"), &cal("primary"))
            .len(),
        1
    );
    let (creates, _, _) = engine.provider.call_counts();
    assert!(creates >= 2, "expected a retried create, saw {}", creates);
}

#[tokio::test]
async fn permanent_failure_dead_letters_until_manual_reset() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();

    engine
        .provider
        .fail_next(ProviderWriteError::permanent("403 forbidden"));
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;

    let health = user.get_health_report().await.unwrap();
    assert_eq!(health.failed_mirrors.len(), 1);
    assert!(health.failed_mirrors[0]
        .error
        .as_deref()
        .unwrap()
        .contains("403"));

    let mirror_id = MirrorId::parse(&health.failed_mirrors[0].mirror_id).unwrap();
    user.retry_failed_mirror(mirror_id).await.unwrap();
    engine.settle(&user).await;

    assert_eq!(
        engine
            .provider
            .events_on(&acc("acc_b"), &cal("primary"))
            .len(),
        1
    );
    let health = user.get_health_report().await.unwrap();
    assert!(health.failed_mirrors.is_empty());
}

#[tokio::test]
async fn revoked_account_fails_mirror_permanently() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();
    engine.tokens.revoke(&acc("acc_b"));

    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;

    let health = user.get_health_report().await.unwrap();
    assert_eq!(health.failed_mirrors.len(), 1);
    assert!(engine
        .tokens
        .revoked_accounts()
        .contains(&"acc_b".to_string()));
}

#[tokio::test]
async fn external_mirror_removal_tombstones() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    add_edge(&user, "acc_a", "acc_b", "primary", "BUSY")
        .await
        .unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;

    // The user deletes our mirror by hand in their B calendar; the B sync
    // reports it as a deleted event.
    let mirrored = engine.provider.events_on(&acc("acc_b"), &cal("primary"));
    let summary = user
        .apply_provider_delta(
            acc("acc_b"),
            vec![ProviderDelta::Deleted {
                origin_event_id: mirrored[0].0.clone(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(summary.deleted, 0);

    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.mirrors[0].state, MirrorState::Tombstoned);
}

#[tokio::test]
async fn ics_import_uses_ics_source() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let summary = user
        .import_ics_events(
            acc("acc_feed"),
            vec![ProviderDelta::Created {
                origin_event_id: "uid-1@feed".to_string(),
                event: provider_event("Conference", "2026-04-01T09:00:00Z", "2026-04-01T17:00:00Z"),
            }],
        )
        .await
        .unwrap();
    assert_eq!(summary.created, 1);

    let snapshot = user.build_simulation_snapshot().await.unwrap();
    assert_eq!(snapshot.events[0].source, EventSource::Ics);
}

#[tokio::test]
async fn ingestion_refuses_when_gated() {
    let engine = TestEngine::start_with(|config| {
        config.queue_high_watermark = 0;
        config.queue_low_watermark = 0;
    });
    let user = engine.user("usr_alice").await;
    let error = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![ProviderDelta::Created {
                origin_event_id: "g1".to_string(),
                event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
            }],
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "transient");
    assert!(error.retry_after().is_some());
}

#[tokio::test]
async fn participants_touch_relationships() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let relationship = user
        .create_relationship(calfed_engine::relationships::NewRelationship {
            email: "ada@example.com".to_string(),
            display_name: "Ada".to_string(),
            city: None,
            cadence_days: Some(30),
        })
        .await
        .unwrap();
    assert!(relationship.last_interaction_ts.is_none());

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

    let refreshed = user
        .get_relationship(relationship.relationship_id.clone())
        .await
        .unwrap();
    assert!(refreshed.last_interaction_ts.is_some());

    let snapshot = user.build_simulation_snapshot().await.unwrap();
    let briefing = user
        .get_event_briefing(snapshot.events[0].canonical_event_id.clone())
        .await
        .unwrap();
    assert_eq!(briefing.participants.len(), 1);
    assert!(briefing.participants[0].relationship.is_some());
}

#[tokio::test]
async fn edge_removal_deletes_mirrors() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let edge_id = add_edge(&user, "acc_a", "acc_b", "primary", "TITLE")
        .await
        .unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Planning", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    engine.settle(&user).await;
    let mirrored = engine.provider.events_on(&acc("acc_b"), &cal("primary"));
    assert_eq!(mirrored[0].1.title, "Planning");

    user.delete_constraint(calfed_core::ids::ConstraintId::parse(&edge_id).unwrap())
        .await
        .unwrap();
    engine.settle(&user).await;
    assert!(engine
        .provider
        .events_on(&acc("acc_b"), &cal("primary"))
        .is_empty());
}

#[tokio::test]
async fn invalid_event_accumulates_error_without_aborting_batch() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let summary = user
        .apply_provider_delta(
            acc("acc_a"),
            vec![
                ProviderDelta::Created {
                    origin_event_id: "bad".to_string(),
                    // Ends before it starts.
                    event: provider_event("Bad", "2026-02-16T15:00:00Z", "2026-02-16T14:00:00Z"),
                },
                ProviderDelta::Created {
                    origin_event_id: "good".to_string(),
                    event: provider_event("Good", "2026-02-16T15:00:00Z", "2026-02-16T16:00:00Z"),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].origin_event_id, "bad");
    assert_eq!(summary.errors[0].code, "validation_error");
}

#[tokio::test]
async fn journal_is_append_only_across_operations() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Team Sync", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();
    let snapshot = user.build_simulation_snapshot().await.unwrap();
    let event_id: EventId = snapshot.events[0].canonical_event_id.clone();

    let first = user.get_journal(event_id.clone()).await.unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Deleted {
            origin_event_id: "g1".to_string(),
        }],
    )
    .await
    .unwrap();
    let second = user.get_journal(event_id).await.unwrap();

    assert!(second.len() > first.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.change_type, b.change_type);
    }
}
