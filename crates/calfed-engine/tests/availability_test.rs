//! Availability computation against constraints and events.

mod common;

use chrono::{DateTime, Utc};
use calfed_core::constraint::ConstraintKind;
use calfed_core::event::ProviderDelta;
use calfed_core::ids::AccountId;
use calfed_engine::testing::provider_event;
use calfed_engine::AvailabilityReport;
use serde_json::json;

use common::TestEngine;

fn acc(raw: &str) -> AccountId {
    AccountId::new(raw)
}

fn ts(raw: &str) -> DateTime<Utc> {
    calfed_core::interval::normalize_time(raw).unwrap()
}

/// Busy and free must tile the range exactly: no overlap, no uncovered
/// instant.
fn assert_gap_free(report: &AvailabilityReport) {
    let mut cursor = report.range_start;
    let mut busy = report.busy.iter().peekable();
    let mut free = report.free.iter().peekable();
    while cursor < report.range_end {
        if let Some(interval) = busy.peek() {
            if interval.start == cursor {
                cursor = interval.end;
                busy.next();
                continue;
            }
        }
        if let Some(gap) = free.peek() {
            if gap.start == cursor {
                cursor = gap.end;
                free.next();
                continue;
            }
        }
        panic!("coverage hole at {} in {:?}", cursor, report);
    }
    assert!(busy.next().is_none());
    assert!(free.next().is_none());
}

#[tokio::test]
async fn working_hours_invert_to_busy_blocks() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.create_constraint(
        ConstraintKind::WorkingHours,
        json!({
            "days": [1, 2, 3, 4, 5],
            "start": "09:00",
            "end": "17:00",
            "timezone": "America/Los_Angeles",
        }),
        None,
        None,
    )
    .await
    .unwrap();
    // Monday 2026-02-16, event 10:00-11:00 UTC sits inside the
    // before-hours block (LA is UTC-8 in February).
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Early sync", "2026-02-16T10:00:00Z", "2026-02-16T11:00:00Z"),
        }],
    )
    .await
    .unwrap();

    let report = user
        .compute_availability("2026-02-16T00:00:00Z", "2026-02-17T00:00:00Z", None)
        .await
        .unwrap();
    assert_gap_free(&report);

    // Everything before 09:00 LA (17:00 UTC) is busy, the working window
    // to midnight UTC is free.
    assert_eq!(report.busy.len(), 1);
    assert_eq!(report.busy[0].start, ts("2026-02-16T00:00:00Z"));
    assert_eq!(report.busy[0].end, ts("2026-02-16T17:00:00Z"));
    assert!(report.busy[0].sources.contains("working_hours"));
    assert!(report.busy[0].sources.contains("event"));
    assert_eq!(report.free.len(), 1);
    assert_eq!(report.free[0].start, ts("2026-02-16T17:00:00Z"));
    assert_eq!(report.free[0].end, ts("2026-02-17T00:00:00Z"));
}

#[tokio::test]
async fn trip_blocks_cover_inclusive_dates() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.create_constraint(
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

    let report = user
        .compute_availability("2026-03-01T00:00:00Z", "2026-03-06T00:00:00Z", None)
        .await
        .unwrap();
    assert_gap_free(&report);
    assert_eq!(report.busy.len(), 1);
    assert_eq!(report.busy[0].start, ts("2026-03-02T00:00:00Z"));
    assert_eq!(report.busy[0].end, ts("2026-03-05T00:00:00Z"));
    assert!(report.busy[0].sources.contains("trip"));
}

#[tokio::test]
async fn buffers_pad_matching_events() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.create_constraint(
        ConstraintKind::Buffer,
        json!({ "before_minutes": 30, "after_minutes": 15 }),
        None,
        None,
    )
    .await
    .unwrap();
    user.apply_provider_delta(
        acc("acc_a"),
        vec![ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: provider_event("Onsite", "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"),
        }],
    )
    .await
    .unwrap();

    let report = user
        .compute_availability("2026-02-16T12:00:00Z", "2026-02-16T18:00:00Z", None)
        .await
        .unwrap();
    assert_gap_free(&report);
    assert_eq!(report.busy.len(), 1);
    assert_eq!(report.busy[0].start, ts("2026-02-16T13:30:00Z"));
    assert_eq!(report.busy[0].end, ts("2026-02-16T15:15:00Z"));
    assert!(report.busy[0].sources.contains("buffer"));
}

#[tokio::test]
async fn earliest_cutoff_wins() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    for cutoff in ["18:00", "16:00"] {
        user.create_constraint(
            ConstraintKind::NoMeetingsAfter,
            json!({ "cutoff": cutoff, "timezone": "UTC" }),
            None,
            None,
        )
        .await
        .unwrap();
    }

    let report = user
        .compute_availability("2026-02-16T12:00:00Z", "2026-02-17T00:00:00Z", None)
        .await
        .unwrap();
    assert_gap_free(&report);
    assert_eq!(report.busy.len(), 1);
    assert_eq!(report.busy[0].start, ts("2026-02-16T16:00:00Z"));
    assert_eq!(report.busy[0].end, ts("2026-02-17T00:00:00Z"));
}

#[tokio::test]
async fn date_only_and_datetime_events_merge() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let mut all_day = provider_event("Offsite", "2026-02-16", "2026-02-16");
    all_day.all_day = true;
    user.apply_provider_delta(
        acc("acc_a"),
        vec![
            ProviderDelta::Created {
                origin_event_id: "g1".to_string(),
                event: all_day,
            },
            ProviderDelta::Created {
                origin_event_id: "g2".to_string(),
                event: provider_event("Late call", "2026-02-16T23:00:00Z", "2026-02-16T23:30:00Z"),
            },
        ],
    )
    .await
    .unwrap();

    let report = user
        .compute_availability("2026-02-16T00:00:00Z", "2026-02-18T00:00:00Z", None)
        .await
        .unwrap();
    assert_gap_free(&report);
    // The timed event is swallowed by the all-day block.
    assert_eq!(report.busy.len(), 1);
    assert_eq!(report.busy[0].start, ts("2026-02-16T00:00:00Z"));
    assert_eq!(report.busy[0].end, ts("2026-02-17T00:00:00Z"));
    assert_eq!(report.free.len(), 1);
}

#[tokio::test]
async fn milestones_block_their_day() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    user.create_milestone(calfed_engine::relationships::NewMilestone {
        relationship_id: None,
        title: "Ada's birthday".to_string(),
        month: 2,
        day: 17,
        year: None,
        recurring: true,
    })
    .await
    .unwrap();

    let report = user
        .compute_availability("2026-02-16T00:00:00Z", "2026-02-19T00:00:00Z", None)
        .await
        .unwrap();
    assert_gap_free(&report);
    assert_eq!(report.busy.len(), 1);
    assert_eq!(report.busy[0].start, ts("2026-02-17T00:00:00Z"));
    assert_eq!(report.busy[0].end, ts("2026-02-18T00:00:00Z"));
    assert!(report.busy[0].sources.contains("milestone"));
}

#[tokio::test]
async fn cancelled_and_transparent_events_do_not_block() {
    let engine = TestEngine::start();
    let user = engine.user("usr_alice").await;
    let mut transparent =
        provider_event("FYI", "2026-02-16T10:00:00Z", "2026-02-16T11:00:00Z");
    transparent.transparency = calfed_core::event::Transparency::Transparent;
    user.apply_provider_delta(
        acc("acc_a"),
        vec![
            ProviderDelta::Created {
                origin_event_id: "g1".to_string(),
                event: transparent,
            },
            ProviderDelta::Created {
                origin_event_id: "g2".to_string(),
                event: provider_event("Real", "2026-02-16T12:00:00Z", "2026-02-16T13:00:00Z"),
            },
            ProviderDelta::Deleted {
                origin_event_id: "g2".to_string(),
            },
        ],
    )
    .await
    .unwrap();

    let report = user
        .compute_availability("2026-02-16T00:00:00Z", "2026-02-17T00:00:00Z", None)
        .await
        .unwrap();
    assert!(report.busy.is_empty());
    assert_eq!(report.free.len(), 1);
}
