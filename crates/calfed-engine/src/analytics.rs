//! Read-only analytics façade.
//!
//! Each operation fetches the minimum SQL slice and delegates to the pure
//! functions in `calfed_core::analytics`, so every result is deterministic
//! over a store snapshot.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::analytics::{
    context_switches, daily_cognitive_load, day_risk_scores, deep_work_windows,
    reputation_score, slot_probabilities, ContextSwitch, DailyLoad, DayRisk, DeepWorkWindow,
    MeetingSlice, OutcomeKind, ReputationSummary, SlotProbability,
};
use calfed_core::error::EngineResult;
use calfed_core::event::{CanonicalEvent, Transparency};
use calfed_core::ids::EventId;
use calfed_core::interval::normalize_time;

use crate::availability;
use crate::events;
use crate::relationships::{self, LedgerEntry, Relationship};

/// Free windows long enough for focused work.
const DEEP_WORK_MIN_MINUTES: i64 = 90;

/// Briefing for one event: who is in the room and how reliable they have
/// been.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBriefing {
    pub event: CanonicalEvent,
    pub participants: Vec<ParticipantBrief>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantBrief {
    pub participant_hash: String,
    pub display_name: Option<String>,
    pub response_status: Option<String>,
    pub relationship: Option<Relationship>,
    pub reputation: Option<ReputationSummary>,
    pub recent_outcomes: Vec<LedgerEntry>,
}

/// Opaque non-cancelled events in `[start, end)` as analytics slices.
fn meeting_slices(
    conn: &mut SqliteConnection,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> EngineResult<Vec<MeetingSlice>> {
    let counts = events::participant_counts(conn)?;
    let mut slices = Vec::new();
    for event in events::list_non_cancelled(conn)? {
        if event.transparency != Transparency::Opaque || event.all_day {
            continue;
        }
        let (Ok(start), Ok(end)) = (
            normalize_time(&event.start_ts),
            normalize_time(&event.end_ts),
        ) else {
            continue;
        };
        if end <= range_start || start >= range_end {
            continue;
        }
        slices.push(MeetingSlice {
            account: event.origin_account_id.to_string(),
            title: event.title.clone(),
            start,
            end,
            attendee_count: counts
                .get(event.canonical_event_id.as_str())
                .copied()
                .unwrap_or(0) as u32,
        });
    }
    Ok(slices)
}

pub fn cognitive_load(
    conn: &mut SqliteConnection,
    range_start_raw: &str,
    range_end_raw: &str,
) -> EngineResult<Vec<DailyLoad>> {
    let start = normalize_time(range_start_raw)?;
    let end = normalize_time(range_end_raw)?;
    Ok(daily_cognitive_load(&meeting_slices(conn, start, end)?))
}

pub fn context_switch_report(
    conn: &mut SqliteConnection,
    range_start_raw: &str,
    range_end_raw: &str,
) -> EngineResult<Vec<ContextSwitch>> {
    let start = normalize_time(range_start_raw)?;
    let end = normalize_time(range_end_raw)?;
    Ok(context_switches(&meeting_slices(conn, start, end)?))
}

/// Deep-work windows: availability gaps of at least ninety minutes.
pub fn deep_work(
    conn: &mut SqliteConnection,
    range_start_raw: &str,
    range_end_raw: &str,
) -> EngineResult<Vec<DeepWorkWindow>> {
    let report = availability::compute(conn, range_start_raw, range_end_raw, None)?;
    Ok(deep_work_windows(&report.free, DEEP_WORK_MIN_MINUTES))
}

pub fn risk_scores(
    conn: &mut SqliteConnection,
    range_start_raw: &str,
    range_end_raw: &str,
) -> EngineResult<Vec<DayRisk>> {
    Ok(day_risk_scores(&cognitive_load(
        conn,
        range_start_raw,
        range_end_raw,
    )?))
}

/// Weekday/hour busy-probability grid learned from the trailing
/// `weeks_back` weeks.
pub fn probabilistic_availability(
    conn: &mut SqliteConnection,
    weeks_back: u32,
) -> EngineResult<Vec<SlotProbability>> {
    let weeks = weeks_back.clamp(1, 52);
    let end = Utc::now();
    let start = end - Duration::weeks(i64::from(weeks));
    let history = meeting_slices(conn, start, end)?;
    Ok(slot_probabilities(&history, weeks))
}

/// Assemble the briefing for one event.
pub fn event_briefing(
    conn: &mut SqliteConnection,
    event_id: &EventId,
) -> EngineResult<EventBriefing> {
    let event = events::get(conn, event_id)?;
    let mut participants = Vec::new();
    for row in events::participants_for_event(conn, event_id)? {
        let relationship = relationships::find_by_hash(conn, &row.participant_hash)?;
        let (reputation, recent_outcomes) = match &relationship {
            Some(rel) => {
                let outcomes = relationships::list_outcomes(conn, &rel.relationship_id)?;
                let kinds: Vec<OutcomeKind> = outcomes.iter().map(|o| o.outcome).collect();
                (
                    Some(reputation_score(&kinds)),
                    outcomes.into_iter().take(5).collect(),
                )
            }
            None => (None, Vec::new()),
        };
        participants.push(ParticipantBrief {
            participant_hash: row.participant_hash,
            display_name: row.display_name,
            response_status: row.response_status,
            relationship,
            reputation,
            recent_outcomes,
        });
    }
    Ok(EventBriefing {
        event,
        participants,
    })
}
