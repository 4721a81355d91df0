//! Canonical event persistence.
//!
//! Row mapping and queries for `canonical_events` and the per-event
//! participant side table. Cancelled events stay as tombstone rows so
//! journal references and mirror teardown always have a target.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::{CanonicalEvent, EventSource, EventStatus, Transparency, Visibility};
use calfed_core::ids::{AccountId, ConstraintId, EventId};

use crate::store::schema::{canonical_events, event_participants};

#[derive(Debug, Queryable)]
struct EventRecord {
    canonical_event_id: String,
    origin_account_id: String,
    origin_event_id: String,
    title: String,
    description: Option<String>,
    location: Option<String>,
    start_ts: String,
    end_ts: String,
    timezone: Option<String>,
    all_day: bool,
    status: String,
    visibility: String,
    transparency: String,
    recurrence_rule: Option<String>,
    source: String,
    version: i64,
    constraint_id: Option<String>,
    payload_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRecord> for CanonicalEvent {
    type Error = EngineError;

    fn try_from(record: EventRecord) -> EngineResult<Self> {
        Ok(CanonicalEvent {
            canonical_event_id: EventId::parse(&record.canonical_event_id)?,
            origin_account_id: AccountId::new(record.origin_account_id),
            origin_event_id: record.origin_event_id,
            title: record.title,
            description: record.description,
            location: record.location,
            start_ts: record.start_ts,
            end_ts: record.end_ts,
            timezone: record.timezone,
            all_day: record.all_day,
            status: EventStatus::parse(&record.status)?,
            visibility: Visibility::parse(&record.visibility)?,
            transparency: Transparency::parse(&record.transparency)?,
            recurrence_rule: record.recurrence_rule,
            source: EventSource::parse(&record.source)?,
            version: record.version,
            constraint_id: record
                .constraint_id
                .as_deref()
                .map(ConstraintId::parse)
                .transpose()?,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Insert a canonical event row. The payload hash is recomputed here so
/// every writer goes through the same hashing rule.
pub fn insert(conn: &mut SqliteConnection, event: &CanonicalEvent) -> EngineResult<()> {
    diesel::insert_into(canonical_events::table)
        .values((
            canonical_events::canonical_event_id.eq(event.canonical_event_id.as_str()),
            canonical_events::origin_account_id.eq(event.origin_account_id.as_str()),
            canonical_events::origin_event_id.eq(&event.origin_event_id),
            canonical_events::title.eq(&event.title),
            canonical_events::description.eq(&event.description),
            canonical_events::location.eq(&event.location),
            canonical_events::start_ts.eq(&event.start_ts),
            canonical_events::end_ts.eq(&event.end_ts),
            canonical_events::timezone.eq(&event.timezone),
            canonical_events::all_day.eq(event.all_day),
            canonical_events::status.eq(event.status.as_str()),
            canonical_events::visibility.eq(event.visibility.as_str()),
            canonical_events::transparency.eq(event.transparency.as_str()),
            canonical_events::recurrence_rule.eq(&event.recurrence_rule),
            canonical_events::source.eq(event.source.as_str()),
            canonical_events::version.eq(event.version),
            canonical_events::constraint_id
                .eq(event.constraint_id.as_ref().map(|id| id.as_str())),
            canonical_events::payload_hash.eq(event.payload_hash()),
            canonical_events::created_at.eq(event.created_at),
            canonical_events::updated_at.eq(event.updated_at),
        ))
        .execute(conn)?;
    Ok(())
}

/// Rewrite every mutable column of an existing row.
pub fn update(conn: &mut SqliteConnection, event: &CanonicalEvent) -> EngineResult<()> {
    diesel::update(
        canonical_events::table
            .filter(canonical_events::canonical_event_id.eq(event.canonical_event_id.as_str())),
    )
    .set((
        canonical_events::title.eq(&event.title),
        canonical_events::description.eq(&event.description),
        canonical_events::location.eq(&event.location),
        canonical_events::start_ts.eq(&event.start_ts),
        canonical_events::end_ts.eq(&event.end_ts),
        canonical_events::timezone.eq(&event.timezone),
        canonical_events::all_day.eq(event.all_day),
        canonical_events::status.eq(event.status.as_str()),
        canonical_events::visibility.eq(event.visibility.as_str()),
        canonical_events::transparency.eq(event.transparency.as_str()),
        canonical_events::recurrence_rule.eq(&event.recurrence_rule),
        canonical_events::version.eq(event.version),
        canonical_events::constraint_id.eq(event.constraint_id.as_ref().map(|id| id.as_str())),
        canonical_events::payload_hash.eq(event.payload_hash()),
        canonical_events::updated_at.eq(event.updated_at),
    ))
    .execute(conn)?;
    Ok(())
}

pub fn get(conn: &mut SqliteConnection, id: &EventId) -> EngineResult<CanonicalEvent> {
    let record: Option<EventRecord> = canonical_events::table
        .filter(canonical_events::canonical_event_id.eq(id.as_str()))
        .first(conn)
        .optional()?;
    record
        .ok_or_else(|| EngineError::not_found("canonical event", id.as_str()))?
        .try_into()
}

/// Resolve by the `(origin_account_id, origin_event_id)` unique key.
pub fn find_by_origin(
    conn: &mut SqliteConnection,
    origin_account: &AccountId,
    origin_event_id: &str,
) -> EngineResult<Option<CanonicalEvent>> {
    let record: Option<EventRecord> = canonical_events::table
        .filter(canonical_events::origin_account_id.eq(origin_account.as_str()))
        .filter(canonical_events::origin_event_id.eq(origin_event_id))
        .first(conn)
        .optional()?;
    record.map(CanonicalEvent::try_from).transpose()
}

/// The derived event of a trip constraint, if present.
pub fn find_by_constraint(
    conn: &mut SqliteConnection,
    constraint_id: &ConstraintId,
) -> EngineResult<Option<CanonicalEvent>> {
    let record: Option<EventRecord> = canonical_events::table
        .filter(canonical_events::constraint_id.eq(constraint_id.as_str()))
        .first(conn)
        .optional()?;
    record.map(CanonicalEvent::try_from).transpose()
}

/// Clear `constraint_id` on rows referencing a constraint being deleted.
pub fn detach_constraint(
    conn: &mut SqliteConnection,
    constraint_id: &ConstraintId,
) -> EngineResult<usize> {
    Ok(diesel::update(
        canonical_events::table
            .filter(canonical_events::constraint_id.eq(constraint_id.as_str())),
    )
    .set(canonical_events::constraint_id.eq(None::<String>))
    .execute(conn)?)
}

/// Every non-cancelled event; availability and analytics filter further
/// in memory after time normalization.
pub fn list_non_cancelled(conn: &mut SqliteConnection) -> EngineResult<Vec<CanonicalEvent>> {
    let records: Vec<EventRecord> = canonical_events::table
        .filter(canonical_events::status.ne(EventStatus::Cancelled.as_str()))
        .order(canonical_events::start_ts.asc())
        .load(conn)?;
    records.into_iter().map(CanonicalEvent::try_from).collect()
}

/// Every event, any status. Snapshot surface.
pub fn list_all(conn: &mut SqliteConnection) -> EngineResult<Vec<CanonicalEvent>> {
    let records: Vec<EventRecord> = canonical_events::table
        .order(canonical_events::start_ts.asc())
        .load(conn)?;
    records.into_iter().map(CanonicalEvent::try_from).collect()
}

/// One stored participant row.
#[derive(Debug, Clone, Queryable)]
pub struct ParticipantRow {
    pub id: i64,
    pub canonical_event_id: String,
    pub participant_hash: String,
    pub display_name: Option<String>,
    pub response_status: Option<String>,
}

/// Replace the participant set of one event.
pub fn replace_participants(
    conn: &mut SqliteConnection,
    event_id: &EventId,
    participants: &[(String, Option<String>, Option<String>)],
) -> EngineResult<()> {
    diesel::delete(
        event_participants::table
            .filter(event_participants::canonical_event_id.eq(event_id.as_str())),
    )
    .execute(conn)?;
    for (hash, display_name, response_status) in participants {
        diesel::insert_into(event_participants::table)
            .values((
                event_participants::canonical_event_id.eq(event_id.as_str()),
                event_participants::participant_hash.eq(hash),
                event_participants::display_name.eq(display_name),
                event_participants::response_status.eq(response_status),
            ))
            .execute(conn)?;
    }
    Ok(())
}

pub fn participants_for_event(
    conn: &mut SqliteConnection,
    event_id: &EventId,
) -> EngineResult<Vec<ParticipantRow>> {
    Ok(event_participants::table
        .filter(event_participants::canonical_event_id.eq(event_id.as_str()))
        .load(conn)?)
}

/// Events a participant appears on; timeline assembly sorts by start.
pub fn events_for_participant(
    conn: &mut SqliteConnection,
    participant_hash: &str,
) -> EngineResult<Vec<CanonicalEvent>> {
    let ids: Vec<String> = event_participants::table
        .filter(event_participants::participant_hash.eq(participant_hash))
        .select(event_participants::canonical_event_id)
        .load(conn)?;
    let records: Vec<EventRecord> = canonical_events::table
        .filter(canonical_events::canonical_event_id.eq_any(ids))
        .load(conn)?;
    records.into_iter().map(CanonicalEvent::try_from).collect()
}

/// Participant counts per event id, for analytics slices.
pub fn participant_counts(
    conn: &mut SqliteConnection,
) -> EngineResult<std::collections::HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = event_participants::table
        .group_by(event_participants::canonical_event_id)
        .select((
            event_participants::canonical_event_id,
            diesel::dsl::count_star(),
        ))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}
