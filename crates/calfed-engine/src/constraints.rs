//! Constraint persistence and the trip-derived event lifecycle.
//!
//! Edge constraints materialize as policy edges for the projection engine.
//! Trip constraints derive exactly one system-source canonical event whose
//! mirrors ride the normal write-back pipeline; deleting the constraint
//! cancels the derived event and detaches any remaining references while
//! in-flight mirror deletes finish their journey.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::json;

use calfed_core::constraint::{Constraint, ConstraintConfig, ConstraintKind, PolicyEdge, TripConfig};
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::{
    CanonicalEvent, EventSource, EventStatus, Transparency, Visibility,
};
use calfed_core::ids::{AccountId, ConstraintId, EventId};

use crate::events;
use crate::journal::{self, ChangeType};
use crate::queue::MirrorJob;
use crate::store::schema::constraints;

/// Origin account recorded on derived system events.
const SYSTEM_ACCOUNT: &str = "system";
const CONSTRAINT_ACTOR: &str = "constraints";

#[derive(Debug, Queryable)]
struct ConstraintRecord {
    constraint_id: String,
    kind: String,
    config_json: String,
    active_from: Option<DateTime<Utc>>,
    active_to: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConstraintRecord> for Constraint {
    type Error = EngineError;

    fn try_from(record: ConstraintRecord) -> EngineResult<Self> {
        Ok(Constraint {
            constraint_id: ConstraintId::parse(&record.constraint_id)?,
            kind: ConstraintKind::parse(&record.kind)?,
            config: serde_json::from_str(&record.config_json)?,
            active_from: record.active_from,
            active_to: record.active_to,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Validate and insert a constraint. Trips also derive their system event;
/// the returned jobs mirror it out.
pub fn create(
    conn: &mut SqliteConnection,
    user_id: &str,
    kind: ConstraintKind,
    config: serde_json::Value,
    active_from: Option<DateTime<Utc>>,
    active_to: Option<DateTime<Utc>>,
) -> EngineResult<(Constraint, Vec<MirrorJob>)> {
    let typed = ConstraintConfig::from_value(kind, &config)?;
    let now = Utc::now();
    let constraint = Constraint {
        constraint_id: ConstraintId::generate(),
        kind,
        config,
        active_from,
        active_to,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(constraints::table)
        .values((
            constraints::constraint_id.eq(constraint.constraint_id.as_str()),
            constraints::kind.eq(constraint.kind.as_str()),
            constraints::config_json.eq(constraint.config.to_string()),
            constraints::active_from.eq(constraint.active_from),
            constraints::active_to.eq(constraint.active_to),
            constraints::created_at.eq(constraint.created_at),
            constraints::updated_at.eq(constraint.updated_at),
        ))
        .execute(conn)?;

    let jobs = match typed {
        ConstraintConfig::Trip(trip) => {
            let event = derive_trip_event(conn, &constraint.constraint_id, &trip)?;
            crate::ingest::recompute_mirrors(conn, user_id, &event)?
        }
        _ => {
            // New or changed edges can select existing events.
            if kind == ConstraintKind::Edge {
                reproject_all(conn, user_id)?
            } else {
                Vec::new()
            }
        }
    };
    Ok((constraint, jobs))
}

/// Update config and active window, revalidating against the stored kind.
pub fn update(
    conn: &mut SqliteConnection,
    user_id: &str,
    constraint_id: &ConstraintId,
    config: serde_json::Value,
    active_from: Option<DateTime<Utc>>,
    active_to: Option<DateTime<Utc>>,
) -> EngineResult<(Constraint, Vec<MirrorJob>)> {
    let current = get(conn, constraint_id)?;
    let typed = ConstraintConfig::from_value(current.kind, &config)?;
    let now = Utc::now();
    diesel::update(constraints::table.filter(constraints::constraint_id.eq(constraint_id.as_str())))
        .set((
            constraints::config_json.eq(config.to_string()),
            constraints::active_from.eq(active_from),
            constraints::active_to.eq(active_to),
            constraints::updated_at.eq(now),
        ))
        .execute(conn)?;

    let jobs = match typed {
        ConstraintConfig::Trip(trip) => {
            let event = match events::find_by_constraint(conn, constraint_id)? {
                Some(existing) => refresh_trip_event(conn, existing, &trip)?,
                None => derive_trip_event(conn, constraint_id, &trip)?,
            };
            crate::ingest::recompute_mirrors(conn, user_id, &event)?
        }
        ConstraintConfig::Edge(_) => reproject_all(conn, user_id)?,
        _ => Vec::new(),
    };
    Ok((get(conn, constraint_id)?, jobs))
}

/// Delete a constraint. The derived trip event (if any) is cancelled and
/// its mirrors enter DELETING; other canonical rows referencing the
/// constraint are detached before the row is removed.
pub fn delete(
    conn: &mut SqliteConnection,
    user_id: &str,
    constraint_id: &ConstraintId,
) -> EngineResult<Vec<MirrorJob>> {
    let current = get(conn, constraint_id)?;
    let mut jobs = Vec::new();

    if current.kind == ConstraintKind::Trip {
        if let Some(event) = events::find_by_constraint(conn, constraint_id)? {
            let cancelled = CanonicalEvent {
                status: EventStatus::Cancelled,
                version: event.version + 1,
                constraint_id: None,
                updated_at: Utc::now(),
                ..event
            };
            events::update(conn, &cancelled)?;
            journal::append(
                conn,
                &cancelled.canonical_event_id,
                ChangeType::Deleted,
                CONSTRAINT_ACTOR,
                &json!({ "constraint_deleted": constraint_id.as_str() }),
            )?;
            jobs.extend(crate::ingest::recompute_mirrors(conn, user_id, &cancelled)?);
        }
    }
    events::detach_constraint(conn, constraint_id)?;
    diesel::delete(constraints::table.filter(constraints::constraint_id.eq(constraint_id.as_str())))
        .execute(conn)?;

    if current.kind == ConstraintKind::Edge {
        jobs.extend(reproject_all(conn, user_id)?);
    }
    Ok(jobs)
}

pub fn get(conn: &mut SqliteConnection, constraint_id: &ConstraintId) -> EngineResult<Constraint> {
    let record: Option<ConstraintRecord> = constraints::table
        .filter(constraints::constraint_id.eq(constraint_id.as_str()))
        .first(conn)
        .optional()?;
    record
        .ok_or_else(|| EngineError::not_found("constraint", constraint_id.as_str()))?
        .try_into()
}

/// List constraints, optionally filtered by kind.
pub fn list(
    conn: &mut SqliteConnection,
    kind: Option<ConstraintKind>,
) -> EngineResult<Vec<Constraint>> {
    let records: Vec<ConstraintRecord> = match kind {
        Some(kind) => constraints::table
            .filter(constraints::kind.eq(kind.as_str()))
            .order(constraints::created_at.asc())
            .load(conn)?,
        None => constraints::table
            .order(constraints::created_at.asc())
            .load(conn)?,
    };
    records.into_iter().map(Constraint::try_from).collect()
}

/// Materialize the active policy edges. Rows whose config no longer
/// validates are skipped with a warning rather than poisoning projection;
/// older rows may predate schema tightening.
pub fn active_policy_edges(conn: &mut SqliteConnection) -> EngineResult<Vec<PolicyEdge>> {
    let mut edges = Vec::new();
    for constraint in list(conn, Some(ConstraintKind::Edge))? {
        match PolicyEdge::from_constraint(&constraint) {
            Ok(edge) => edges.push(edge),
            Err(error) => {
                tracing::warn!(
                    constraint_id = %constraint.constraint_id,
                    error = %error,
                    "skipping edge with invalid config"
                );
            }
        }
    }
    Ok(edges)
}

/// Whether `event` is the derived event of a trip constraint.
pub fn is_trip_derived(
    conn: &mut SqliteConnection,
    event: &CanonicalEvent,
) -> EngineResult<bool> {
    if event.source != EventSource::System {
        return Ok(false);
    }
    let Some(constraint_id) = &event.constraint_id else {
        return Ok(false);
    };
    match get(conn, constraint_id) {
        Ok(constraint) => Ok(constraint.kind == ConstraintKind::Trip),
        Err(EngineError::NotFound { .. }) => Ok(false),
        Err(error) => Err(error),
    }
}

/// Re-run projection for every live event. Used when the edge set itself
/// changes.
fn reproject_all(conn: &mut SqliteConnection, user_id: &str) -> EngineResult<Vec<MirrorJob>> {
    let mut jobs = Vec::new();
    for event in events::list_non_cancelled(conn)? {
        jobs.extend(crate::ingest::recompute_mirrors(conn, user_id, &event)?);
    }
    Ok(jobs)
}

fn trip_event_fields(trip: &TripConfig) -> (String, String, String) {
    (
        format!("Trip: {}", trip.destination),
        trip.start_date.clone(),
        trip.end_date.clone(),
    )
}

fn derive_trip_event(
    conn: &mut SqliteConnection,
    constraint_id: &ConstraintId,
    trip: &TripConfig,
) -> EngineResult<CanonicalEvent> {
    let (title, start_ts, end_ts) = trip_event_fields(trip);
    let now = Utc::now();
    let event = CanonicalEvent {
        canonical_event_id: EventId::generate(),
        origin_account_id: AccountId::new(SYSTEM_ACCOUNT),
        origin_event_id: constraint_id.to_string(),
        title,
        description: None,
        location: Some(trip.destination.clone()),
        start_ts,
        end_ts,
        timezone: trip.timezone.clone(),
        all_day: true,
        status: EventStatus::Confirmed,
        visibility: Visibility::Default,
        transparency: Transparency::Opaque,
        recurrence_rule: None,
        source: EventSource::System,
        version: 1,
        constraint_id: Some(constraint_id.clone()),
        created_at: now,
        updated_at: now,
    };
    events::insert(conn, &event)?;
    journal::append(
        conn,
        &event.canonical_event_id,
        ChangeType::Created,
        CONSTRAINT_ACTOR,
        &serde_json::to_value(&event)?,
    )?;
    Ok(event)
}

fn refresh_trip_event(
    conn: &mut SqliteConnection,
    existing: CanonicalEvent,
    trip: &TripConfig,
) -> EngineResult<CanonicalEvent> {
    let (title, start_ts, end_ts) = trip_event_fields(trip);
    let updated = CanonicalEvent {
        title,
        start_ts,
        end_ts,
        location: Some(trip.destination.clone()),
        timezone: trip.timezone.clone(),
        status: EventStatus::Confirmed,
        version: existing.version + 1,
        updated_at: Utc::now(),
        ..existing
    };
    events::update(conn, &updated)?;
    journal::append(
        conn,
        &updated.canonical_event_id,
        ChangeType::Updated,
        CONSTRAINT_ACTOR,
        &json!({ "trip": { "start_date": updated.start_ts, "end_date": updated.end_ts } }),
    )?;
    Ok(updated)
}
