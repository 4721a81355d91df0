//! Provider delta ingestion.
//!
//! Applies one normalized delta batch for one origin account. Per delta:
//! classify (the managed-mirror guard runs before any state is touched),
//! resolve the canonical row, apply, journal, recompute the mirror desired
//! state, then update participant side tables. Each delta runs in its own
//! transaction; per-delta failures accumulate into the batch summary and
//! do not abort siblings, except a store failure which aborts the batch.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::json;

use calfed_core::classify::{classify, EventClass};
use calfed_core::config::EngineConfig;
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::{
    participant_hash, CanonicalEvent, DeltaError, DeltaSummary, EventSource, EventStatus,
    ProviderDelta, ProviderEvent,
};
use calfed_core::ids::{AccountId, EventId};
use calfed_core::projection::project_mirrors;

use crate::constraints;
use crate::events;
use crate::journal::{self, ChangeType};
use crate::mirror;
use crate::queue::MirrorJob;
use crate::relationships;

/// Who gets recorded in the journal for this batch.
const INGESTION_ACTOR: &str = "ingestion";

/// Apply a delta batch. Returns the summary plus the mirror jobs to
/// enqueue after the enclosing actor call commits.
pub fn apply_deltas(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: &str,
    origin_account: &AccountId,
    deltas: &[ProviderDelta],
    source: EventSource,
) -> EngineResult<(DeltaSummary, Vec<MirrorJob>)> {
    let mut summary = DeltaSummary::default();
    let mut jobs = Vec::new();

    for delta in deltas {
        let result = conn.transaction::<_, EngineError, _>(|conn| {
            apply_one(conn, config, user_id, origin_account, delta, source)
        });
        match result {
            Ok(outcome) => {
                match outcome.applied {
                    Applied::Created => summary.created += 1,
                    Applied::Updated => summary.updated += 1,
                    Applied::Deleted => summary.deleted += 1,
                    Applied::Skipped => {}
                }
                summary.mirrors_enqueued += outcome.jobs.len() as u64;
                jobs.extend(outcome.jobs);
            }
            Err(error @ EngineError::Database { .. }) => {
                // Store failure poisons the whole batch.
                return Err(error);
            }
            Err(error) => {
                tracing::warn!(
                    origin_event_id = delta.origin_event_id(),
                    error = %error,
                    "delta failed"
                );
                summary.errors.push(DeltaError {
                    origin_event_id: delta.origin_event_id().to_string(),
                    code: error.code().to_string(),
                    message: error.to_string(),
                });
            }
        }
    }

    Ok((summary, jobs))
}

enum Applied {
    Created,
    Updated,
    Deleted,
    Skipped,
}

struct DeltaOutcome {
    applied: Applied,
    jobs: Vec<MirrorJob>,
}

fn apply_one(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: &str,
    origin_account: &AccountId,
    delta: &ProviderDelta,
    source: EventSource,
) -> EngineResult<DeltaOutcome> {
    match delta {
        ProviderDelta::Created {
            origin_event_id,
            event,
        }
        | ProviderDelta::Updated {
            origin_event_id,
            event,
        } => {
            match classify(event, config.external_mirror_tag.as_deref()) {
                EventClass::ManagedMirror => {
                    // Our own write-back observed through the provider;
                    // the sync-loop guard discards it untouched.
                    tracing::debug!(
                        origin_event_id = %origin_event_id,
                        account = %origin_account,
                        "discarding managed mirror echo"
                    );
                    return Ok(DeltaOutcome {
                        applied: Applied::Skipped,
                        jobs: Vec::new(),
                    });
                }
                EventClass::Origin | EventClass::ExternalMirror => {}
            }
            event.validate()?;
            let existing = events::find_by_origin(conn, origin_account, origin_event_id)?;
            match existing {
                None => {
                    let canonical =
                        insert_canonical(conn, origin_account, origin_event_id, event, source)?;
                    let jobs = recompute_mirrors(conn, user_id, &canonical)?;
                    record_participants(conn, config, &canonical, event)?;
                    Ok(DeltaOutcome {
                        applied: Applied::Created,
                        jobs,
                    })
                }
                Some(current) => {
                    let (canonical, changed) = update_canonical(conn, current, event)?;
                    let jobs = if changed {
                        recompute_mirrors(conn, user_id, &canonical)?
                    } else {
                        Vec::new()
                    };
                    record_participants(conn, config, &canonical, event)?;
                    Ok(DeltaOutcome {
                        applied: Applied::Updated,
                        jobs,
                    })
                }
            }
        }
        ProviderDelta::Deleted { origin_event_id } => {
            // A delete of one of our own mirrors on this account means the
            // user removed it provider-side: tombstone, never re-ingest.
            if let Some(mirror_id) =
                mirror::tombstone_by_provider_id(conn, origin_account, origin_event_id)?
            {
                tracing::debug!(%mirror_id, origin_event_id = %origin_event_id, "delete delta matched a managed mirror");
                return Ok(DeltaOutcome {
                    applied: Applied::Skipped,
                    jobs: Vec::new(),
                });
            }
            let Some(current) = events::find_by_origin(conn, origin_account, origin_event_id)?
            else {
                tracing::debug!(origin_event_id = %origin_event_id, "delete delta for unknown event, ignoring");
                return Ok(DeltaOutcome {
                    applied: Applied::Skipped,
                    jobs: Vec::new(),
                });
            };
            let jobs = delete_canonical(conn, user_id, current)?;
            Ok(DeltaOutcome {
                applied: Applied::Deleted,
                jobs,
            })
        }
    }
}

fn canonical_from_provider(
    origin_account: &AccountId,
    origin_event_id: &str,
    event: &ProviderEvent,
    source: EventSource,
) -> CanonicalEvent {
    let now = Utc::now();
    CanonicalEvent {
        canonical_event_id: EventId::generate(),
        origin_account_id: origin_account.clone(),
        origin_event_id: origin_event_id.to_string(),
        title: event.title.clone(),
        description: event.description.clone(),
        location: event.location.clone(),
        start_ts: event.start.clone(),
        end_ts: event.end.clone(),
        timezone: event.timezone.clone(),
        all_day: event.all_day,
        status: event.status,
        visibility: event.visibility,
        transparency: event.transparency,
        recurrence_rule: event.recurrence_rule.clone(),
        source,
        version: 1,
        constraint_id: None,
        created_at: now,
        updated_at: now,
    }
}

fn insert_canonical(
    conn: &mut SqliteConnection,
    origin_account: &AccountId,
    origin_event_id: &str,
    event: &ProviderEvent,
    source: EventSource,
) -> EngineResult<CanonicalEvent> {
    let canonical = canonical_from_provider(origin_account, origin_event_id, event, source);
    events::insert(conn, &canonical)?;
    journal::append(
        conn,
        &canonical.canonical_event_id,
        ChangeType::Created,
        INGESTION_ACTOR,
        &serde_json::to_value(&canonical)?,
    )?;
    Ok(canonical)
}

/// Apply an update delta. Returns the row plus whether anything changed.
/// No-ops when the payload hash is unchanged (version stays put) or when
/// the provider's modification stamp is older than what we stored.
fn update_canonical(
    conn: &mut SqliteConnection,
    current: CanonicalEvent,
    event: &ProviderEvent,
) -> EngineResult<(CanonicalEvent, bool)> {
    let incoming = canonical_from_provider(
        &current.origin_account_id,
        &current.origin_event_id,
        event,
        current.source,
    );
    if incoming.payload_hash() == current.payload_hash() {
        return Ok((current, false));
    }
    if let Some(incoming_stamp) = event.updated_at {
        if incoming_stamp < current.updated_at {
            tracing::debug!(
                canonical_event_id = %current.canonical_event_id,
                "stale provider update ignored"
            );
            return Ok((current, false));
        }
    }

    let patch = diff_patch(&current, &incoming);
    let updated = CanonicalEvent {
        canonical_event_id: current.canonical_event_id.clone(),
        origin_account_id: current.origin_account_id.clone(),
        origin_event_id: current.origin_event_id.clone(),
        source: current.source,
        constraint_id: current.constraint_id.clone(),
        created_at: current.created_at,
        version: current.version + 1,
        updated_at: Utc::now(),
        ..incoming
    };
    events::update(conn, &updated)?;
    journal::append(
        conn,
        &updated.canonical_event_id,
        ChangeType::Updated,
        INGESTION_ACTOR,
        &patch,
    )?;
    Ok((updated, true))
}

/// Cancel the canonical row and tear its mirrors down. The row stays as a
/// tombstone; mirrors transition to DELETING via reconciliation against an
/// empty desired set.
fn delete_canonical(
    conn: &mut SqliteConnection,
    user_id: &str,
    current: CanonicalEvent,
) -> EngineResult<Vec<MirrorJob>> {
    let cancelled = CanonicalEvent {
        status: EventStatus::Cancelled,
        version: current.version + 1,
        updated_at: Utc::now(),
        ..current
    };
    events::update(conn, &cancelled)?;
    journal::append(
        conn,
        &cancelled.canonical_event_id,
        ChangeType::Deleted,
        INGESTION_ACTOR,
        &json!({ "status": "cancelled" }),
    )?;
    recompute_mirrors(conn, user_id, &cancelled)
}

/// Re-run projection for one event against the active policy edges and
/// reconcile the mirror table. Cancelled events project to nothing, which
/// is exactly the teardown path.
pub fn recompute_mirrors(
    conn: &mut SqliteConnection,
    user_id: &str,
    event: &CanonicalEvent,
) -> EngineResult<Vec<MirrorJob>> {
    let edges = constraints::active_policy_edges(conn)?;
    let desired = if constraints::is_trip_derived(conn, event)? {
        calfed_core::projection::project_trip_mirrors(event, &edges)
    } else {
        project_mirrors(event, &edges)
    };
    mirror::reconcile(conn, user_id, event, &desired)
}

/// Store attendees and touch relationship freshness for known ones.
fn record_participants(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    canonical: &CanonicalEvent,
    event: &ProviderEvent,
) -> EngineResult<()> {
    if event.attendees.is_empty() {
        return Ok(());
    }
    let rows: Vec<(String, Option<String>, Option<String>)> = event
        .attendees
        .iter()
        .map(|attendee| {
            (
                participant_hash(&attendee.email, &config.participant_salt),
                attendee.display_name.clone(),
                attendee.response_status.clone(),
            )
        })
        .collect();
    events::replace_participants(conn, &canonical.canonical_event_id, &rows)?;

    let interaction_ts = calfed_core::interval::normalize_time(&canonical.start_ts)
        .unwrap_or_else(|_| Utc::now());
    for (hash, _, _) in &rows {
        relationships::touch_last_interaction(conn, hash, interaction_ts)?;
    }
    Ok(())
}

/// Field-level patch between two canonical versions, journaled with the
/// update.
fn diff_patch(before: &CanonicalEvent, after: &CanonicalEvent) -> serde_json::Value {
    let mut patch = serde_json::Map::new();
    let before_value = serde_json::to_value(before).unwrap_or_default();
    let after_value = serde_json::to_value(after).unwrap_or_default();
    let (Some(before_map), Some(after_map)) = (before_value.as_object(), after_value.as_object())
    else {
        return json!({});
    };
    for (key, after_field) in after_map {
        if matches!(
            key.as_str(),
            "canonical_event_id"
                | "origin_account_id"
                | "origin_event_id"
                | "source"
                | "constraint_id"
                | "version"
                | "updated_at"
                | "created_at"
        ) {
            continue;
        }
        if before_map.get(key) != Some(after_field) {
            patch.insert(
                key.clone(),
                json!({
                    "from": before_map.get(key).cloned().unwrap_or(serde_json::Value::Null),
                    "to": after_field.clone(),
                }),
            );
        }
    }
    serde_json::Value::Object(patch)
}
