//! Mirror state table and the per-mirror write state machine.
//!
//! One row per `(canonical_event_id, target_account_id, target_calendar_id)`
//! key. The desired payload and projection hash live on the row, so queued
//! jobs carry keys only and a writer always claims the *current* desired
//! state. State machine:
//!
//! ```text
//! PENDING_CREATE -> WRITING -> LIVE
//! LIVE -> PENDING_UPDATE -> WRITING -> LIVE
//! LIVE | PENDING_* -> DELETING -> WRITING -> DELETED
//! any + external removal observed -> TOMBSTONED
//! any + permanent provider error  -> FAILED -> (manual reset)
//! ```
//!
//! `DELETED` and `TOMBSTONED` are terminal. The `WRITING` guard serializes
//! concurrent job deliveries for the same row: a claim whose expected
//! state no longer holds is acknowledged without acting.

pub mod writer;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::config::EngineConfig;
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::CanonicalEvent;
use calfed_core::ids::{AccountId, CalendarId, EventId, MirrorId};
use calfed_core::projection::{MirrorPayload, MirrorTarget};

use crate::queue::{MirrorJob, MirrorJobKind};
use crate::store::schema::event_mirrors;
use writer::RetryPolicy;

/// Mirror lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorState {
    PendingCreate,
    PendingUpdate,
    Writing,
    Live,
    Deleting,
    Deleted,
    Tombstoned,
    Failed,
}

impl MirrorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorState::PendingCreate => "PENDING_CREATE",
            MirrorState::PendingUpdate => "PENDING_UPDATE",
            MirrorState::Writing => "WRITING",
            MirrorState::Live => "LIVE",
            MirrorState::Deleting => "DELETING",
            MirrorState::Deleted => "DELETED",
            MirrorState::Tombstoned => "TOMBSTONED",
            MirrorState::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "PENDING_CREATE" => Ok(MirrorState::PendingCreate),
            "PENDING_UPDATE" => Ok(MirrorState::PendingUpdate),
            "WRITING" => Ok(MirrorState::Writing),
            "LIVE" => Ok(MirrorState::Live),
            "DELETING" => Ok(MirrorState::Deleting),
            "DELETED" => Ok(MirrorState::Deleted),
            "TOMBSTONED" => Ok(MirrorState::Tombstoned),
            "FAILED" => Ok(MirrorState::Failed),
            other => Err(EngineError::validation(format!(
                "invalid mirror state: {:?}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MirrorState::Deleted | MirrorState::Tombstoned)
    }
}

/// One mirror row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMirror {
    pub mirror_id: MirrorId,
    pub canonical_event_id: EventId,
    pub target_account_id: AccountId,
    pub target_calendar_id: CalendarId,
    pub provider_event_id: Option<String>,
    pub last_projected_hash: Option<String>,
    pub desired_payload: Option<MirrorPayload>,
    pub state: MirrorState,
    pub error: Option<String>,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_write_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Queryable)]
struct MirrorRecord {
    mirror_id: String,
    canonical_event_id: String,
    target_account_id: String,
    target_calendar_id: String,
    provider_event_id: Option<String>,
    last_projected_hash: Option<String>,
    desired_payload: Option<String>,
    state: String,
    error: Option<String>,
    attempt_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_write_ts: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MirrorRecord> for EventMirror {
    type Error = EngineError;

    fn try_from(record: MirrorRecord) -> EngineResult<Self> {
        let desired_payload = record
            .desired_payload
            .as_deref()
            .map(serde_json::from_str::<MirrorPayload>)
            .transpose()?;
        Ok(EventMirror {
            mirror_id: MirrorId::parse(&record.mirror_id)?,
            canonical_event_id: EventId::parse(&record.canonical_event_id)?,
            target_account_id: AccountId::new(record.target_account_id),
            target_calendar_id: CalendarId::new(record.target_calendar_id),
            provider_event_id: record.provider_event_id,
            last_projected_hash: record.last_projected_hash,
            desired_payload,
            state: MirrorState::parse(&record.state)?,
            error: record.error,
            attempt_count: record.attempt_count,
            next_retry_at: record.next_retry_at,
            last_write_ts: record.last_write_ts,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Snapshot a writer receives when it claims a mirror row. Carries the
/// desired payload as of the claim, plus the create idempotency key.
#[derive(Debug, Clone)]
pub struct MirrorWriteTicket {
    pub kind: MirrorJobKind,
    pub mirror_id: MirrorId,
    pub canonical_event_id: EventId,
    pub target_account_id: AccountId,
    pub target_calendar_id: CalendarId,
    pub payload: Option<MirrorPayload>,
    pub provider_event_id: Option<String>,
    pub projected_hash: Option<String>,
    pub attempt_count: i32,
    pub idempotency_key: String,
}

/// What the writer observed at the provider for one claimed write.
#[derive(Debug, Clone)]
pub enum MirrorWriteOutcome {
    Created {
        provider_event_id: String,
        written_hash: Option<String>,
    },
    Updated {
        written_hash: Option<String>,
    },
    Deleted,
    Retryable {
        error: String,
    },
    RateLimited {
        error: String,
        retry_after: std::time::Duration,
    },
    Permanent {
        error: String,
    },
}

fn job_for(
    user_id: &str,
    mirror: &EventMirror,
    kind: MirrorJobKind,
    state: MirrorState,
) -> MirrorJob {
    MirrorJob {
        user_id: user_id.to_string(),
        kind,
        mirror_id: mirror.mirror_id.clone(),
        canonical_event_id: mirror.canonical_event_id.clone(),
        target_account_id: mirror.target_account_id.clone(),
        target_calendar_id: mirror.target_calendar_id.clone(),
        state_when_enqueued: state,
    }
}

fn payload_json(payload: &MirrorPayload) -> EngineResult<String> {
    Ok(serde_json::to_string(payload)?)
}

/// Load one mirror by id.
pub fn get(conn: &mut SqliteConnection, mirror_id: &MirrorId) -> EngineResult<EventMirror> {
    let record: Option<MirrorRecord> = event_mirrors::table
        .filter(event_mirrors::mirror_id.eq(mirror_id.as_str()))
        .first(conn)
        .optional()?;
    record
        .ok_or_else(|| EngineError::not_found("mirror", mirror_id.as_str()))?
        .try_into()
}

/// All mirrors of one canonical event, any state.
pub fn list_for_event(
    conn: &mut SqliteConnection,
    canonical_event_id: &EventId,
) -> EngineResult<Vec<EventMirror>> {
    let records: Vec<MirrorRecord> = event_mirrors::table
        .filter(event_mirrors::canonical_event_id.eq(canonical_event_id.as_str()))
        .order(event_mirrors::mirror_id.asc())
        .load(conn)?;
    records.into_iter().map(EventMirror::try_from).collect()
}

/// All mirrors, any state. Snapshot/debug surface.
pub fn list_all(conn: &mut SqliteConnection) -> EngineResult<Vec<EventMirror>> {
    let records: Vec<MirrorRecord> = event_mirrors::table
        .order(event_mirrors::mirror_id.asc())
        .load(conn)?;
    records.into_iter().map(EventMirror::try_from).collect()
}

/// Queued or in-flight provider writes; the ingestion back-pressure gauge.
pub fn pending_write_count(conn: &mut SqliteConnection) -> EngineResult<i64> {
    let count = event_mirrors::table
        .filter(event_mirrors::state.eq_any([
            MirrorState::PendingCreate.as_str(),
            MirrorState::PendingUpdate.as_str(),
            MirrorState::Deleting.as_str(),
            MirrorState::Writing.as_str(),
        ]))
        .count()
        .get_result(conn)?;
    Ok(count)
}

/// Mirror counts grouped by state, for the health report.
pub fn counts_by_state(
    conn: &mut SqliteConnection,
) -> EngineResult<std::collections::BTreeMap<String, i64>> {
    let rows: Vec<(String, i64)> = event_mirrors::table
        .group_by(event_mirrors::state)
        .select((event_mirrors::state, diesel::dsl::count_star()))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

/// Mirrors stuck in `FAILED`, for the health report.
pub fn failed_mirrors(conn: &mut SqliteConnection) -> EngineResult<Vec<EventMirror>> {
    let records: Vec<MirrorRecord> = event_mirrors::table
        .filter(event_mirrors::state.eq(MirrorState::Failed.as_str()))
        .load(conn)?;
    records.into_iter().map(EventMirror::try_from).collect()
}

/// Reconcile the desired projection of `event` against the mirror table.
/// Returns the jobs to enqueue once the surrounding transaction commits.
pub fn reconcile(
    conn: &mut SqliteConnection,
    user_id: &str,
    event: &CanonicalEvent,
    desired: &[MirrorTarget],
) -> EngineResult<Vec<MirrorJob>> {
    let existing = list_for_event(conn, &event.canonical_event_id)?;
    let now = Utc::now();
    let mut jobs = Vec::new();

    for target in desired {
        let key_match = existing.iter().find(|m| {
            m.target_account_id == target.target_account
                && m.target_calendar_id == target.target_calendar
        });
        match key_match {
            None => {
                let mirror_id = MirrorId::generate();
                diesel::insert_into(event_mirrors::table)
                    .values((
                        event_mirrors::mirror_id.eq(mirror_id.as_str()),
                        event_mirrors::canonical_event_id.eq(event.canonical_event_id.as_str()),
                        event_mirrors::target_account_id.eq(target.target_account.as_str()),
                        event_mirrors::target_calendar_id.eq(target.target_calendar.as_str()),
                        event_mirrors::last_projected_hash.eq(&target.projected_hash),
                        event_mirrors::desired_payload.eq(payload_json(&target.payload)?),
                        event_mirrors::state.eq(MirrorState::PendingCreate.as_str()),
                        event_mirrors::attempt_count.eq(0),
                        event_mirrors::created_at.eq(now),
                        event_mirrors::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                let mirror = get(conn, &mirror_id)?;
                jobs.push(job_for(
                    user_id,
                    &mirror,
                    MirrorJobKind::CreateMirror,
                    MirrorState::PendingCreate,
                ));
            }
            Some(mirror) => match mirror.state {
                MirrorState::Deleted | MirrorState::Tombstoned => {
                    // The key exists but its provider artifact is gone;
                    // resurrect as a fresh create.
                    diesel::update(
                        event_mirrors::table
                            .filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
                    )
                    .set((
                        event_mirrors::state.eq(MirrorState::PendingCreate.as_str()),
                        event_mirrors::provider_event_id.eq(None::<String>),
                        event_mirrors::last_projected_hash.eq(&target.projected_hash),
                        event_mirrors::desired_payload.eq(payload_json(&target.payload)?),
                        event_mirrors::attempt_count.eq(0),
                        event_mirrors::error.eq(None::<String>),
                        event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                        event_mirrors::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                    jobs.push(job_for(
                        user_id,
                        mirror,
                        MirrorJobKind::CreateMirror,
                        MirrorState::PendingCreate,
                    ));
                }
                MirrorState::Failed => {
                    // Keep the desired state current but wait for a
                    // manual reset before retrying.
                    diesel::update(
                        event_mirrors::table
                            .filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
                    )
                    .set((
                        event_mirrors::last_projected_hash.eq(&target.projected_hash),
                        event_mirrors::desired_payload.eq(payload_json(&target.payload)?),
                        event_mirrors::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                }
                MirrorState::Live => {
                    if mirror.last_projected_hash.as_deref() != Some(&target.projected_hash) {
                        diesel::update(
                            event_mirrors::table
                                .filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
                        )
                        .set((
                            event_mirrors::state.eq(MirrorState::PendingUpdate.as_str()),
                            event_mirrors::last_projected_hash.eq(&target.projected_hash),
                            event_mirrors::desired_payload.eq(payload_json(&target.payload)?),
                            event_mirrors::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                        jobs.push(job_for(
                            user_id,
                            mirror,
                            MirrorJobKind::UpdateMirror,
                            MirrorState::PendingUpdate,
                        ));
                    }
                }
                MirrorState::PendingCreate
                | MirrorState::PendingUpdate
                | MirrorState::Deleting
                | MirrorState::Writing => {
                    // Work is already queued or in flight; refresh the
                    // desired state and let completion converge.
                    diesel::update(
                        event_mirrors::table
                            .filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
                    )
                    .set((
                        event_mirrors::last_projected_hash.eq(&target.projected_hash),
                        event_mirrors::desired_payload.eq(payload_json(&target.payload)?),
                        event_mirrors::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                }
            },
        }
    }

    // Rows whose key fell out of the desired set get torn down.
    for mirror in &existing {
        let still_desired = desired.iter().any(|t| {
            t.target_account == mirror.target_account_id
                && t.target_calendar == mirror.target_calendar_id
        });
        if still_desired || mirror.state.is_terminal() {
            continue;
        }
        match mirror.state {
            MirrorState::Deleting => {}
            MirrorState::Writing | MirrorState::Failed => {
                diesel::update(
                    event_mirrors::table
                        .filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
                )
                .set((
                    event_mirrors::desired_payload.eq(None::<String>),
                    event_mirrors::last_projected_hash.eq(None::<String>),
                    event_mirrors::updated_at.eq(now),
                ))
                .execute(conn)?;
            }
            _ => {
                diesel::update(
                    event_mirrors::table
                        .filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
                )
                .set((
                    event_mirrors::state.eq(MirrorState::Deleting.as_str()),
                    event_mirrors::desired_payload.eq(None::<String>),
                    event_mirrors::last_projected_hash.eq(None::<String>),
                    event_mirrors::updated_at.eq(now),
                ))
                .execute(conn)?;
                jobs.push(job_for(
                    user_id,
                    mirror,
                    MirrorJobKind::DeleteMirror,
                    MirrorState::Deleting,
                ));
            }
        }
    }

    Ok(jobs)
}

/// Claim a mirror row for writing. Returns `(ticket, follow_up_jobs)`;
/// `None` means the claim is stale (state moved on) and the job must be
/// acknowledged without acting. A delete of a never-created mirror
/// completes inline.
pub fn begin_write(
    conn: &mut SqliteConnection,
    user_id: &str,
    mirror_id: &MirrorId,
    expected: MirrorState,
) -> EngineResult<(Option<MirrorWriteTicket>, Vec<MirrorJob>)> {
    let mirror = match get(conn, mirror_id) {
        Ok(m) => m,
        Err(EngineError::NotFound { .. }) => return Ok((None, Vec::new())),
        Err(e) => return Err(e),
    };
    if mirror.state != expected {
        tracing::debug!(
            mirror_id = %mirror_id,
            expected = expected.as_str(),
            actual = mirror.state.as_str(),
            "stale mirror job acknowledged without acting"
        );
        return Ok((None, Vec::new()));
    }
    let kind = match expected {
        MirrorState::PendingCreate => MirrorJobKind::CreateMirror,
        MirrorState::PendingUpdate => MirrorJobKind::UpdateMirror,
        MirrorState::Deleting => MirrorJobKind::DeleteMirror,
        _ => return Ok((None, Vec::new())),
    };

    let now = Utc::now();
    if kind == MirrorJobKind::DeleteMirror && mirror.provider_event_id.is_none() {
        // Nothing ever reached the provider; deletion is a local affair.
        if mirror.desired_payload.is_some() {
            diesel::update(
                event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
            )
            .set((
                event_mirrors::state.eq(MirrorState::PendingCreate.as_str()),
                event_mirrors::attempt_count.eq(0),
                event_mirrors::error.eq(None::<String>),
                event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                event_mirrors::updated_at.eq(now),
            ))
            .execute(conn)?;
            return Ok((
                None,
                vec![job_for(
                    user_id,
                    &mirror,
                    MirrorJobKind::CreateMirror,
                    MirrorState::PendingCreate,
                )],
            ));
        }
        diesel::update(
            event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
        )
        .set((
            event_mirrors::state.eq(MirrorState::Deleted.as_str()),
            event_mirrors::error.eq(None::<String>),
            event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
            event_mirrors::updated_at.eq(now),
        ))
        .execute(conn)?;
        return Ok((None, Vec::new()));
    }

    let attempt_count = mirror.attempt_count + 1;
    diesel::update(event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())))
        .set((
            event_mirrors::state.eq(MirrorState::Writing.as_str()),
            event_mirrors::attempt_count.eq(attempt_count),
            event_mirrors::updated_at.eq(now),
        ))
        .execute(conn)?;

    let idempotency_key = format!(
        "{}:{}:{}",
        mirror.canonical_event_id, mirror.target_account_id, mirror.target_calendar_id
    );
    Ok((
        Some(MirrorWriteTicket {
            kind,
            mirror_id: mirror.mirror_id.clone(),
            canonical_event_id: mirror.canonical_event_id.clone(),
            target_account_id: mirror.target_account_id.clone(),
            target_calendar_id: mirror.target_calendar_id.clone(),
            payload: mirror.desired_payload.clone(),
            provider_event_id: mirror.provider_event_id.clone(),
            projected_hash: mirror.last_projected_hash.clone(),
            attempt_count,
            idempotency_key,
        }),
        Vec::new(),
    ))
}

/// Apply a writer's outcome to a claimed row. Returns follow-up jobs
/// (converging deletes, resurrections, mid-write projection changes).
pub fn apply_write_outcome(
    conn: &mut SqliteConnection,
    user_id: &str,
    config: &EngineConfig,
    mirror_id: &MirrorId,
    outcome: MirrorWriteOutcome,
) -> EngineResult<Vec<MirrorJob>> {
    let mirror = get(conn, mirror_id)?;
    if mirror.state != MirrorState::Writing {
        tracing::warn!(
            mirror_id = %mirror_id,
            state = mirror.state.as_str(),
            "write completion for a row not in WRITING; ignoring"
        );
        return Ok(Vec::new());
    }
    let now = Utc::now();
    let policy = RetryPolicy::from_config(config);
    let mut jobs = Vec::new();

    match outcome {
        MirrorWriteOutcome::Created {
            provider_event_id,
            written_hash,
        } => {
            let (next_state, follow_up) =
                converge_after_success(&mirror, written_hash.as_deref());
            diesel::update(
                event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
            )
            .set((
                event_mirrors::provider_event_id.eq(Some(provider_event_id)),
                event_mirrors::state.eq(next_state.as_str()),
                event_mirrors::attempt_count.eq(0),
                event_mirrors::error.eq(None::<String>),
                event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                event_mirrors::last_write_ts.eq(Some(now)),
                event_mirrors::updated_at.eq(now),
            ))
            .execute(conn)?;
            if let Some((kind, state)) = follow_up {
                jobs.push(job_for(user_id, &mirror, kind, state));
            }
        }
        MirrorWriteOutcome::Updated { written_hash } => {
            let (next_state, follow_up) =
                converge_after_success(&mirror, written_hash.as_deref());
            diesel::update(
                event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
            )
            .set((
                event_mirrors::state.eq(next_state.as_str()),
                event_mirrors::attempt_count.eq(0),
                event_mirrors::error.eq(None::<String>),
                event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                event_mirrors::last_write_ts.eq(Some(now)),
                event_mirrors::updated_at.eq(now),
            ))
            .execute(conn)?;
            if let Some((kind, state)) = follow_up {
                jobs.push(job_for(user_id, &mirror, kind, state));
            }
        }
        MirrorWriteOutcome::Deleted => {
            if mirror.desired_payload.is_some() {
                // The projection reappeared while the delete was in
                // flight; resurrect as a fresh create.
                diesel::update(
                    event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
                )
                .set((
                    event_mirrors::state.eq(MirrorState::PendingCreate.as_str()),
                    event_mirrors::provider_event_id.eq(None::<String>),
                    event_mirrors::attempt_count.eq(0),
                    event_mirrors::error.eq(None::<String>),
                    event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                    event_mirrors::last_write_ts.eq(Some(now)),
                    event_mirrors::updated_at.eq(now),
                ))
                .execute(conn)?;
                jobs.push(job_for(
                    user_id,
                    &mirror,
                    MirrorJobKind::CreateMirror,
                    MirrorState::PendingCreate,
                ));
            } else {
                diesel::update(
                    event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
                )
                .set((
                    event_mirrors::state.eq(MirrorState::Deleted.as_str()),
                    event_mirrors::error.eq(None::<String>),
                    event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                    event_mirrors::last_write_ts.eq(Some(now)),
                    event_mirrors::updated_at.eq(now),
                ))
                .execute(conn)?;
            }
        }
        MirrorWriteOutcome::Retryable { error } => {
            schedule_retry(conn, &mirror, &policy, config, &error, None, now)?;
        }
        MirrorWriteOutcome::RateLimited { error, retry_after } => {
            schedule_retry(conn, &mirror, &policy, config, &error, Some(retry_after), now)?;
        }
        MirrorWriteOutcome::Permanent { error } => {
            tracing::error!(
                mirror_id = %mirror_id,
                target_account = %mirror.target_account_id,
                error = %error,
                "mirror write failed permanently"
            );
            diesel::update(
                event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())),
            )
            .set((
                event_mirrors::state.eq(MirrorState::Failed.as_str()),
                event_mirrors::error.eq(Some(error)),
                event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
                event_mirrors::updated_at.eq(now),
            ))
            .execute(conn)?;
        }
    }

    Ok(jobs)
}

/// After a successful create/update, decide the resting state: the
/// desired payload may have been removed or changed while the write was in
/// flight.
fn converge_after_success(
    mirror: &EventMirror,
    written_hash: Option<&str>,
) -> (MirrorState, Option<(MirrorJobKind, MirrorState)>) {
    if mirror.desired_payload.is_none() {
        return (
            MirrorState::Deleting,
            Some((MirrorJobKind::DeleteMirror, MirrorState::Deleting)),
        );
    }
    match (written_hash, mirror.last_projected_hash.as_deref()) {
        (Some(written), Some(desired)) if written != desired => (
            MirrorState::PendingUpdate,
            Some((MirrorJobKind::UpdateMirror, MirrorState::PendingUpdate)),
        ),
        _ => (MirrorState::Live, None),
    }
}

fn schedule_retry(
    conn: &mut SqliteConnection,
    mirror: &EventMirror,
    policy: &RetryPolicy,
    config: &EngineConfig,
    error: &str,
    retry_after: Option<std::time::Duration>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    if mirror.attempt_count >= config.mirror_max_attempts as i32 {
        tracing::error!(
            mirror_id = %mirror.mirror_id,
            attempts = mirror.attempt_count,
            error = %error,
            "mirror write exhausted retries"
        );
        diesel::update(
            event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
        )
        .set((
            event_mirrors::state.eq(MirrorState::Failed.as_str()),
            event_mirrors::error.eq(Some(error.to_string())),
            event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
            event_mirrors::updated_at.eq(now),
        ))
        .execute(conn)?;
        return Ok(());
    }

    let revert_state = revert_state_for(mirror);
    let delay = retry_after.unwrap_or_else(|| policy.delay_for(mirror.attempt_count as u32));
    let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
    tracing::warn!(
        mirror_id = %mirror.mirror_id,
        attempt = mirror.attempt_count,
        next_retry_at = %next_retry_at,
        error = %error,
        "mirror write failed, retry scheduled"
    );
    diesel::update(
        event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
    )
    .set((
        event_mirrors::state.eq(revert_state.as_str()),
        event_mirrors::error.eq(Some(error.to_string())),
        event_mirrors::next_retry_at.eq(Some(next_retry_at)),
        event_mirrors::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(())
}

/// The pending state a failed write reverts to, derived from the row.
fn revert_state_for(mirror: &EventMirror) -> MirrorState {
    if mirror.desired_payload.is_none() {
        MirrorState::Deleting
    } else if mirror.provider_event_id.is_none() {
        MirrorState::PendingCreate
    } else {
        MirrorState::PendingUpdate
    }
}

/// Re-enqueue jobs for mirrors whose retry delay elapsed. Re-arms
/// `next_retry_at` so a lost job is retried again later; the claim guard
/// makes duplicates harmless.
pub fn due_retries(
    conn: &mut SqliteConnection,
    user_id: &str,
    config: &EngineConfig,
) -> EngineResult<Vec<MirrorJob>> {
    let now = Utc::now();
    let records: Vec<MirrorRecord> = event_mirrors::table
        .filter(event_mirrors::next_retry_at.le(now))
        .filter(event_mirrors::state.eq_any([
            MirrorState::PendingCreate.as_str(),
            MirrorState::PendingUpdate.as_str(),
            MirrorState::Deleting.as_str(),
        ]))
        .load(conn)?;

    let policy = RetryPolicy::from_config(config);
    let mut jobs = Vec::new();
    for record in records {
        let mirror: EventMirror = record.try_into()?;
        let kind = match mirror.state {
            MirrorState::PendingCreate => MirrorJobKind::CreateMirror,
            MirrorState::PendingUpdate => MirrorJobKind::UpdateMirror,
            MirrorState::Deleting => MirrorJobKind::DeleteMirror,
            _ => continue,
        };
        let re_arm = now
            + chrono::Duration::from_std(policy.delay_for(mirror.attempt_count as u32))
                .unwrap_or(chrono::Duration::seconds(60));
        diesel::update(
            event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
        )
        .set((
            event_mirrors::next_retry_at.eq(Some(re_arm)),
            event_mirrors::updated_at.eq(now),
        ))
        .execute(conn)?;
        jobs.push(job_for(user_id, &mirror, kind, mirror.state));
    }
    Ok(jobs)
}

/// Manual reset of a `FAILED` mirror back onto the retry path.
pub fn retry_failed(
    conn: &mut SqliteConnection,
    user_id: &str,
    mirror_id: &MirrorId,
) -> EngineResult<Vec<MirrorJob>> {
    let mirror = get(conn, mirror_id)?;
    if mirror.state != MirrorState::Failed {
        return Err(EngineError::conflict(format!(
            "mirror {} is {} not FAILED",
            mirror_id,
            mirror.state.as_str()
        )));
    }
    let next_state = revert_state_for(&mirror);
    let kind = match next_state {
        MirrorState::PendingCreate => MirrorJobKind::CreateMirror,
        MirrorState::PendingUpdate => MirrorJobKind::UpdateMirror,
        _ => MirrorJobKind::DeleteMirror,
    };
    let now = Utc::now();
    diesel::update(event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror_id.as_str())))
        .set((
            event_mirrors::state.eq(next_state.as_str()),
            event_mirrors::attempt_count.eq(0),
            event_mirrors::error.eq(None::<String>),
            event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
            event_mirrors::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(vec![job_for(user_id, &mirror, kind, next_state)])
}

/// Mark the mirror whose provider artifact was removed externally. Called
/// by ingestion when a delete delta on a target account matches one of our
/// provider event ids.
pub fn tombstone_by_provider_id(
    conn: &mut SqliteConnection,
    account: &AccountId,
    provider_event_id: &str,
) -> EngineResult<Option<MirrorId>> {
    let record: Option<MirrorRecord> = event_mirrors::table
        .filter(event_mirrors::target_account_id.eq(account.as_str()))
        .filter(event_mirrors::provider_event_id.eq(provider_event_id))
        .first(conn)
        .optional()?;
    let Some(record) = record else {
        return Ok(None);
    };
    let mirror: EventMirror = record.try_into()?;
    if mirror.state.is_terminal() {
        return Ok(Some(mirror.mirror_id));
    }
    tracing::info!(
        mirror_id = %mirror.mirror_id,
        account = %account,
        "mirror removed externally, tombstoning"
    );
    diesel::update(
        event_mirrors::table.filter(event_mirrors::mirror_id.eq(mirror.mirror_id.as_str())),
    )
    .set((
        event_mirrors::state.eq(MirrorState::Tombstoned.as_str()),
        event_mirrors::desired_payload.eq(None::<String>),
        event_mirrors::last_projected_hash.eq(None::<String>),
        event_mirrors::next_retry_at.eq(None::<DateTime<Utc>>),
        event_mirrors::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    Ok(Some(mirror.mirror_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use calfed_core::constraint::{DetailLevel, PolicyEdge};
    use calfed_core::event::{EventSource, EventStatus, Transparency, Visibility};
    use calfed_core::ids::ConstraintId;
    use calfed_core::projection::project_mirrors;
    use crate::store::Store;

    fn sample_event() -> CanonicalEvent {
        CanonicalEvent {
            canonical_event_id: EventId::generate(),
            origin_account_id: AccountId::new("acc_a"),
            origin_event_id: "g1".to_string(),
            title: "Team Sync".to_string(),
            description: None,
            location: None,
            start_ts: "2026-02-16T14:00:00Z".to_string(),
            end_ts: "2026-02-16T15:00:00Z".to_string(),
            timezone: None,
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            recurrence_rule: None,
            source: EventSource::Provider,
            version: 1,
            constraint_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn edge() -> PolicyEdge {
        PolicyEdge {
            constraint_id: ConstraintId::generate(),
            source_account: AccountId::new("acc_a"),
            target_account: AccountId::new("acc_b"),
            target_calendar: CalendarId::new("primary"),
            detail_level: DetailLevel::Busy,
            active_from: None,
            active_to: None,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn reconcile_inserts_pending_create() {
        let store = Store::open_ephemeral("usr_m").unwrap();
        let mut conn = store.conn().unwrap();
        let event = sample_event();
        let desired = project_mirrors(&event, &[edge()]);

        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, MirrorJobKind::CreateMirror);

        let rows = list_for_event(&mut conn, &event.canonical_event_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, MirrorState::PendingCreate);
        assert!(rows[0].desired_payload.is_some());

        // Idempotent: same desired set enqueues nothing new.
        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn full_write_cycle_reaches_live_then_deleted() {
        let store = Store::open_ephemeral("usr_m").unwrap();
        let mut conn = store.conn().unwrap();
        let event = sample_event();
        let desired = project_mirrors(&event, &[edge()]);
        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        let mirror_id = jobs[0].mirror_id.clone();

        let (ticket, follow_ups) =
            begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::PendingCreate).unwrap();
        assert!(follow_ups.is_empty());
        let ticket = ticket.unwrap();
        assert_eq!(ticket.kind, MirrorJobKind::CreateMirror);
        assert_eq!(ticket.attempt_count, 1);
        assert_eq!(get(&mut conn, &mirror_id).unwrap().state, MirrorState::Writing);

        // A duplicate delivery while WRITING is acknowledged without acting.
        let (dup, _) =
            begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::PendingCreate).unwrap();
        assert!(dup.is_none());

        let jobs = apply_write_outcome(
            &mut conn,
            "usr_m",
            &config(),
            &mirror_id,
            MirrorWriteOutcome::Created {
                provider_event_id: "pev_1".to_string(),
                written_hash: ticket.projected_hash.clone(),
            },
        )
        .unwrap();
        assert!(jobs.is_empty());
        let row = get(&mut conn, &mirror_id).unwrap();
        assert_eq!(row.state, MirrorState::Live);
        assert_eq!(row.provider_event_id.as_deref(), Some("pev_1"));
        assert_eq!(row.attempt_count, 0);

        // Desired set drops the edge: DELETING, then DELETED.
        let jobs = reconcile(&mut conn, "usr_m", &event, &[]).unwrap();
        assert_eq!(jobs[0].kind, MirrorJobKind::DeleteMirror);
        let (ticket, _) =
            begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::Deleting).unwrap();
        assert!(ticket.is_some());
        apply_write_outcome(
            &mut conn,
            "usr_m",
            &config(),
            &mirror_id,
            MirrorWriteOutcome::Deleted,
        )
        .unwrap();
        let row = get(&mut conn, &mirror_id).unwrap();
        assert_eq!(row.state, MirrorState::Deleted);
        assert!(row.state.is_terminal());
    }

    #[test]
    fn retryable_outcome_schedules_backoff() {
        let store = Store::open_ephemeral("usr_m").unwrap();
        let mut conn = store.conn().unwrap();
        let event = sample_event();
        let desired = project_mirrors(&event, &[edge()]);
        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        let mirror_id = jobs[0].mirror_id.clone();

        begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::PendingCreate).unwrap();
        apply_write_outcome(
            &mut conn,
            "usr_m",
            &config(),
            &mirror_id,
            MirrorWriteOutcome::Retryable {
                error: "503".to_string(),
            },
        )
        .unwrap();

        let row = get(&mut conn, &mirror_id).unwrap();
        assert_eq!(row.state, MirrorState::PendingCreate);
        assert_eq!(row.attempt_count, 1);
        assert!(row.next_retry_at.is_some());
        assert_eq!(row.error.as_deref(), Some("503"));
    }

    #[test]
    fn exhausted_retries_dead_letter_to_failed() {
        let store = Store::open_ephemeral("usr_m").unwrap();
        let mut conn = store.conn().unwrap();
        let event = sample_event();
        let desired = project_mirrors(&event, &[edge()]);
        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        let mirror_id = jobs[0].mirror_id.clone();

        let config = EngineConfig {
            mirror_max_attempts: 2,
            ..EngineConfig::default()
        };
        for _ in 0..2 {
            begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::PendingCreate).unwrap();
            apply_write_outcome(
                &mut conn,
                "usr_m",
                &config,
                &mirror_id,
                MirrorWriteOutcome::Retryable {
                    error: "503".to_string(),
                },
            )
            .unwrap();
        }

        let row = get(&mut conn, &mirror_id).unwrap();
        assert_eq!(row.state, MirrorState::Failed);

        // Manual reset puts it back on the create path.
        let jobs = retry_failed(&mut conn, "usr_m", &mirror_id).unwrap();
        assert_eq!(jobs[0].kind, MirrorJobKind::CreateMirror);
        let row = get(&mut conn, &mirror_id).unwrap();
        assert_eq!(row.state, MirrorState::PendingCreate);
        assert_eq!(row.attempt_count, 0);
    }

    #[test]
    fn hash_change_mid_write_converges_via_follow_up() {
        let store = Store::open_ephemeral("usr_m").unwrap();
        let mut conn = store.conn().unwrap();
        let mut event = sample_event();
        let desired = project_mirrors(&event, &[edge()]);
        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        let mirror_id = jobs[0].mirror_id.clone();

        let (ticket, _) =
            begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::PendingCreate).unwrap();
        let ticket = ticket.unwrap();

        // The event moves while the create is in flight.
        event.start_ts = "2026-02-16T16:00:00Z".to_string();
        event.end_ts = "2026-02-16T17:00:00Z".to_string();
        let moved = project_mirrors(&event, &[edge()]);
        reconcile(&mut conn, "usr_m", &event, &moved).unwrap();

        let jobs = apply_write_outcome(
            &mut conn,
            "usr_m",
            &config(),
            &mirror_id,
            MirrorWriteOutcome::Created {
                provider_event_id: "pev_1".to_string(),
                written_hash: ticket.projected_hash.clone(),
            },
        )
        .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, MirrorJobKind::UpdateMirror);
        assert_eq!(
            get(&mut conn, &mirror_id).unwrap().state,
            MirrorState::PendingUpdate
        );
    }

    #[test]
    fn delete_without_provider_artifact_completes_inline() {
        let store = Store::open_ephemeral("usr_m").unwrap();
        let mut conn = store.conn().unwrap();
        let event = sample_event();
        let desired = project_mirrors(&event, &[edge()]);
        let jobs = reconcile(&mut conn, "usr_m", &event, &desired).unwrap();
        let mirror_id = jobs[0].mirror_id.clone();

        // Edge drops before anything was written to the provider.
        let jobs = reconcile(&mut conn, "usr_m", &event, &[]).unwrap();
        assert_eq!(jobs[0].kind, MirrorJobKind::DeleteMirror);
        let (ticket, follow_ups) =
            begin_write(&mut conn, "usr_m", &mirror_id, MirrorState::Deleting).unwrap();
        assert!(ticket.is_none());
        assert!(follow_ups.is_empty());
        assert_eq!(get(&mut conn, &mirror_id).unwrap().state, MirrorState::Deleted);
    }
}
