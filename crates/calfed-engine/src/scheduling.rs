//! Scheduling sessions with atomic holds.
//!
//! A session proposes candidate times, reserves each as a tentative
//! provider event (a hold), lets the caller select and commit one, and
//! tears the rest down. Hold lifetimes are bounded by the session TTL; a
//! sweeper expires both. All transitions run inside the owning user
//! actor, so a commit is linearizable against every other session
//! mutation for the user.
//!
//! Session: `proposed -> committed | cancelled | expired`.
//! Hold: `pending -> confirmed -> (committed | released | expired)`, plus
//! `pending -> released` when a sibling wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::classify::{TAG_CANONICAL_EVENT_ID, TAG_ENGINE, TAG_MANAGED, TAG_ORIGIN_ACCOUNT_ID};
use calfed_core::config::EngineConfig;
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::{
    DeltaSummary, EventSource, EventStatus, ProviderDelta, ProviderEvent, Transparency, Visibility,
};
use calfed_core::ids::{AccountId, CalendarId, EventId, HoldId, SessionId};
use calfed_core::interval::normalize_time;
use calfed_core::projection::MirrorPayload;

use crate::availability;
use crate::events;
use crate::ingest;
use crate::provider::ProviderWriteAdapter;
use crate::queue::MirrorJob;
use crate::store::schema::{holds, scheduling_sessions};
use crate::store::Store;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Proposed,
    Committed,
    Cancelled,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Proposed => "proposed",
            SessionStatus::Committed => "committed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "proposed" => Ok(SessionStatus::Proposed),
            "committed" => Ok(SessionStatus::Committed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(EngineError::validation(format!(
                "invalid session status: {:?}",
                other
            ))),
        }
    }
}

/// Hold lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Pending,
    Confirmed,
    Released,
    Committed,
    Expired,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Pending => "pending",
            HoldStatus::Confirmed => "confirmed",
            HoldStatus::Released => "released",
            HoldStatus::Committed => "committed",
            HoldStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "pending" => Ok(HoldStatus::Pending),
            "confirmed" => Ok(HoldStatus::Confirmed),
            "released" => Ok(HoldStatus::Released),
            "committed" => Ok(HoldStatus::Committed),
            "expired" => Ok(HoldStatus::Expired),
            other => Err(EngineError::validation(format!(
                "invalid hold status: {:?}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HoldStatus::Released | HoldStatus::Committed | HoldStatus::Expired
        )
    }
}

/// One proposed slot. The candidate id doubles as the hold id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub start_ts: String,
    pub end_ts: String,
    pub target_account: AccountId,
    pub target_calendar: CalendarId,
}

/// One tentative reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub hold_id: HoldId,
    pub session_id: SessionId,
    pub candidate_id: String,
    pub target_account: AccountId,
    pub target_calendar: CalendarId,
    pub start_ts: String,
    pub end_ts: String,
    pub status: HoldStatus,
    pub provider_event_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One scheduling session with its holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub title: String,
    pub duration_minutes: u32,
    pub candidates: Vec<Candidate>,
    pub selected_candidate_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub holds: Vec<Hold>,
}

/// Input to `propose_times`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub title: String,
    pub duration_minutes: u32,
    pub window_start: String,
    pub window_end: String,
    pub target_account: AccountId,
    pub target_calendar: CalendarId,
    #[serde(default = "default_candidate_count")]
    pub candidate_count: u32,
}

fn default_candidate_count() -> u32 {
    3
}

/// Result of committing a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub session: SessionView,
    pub canonical_event_id: EventId,
    pub ingest_summary: DeltaSummary,
}

#[derive(Debug, Queryable)]
struct HoldRecord {
    hold_id: String,
    session_id: String,
    candidate_id: String,
    target_account_id: String,
    target_calendar_id: String,
    start_ts: String,
    end_ts: String,
    status: String,
    provider_event_id: Option<String>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<HoldRecord> for Hold {
    type Error = EngineError;

    fn try_from(record: HoldRecord) -> EngineResult<Self> {
        Ok(Hold {
            hold_id: HoldId::parse(&record.hold_id)?,
            session_id: SessionId::parse(&record.session_id)?,
            candidate_id: record.candidate_id,
            target_account: AccountId::new(record.target_account_id),
            target_calendar: CalendarId::new(record.target_calendar_id),
            start_ts: record.start_ts,
            end_ts: record.end_ts,
            status: HoldStatus::parse(&record.status)?,
            provider_event_id: record.provider_event_id,
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[derive(Debug, Queryable)]
struct SessionRecord {
    session_id: String,
    status: String,
    title: String,
    duration_minutes: i32,
    candidates_json: String,
    selected_candidate_id: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn view_from(record: SessionRecord, session_holds: Vec<Hold>) -> EngineResult<SessionView> {
    Ok(SessionView {
        session_id: SessionId::parse(&record.session_id)?,
        status: SessionStatus::parse(&record.status)?,
        title: record.title,
        duration_minutes: record.duration_minutes as u32,
        candidates: serde_json::from_str(&record.candidates_json)?,
        selected_candidate_id: record.selected_candidate_id,
        created_at: record.created_at,
        expires_at: record.expires_at,
        holds: session_holds,
    })
}

fn load_session(conn: &mut SqliteConnection, session_id: &SessionId) -> EngineResult<SessionView> {
    let record: Option<SessionRecord> = scheduling_sessions::table
        .filter(scheduling_sessions::session_id.eq(session_id.as_str()))
        .first(conn)
        .optional()?;
    let record =
        record.ok_or_else(|| EngineError::not_found("scheduling session", session_id.as_str()))?;
    let hold_records: Vec<HoldRecord> = holds::table
        .filter(holds::session_id.eq(session_id.as_str()))
        .order(holds::start_ts.asc())
        .load(conn)?;
    let session_holds = hold_records
        .into_iter()
        .map(Hold::try_from)
        .collect::<EngineResult<Vec<_>>>()?;
    view_from(record, session_holds)
}

/// All sessions, newest first.
pub fn list(conn: &mut SqliteConnection) -> EngineResult<Vec<SessionView>> {
    let records: Vec<SessionRecord> = scheduling_sessions::table
        .order(scheduling_sessions::created_at.desc())
        .load(conn)?;
    let mut views = Vec::with_capacity(records.len());
    for record in records {
        let hold_records: Vec<HoldRecord> = holds::table
            .filter(holds::session_id.eq(&record.session_id))
            .load(conn)?;
        let session_holds = hold_records
            .into_iter()
            .map(Hold::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        views.push(view_from(record, session_holds)?);
    }
    Ok(views)
}

fn set_session_status(
    conn: &mut SqliteConnection,
    session_id: &SessionId,
    status: SessionStatus,
) -> EngineResult<()> {
    diesel::update(
        scheduling_sessions::table
            .filter(scheduling_sessions::session_id.eq(session_id.as_str())),
    )
    .set((
        scheduling_sessions::status.eq(status.as_str()),
        scheduling_sessions::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    Ok(())
}

fn set_hold_status(
    conn: &mut SqliteConnection,
    hold_id: &HoldId,
    status: HoldStatus,
) -> EngineResult<()> {
    diesel::update(holds::table.filter(holds::hold_id.eq(hold_id.as_str())))
        .set((
            holds::status.eq(status.as_str()),
            holds::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// The payload a hold writes to the provider: opaque, real title, tagged
/// as managed so re-ingestion discards it.
fn hold_payload(title: &str, hold: &Hold) -> MirrorPayload {
    let mut tags = std::collections::BTreeMap::new();
    tags.insert(TAG_ENGINE.to_string(), "true".to_string());
    tags.insert(TAG_MANAGED.to_string(), "true".to_string());
    tags.insert(TAG_CANONICAL_EVENT_ID.to_string(), hold.hold_id.to_string());
    tags.insert(
        TAG_ORIGIN_ACCOUNT_ID.to_string(),
        hold.target_account.to_string(),
    );
    MirrorPayload {
        title: format!("HOLD: {}", title),
        description: None,
        location: None,
        start_ts: hold.start_ts.clone(),
        end_ts: hold.end_ts.clone(),
        timezone: None,
        all_day: false,
        transparency: Transparency::Opaque,
        tags,
    }
}

/// Delete a hold's provider artifact. Failures are logged and swallowed:
/// the artifact is tagged managed, so a later observation of it cannot
/// loop back into the store.
async fn release_provider_artifact(provider: &Arc<dyn ProviderWriteAdapter>, hold: &Hold) {
    let Some(provider_event_id) = &hold.provider_event_id else {
        return;
    };
    if let Err(error) = provider
        .delete_event(&hold.target_account, &hold.target_calendar, provider_event_id)
        .await
    {
        tracing::warn!(
            hold_id = %hold.hold_id,
            error = %error,
            "failed to delete tentative provider event"
        );
    }
}

/// Propose candidate times and reserve them as confirmed holds.
///
/// Candidates come from the availability gaps in the requested window. If
/// any provider reservation fails, every already-confirmed hold is
/// released before the error returns, leaving no tentative artifacts.
pub async fn propose(
    store: &Store,
    config: &EngineConfig,
    provider: &Arc<dyn ProviderWriteAdapter>,
    request: ProposeRequest,
) -> EngineResult<SessionView> {
    if request.duration_minutes == 0 {
        return Err(EngineError::validation("duration_minutes must be positive"));
    }
    if request.candidate_count == 0 {
        return Err(EngineError::validation("candidate_count must be positive"));
    }
    let window_start = normalize_time(&request.window_start)?;
    let window_end = normalize_time(&request.window_end)?;
    if window_start >= window_end {
        return Err(EngineError::validation("scheduling window is empty"));
    }

    // Candidate slots from true availability across all accounts.
    let report = store.transaction(|conn| {
        availability::compute(conn, &request.window_start, &request.window_end, None)
    })?;
    let duration = chrono::Duration::minutes(i64::from(request.duration_minutes));
    let mut slots = Vec::new();
    'outer: for gap in &report.free {
        let mut cursor = gap.start;
        while cursor + duration <= gap.end {
            slots.push((cursor, cursor + duration));
            if slots.len() >= request.candidate_count as usize {
                break 'outer;
            }
            cursor += duration;
        }
    }
    if slots.is_empty() {
        return Err(EngineError::conflict(
            "no free slots of the requested duration in the window",
        ));
    }

    let now = Utc::now();
    let expires_at = now
        + chrono::Duration::from_std(config.hold_ttl()).unwrap_or(chrono::Duration::minutes(10));
    let session_id = SessionId::generate();
    let mut session_holds = Vec::new();
    let mut candidates = Vec::new();
    for (start, end) in &slots {
        let hold_id = HoldId::generate();
        let hold = Hold {
            hold_id: hold_id.clone(),
            session_id: session_id.clone(),
            candidate_id: hold_id.to_string(),
            target_account: request.target_account.clone(),
            target_calendar: request.target_calendar.clone(),
            start_ts: start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            end_ts: end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            status: HoldStatus::Pending,
            provider_event_id: None,
            expires_at,
            created_at: now,
            updated_at: now,
        };
        candidates.push(Candidate {
            candidate_id: hold.candidate_id.clone(),
            start_ts: hold.start_ts.clone(),
            end_ts: hold.end_ts.clone(),
            target_account: hold.target_account.clone(),
            target_calendar: hold.target_calendar.clone(),
        });
        session_holds.push(hold);
    }

    store.transaction(|conn| {
        diesel::insert_into(scheduling_sessions::table)
            .values((
                scheduling_sessions::session_id.eq(session_id.as_str()),
                scheduling_sessions::status.eq(SessionStatus::Proposed.as_str()),
                scheduling_sessions::title.eq(&request.title),
                scheduling_sessions::duration_minutes.eq(request.duration_minutes as i32),
                scheduling_sessions::candidates_json.eq(serde_json::to_string(&candidates)?),
                scheduling_sessions::created_at.eq(now),
                scheduling_sessions::expires_at.eq(expires_at),
                scheduling_sessions::updated_at.eq(now),
            ))
            .execute(conn)?;
        for hold in &session_holds {
            diesel::insert_into(holds::table)
                .values((
                    holds::hold_id.eq(hold.hold_id.as_str()),
                    holds::session_id.eq(session_id.as_str()),
                    holds::candidate_id.eq(&hold.candidate_id),
                    holds::target_account_id.eq(hold.target_account.as_str()),
                    holds::target_calendar_id.eq(hold.target_calendar.as_str()),
                    holds::start_ts.eq(&hold.start_ts),
                    holds::end_ts.eq(&hold.end_ts),
                    holds::status.eq(HoldStatus::Pending.as_str()),
                    holds::expires_at.eq(hold.expires_at),
                    holds::created_at.eq(hold.created_at),
                    holds::updated_at.eq(hold.updated_at),
                ))
                .execute(conn)?;
        }
        Ok(())
    })?;

    // Reserve each candidate provider-side; compensate on first failure.
    for idx in 0..session_holds.len() {
        let payload = hold_payload(&request.title, &session_holds[idx]);
        let hold_id = session_holds[idx].hold_id.clone();
        let result = provider
            .create_event(
                &session_holds[idx].target_account,
                &session_holds[idx].target_calendar,
                &payload,
                hold_id.as_str(),
            )
            .await;
        match result {
            Ok(provider_event_id) => {
                store.transaction(|conn| {
                    diesel::update(holds::table.filter(holds::hold_id.eq(hold_id.as_str())))
                        .set((
                            holds::status.eq(HoldStatus::Confirmed.as_str()),
                            holds::provider_event_id.eq(Some(&provider_event_id)),
                            holds::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)?;
                    Ok(())
                })?;
                session_holds[idx].status = HoldStatus::Confirmed;
                session_holds[idx].provider_event_id = Some(provider_event_id);
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    hold_id = %hold_id,
                    error = %error,
                    "hold reservation failed, releasing session"
                );
                for done in session_holds.iter().take(idx) {
                    release_provider_artifact(provider, done).await;
                }
                store.transaction(|conn| {
                    for h in &session_holds {
                        set_hold_status(conn, &h.hold_id, HoldStatus::Released)?;
                    }
                    set_session_status(conn, &session_id, SessionStatus::Cancelled)
                })?;
                return Err(EngineError::from(error));
            }
        }
    }

    tracing::info!(
        session_id = %session_id,
        candidates = session_holds.len(),
        "scheduling session proposed"
    );
    store.transaction(|conn| load_session(conn, &session_id))
}

/// Record the caller's preferred candidate; the session stays `proposed`
/// until commit.
pub fn select_candidate(
    conn: &mut SqliteConnection,
    session_id: &SessionId,
    candidate_id: &str,
) -> EngineResult<SessionView> {
    let session = load_session(conn, session_id)?;
    if session.status != SessionStatus::Proposed {
        return Err(EngineError::conflict(format!(
            "session {} is {}, not proposed",
            session_id,
            session.status.as_str()
        )));
    }
    if !session
        .candidates
        .iter()
        .any(|c| c.candidate_id == candidate_id)
    {
        return Err(EngineError::not_found("candidate", candidate_id));
    }
    diesel::update(
        scheduling_sessions::table
            .filter(scheduling_sessions::session_id.eq(session_id.as_str())),
    )
    .set((
        scheduling_sessions::selected_candidate_id.eq(Some(candidate_id)),
        scheduling_sessions::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    load_session(conn, session_id)
}

/// Commit one candidate: its hold becomes the real event, every other
/// hold is released, and the session closes as `committed`.
pub async fn commit(
    store: &Store,
    config: &EngineConfig,
    provider: &Arc<dyn ProviderWriteAdapter>,
    user_id: &str,
    session_id: &SessionId,
    candidate_id: Option<&str>,
) -> EngineResult<(CommitOutcome, Vec<MirrorJob>)> {
    let now = Utc::now();
    // Validate and transition session + holds atomically.
    let (session, chosen, to_release) = store.transaction(|conn| {
        let session = load_session(conn, session_id)?;
        if session.status != SessionStatus::Proposed {
            return Err(EngineError::conflict(format!(
                "session {} is {}, not proposed",
                session_id,
                session.status.as_str()
            )));
        }
        if session.expires_at <= now {
            return Err(EngineError::conflict(format!(
                "session {} expired at {}",
                session_id, session.expires_at
            )));
        }
        let chosen_id = candidate_id
            .map(str::to_string)
            .or_else(|| session.selected_candidate_id.clone())
            .ok_or_else(|| {
                EngineError::validation("no candidate given and none previously selected")
            })?;
        let chosen = session
            .holds
            .iter()
            .find(|h| h.candidate_id == chosen_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("candidate", chosen_id.clone()))?;
        if chosen.status != HoldStatus::Confirmed {
            return Err(EngineError::conflict(format!(
                "hold {} is {}, not confirmed",
                chosen.hold_id,
                chosen.status.as_str()
            )));
        }

        set_hold_status(conn, &chosen.hold_id, HoldStatus::Committed)?;
        let mut to_release = Vec::new();
        for hold in &session.holds {
            if hold.hold_id != chosen.hold_id && !hold.status.is_terminal() {
                set_hold_status(conn, &hold.hold_id, HoldStatus::Released)?;
                to_release.push(hold.clone());
            }
        }
        diesel::update(
            scheduling_sessions::table
                .filter(scheduling_sessions::session_id.eq(session_id.as_str())),
        )
        .set((
            scheduling_sessions::status.eq(SessionStatus::Committed.as_str()),
            scheduling_sessions::selected_candidate_id.eq(Some(&chosen_id)),
            scheduling_sessions::updated_at.eq(now),
        ))
        .execute(conn)?;
        Ok((session, chosen, to_release))
    })?;

    // Tear the losing reservations down provider-side.
    for hold in &to_release {
        release_provider_artifact(provider, hold).await;
    }

    // Materialize the winner as a canonical event, exactly as if the
    // provider had reported it as a fresh origin event.
    let origin_event_id = chosen
        .provider_event_id
        .clone()
        .unwrap_or_else(|| chosen.hold_id.to_string());
    let deltas = vec![ProviderDelta::Created {
        origin_event_id: origin_event_id.clone(),
        event: ProviderEvent {
            title: session.title.clone(),
            description: None,
            location: None,
            start: chosen.start_ts.clone(),
            end: chosen.end_ts.clone(),
            timezone: None,
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            recurrence_rule: None,
            extended_properties: HashMap::new(),
            attendees: Vec::new(),
            updated_at: Some(now),
        },
    }];
    let (summary, jobs) = store.transaction(|conn| {
        ingest::apply_deltas(
            conn,
            config,
            user_id,
            &chosen.target_account,
            &deltas,
            EventSource::Provider,
        )
    })?;
    let canonical_event_id = store.transaction(|conn| {
        events::find_by_origin(conn, &chosen.target_account, &origin_event_id)?
            .map(|e| e.canonical_event_id)
            .ok_or_else(|| EngineError::not_found("canonical event", origin_event_id.clone()))
    })?;

    let session = store.transaction(|conn| load_session(conn, session_id))?;
    tracing::info!(
        session_id = %session_id,
        canonical_event_id = %canonical_event_id,
        "scheduling session committed"
    );
    Ok((
        CommitOutcome {
            session,
            canonical_event_id,
            ingest_summary: summary,
        },
        jobs,
    ))
}

/// Cancel a proposed session, releasing every non-terminal hold.
pub async fn cancel(
    store: &Store,
    provider: &Arc<dyn ProviderWriteAdapter>,
    session_id: &SessionId,
) -> EngineResult<SessionView> {
    let to_release = store.transaction(|conn| {
        let session = load_session(conn, session_id)?;
        if session.status != SessionStatus::Proposed {
            return Err(EngineError::conflict(format!(
                "session {} is {}, not proposed",
                session_id,
                session.status.as_str()
            )));
        }
        let mut to_release = Vec::new();
        for hold in &session.holds {
            if !hold.status.is_terminal() {
                set_hold_status(conn, &hold.hold_id, HoldStatus::Released)?;
                to_release.push(hold.clone());
            }
        }
        set_session_status(conn, session_id, SessionStatus::Cancelled)?;
        Ok(to_release)
    })?;

    for hold in &to_release {
        release_provider_artifact(provider, hold).await;
    }
    store.transaction(|conn| load_session(conn, session_id))
}

/// Expire overdue holds and settle their sessions. Returns
/// `(expired_holds, expired_sessions)`.
pub async fn sweep(
    store: &Store,
    provider: &Arc<dyn ProviderWriteAdapter>,
    now: DateTime<Utc>,
) -> EngineResult<(u32, u32)> {
    let overdue: Vec<Hold> = store.transaction(|conn| {
        let records: Vec<HoldRecord> = holds::table
            .filter(holds::expires_at.lt(now))
            .filter(holds::status.eq_any([
                HoldStatus::Pending.as_str(),
                HoldStatus::Confirmed.as_str(),
            ]))
            .load(conn)?;
        records.into_iter().map(Hold::try_from).collect()
    })?;

    let mut expired_holds = 0u32;
    for hold in &overdue {
        release_provider_artifact(provider, hold).await;
        store.transaction(|conn| set_hold_status(conn, &hold.hold_id, HoldStatus::Expired))?;
        expired_holds += 1;
    }

    // Sessions still proposed whose holds are all terminal expire too.
    let expired_sessions = store.transaction(|conn| {
        let mut expired = 0u32;
        let records: Vec<SessionRecord> = scheduling_sessions::table
            .filter(scheduling_sessions::status.eq(SessionStatus::Proposed.as_str()))
            .load(conn)?;
        for record in records {
            let session_id = SessionId::parse(&record.session_id)?;
            let session = load_session(conn, &session_id)?;
            let all_terminal = !session.holds.is_empty()
                && session.holds.iter().all(|h| h.status.is_terminal());
            if all_terminal {
                set_session_status(conn, &session_id, SessionStatus::Expired)?;
                expired += 1;
            }
        }
        Ok(expired)
    })?;

    if expired_holds > 0 || expired_sessions > 0 {
        tracing::info!(expired_holds, expired_sessions, "scheduling sweep");
    }
    Ok((expired_holds, expired_sessions))
}
