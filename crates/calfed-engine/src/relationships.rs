//! Relationships, outcome ledger, and milestones.
//!
//! Participants are keyed by a salted SHA-256 of their email; raw emails
//! live only on the relationship row the user created, never in the
//! analytics side tables. The ledger is append-only and survives the
//! relationships it describes.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::analytics::{
    drift_report, rank_reconnections, reputation_score, DriftEntry, OutcomeKind,
    ReconnectionSuggestion, RelationshipSlice, ReputationSummary,
};
use calfed_core::constraint::ConstraintConfig;
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::participant_hash;
use calfed_core::ids::{ConstraintId, LedgerId, MilestoneId, RelationshipId};

use crate::constraints;
use crate::events;
use crate::store::schema::{ledger_entries, milestones, relationships};

/// One person the user tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: RelationshipId,
    pub participant_hash: String,
    pub email: String,
    pub display_name: String,
    pub city: Option<String>,
    pub cadence_days: Option<i32>,
    pub last_interaction_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for relationship creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRelationship {
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub cadence_days: Option<i32>,
}

/// Mutable relationship fields, replaced wholesale on update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub display_name: String,
    pub city: Option<String>,
    pub cadence_days: Option<i32>,
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ledger_id: LedgerId,
    pub participant_hash: String,
    pub outcome: OutcomeKind,
    pub note: Option<String>,
    pub ts: DateTime<Utc>,
}

/// A tracked date (birthday, anniversary, deadline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: MilestoneId,
    pub participant_hash: Option<String>,
    pub title: String,
    pub month: u32,
    pub day: u32,
    pub year: Option<i32>,
    pub recurring: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for milestone creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMilestone {
    #[serde(default)]
    pub relationship_id: Option<RelationshipId>,
    pub title: String,
    pub month: u32,
    pub day: u32,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default = "default_recurring")]
    pub recurring: bool,
}

fn default_recurring() -> bool {
    true
}

/// A milestone occurrence inside the lookahead window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcomingMilestone {
    pub milestone: Milestone,
    pub occurs_on: NaiveDate,
    pub in_days: i64,
}

/// One item in a relationship timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub ts: DateTime<Utc>,
    pub kind: TimelineKind,
    pub summary: String,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Event,
    Outcome,
}

#[derive(Debug, Queryable)]
struct RelationshipRecord {
    relationship_id: String,
    participant_hash: String,
    email: String,
    display_name: String,
    city: Option<String>,
    cadence_days: Option<i32>,
    last_interaction_ts: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RelationshipRecord> for Relationship {
    type Error = EngineError;

    fn try_from(record: RelationshipRecord) -> EngineResult<Self> {
        Ok(Relationship {
            relationship_id: RelationshipId::parse(&record.relationship_id)?,
            participant_hash: record.participant_hash,
            email: record.email,
            display_name: record.display_name,
            city: record.city,
            cadence_days: record.cadence_days,
            last_interaction_ts: record.last_interaction_ts,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

pub fn create(
    conn: &mut SqliteConnection,
    salt: &str,
    input: NewRelationship,
) -> EngineResult<Relationship> {
    if input.email.trim().is_empty() {
        return Err(EngineError::validation("relationship email must not be empty"));
    }
    if let Some(cadence) = input.cadence_days {
        if cadence <= 0 {
            return Err(EngineError::validation("cadence_days must be positive"));
        }
    }
    let hash = participant_hash(&input.email, salt);
    let now = Utc::now();
    let relationship = Relationship {
        relationship_id: RelationshipId::generate(),
        participant_hash: hash,
        email: input.email,
        display_name: input.display_name,
        city: input.city,
        cadence_days: input.cadence_days,
        last_interaction_ts: None,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(relationships::table)
        .values((
            relationships::relationship_id.eq(relationship.relationship_id.as_str()),
            relationships::participant_hash.eq(&relationship.participant_hash),
            relationships::email.eq(&relationship.email),
            relationships::display_name.eq(&relationship.display_name),
            relationships::city.eq(&relationship.city),
            relationships::cadence_days.eq(relationship.cadence_days),
            relationships::created_at.eq(now),
            relationships::updated_at.eq(now),
        ))
        .execute(conn)
        .map_err(|error| match error {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ) => EngineError::conflict("a relationship for this email already exists"),
            other => other.into(),
        })?;
    Ok(relationship)
}

pub fn update(
    conn: &mut SqliteConnection,
    relationship_id: &RelationshipId,
    patch: RelationshipUpdate,
) -> EngineResult<Relationship> {
    if let Some(cadence) = patch.cadence_days {
        if cadence <= 0 {
            return Err(EngineError::validation("cadence_days must be positive"));
        }
    }
    let updated = diesel::update(
        relationships::table
            .filter(relationships::relationship_id.eq(relationship_id.as_str())),
    )
    .set((
        relationships::display_name.eq(&patch.display_name),
        relationships::city.eq(&patch.city),
        relationships::cadence_days.eq(patch.cadence_days),
        relationships::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(EngineError::not_found("relationship", relationship_id.as_str()));
    }
    get(conn, relationship_id)
}

pub fn delete(conn: &mut SqliteConnection, relationship_id: &RelationshipId) -> EngineResult<()> {
    let deleted = diesel::delete(
        relationships::table
            .filter(relationships::relationship_id.eq(relationship_id.as_str())),
    )
    .execute(conn)?;
    if deleted == 0 {
        return Err(EngineError::not_found("relationship", relationship_id.as_str()));
    }
    // Ledger entries are weak back-references and stay behind.
    Ok(())
}

pub fn get(
    conn: &mut SqliteConnection,
    relationship_id: &RelationshipId,
) -> EngineResult<Relationship> {
    let record: Option<RelationshipRecord> = relationships::table
        .filter(relationships::relationship_id.eq(relationship_id.as_str()))
        .first(conn)
        .optional()?;
    record
        .ok_or_else(|| EngineError::not_found("relationship", relationship_id.as_str()))?
        .try_into()
}

/// Lookup by participant hash; event briefings use this.
pub fn find_by_hash(
    conn: &mut SqliteConnection,
    participant_hash: &str,
) -> EngineResult<Option<Relationship>> {
    let record: Option<RelationshipRecord> = relationships::table
        .filter(relationships::participant_hash.eq(participant_hash))
        .first(conn)
        .optional()?;
    record.map(Relationship::try_from).transpose()
}

pub fn list(conn: &mut SqliteConnection) -> EngineResult<Vec<Relationship>> {
    let records: Vec<RelationshipRecord> = relationships::table
        .order(relationships::display_name.asc())
        .load(conn)?;
    records.into_iter().map(Relationship::try_from).collect()
}

/// Bump freshness for a known participant; unknown hashes are ignored.
pub fn touch_last_interaction(
    conn: &mut SqliteConnection,
    hash: &str,
    ts: DateTime<Utc>,
) -> EngineResult<()> {
    diesel::update(
        relationships::table
            .filter(relationships::participant_hash.eq(hash))
            .filter(
                relationships::last_interaction_ts
                    .lt(ts)
                    .or(relationships::last_interaction_ts.is_null()),
            ),
    )
    .set((
        relationships::last_interaction_ts.eq(Some(ts)),
        relationships::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    Ok(())
}

/// Record an interaction outcome in the append-only ledger.
pub fn mark_outcome(
    conn: &mut SqliteConnection,
    relationship_id: &RelationshipId,
    outcome: OutcomeKind,
    note: Option<String>,
) -> EngineResult<LedgerEntry> {
    let relationship = get(conn, relationship_id)?;
    let entry = LedgerEntry {
        ledger_id: LedgerId::generate(),
        participant_hash: relationship.participant_hash,
        outcome,
        note,
        ts: Utc::now(),
    };
    diesel::insert_into(ledger_entries::table)
        .values((
            ledger_entries::ledger_id.eq(entry.ledger_id.as_str()),
            ledger_entries::participant_hash.eq(&entry.participant_hash),
            ledger_entries::outcome.eq(entry.outcome.as_str()),
            ledger_entries::note.eq(&entry.note),
            ledger_entries::ts.eq(entry.ts),
        ))
        .execute(conn)?;
    Ok(entry)
}

/// Ledger entries for one relationship, newest first.
pub fn list_outcomes(
    conn: &mut SqliteConnection,
    relationship_id: &RelationshipId,
) -> EngineResult<Vec<LedgerEntry>> {
    let relationship = get(conn, relationship_id)?;
    let rows: Vec<(String, String, String, Option<String>, DateTime<Utc>)> = ledger_entries::table
        .filter(ledger_entries::participant_hash.eq(&relationship.participant_hash))
        .order(ledger_entries::ts.desc())
        .select((
            ledger_entries::ledger_id,
            ledger_entries::participant_hash,
            ledger_entries::outcome,
            ledger_entries::note,
            ledger_entries::ts,
        ))
        .load(conn)?;
    rows.into_iter()
        .map(|(ledger_id, hash, outcome, note, ts)| {
            Ok(LedgerEntry {
                ledger_id: LedgerId::parse(&ledger_id)?,
                participant_hash: hash,
                outcome: OutcomeKind::parse(&outcome).ok_or_else(|| {
                    EngineError::validation(format!("invalid ledger outcome: {:?}", outcome))
                })?,
                note,
                ts,
            })
        })
        .collect()
}

/// Shared events and ledger entries interleaved, newest first.
pub fn timeline(
    conn: &mut SqliteConnection,
    relationship_id: &RelationshipId,
) -> EngineResult<Vec<TimelineEntry>> {
    let relationship = get(conn, relationship_id)?;
    let mut entries = Vec::new();

    for event in events::events_for_participant(conn, &relationship.participant_hash)? {
        let ts = calfed_core::interval::normalize_time(&event.start_ts)
            .unwrap_or(event.created_at);
        entries.push(TimelineEntry {
            ts,
            kind: TimelineKind::Event,
            summary: event.title.clone(),
            reference: event.canonical_event_id.to_string(),
        });
    }
    for outcome in list_outcomes(conn, relationship_id)? {
        entries.push(TimelineEntry {
            ts: outcome.ts,
            kind: TimelineKind::Outcome,
            summary: match &outcome.note {
                Some(note) => format!("{}: {}", outcome.outcome.as_str(), note),
                None => outcome.outcome.as_str().to_string(),
            },
            reference: outcome.ledger_id.to_string(),
        });
    }
    entries.sort_by(|a, b| b.ts.cmp(&a.ts));
    Ok(entries)
}

/// Reliability summary over the relationship's ledger.
pub fn reputation(
    conn: &mut SqliteConnection,
    relationship_id: &RelationshipId,
) -> EngineResult<ReputationSummary> {
    let outcomes: Vec<OutcomeKind> = list_outcomes(conn, relationship_id)?
        .into_iter()
        .map(|entry| entry.outcome)
        .collect();
    Ok(reputation_score(&outcomes))
}

fn slices(conn: &mut SqliteConnection) -> EngineResult<Vec<RelationshipSlice>> {
    Ok(list(conn)?
        .into_iter()
        .map(|rel| RelationshipSlice {
            relationship_id: rel.relationship_id.to_string(),
            display_name: rel.display_name,
            city: rel.city,
            cadence_days: rel.cadence_days.map(|d| d as u32),
            last_interaction_ts: rel.last_interaction_ts,
        })
        .collect())
}

/// Relationships past their contact cadence.
pub fn drift(conn: &mut SqliteConnection) -> EngineResult<Vec<DriftEntry>> {
    Ok(drift_report(&slices(conn)?, Utc::now()))
}

/// Ranked reconnection candidates, optionally biased to a city or an
/// upcoming trip's destination.
pub fn reconnection_suggestions(
    conn: &mut SqliteConnection,
    city: Option<String>,
    trip_id: Option<ConstraintId>,
) -> EngineResult<Vec<ReconnectionSuggestion>> {
    let city = match (city, trip_id) {
        (Some(city), _) => Some(city),
        (None, Some(trip_id)) => {
            let constraint = constraints::get(conn, &trip_id)?;
            match constraint.typed_config()? {
                ConstraintConfig::Trip(trip) => Some(trip.destination),
                _ => {
                    return Err(EngineError::validation(format!(
                        "constraint {} is not a trip",
                        trip_id
                    )))
                }
            }
        }
        (None, None) => None,
    };
    Ok(rank_reconnections(&slices(conn)?, city.as_deref(), Utc::now()))
}

pub fn create_milestone(
    conn: &mut SqliteConnection,
    input: NewMilestone,
) -> EngineResult<Milestone> {
    if !(1..=12).contains(&input.month) || !(1..=31).contains(&input.day) {
        return Err(EngineError::validation(format!(
            "invalid milestone date: month {} day {}",
            input.month, input.day
        )));
    }
    let participant = input
        .relationship_id
        .as_ref()
        .map(|id| get(conn, id))
        .transpose()?
        .map(|rel| rel.participant_hash);
    let milestone = Milestone {
        milestone_id: MilestoneId::generate(),
        participant_hash: participant,
        title: input.title,
        month: input.month,
        day: input.day,
        year: input.year,
        recurring: input.recurring,
        created_at: Utc::now(),
    };
    diesel::insert_into(milestones::table)
        .values((
            milestones::milestone_id.eq(milestone.milestone_id.as_str()),
            milestones::participant_hash.eq(&milestone.participant_hash),
            milestones::title.eq(&milestone.title),
            milestones::month.eq(milestone.month as i32),
            milestones::day.eq(milestone.day as i32),
            milestones::year.eq(milestone.year),
            milestones::recurring.eq(milestone.recurring),
            milestones::created_at.eq(milestone.created_at),
        ))
        .execute(conn)?;
    Ok(milestone)
}

pub fn delete_milestone(
    conn: &mut SqliteConnection,
    milestone_id: &MilestoneId,
) -> EngineResult<()> {
    let deleted = diesel::delete(
        milestones::table.filter(milestones::milestone_id.eq(milestone_id.as_str())),
    )
    .execute(conn)?;
    if deleted == 0 {
        return Err(EngineError::not_found("milestone", milestone_id.as_str()));
    }
    Ok(())
}

pub fn list_milestones(conn: &mut SqliteConnection) -> EngineResult<Vec<Milestone>> {
    let rows: Vec<(
        String,
        Option<String>,
        String,
        i32,
        i32,
        Option<i32>,
        bool,
        DateTime<Utc>,
    )> = milestones::table
        .order((milestones::month.asc(), milestones::day.asc()))
        .select((
            milestones::milestone_id,
            milestones::participant_hash,
            milestones::title,
            milestones::month,
            milestones::day,
            milestones::year,
            milestones::recurring,
            milestones::created_at,
        ))
        .load(conn)?;
    rows.into_iter()
        .map(
            |(milestone_id, participant_hash, title, month, day, year, recurring, created_at)| {
                Ok(Milestone {
                    milestone_id: MilestoneId::parse(&milestone_id)?,
                    participant_hash,
                    title,
                    month: month as u32,
                    day: day as u32,
                    year,
                    recurring,
                    created_at,
                })
            },
        )
        .collect()
}

/// Milestones occurring within `max_days` of `now`, soonest first.
/// Recurring milestones expand per year.
pub fn upcoming_milestones(
    conn: &mut SqliteConnection,
    max_days: u32,
    now: DateTime<Utc>,
) -> EngineResult<Vec<UpcomingMilestone>> {
    let today = now.date_naive();
    let horizon = today + chrono::Duration::days(i64::from(max_days));
    let mut upcoming = Vec::new();

    for milestone in list_milestones(conn)? {
        let candidate_years: Vec<i32> = if milestone.recurring {
            (today.year()..=horizon.year()).collect()
        } else {
            milestone.year.into_iter().collect()
        };
        for year in candidate_years {
            let Some(date) = NaiveDate::from_ymd_opt(year, milestone.month, milestone.day) else {
                // Feb 29 in a non-leap year has no occurrence.
                continue;
            };
            if date >= today && date <= horizon {
                upcoming.push(UpcomingMilestone {
                    in_days: (date - today).num_days(),
                    occurs_on: date,
                    milestone: milestone.clone(),
                });
            }
        }
    }
    upcoming.sort_by_key(|u| u.in_days);
    Ok(upcoming)
}
