//! Append-only journal of canonical-event changes.
//!
//! Every ingestion, constraint, or scheduling mutation of a canonical
//! event appends exactly one entry. Entries are never updated or deleted
//! except by whole-user teardown; they drive idempotency checks and debug
//! trails.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::error::{EngineError, EngineResult};
use calfed_core::ids::EventId;

use crate::store::schema::journal_entries;

/// What happened to the canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "created" => Ok(ChangeType::Created),
            "updated" => Ok(ChangeType::Updated),
            "deleted" => Ok(ChangeType::Deleted),
            other => Err(EngineError::validation(format!(
                "invalid change type: {:?}",
                other
            ))),
        }
    }
}

/// One journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub canonical_event_id: EventId,
    pub change_type: ChangeType,
    pub actor: String,
    pub patch: serde_json::Value,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Queryable)]
struct JournalRecord {
    id: i64,
    canonical_event_id: String,
    change_type: String,
    actor: String,
    patch: String,
    ts: DateTime<Utc>,
}

impl TryFrom<JournalRecord> for JournalEntry {
    type Error = EngineError;

    fn try_from(record: JournalRecord) -> EngineResult<Self> {
        Ok(JournalEntry {
            id: record.id,
            canonical_event_id: EventId::parse(&record.canonical_event_id)?,
            change_type: ChangeType::parse(&record.change_type)?,
            actor: record.actor,
            patch: serde_json::from_str(&record.patch)?,
            ts: record.ts,
        })
    }
}

/// Append one entry. Runs inside the caller's transaction.
pub fn append(
    conn: &mut SqliteConnection,
    canonical_event_id: &EventId,
    change_type: ChangeType,
    actor: &str,
    patch: &serde_json::Value,
) -> EngineResult<()> {
    diesel::insert_into(journal_entries::table)
        .values((
            journal_entries::canonical_event_id.eq(canonical_event_id.as_str()),
            journal_entries::change_type.eq(change_type.as_str()),
            journal_entries::actor.eq(actor),
            journal_entries::patch.eq(patch.to_string()),
            journal_entries::ts.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// All entries for one canonical event, oldest first.
pub fn for_event(
    conn: &mut SqliteConnection,
    canonical_event_id: &EventId,
) -> EngineResult<Vec<JournalEntry>> {
    let records: Vec<JournalRecord> = journal_entries::table
        .filter(journal_entries::canonical_event_id.eq(canonical_event_id.as_str()))
        .order(journal_entries::id.asc())
        .load(conn)?;
    records.into_iter().map(JournalEntry::try_from).collect()
}

/// Total number of journal entries, for the health report.
pub fn count(conn: &mut SqliteConnection) -> EngineResult<i64> {
    Ok(journal_entries::table.count().get_result(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    #[test]
    fn append_and_read_back_in_order() {
        let store = Store::open_ephemeral("usr_j").unwrap();
        let mut conn = store.conn().unwrap();
        let event_id = EventId::generate();

        append(
            &mut conn,
            &event_id,
            ChangeType::Created,
            "ingestion",
            &json!({"title": "Team Sync"}),
        )
        .unwrap();
        append(
            &mut conn,
            &event_id,
            ChangeType::Updated,
            "ingestion",
            &json!({"start_ts": {"from": "a", "to": "b"}}),
        )
        .unwrap();

        let entries = for_event(&mut conn, &event_id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].change_type, ChangeType::Created);
        assert_eq!(entries[1].change_type, ChangeType::Updated);
        assert!(entries[0].id < entries[1].id);
        assert_eq!(count(&mut conn).unwrap(), 2);
    }
}
