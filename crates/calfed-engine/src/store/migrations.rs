//! Numbered, forward-only schema migrations.
//!
//! Migrations are embedded SQL applied at store open inside one
//! transaction each; `schema_migrations` records what ran. Re-applying is
//! a no-op, and every statement is written to be idempotent so a crash
//! between the DDL and the version insert heals on the next boot.

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;

use calfed_core::error::{EngineError, EngineResult};

use super::schema::schema_migrations;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "canonical_events_and_journal",
        sql: r#"
CREATE TABLE IF NOT EXISTS canonical_events (
    canonical_event_id TEXT PRIMARY KEY NOT NULL,
    origin_account_id TEXT NOT NULL,
    origin_event_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    location TEXT,
    start_ts TEXT NOT NULL,
    end_ts TEXT NOT NULL,
    timezone TEXT,
    all_day BOOLEAN NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'default',
    transparency TEXT NOT NULL,
    recurrence_rule TEXT,
    source TEXT NOT NULL,
    version BIGINT NOT NULL DEFAULT 1,
    constraint_id TEXT,
    payload_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_canonical_origin
    ON canonical_events (origin_account_id, origin_event_id);
CREATE INDEX IF NOT EXISTS idx_canonical_start ON canonical_events (start_ts);

CREATE TABLE IF NOT EXISTS journal_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_event_id TEXT NOT NULL,
    change_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    patch TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_journal_event ON journal_entries (canonical_event_id);
"#,
    },
    Migration {
        version: 2,
        name: "constraints",
        sql: r#"
CREATE TABLE IF NOT EXISTS constraints (
    constraint_id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    config_json TEXT NOT NULL,
    active_from TEXT,
    active_to TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_constraints_kind ON constraints (kind);
"#,
    },
    Migration {
        version: 3,
        name: "event_mirrors",
        sql: r#"
CREATE TABLE IF NOT EXISTS event_mirrors (
    mirror_id TEXT PRIMARY KEY NOT NULL,
    canonical_event_id TEXT NOT NULL,
    target_account_id TEXT NOT NULL,
    target_calendar_id TEXT NOT NULL,
    provider_event_id TEXT,
    last_projected_hash TEXT,
    desired_payload TEXT,
    state TEXT NOT NULL,
    error TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at TEXT,
    last_write_ts TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_mirror_key
    ON event_mirrors (canonical_event_id, target_account_id, target_calendar_id);
CREATE INDEX IF NOT EXISTS idx_mirror_state ON event_mirrors (state);
CREATE INDEX IF NOT EXISTS idx_mirror_retry ON event_mirrors (next_retry_at);
"#,
    },
    Migration {
        version: 4,
        name: "relationships_and_milestones",
        sql: r#"
CREATE TABLE IF NOT EXISTS relationships (
    relationship_id TEXT PRIMARY KEY NOT NULL,
    participant_hash TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    display_name TEXT NOT NULL,
    city TEXT,
    cadence_days INTEGER,
    last_interaction_ts TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    ledger_id TEXT PRIMARY KEY NOT NULL,
    participant_hash TEXT NOT NULL,
    outcome TEXT NOT NULL,
    note TEXT,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_participant ON ledger_entries (participant_hash);

CREATE TABLE IF NOT EXISTS milestones (
    milestone_id TEXT PRIMARY KEY NOT NULL,
    participant_hash TEXT,
    title TEXT NOT NULL,
    month INTEGER NOT NULL,
    day INTEGER NOT NULL,
    year INTEGER,
    recurring BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_participants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_event_id TEXT NOT NULL,
    participant_hash TEXT NOT NULL,
    display_name TEXT,
    response_status TEXT
);
CREATE INDEX IF NOT EXISTS idx_participants_event
    ON event_participants (canonical_event_id);
CREATE INDEX IF NOT EXISTS idx_participants_hash
    ON event_participants (participant_hash);
"#,
    },
    Migration {
        version: 5,
        name: "scheduling_sessions_and_holds",
        sql: r#"
CREATE TABLE IF NOT EXISTS scheduling_sessions (
    session_id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    title TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL,
    candidates_json TEXT NOT NULL,
    selected_candidate_id TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS holds (
    hold_id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    candidate_id TEXT NOT NULL,
    target_account_id TEXT NOT NULL,
    target_calendar_id TEXT NOT NULL,
    start_ts TEXT NOT NULL,
    end_ts TEXT NOT NULL,
    status TEXT NOT NULL,
    provider_event_id TEXT,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_holds_session ON holds (session_id);
CREATE INDEX IF NOT EXISTS idx_holds_expiry ON holds (expires_at);
"#,
    },
];

/// Apply all missing migrations. Called at store open and again if a
/// later query reports a missing table (schema drift heals by re-running).
pub fn apply_migrations(conn: &mut SqliteConnection) -> EngineResult<()> {
    conn.batch_execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(EngineError::from)?;

    let applied: Vec<i32> = schema_migrations::table
        .select(schema_migrations::version)
        .order(schema_migrations::version.asc())
        .load(conn)?;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        conn.transaction::<_, EngineError, _>(|conn| {
            conn.batch_execute(migration.sql)?;
            diesel::insert_into(schema_migrations::table)
                .values((
                    schema_migrations::version.eq(migration.version),
                    schema_migrations::name.eq(migration.name),
                    schema_migrations::applied_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
    }
    Ok(())
}

/// Highest applied migration version, if any.
pub fn current_version(conn: &mut SqliteConnection) -> EngineResult<Option<i32>> {
    let version = schema_migrations::table
        .select(diesel::dsl::max(schema_migrations::version))
        .first::<Option<i32>>(conn)?;
    Ok(version)
}

/// Whether a diesel error looks like "required table is missing", the
/// schema-drift signal that warrants re-running migrations.
pub fn is_missing_table(error: &diesel::result::Error) -> bool {
    matches!(
        error,
        diesel::result::Error::DatabaseError(_, info)
            if info.message().contains("no such table")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::Connection;

    fn test_conn() -> SqliteConnection {
        SqliteConnection::establish(":memory:").expect("in-memory sqlite")
    }

    #[test]
    fn migrations_apply_cleanly() {
        let mut conn = test_conn();
        apply_migrations(&mut conn).unwrap();
        assert_eq!(
            current_version(&mut conn).unwrap(),
            Some(MIGRATIONS.last().unwrap().version)
        );
    }

    #[test]
    fn reapply_is_a_noop() {
        let mut conn = test_conn();
        apply_migrations(&mut conn).unwrap();
        apply_migrations(&mut conn).unwrap();
        let applied: Vec<i32> = schema_migrations::table
            .select(schema_migrations::version)
            .load(&mut conn)
            .unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());
    }

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
