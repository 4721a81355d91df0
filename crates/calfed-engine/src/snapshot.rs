//! Read-only snapshots for what-if engines and the health surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::constraint::Constraint;
use calfed_core::error::EngineResult;
use calfed_core::event::CanonicalEvent;

use crate::events;
use crate::journal;
use crate::mirror::{self, EventMirror};
use crate::scheduling::{self, SessionView};

/// Everything a simulation needs, copied out of one store snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub events: Vec<CanonicalEvent>,
    pub constraints: Vec<Constraint>,
    pub mirrors: Vec<EventMirror>,
    pub sessions: Vec<SessionView>,
}

pub fn build(conn: &mut SqliteConnection, user_id: &str) -> EngineResult<SimulationSnapshot> {
    Ok(SimulationSnapshot {
        user_id: user_id.to_string(),
        generated_at: Utc::now(),
        events: events::list_all(conn)?,
        constraints: crate::constraints::list(conn, None)?,
        mirrors: mirror::list_all(conn)?,
        sessions: scheduling::list(conn)?,
    })
}

/// Operator-facing summary of one user's engine health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub mirror_counts: BTreeMap<String, i64>,
    pub failed_mirrors: Vec<FailedMirror>,
    pub pending_mirror_writes: i64,
    pub journal_entries: i64,
    pub ingestion_gated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMirror {
    pub mirror_id: String,
    pub canonical_event_id: String,
    pub target_account_id: String,
    pub attempt_count: i32,
    pub error: Option<String>,
}

pub fn health(
    conn: &mut SqliteConnection,
    user_id: &str,
    ingestion_gated: bool,
) -> EngineResult<HealthReport> {
    let failed = mirror::failed_mirrors(conn)?
        .into_iter()
        .map(|m| FailedMirror {
            mirror_id: m.mirror_id.to_string(),
            canonical_event_id: m.canonical_event_id.to_string(),
            target_account_id: m.target_account_id.to_string(),
            attempt_count: m.attempt_count,
            error: m.error,
        })
        .collect();
    Ok(HealthReport {
        user_id: user_id.to_string(),
        generated_at: Utc::now(),
        mirror_counts: mirror::counts_by_state(conn)?,
        failed_mirrors: failed,
        pending_mirror_writes: mirror::pending_write_count(conn)?,
        journal_entries: journal::count(conn)?,
        ingestion_gated,
    })
}
