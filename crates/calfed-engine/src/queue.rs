//! Mirror write jobs and the queue seam between ingestion and the writers.
//!
//! The engine depends only on [`JobSink`]; delivery is at least once and
//! consumers must tolerate duplicates. The writer-side claim guard makes a
//! duplicate delivery a no-op, so redelivery is always safe.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use calfed_core::error::{EngineError, EngineResult};
use calfed_core::ids::{AccountId, CalendarId, EventId, MirrorId};

use crate::mirror::MirrorState;

/// The three provider-facing mirror operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorJobKind {
    CreateMirror,
    UpdateMirror,
    DeleteMirror,
}

impl MirrorJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorJobKind::CreateMirror => "CREATE_MIRROR",
            MirrorJobKind::UpdateMirror => "UPDATE_MIRROR",
            MirrorJobKind::DeleteMirror => "DELETE_MIRROR",
        }
    }
}

/// One mirror write job. Payloads are not carried here: the writer claims
/// the mirror row through the owning user actor and receives the current
/// desired payload with the claim, so a stale queued job can never write
/// stale content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorJob {
    pub user_id: String,
    pub kind: MirrorJobKind,
    pub mirror_id: MirrorId,
    pub canonical_event_id: EventId,
    pub target_account_id: AccountId,
    pub target_calendar_id: CalendarId,
    /// Mirror state at enqueue time; the claim guard checks it still holds.
    pub state_when_enqueued: MirrorState,
}

impl MirrorJob {
    /// Message idempotency key.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.canonical_event_id,
            self.target_account_id,
            self.target_calendar_id,
            self.state_when_enqueued.as_str()
        )
    }
}

/// Producer side of the write queue.
pub trait JobSink: Send + Sync {
    /// Enqueue with at-least-once semantics.
    fn enqueue(&self, job: MirrorJob) -> EngineResult<()>;
}

/// In-memory sink that records jobs instead of delivering them. Unit
/// tests drain it to assert what ingestion enqueued.
#[derive(Debug, Default)]
pub struct RecordingJobSink {
    jobs: Mutex<Vec<MirrorJob>>,
}

impl RecordingJobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<MirrorJob> {
        std::mem::take(&mut self.jobs.lock().expect("job sink poisoned"))
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobSink for RecordingJobSink {
    fn enqueue(&self, job: MirrorJob) -> EngineResult<()> {
        self.jobs
            .lock()
            .map_err(|_| EngineError::transient("job sink poisoned"))?
            .push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_tracks_state() {
        let job = MirrorJob {
            user_id: "usr_a".to_string(),
            kind: MirrorJobKind::CreateMirror,
            mirror_id: MirrorId::generate(),
            canonical_event_id: EventId::generate(),
            target_account_id: AccountId::new("acc_b"),
            target_calendar_id: CalendarId::new("primary"),
            state_when_enqueued: MirrorState::PendingCreate,
        };
        let mut update = job.clone();
        update.kind = MirrorJobKind::UpdateMirror;
        update.state_when_enqueued = MirrorState::PendingUpdate;
        assert_ne!(job.idempotency_key(), update.idempotency_key());
    }
}
