//! Pure analytics math.
//!
//! Every function here is deterministic over its inputs; the engine's
//! analytics façade fetches the minimum SQL slice and delegates. Nothing
//! in this module touches a clock or a store.

pub mod load;
pub mod relationship;
pub mod risk;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use load::{
    context_switches, daily_cognitive_load, deep_work_windows, ContextSwitch, DailyLoad,
    DeepWorkWindow,
};
pub use relationship::{
    drift_report, rank_reconnections, reputation_score, DriftEntry, OutcomeKind,
    ReconnectionSuggestion, RelationshipSlice, ReputationSummary,
};
pub use risk::{day_risk_scores, slot_probabilities, DayRisk, SlotProbability};

/// The minimal event slice analytics operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingSlice {
    pub account: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendee_count: u32,
}

impl MeetingSlice {
    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes().max(0)
    }
}
