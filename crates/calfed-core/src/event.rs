//! Canonical event model and normalized provider delta types.
//!
//! A [`CanonicalEvent`] is the system-of-record representation of a user's
//! event, independent of any provider. Providers feed the engine
//! [`ProviderDelta`] batches whose embedded [`ProviderEvent`] has already
//! been normalized by the external sync worker; the engine never parses a
//! provider wire format.
//!
//! Event times are ISO-8601 strings. All-day events carry date-only values
//! (`YYYY-MM-DD`); timed events carry RFC 3339 datetimes. The interval
//! module normalizes both forms before any comparison.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::ids::{AccountId, ConstraintId, EventId};
use crate::interval::normalize_time;

/// Event confirmation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "confirmed",
            EventStatus::Tentative => "tentative",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "confirmed" => Ok(EventStatus::Confirmed),
            "tentative" => Ok(EventStatus::Tentative),
            "cancelled" => Ok(EventStatus::Cancelled),
            other => Err(EngineError::validation(format!(
                "invalid event status: {:?}",
                other
            ))),
        }
    }
}

/// Whether the event blocks availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transparency {
    /// Counts as busy.
    Opaque,
    /// Free; never mirrored and never blocks availability.
    Transparent,
}

impl Transparency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transparency::Opaque => "opaque",
            Transparency::Transparent => "transparent",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "opaque" => Ok(Transparency::Opaque),
            "transparent" => Ok(Transparency::Transparent),
            other => Err(EngineError::validation(format!(
                "invalid transparency: {:?}",
                other
            ))),
        }
    }
}

/// Provider-facing visibility of the event body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Default,
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Default => "default",
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "default" => Ok(Visibility::Default),
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(EngineError::validation(format!(
                "invalid visibility: {:?}",
                other
            ))),
        }
    }
}

/// Where a canonical event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Ingested from a connected provider.
    Provider,
    /// Derived by the engine (trip constraints, committed sessions).
    System,
    /// Imported from an ICS feed.
    Ics,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Provider => "provider",
            EventSource::System => "system",
            EventSource::Ics => "ics",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "provider" => Ok(EventSource::Provider),
            "system" => Ok(EventSource::System),
            "ics" => Ok(EventSource::Ics),
            other => Err(EngineError::validation(format!(
                "invalid event source: {:?}",
                other
            ))),
        }
    }
}

/// The system-of-record representation of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub canonical_event_id: EventId,
    pub origin_account_id: AccountId,
    /// Provider-assigned id of the origin event; unique per origin account.
    pub origin_event_id: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_ts: String,
    pub end_ts: String,
    pub timezone: Option<String>,
    pub all_day: bool,
    pub status: EventStatus,
    pub visibility: Visibility,
    pub transparency: Transparency,
    pub recurrence_rule: Option<String>,
    pub source: EventSource,
    /// Monotonic per event; starts at 1.
    pub version: i64,
    pub constraint_id: Option<ConstraintId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Validate the time-ordering invariant (`start_ts <= end_ts` after
    /// normalization) and that both timestamps parse.
    pub fn validate_times(&self) -> EngineResult<()> {
        let start = normalize_time(&self.start_ts)?;
        let end = normalize_time(&self.end_ts)?;
        if start > end {
            return Err(EngineError::validation(format!(
                "event {} starts after it ends ({} > {})",
                self.canonical_event_id, self.start_ts, self.end_ts
            )));
        }
        Ok(())
    }

    /// Stable hash over the payload fields ingestion compares for the
    /// "no-op when unchanged" rule. Excludes version and bookkeeping
    /// timestamps so an identical provider update hashes identically.
    pub fn payload_hash(&self) -> String {
        sha256_hex(&[
            &self.title,
            self.description.as_deref().unwrap_or(""),
            self.location.as_deref().unwrap_or(""),
            &self.start_ts,
            &self.end_ts,
            self.timezone.as_deref().unwrap_or(""),
            if self.all_day { "1" } else { "0" },
            self.status.as_str(),
            self.visibility.as_str(),
            self.transparency.as_str(),
            self.recurrence_rule.as_deref().unwrap_or(""),
        ])
    }
}

/// One attendee on a provider event, already normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub display_name: Option<String>,
    pub response_status: Option<String>,
}

/// A provider event as delivered by the external sync worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub all_day: bool,
    pub status: EventStatus,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    pub transparency: Transparency,
    #[serde(default)]
    pub recurrence_rule: Option<String>,
    /// Provider extended-properties / open-extension slot. This is where
    /// the engine's managed-mirror tags live.
    #[serde(default)]
    pub extended_properties: HashMap<String, String>,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
    /// Provider-side modification stamp, used for the monotonicity no-op.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_visibility() -> Visibility {
    Visibility::Default
}

impl ProviderEvent {
    pub fn validate(&self) -> EngineResult<()> {
        if self.title.trim().is_empty() {
            return Err(EngineError::validation("event title must not be empty"));
        }
        let start = normalize_time(&self.start)?;
        let end = normalize_time(&self.end)?;
        if start > end {
            return Err(EngineError::validation(format!(
                "event starts after it ends ({} > {})",
                self.start, self.end
            )));
        }
        if let Some(tz) = &self.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(EngineError::validation(format!(
                    "invalid IANA timezone: {:?}",
                    tz
                )));
            }
        }
        Ok(())
    }
}

/// One normalized change from a provider sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderDelta {
    Created {
        origin_event_id: String,
        event: ProviderEvent,
    },
    Updated {
        origin_event_id: String,
        event: ProviderEvent,
    },
    Deleted {
        origin_event_id: String,
    },
}

impl ProviderDelta {
    pub fn origin_event_id(&self) -> &str {
        match self {
            ProviderDelta::Created {
                origin_event_id, ..
            }
            | ProviderDelta::Updated {
                origin_event_id, ..
            }
            | ProviderDelta::Deleted { origin_event_id } => origin_event_id,
        }
    }
}

/// Per-delta failure inside a batch; siblings keep processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaError {
    pub origin_event_id: String,
    pub code: String,
    pub message: String,
}

/// Result of one `apply_provider_deltas` batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub errors: Vec<DeltaError>,
    pub mirrors_enqueued: u64,
}

/// Hex SHA-256 over length-delimited parts. Length delimiting keeps the
/// hash stable under field concatenation ambiguity.
pub(crate) fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Participant hash: SHA-256 of the lowercased email plus a per-deployment
/// salt. The raw email is never persisted in analytics tables.
pub fn participant_hash(email: &str, salt: &str) -> String {
    sha256_hex(&[email.trim().to_lowercase().as_str(), salt])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> ProviderEvent {
        ProviderEvent {
            title: "Team Sync".to_string(),
            description: None,
            location: None,
            start: "2026-02-16T14:00:00Z".to_string(),
            end: "2026-02-16T15:00:00Z".to_string(),
            timezone: None,
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            recurrence_rule: None,
            extended_properties: HashMap::new(),
            attendees: Vec::new(),
            updated_at: None,
        }
    }

    #[test]
    fn delta_round_trips_through_tagged_json() {
        let delta = ProviderDelta::Created {
            origin_event_id: "g1".to_string(),
            event: sample_event(),
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["type"], "created");
        let back: ProviderDelta = serde_json::from_value(json).unwrap();
        assert_eq!(back.origin_event_id(), "g1");
    }

    #[test]
    fn validate_rejects_inverted_times() {
        let mut event = sample_event();
        event.start = "2026-02-16T16:00:00Z".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_timezone() {
        let mut event = sample_event();
        event.timezone = Some("Mars/Olympus".to_string());
        assert!(event.validate().is_err());
    }

    #[test]
    fn participant_hash_is_salted_and_case_insensitive() {
        let a = participant_hash("Ada@example.com", "s1");
        let b = participant_hash("ada@example.com", "s1");
        let c = participant_hash("ada@example.com", "s2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sha256_hex_is_length_delimited() {
        assert_ne!(sha256_hex(&["ab", "c"]), sha256_hex(&["a", "bc"]));
    }
}
