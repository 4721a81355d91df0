//! The mirror projection engine.
//!
//! Pure function from one canonical event plus the active policy edges to
//! the set of mirror payloads that must exist downstream. The engine layer
//! reconciles this desired set against the mirror state table and enqueues
//! the create/update/delete jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classify::{TAG_CANONICAL_EVENT_ID, TAG_ENGINE, TAG_MANAGED, TAG_ORIGIN_ACCOUNT_ID};
use crate::constraint::{DetailLevel, PolicyEdge};
use crate::event::{sha256_hex, CanonicalEvent, EventStatus, Transparency};
use crate::ids::{AccountId, CalendarId};

/// The body the writer pushes to a provider for one mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPayload {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_ts: String,
    pub end_ts: String,
    pub timezone: Option<String>,
    pub all_day: bool,
    pub transparency: Transparency,
    /// Managed metadata stamped into the provider's extended-properties
    /// slot; sorted for deterministic serialization.
    pub tags: BTreeMap<String, String>,
}

/// One desired `(target account, target calendar)` projection of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorTarget {
    pub target_account: AccountId,
    pub target_calendar: CalendarId,
    pub detail_level: DetailLevel,
    pub payload: MirrorPayload,
    /// Stable hash of the canonical fields reflected downstream; a mirror
    /// whose stored hash differs needs an update.
    pub projected_hash: String,
}

/// Compute the desired mirror set for `event` under `edges`.
///
/// Cancelled and transparent events project to nothing (their existing
/// mirrors get torn down by reconciliation). Each selecting edge yields
/// one target with a payload at the edge's detail level.
pub fn project_mirrors(event: &CanonicalEvent, edges: &[PolicyEdge]) -> Vec<MirrorTarget> {
    if event.status == EventStatus::Cancelled || event.transparency == Transparency::Transparent {
        return Vec::new();
    }

    let mut targets = Vec::new();
    for edge in edges {
        if !edge.selects(&event.origin_account_id, &event.start_ts, &event.end_ts) {
            continue;
        }
        let payload = build_payload(event, edge.detail_level);
        let projected_hash = projected_hash(event, edge.detail_level);
        targets.push(MirrorTarget {
            target_account: edge.target_account.clone(),
            target_calendar: edge.target_calendar.clone(),
            detail_level: edge.detail_level,
            payload,
            projected_hash,
        });
    }
    targets
}

/// Trip-derived system events block every connected calendar, so they
/// project through each active edge regardless of the edge's source
/// account, deduplicated by target.
pub fn project_trip_mirrors(event: &CanonicalEvent, edges: &[PolicyEdge]) -> Vec<MirrorTarget> {
    if event.status == EventStatus::Cancelled || event.transparency == Transparency::Transparent {
        return Vec::new();
    }
    let mut targets: Vec<MirrorTarget> = Vec::new();
    for edge in edges {
        if targets.iter().any(|t| {
            t.target_account == edge.target_account && t.target_calendar == edge.target_calendar
        }) {
            continue;
        }
        if let Some(from) = edge.active_from {
            if let Ok(end) = crate::interval::normalize_time(&event.end_ts) {
                if from >= end {
                    continue;
                }
            }
        }
        if let Some(to) = edge.active_to {
            if let Ok(start) = crate::interval::normalize_time(&event.start_ts) {
                if to <= start {
                    continue;
                }
            }
        }
        let payload = build_payload(event, DetailLevel::Busy);
        targets.push(MirrorTarget {
            target_account: edge.target_account.clone(),
            target_calendar: edge.target_calendar.clone(),
            detail_level: DetailLevel::Busy,
            payload,
            projected_hash: projected_hash(event, DetailLevel::Busy),
        });
    }
    targets
}

fn build_payload(event: &CanonicalEvent, detail_level: DetailLevel) -> MirrorPayload {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_ENGINE.to_string(), "true".to_string());
    tags.insert(TAG_MANAGED.to_string(), "true".to_string());
    tags.insert(
        TAG_CANONICAL_EVENT_ID.to_string(),
        event.canonical_event_id.to_string(),
    );
    tags.insert(
        TAG_ORIGIN_ACCOUNT_ID.to_string(),
        event.origin_account_id.to_string(),
    );

    match detail_level {
        DetailLevel::Busy => MirrorPayload {
            title: "Busy".to_string(),
            description: None,
            location: None,
            start_ts: event.start_ts.clone(),
            end_ts: event.end_ts.clone(),
            timezone: event.timezone.clone(),
            all_day: event.all_day,
            transparency: Transparency::Opaque,
            tags,
        },
        DetailLevel::Title => MirrorPayload {
            title: event.title.clone(),
            description: None,
            location: None,
            start_ts: event.start_ts.clone(),
            end_ts: event.end_ts.clone(),
            timezone: event.timezone.clone(),
            all_day: event.all_day,
            transparency: Transparency::Opaque,
            tags,
        },
        DetailLevel::Full => MirrorPayload {
            title: event.title.clone(),
            description: event.description.clone(),
            location: event.location.clone(),
            start_ts: event.start_ts.clone(),
            end_ts: event.end_ts.clone(),
            timezone: event.timezone.clone(),
            all_day: event.all_day,
            transparency: Transparency::Opaque,
            tags,
        },
    }
}

/// Hash of the canonical fields a mirror at `detail_level` reflects.
/// Fields invisible at the level do not perturb the hash, so a BUSY
/// mirror does not churn when only the description changes.
pub fn projected_hash(event: &CanonicalEvent, detail_level: DetailLevel) -> String {
    let (title, description, location) = match detail_level {
        DetailLevel::Busy => ("Busy", "", ""),
        DetailLevel::Title => (event.title.as_str(), "", ""),
        DetailLevel::Full => (
            event.title.as_str(),
            event.description.as_deref().unwrap_or(""),
            event.location.as_deref().unwrap_or(""),
        ),
    };
    sha256_hex(&[
        detail_level.as_str(),
        title,
        description,
        location,
        &event.start_ts,
        &event.end_ts,
        event.timezone.as_deref().unwrap_or(""),
        if event.all_day { "1" } else { "0" },
    ])
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::event::{EventSource, Visibility};
    use crate::ids::{ConstraintId, EventId};

    fn sample_event() -> CanonicalEvent {
        CanonicalEvent {
            canonical_event_id: EventId::generate(),
            origin_account_id: AccountId::new("acc_a"),
            origin_event_id: "g1".to_string(),
            title: "Team Sync".to_string(),
            description: Some("weekly notes".to_string()),
            location: Some("Room 4".to_string()),
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

    fn edge(detail_level: DetailLevel) -> PolicyEdge {
        PolicyEdge {
            constraint_id: ConstraintId::generate(),
            source_account: AccountId::new("acc_a"),
            target_account: AccountId::new("acc_b"),
            target_calendar: CalendarId::new("primary"),
            detail_level,
            active_from: None,
            active_to: None,
        }
    }

    #[test]
    fn busy_payload_masks_everything() {
        let targets = project_mirrors(&sample_event(), &[edge(DetailLevel::Busy)]);
        assert_eq!(targets.len(), 1);
        let payload = &targets[0].payload;
        assert_eq!(payload.title, "Busy");
        assert!(payload.description.is_none());
        assert!(payload.location.is_none());
        assert_eq!(payload.transparency, Transparency::Opaque);
    }

    #[test]
    fn payload_carries_managed_tags() {
        let event = sample_event();
        let targets = project_mirrors(&event, &[edge(DetailLevel::Title)]);
        let tags = &targets[0].payload.tags;
        assert_eq!(tags.get(TAG_ENGINE).map(String::as_str), Some("true"));
        assert_eq!(tags.get(TAG_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(
            tags.get(TAG_CANONICAL_EVENT_ID),
            Some(&event.canonical_event_id.to_string())
        );
        assert_eq!(
            tags.get(TAG_ORIGIN_ACCOUNT_ID),
            Some(&event.origin_account_id.to_string())
        );
    }

    #[test]
    fn cancelled_event_projects_nothing() {
        let mut event = sample_event();
        event.status = EventStatus::Cancelled;
        assert!(project_mirrors(&event, &[edge(DetailLevel::Busy)]).is_empty());
    }

    #[test]
    fn transparent_event_projects_nothing() {
        let mut event = sample_event();
        event.transparency = Transparency::Transparent;
        assert!(project_mirrors(&event, &[edge(DetailLevel::Full)]).is_empty());
    }

    #[test]
    fn busy_hash_ignores_description_changes() {
        let mut event = sample_event();
        let before = projected_hash(&event, DetailLevel::Busy);
        event.description = Some("edited".to_string());
        assert_eq!(projected_hash(&event, DetailLevel::Busy), before);
        // A time change perturbs every level.
        event.start_ts = "2026-02-16T14:30:00Z".to_string();
        assert_ne!(projected_hash(&event, DetailLevel::Busy), before);
    }

    #[test]
    fn full_hash_tracks_description() {
        let mut event = sample_event();
        let before = projected_hash(&event, DetailLevel::Full);
        event.description = Some("edited".to_string());
        assert_ne!(projected_hash(&event, DetailLevel::Full), before);
    }

    #[test]
    fn non_matching_edge_is_skipped() {
        let mut foreign = edge(DetailLevel::Busy);
        foreign.source_account = AccountId::new("acc_other");
        assert!(project_mirrors(&sample_event(), &[foreign]).is_empty());
    }
}
