//! Provider event classification: the sync-loop guard.
//!
//! Every inbound provider event is classified before any state is touched.
//! Events the engine itself wrote back (managed mirrors) carry the tag set
//! below in the provider's extended-properties slot and must never be
//! re-ingested; the presence of our managed marker dominates every other
//! signal.

use crate::event::{ProviderEvent, Transparency};

/// Tag keys the engine stamps into provider extended properties when it
/// writes a mirror. These are the authoritative loop-prevention markers.
pub const TAG_ENGINE: &str = "tminus";
pub const TAG_MANAGED: &str = "managed";
pub const TAG_CANONICAL_EVENT_ID: &str = "canonical_event_id";
pub const TAG_ORIGIN_ACCOUNT_ID: &str = "origin_account_id";

/// Classification of an inbound provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// A real event owned by the origin account; ingested.
    Origin,
    /// One of our own mirror write-backs observed through the provider;
    /// discarded before touching any state.
    ManagedMirror,
    /// A busy block written by some other system the user has marked;
    /// ingested but flagged for analytics.
    ExternalMirror,
}

fn tag_is_true(event: &ProviderEvent, key: &str) -> bool {
    event
        .extended_properties
        .get(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Classify a provider event.
///
/// - `managed_mirror` iff the extended properties carry `tminus=true` and
///   `managed=true` plus a `canonical_event_id` tag we previously set.
/// - `external_mirror` iff the event is transparent and carries the
///   user-configured other-system tag.
/// - otherwise `origin`.
///
/// The managed marker always dominates: a transparent event with our
/// marker is still a managed mirror.
pub fn classify(event: &ProviderEvent, external_mirror_tag: Option<&str>) -> EventClass {
    let has_marker = tag_is_true(event, TAG_ENGINE)
        && tag_is_true(event, TAG_MANAGED)
        && event
            .extended_properties
            .get(TAG_CANONICAL_EVENT_ID)
            .map(|id| !id.is_empty())
            .unwrap_or(false);
    if has_marker {
        return EventClass::ManagedMirror;
    }

    if event.transparency == Transparency::Transparent {
        if let Some(tag) = external_mirror_tag {
            if event.extended_properties.contains_key(tag) {
                return EventClass::ExternalMirror;
            }
        }
    }

    EventClass::Origin
}
