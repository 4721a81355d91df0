//! Test doubles for the provider seams.
//!
//! [`InMemoryProvider`] is a scriptable calendar backend: it stores
//! payloads under provider-assigned ids, honors create idempotency keys,
//! and can be told to fail upcoming calls to exercise the retry and
//! dead-letter paths. Integration tests and the demo daemon both use it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use calfed_core::event::{
    Attendee, EventStatus, ProviderEvent, Transparency, Visibility,
};
use calfed_core::ids::{AccountId, CalendarId};
use calfed_core::projection::MirrorPayload;

use crate::provider::{
    AccessToken, AccessTokenProvider, ProviderWriteAdapter, ProviderWriteError,
};

type EventKey = (String, String, String);

#[derive(Default)]
struct ProviderState {
    events: HashMap<EventKey, MirrorPayload>,
    idempotency: HashMap<String, String>,
    next_failures: VecDeque<ProviderWriteError>,
    create_calls: u64,
    update_calls: u64,
    delete_calls: u64,
    sequence: u64,
}

/// In-memory provider backend.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<ProviderState>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next provider call.
    pub fn fail_next(&self, error: ProviderWriteError) {
        self.state.lock().unwrap().next_failures.push_back(error);
    }

    /// Snapshot of all stored events on one calendar.
    pub fn events_on(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
    ) -> Vec<(String, MirrorPayload)> {
        let state = self.state.lock().unwrap();
        state
            .events
            .iter()
            .filter(|((acc, cal, _), _)| {
                acc == account.as_str() && cal == calendar.as_str()
            })
            .map(|((_, _, id), payload)| (id.clone(), payload.clone()))
            .collect()
    }

    pub fn event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        provider_event_id: &str,
    ) -> Option<MirrorPayload> {
        self.state
            .lock()
            .unwrap()
            .events
            .get(&(
                account.as_str().to_string(),
                calendar.as_str().to_string(),
                provider_event_id.to_string(),
            ))
            .cloned()
    }

    pub fn call_counts(&self) -> (u64, u64, u64) {
        let state = self.state.lock().unwrap();
        (state.create_calls, state.update_calls, state.delete_calls)
    }

    /// Render a stored payload as the provider event a sync worker would
    /// deliver back, extended properties included. This is how tests
    /// feed a mirror back through ingestion.
    pub fn as_provider_event(payload: &MirrorPayload) -> ProviderEvent {
        ProviderEvent {
            title: payload.title.clone(),
            description: payload.description.clone(),
            location: payload.location.clone(),
            start: payload.start_ts.clone(),
            end: payload.end_ts.clone(),
            timezone: payload.timezone.clone(),
            all_day: payload.all_day,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: payload.transparency,
            recurrence_rule: None,
            extended_properties: payload
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            attendees: Vec::new(),
            updated_at: Some(Utc::now()),
        }
    }

    fn take_failure(state: &mut ProviderState) -> Option<ProviderWriteError> {
        state.next_failures.pop_front()
    }
}

#[async_trait]
impl ProviderWriteAdapter for InMemoryProvider {
    async fn create_event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        payload: &MirrorPayload,
        idempotency_key: &str,
    ) -> Result<String, ProviderWriteError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if let Some(error) = Self::take_failure(&mut state) {
            return Err(error);
        }
        if let Some(existing) = state.idempotency.get(idempotency_key) {
            return Ok(existing.clone());
        }
        state.sequence += 1;
        let provider_event_id = format!("pev_{:06}", state.sequence);
        state.events.insert(
            (
                account.as_str().to_string(),
                calendar.as_str().to_string(),
                provider_event_id.clone(),
            ),
            payload.clone(),
        );
        state
            .idempotency
            .insert(idempotency_key.to_string(), provider_event_id.clone());
        Ok(provider_event_id)
    }

    async fn update_event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        provider_event_id: &str,
        payload: &MirrorPayload,
    ) -> Result<(), ProviderWriteError> {
        let mut state = self.state.lock().unwrap();
        state.update_calls += 1;
        if let Some(error) = Self::take_failure(&mut state) {
            return Err(error);
        }
        let key = (
            account.as_str().to_string(),
            calendar.as_str().to_string(),
            provider_event_id.to_string(),
        );
        match state.events.get_mut(&key) {
            Some(stored) => {
                *stored = payload.clone();
                Ok(())
            }
            None => Err(ProviderWriteError::permanent(format!(
                "event {} not found",
                provider_event_id
            ))),
        }
    }

    async fn delete_event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        provider_event_id: &str,
    ) -> Result<(), ProviderWriteError> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        if let Some(error) = Self::take_failure(&mut state) {
            return Err(error);
        }
        let key = (
            account.as_str().to_string(),
            calendar.as_str().to_string(),
            provider_event_id.to_string(),
        );
        state.events.remove(&key);
        Ok(())
    }
}

/// Token provider that always succeeds, with a revocation switch per
/// account.
#[derive(Default)]
pub struct StaticTokenProvider {
    revoked: Mutex<Vec<String>>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, account: &AccountId) {
        self.revoked
            .lock()
            .unwrap()
            .push(account.as_str().to_string());
    }

    pub fn revoked_accounts(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn get_access_token(
        &self,
        account: &AccountId,
        _scope: &str,
    ) -> Result<AccessToken, ProviderWriteError> {
        if self
            .revoked
            .lock()
            .unwrap()
            .iter()
            .any(|a| a == account.as_str())
        {
            return Err(ProviderWriteError::permanent(format!(
                "grant revoked for {}",
                account
            )));
        }
        Ok(AccessToken {
            token: format!("tok_{}", account),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn record_token_revoked(&self, account: &AccountId) {
        self.revoke(account);
    }
}

/// Convenience builder for normalized provider events in tests.
pub fn provider_event(title: &str, start: &str, end: &str) -> ProviderEvent {
    ProviderEvent {
        title: title.to_string(),
        description: None,
        location: None,
        start: start.to_string(),
        end: end.to_string(),
        timezone: None,
        all_day: false,
        status: EventStatus::Confirmed,
        visibility: Visibility::Default,
        transparency: Transparency::Opaque,
        recurrence_rule: None,
        extended_properties: HashMap::new(),
        attendees: Vec::new(),
        updated_at: Some(Utc::now()),
    }
}

/// Attendee builder for participant-path tests.
pub fn attendee(email: &str, display_name: &str) -> Attendee {
    Attendee {
        email: email.to_string(),
        display_name: Some(display_name.to_string()),
        response_status: Some("accepted".to_string()),
    }
}
