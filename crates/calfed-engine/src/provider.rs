//! Provider write and account adapter seams.
//!
//! The engine never speaks a provider wire protocol. Writers push abstract
//! payloads through [`ProviderWriteAdapter`] and the adapter classifies
//! every failure as retryable, rate-limited, or permanent — the retry loop
//! keys off that classification alone, so error taxonomy stays pluggable.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use calfed_core::error::EngineError;
use calfed_core::ids::{AccountId, CalendarId};
use calfed_core::projection::MirrorPayload;

/// Classified provider write failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderWriteError {
    /// Network glitch or provider 5xx; retry with backoff.
    #[error("retryable provider error: {message}")]
    Retryable { message: String },

    /// Provider 429; retry after the given delay.
    #[error("provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Auth revoked or other non-rate-limit 4xx; do not retry.
    #[error("permanent provider error: {message}")]
    Permanent { message: String },
}

impl ProviderWriteError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ProviderWriteError::Retryable {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderWriteError::Permanent {
            message: message.into(),
        }
    }
}

impl From<ProviderWriteError> for EngineError {
    fn from(error: ProviderWriteError) -> Self {
        match error {
            ProviderWriteError::Retryable { message } => EngineError::transient(message),
            ProviderWriteError::RateLimited { retry_after } => {
                EngineError::retry_later("provider rate limited", retry_after)
            }
            ProviderWriteError::Permanent { message } => EngineError::permanent(message),
        }
    }
}

/// Abstract provider write surface consumed by the mirror writers and the
/// scheduling hold flow.
#[async_trait]
pub trait ProviderWriteAdapter: Send + Sync {
    /// Create an event; returns the provider-assigned event id.
    /// `idempotency_key` dedupes replayed creates on providers that
    /// support it.
    async fn create_event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        payload: &MirrorPayload,
        idempotency_key: &str,
    ) -> Result<String, ProviderWriteError>;

    async fn update_event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        provider_event_id: &str,
        payload: &MirrorPayload,
    ) -> Result<(), ProviderWriteError>;

    async fn delete_event(
        &self,
        account: &AccountId,
        calendar: &CalendarId,
        provider_event_id: &str,
    ) -> Result<(), ProviderWriteError>;
}

/// Short-lived provider access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// OAuth/account adapter: token minting and revocation reporting. The
/// token lifecycle itself (refresh, storage) is external.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Mint or fetch an access token for the account and scope. A revoked
    /// grant surfaces as [`ProviderWriteError::Permanent`].
    async fn get_access_token(
        &self,
        account: &AccountId,
        scope: &str,
    ) -> Result<AccessToken, ProviderWriteError>;

    /// Record that the provider reported the account's grant revoked.
    async fn record_token_revoked(&self, account: &AccountId);
}
