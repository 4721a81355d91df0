//! Prefixed ULID identifiers for all engine entities.
//!
//! Every id is an opaque string with a type prefix (`evt_`, `mir_`, `ses_`,
//! `hold_`, `con_`, `rel_`, `ledger_`, `mst_`) followed by a ULID. Ids are
//! newtypes over `String` so they stay cheap to store and compare while the
//! type system keeps the different id spaces apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{EngineError, EngineResult};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh id.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, Ulid::new()))
            }

            /// Parse an id, validating the type prefix.
            pub fn parse(raw: &str) -> EngineResult<Self> {
                if raw.len() > $prefix.len() && raw.starts_with($prefix) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(EngineError::validation(format!(
                        "invalid {} id: {:?} (expected {:?} prefix)",
                        stringify!($name),
                        raw,
                        $prefix,
                    )))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

entity_id!(
    /// Canonical event id (`evt_…`).
    EventId,
    "evt_"
);
entity_id!(
    /// Event mirror id (`mir_…`).
    MirrorId,
    "mir_"
);
entity_id!(
    /// Scheduling session id (`ses_…`).
    SessionId,
    "ses_"
);
entity_id!(
    /// Hold id (`hold_…`).
    HoldId,
    "hold_"
);
entity_id!(
    /// Constraint id (`con_…`).
    ConstraintId,
    "con_"
);
entity_id!(
    /// Relationship id (`rel_…`).
    RelationshipId,
    "rel_"
);
entity_id!(
    /// Ledger entry id (`ledger_…`).
    LedgerId,
    "ledger_"
);
entity_id!(
    /// Milestone id (`mst_…`).
    MilestoneId,
    "mst_"
);

/// External account identifier, assigned by the account adapter. Opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-side calendar identifier within an account. Opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarId(pub String);

impl CalendarId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CalendarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        let id = EventId::generate();
        assert!(id.as_str().starts_with("evt_"));
        assert!(HoldId::generate().as_str().starts_with("hold_"));
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        assert!(EventId::parse("mir_01HZX7E9NVT5Q4J0K8Y2W3R6SD").is_err());
        assert!(EventId::parse("evt_").is_err());
        assert!(EventId::parse("evt_01HZX7E9NVT5Q4J0K8Y2W3R6SD").is_ok());
    }

    #[test]
    fn ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }
}
