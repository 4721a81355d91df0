//! Constraints and cross-account policy edges.
//!
//! A constraint is a user-owned rule stored as `(kind, config_json)` with
//! an optional active window. Policy edges are constraints of kind `edge`
//! and drive the mirror projection engine; the other kinds shape
//! availability (working hours, buffers, cutoffs, overrides) or derive
//! system events (trips).
//!
//! `config_json` is persisted as a JSON string and re-validated on read,
//! because older rows may predate schema tightening.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ids::{AccountId, CalendarId, ConstraintId};
use crate::interval::normalize_time;

/// Constraint kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Directed mirror rule: source account -> target calendar.
    Edge,
    /// Travel window; derives one system canonical event.
    Trip,
    /// Weekly working-hours template in an IANA timezone.
    WorkingHours,
    /// Travel/prep/cooldown padding around matching events.
    Buffer,
    /// Daily meeting cutoff; earliest cutoff wins per day.
    NoMeetingsAfter,
    /// Single-day availability override.
    Override,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::Edge => "edge",
            ConstraintKind::Trip => "trip",
            ConstraintKind::WorkingHours => "working_hours",
            ConstraintKind::Buffer => "buffer",
            ConstraintKind::NoMeetingsAfter => "no_meetings_after",
            ConstraintKind::Override => "override",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "edge" => Ok(ConstraintKind::Edge),
            "trip" => Ok(ConstraintKind::Trip),
            "working_hours" => Ok(ConstraintKind::WorkingHours),
            "buffer" => Ok(ConstraintKind::Buffer),
            "no_meetings_after" => Ok(ConstraintKind::NoMeetingsAfter),
            "override" => Ok(ConstraintKind::Override),
            other => Err(EngineError::validation(format!(
                "invalid constraint kind: {:?}",
                other
            ))),
        }
    }
}

/// How much of an event a mirror reveals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailLevel {
    /// Opaque "Busy" block, nothing else.
    Busy,
    /// Real title, no body.
    Title,
    /// Full copy minus provider-internal fields.
    Full,
}

impl DetailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Busy => "BUSY",
            DetailLevel::Title => "TITLE",
            DetailLevel::Full => "FULL",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "BUSY" => Ok(DetailLevel::Busy),
            "TITLE" => Ok(DetailLevel::Title),
            "FULL" => Ok(DetailLevel::Full),
            other => Err(EngineError::validation(format!(
                "invalid detail level: {:?}",
                other
            ))),
        }
    }
}

/// A stored constraint row, config still untyped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub constraint_id: ConstraintId,
    pub kind: ConstraintKind,
    pub config: serde_json::Value,
    pub active_from: Option<DateTime<Utc>>,
    pub active_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Constraint {
    /// Re-validate and type the config. Rows written before schema
    /// tightening may fail here; callers decide whether that is an error
    /// or a skip-with-warning.
    pub fn typed_config(&self) -> EngineResult<ConstraintConfig> {
        ConstraintConfig::from_value(self.kind, &self.config)
    }

    /// Whether the active window overlaps `[start, end)`. Unbounded sides
    /// are open.
    pub fn active_during(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if let Some(from) = self.active_from {
            if from >= end {
                return false;
            }
        }
        if let Some(to) = self.active_to {
            if to <= start {
                return false;
            }
        }
        true
    }
}

/// Config for an `edge` constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub source_account: AccountId,
    pub target_account: AccountId,
    pub target_calendar: CalendarId,
    pub detail_level: DetailLevel,
}

/// Config for a `trip` constraint. Dates are inclusive and date-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripConfig {
    pub destination: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Config for a `working_hours` constraint. Days use ISO numbering
/// (1 = Monday … 7 = Sunday); times are `HH:MM` in the named timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingHoursConfig {
    pub days: Vec<u8>,
    pub start: String,
    pub end: String,
    pub timezone: String,
}

/// Config for a `buffer` constraint, minutes of padding around events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default)]
    pub before_minutes: u32,
    #[serde(default)]
    pub after_minutes: u32,
    /// Optional case-insensitive substring filter on event titles.
    #[serde(default)]
    pub title_contains: Option<String>,
}

/// Config for a `no_meetings_after` constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoMeetingsAfterConfig {
    pub cutoff: String,
    pub timezone: String,
    /// ISO weekdays the cutoff applies to; empty means every day.
    #[serde(default)]
    pub days: Vec<u8>,
}

/// Config for an `override` constraint: force one date free or busy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideConfig {
    pub date: String,
    pub available: bool,
}

/// Typed view over a constraint's `config_json`.
#[derive(Debug, Clone)]
pub enum ConstraintConfig {
    Edge(EdgeConfig),
    Trip(TripConfig),
    WorkingHours(WorkingHoursConfig),
    Buffer(BufferConfig),
    NoMeetingsAfter(NoMeetingsAfterConfig),
    Override(OverrideConfig),
}

impl ConstraintConfig {
    /// Parse and validate a config value against its kind-specific schema.
    pub fn from_value(kind: ConstraintKind, value: &serde_json::Value) -> EngineResult<Self> {
        match kind {
            ConstraintKind::Edge => {
                let config: EdgeConfig = parse_config(value)?;
                if config.is_self_edge() {
                    return Err(EngineError::validation(
                        "edge source and target accounts must differ",
                    ));
                }
                Ok(ConstraintConfig::Edge(config))
            }
            ConstraintKind::Trip => {
                let config: TripConfig = parse_config(value)?;
                let start = parse_date(&config.start_date)?;
                let end = parse_date(&config.end_date)?;
                if start > end {
                    return Err(EngineError::validation(format!(
                        "trip starts after it ends ({} > {})",
                        config.start_date, config.end_date
                    )));
                }
                if let Some(tz) = &config.timezone {
                    validate_timezone(tz)?;
                }
                Ok(ConstraintConfig::Trip(config))
            }
            ConstraintKind::WorkingHours => {
                let config: WorkingHoursConfig = parse_config(value)?;
                validate_days(&config.days)?;
                if config.days.is_empty() {
                    return Err(EngineError::validation(
                        "working_hours requires at least one day",
                    ));
                }
                let start = parse_hhmm(&config.start)?;
                let end = parse_hhmm(&config.end)?;
                if start >= end {
                    return Err(EngineError::validation(format!(
                        "working_hours window is empty ({} >= {})",
                        config.start, config.end
                    )));
                }
                validate_timezone(&config.timezone)?;
                Ok(ConstraintConfig::WorkingHours(config))
            }
            ConstraintKind::Buffer => {
                let config: BufferConfig = parse_config(value)?;
                if config.before_minutes == 0 && config.after_minutes == 0 {
                    return Err(EngineError::validation(
                        "buffer requires before_minutes or after_minutes",
                    ));
                }
                Ok(ConstraintConfig::Buffer(config))
            }
            ConstraintKind::NoMeetingsAfter => {
                let config: NoMeetingsAfterConfig = parse_config(value)?;
                parse_hhmm(&config.cutoff)?;
                validate_days(&config.days)?;
                validate_timezone(&config.timezone)?;
                Ok(ConstraintConfig::NoMeetingsAfter(config))
            }
            ConstraintKind::Override => {
                let config: OverrideConfig = parse_config(value)?;
                parse_date(&config.date)?;
                Ok(ConstraintConfig::Override(config))
            }
        }
    }
}

impl EdgeConfig {
    fn is_self_edge(&self) -> bool {
        self.source_account == self.target_account
    }
}

/// A materialized policy edge: an `edge` constraint with its active window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEdge {
    pub constraint_id: ConstraintId,
    pub source_account: AccountId,
    pub target_account: AccountId,
    pub target_calendar: CalendarId,
    pub detail_level: DetailLevel,
    pub active_from: Option<DateTime<Utc>>,
    pub active_to: Option<DateTime<Utc>>,
}

impl PolicyEdge {
    /// Build from a stored constraint; fails on non-edge kinds or invalid
    /// config.
    pub fn from_constraint(constraint: &Constraint) -> EngineResult<Self> {
        match constraint.typed_config()? {
            ConstraintConfig::Edge(config) => Ok(PolicyEdge {
                constraint_id: constraint.constraint_id.clone(),
                source_account: config.source_account,
                target_account: config.target_account,
                target_calendar: config.target_calendar,
                detail_level: config.detail_level,
                active_from: constraint.active_from,
                active_to: constraint.active_to,
            }),
            _ => Err(EngineError::validation(format!(
                "constraint {} is not an edge",
                constraint.constraint_id
            ))),
        }
    }

    /// Whether this edge selects an event spanning `[start, end)`.
    pub fn selects(&self, source: &AccountId, start: &str, end: &str) -> bool {
        if &self.source_account != source {
            return false;
        }
        let (Ok(start), Ok(end)) = (normalize_time(start), normalize_time(end)) else {
            return false;
        };
        if let Some(from) = self.active_from {
            if from >= end {
                return false;
            }
        }
        if let Some(to) = self.active_to {
            if to <= start {
                return false;
            }
        }
        true
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> EngineResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| EngineError::validation(format!("invalid constraint config: {}", e)))
}

fn parse_date(raw: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| EngineError::validation(format!("invalid date: {:?}", raw)))
}

/// Parse `HH:MM` into minutes since local midnight.
pub fn parse_hhmm(raw: &str) -> EngineResult<u32> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 2 {
        return Err(EngineError::validation(format!(
            "invalid HH:MM time: {:?}",
            raw
        )));
    }
    let hours: u32 = parts[0]
        .parse()
        .map_err(|_| EngineError::validation(format!("invalid HH:MM time: {:?}", raw)))?;
    let minutes: u32 = parts[1]
        .parse()
        .map_err(|_| EngineError::validation(format!("invalid HH:MM time: {:?}", raw)))?;
    if hours > 23 || minutes > 59 {
        return Err(EngineError::validation(format!(
            "invalid HH:MM time: {:?}",
            raw
        )));
    }
    Ok(hours * 60 + minutes)
}

fn validate_days(days: &[u8]) -> EngineResult<()> {
    for day in days {
        if !(1..=7).contains(day) {
            return Err(EngineError::validation(format!(
                "invalid ISO weekday: {} (expected 1-7)",
                day
            )));
        }
    }
    Ok(())
}

fn validate_timezone(tz: &str) -> EngineResult<()> {
    tz.parse::<chrono_tz::Tz>()
        .map(|_| ())
        .map_err(|_| EngineError::validation(format!("invalid IANA timezone: {:?}", tz)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constraint(kind: ConstraintKind, config: serde_json::Value) -> Constraint {
        Constraint {
            constraint_id: ConstraintId::generate(),
            kind,
            config,
            active_from: None,
            active_to: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn edge_config_validates() {
        let c = constraint(
            ConstraintKind::Edge,
            json!({
                "source_account": "acc_google",
                "target_account": "acc_ms",
                "target_calendar": "primary",
                "detail_level": "BUSY"
            }),
        );
        let edge = PolicyEdge::from_constraint(&c).unwrap();
        assert_eq!(edge.detail_level, DetailLevel::Busy);
    }

    #[test]
    fn self_edge_is_rejected() {
        let c = constraint(
            ConstraintKind::Edge,
            json!({
                "source_account": "acc_a",
                "target_account": "acc_a",
                "target_calendar": "primary",
                "detail_level": "BUSY"
            }),
        );
        assert!(c.typed_config().is_err());
    }

    #[test]
    fn working_hours_rejects_bad_timezone() {
        let c = constraint(
            ConstraintKind::WorkingHours,
            json!({
                "days": [1, 2, 3, 4, 5],
                "start": "09:00",
                "end": "17:00",
                "timezone": "Not/AZone"
            }),
        );
        assert!(c.typed_config().is_err());
    }

    #[test]
    fn working_hours_rejects_empty_window() {
        let c = constraint(
            ConstraintKind::WorkingHours,
            json!({
                "days": [1],
                "start": "17:00",
                "end": "09:00",
                "timezone": "America/Los_Angeles"
            }),
        );
        assert!(c.typed_config().is_err());
    }

    #[test]
    fn trip_dates_must_be_ordered() {
        let c = constraint(
            ConstraintKind::Trip,
            json!({
                "destination": "Lisbon",
                "start_date": "2026-03-10",
                "end_date": "2026-03-02"
            }),
        );
        assert!(c.typed_config().is_err());
    }

    #[test]
    fn hhmm_parsing_bounds() {
        assert_eq!(parse_hhmm("09:30").unwrap(), 570);
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("9").is_err());
    }

    #[test]
    fn edge_selection_respects_active_window() {
        let c = Constraint {
            active_from: Some(normalize_time("2026-03-01T00:00:00Z").unwrap()),
            ..constraint(
                ConstraintKind::Edge,
                json!({
                    "source_account": "acc_a",
                    "target_account": "acc_b",
                    "target_calendar": "primary",
                    "detail_level": "TITLE"
                }),
            )
        };
        let edge = PolicyEdge::from_constraint(&c).unwrap();
        let account = AccountId::new("acc_a");
        assert!(!edge.selects(&account, "2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z"));
        assert!(edge.selects(&account, "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z"));
    }
}
