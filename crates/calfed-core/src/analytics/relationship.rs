//! Reputation, drift, and reconnection math over relationship history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a scheduled interaction, recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Honored,
    Rescheduled,
    Cancelled,
    NoShow,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Honored => "honored",
            OutcomeKind::Rescheduled => "rescheduled",
            OutcomeKind::Cancelled => "cancelled",
            OutcomeKind::NoShow => "no_show",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "honored" => Some(OutcomeKind::Honored),
            "rescheduled" => Some(OutcomeKind::Rescheduled),
            "cancelled" => Some(OutcomeKind::Cancelled),
            "no_show" => Some(OutcomeKind::NoShow),
            _ => None,
        }
    }
}

/// Reputation over one participant's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSummary {
    pub honored: u32,
    pub rescheduled: u32,
    pub cancelled: u32,
    pub no_show: u32,
    /// 0–100; 100 = every commitment honored. Neutral 50 with no history.
    pub score: u32,
}

/// Weighted reliability score. Reschedules cost less than cancellations,
/// no-shows cost the most.
pub fn reputation_score(outcomes: &[OutcomeKind]) -> ReputationSummary {
    let mut summary = ReputationSummary {
        honored: 0,
        rescheduled: 0,
        cancelled: 0,
        no_show: 0,
        score: 50,
    };
    for outcome in outcomes {
        match outcome {
            OutcomeKind::Honored => summary.honored += 1,
            OutcomeKind::Rescheduled => summary.rescheduled += 1,
            OutcomeKind::Cancelled => summary.cancelled += 1,
            OutcomeKind::NoShow => summary.no_show += 1,
        }
    }
    let weighted = f64::from(summary.honored)
        + f64::from(summary.rescheduled) * 0.6
        + f64::from(summary.cancelled) * 0.2;
    let total = f64::from(summary.honored)
        + f64::from(summary.rescheduled)
        + f64::from(summary.cancelled)
        + f64::from(summary.no_show);
    if total > 0.0 {
        summary.score = (weighted / total * 100.0).round() as u32;
    }
    summary
}

/// Relationship fields the drift and reconnection math reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipSlice {
    pub relationship_id: String,
    pub display_name: String,
    pub city: Option<String>,
    /// Desired contact cadence; `None` means no expectation.
    pub cadence_days: Option<u32>,
    pub last_interaction_ts: Option<DateTime<Utc>>,
}

/// One overdue relationship in a drift report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEntry {
    pub relationship_id: String,
    pub display_name: String,
    pub days_since_interaction: Option<i64>,
    pub cadence_days: u32,
    pub overdue_days: i64,
}

/// A ranked reconnection candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionSuggestion {
    pub relationship_id: String,
    pub display_name: String,
    pub city: Option<String>,
    pub days_since_interaction: Option<i64>,
    pub reason: String,
}

/// Relationships past their cadence, most overdue first. Relationships
/// without a cadence never drift; ones never contacted count as overdue by
/// their full cadence plus the observation window.
pub fn drift_report(relationships: &[RelationshipSlice], now: DateTime<Utc>) -> Vec<DriftEntry> {
    let mut entries: Vec<DriftEntry> = relationships
        .iter()
        .filter_map(|rel| {
            let cadence = rel.cadence_days?;
            let days_since = rel
                .last_interaction_ts
                .map(|ts| (now - ts).num_days());
            let overdue = match days_since {
                Some(days) => days - i64::from(cadence),
                None => i64::from(cadence),
            };
            (overdue > 0).then(|| DriftEntry {
                relationship_id: rel.relationship_id.clone(),
                display_name: rel.display_name.clone(),
                days_since_interaction: days_since,
                cadence_days: cadence,
                overdue_days: overdue,
            })
        })
        .collect();
    entries.sort_by(|a, b| b.overdue_days.cmp(&a.overdue_days));
    entries
}

/// Rank reconnection candidates, optionally biased to a city (e.g. an
/// upcoming trip destination). City matches rank first, then staleness.
pub fn rank_reconnections(
    relationships: &[RelationshipSlice],
    city: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<ReconnectionSuggestion> {
    let mut suggestions: Vec<(bool, i64, ReconnectionSuggestion)> = relationships
        .iter()
        .map(|rel| {
            let days_since = rel.last_interaction_ts.map(|ts| (now - ts).num_days());
            let staleness = days_since.unwrap_or(i64::MAX);
            let city_match = match (city, rel.city.as_deref()) {
                (Some(wanted), Some(have)) => wanted.eq_ignore_ascii_case(have),
                _ => false,
            };
            let reason = if city_match {
                format!("lives in {}", rel.city.clone().unwrap_or_default())
            } else {
                match days_since {
                    Some(days) => format!("no contact in {} days", days),
                    None => "never connected".to_string(),
                }
            };
            (
                city_match,
                staleness,
                ReconnectionSuggestion {
                    relationship_id: rel.relationship_id.clone(),
                    display_name: rel.display_name.clone(),
                    city: rel.city.clone(),
                    days_since_interaction: days_since,
                    reason,
                },
            )
        })
        .collect();

    suggestions.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    suggestions.into_iter().map(|(_, _, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn reputation_weights_outcomes() {
        let good = reputation_score(&[OutcomeKind::Honored, OutcomeKind::Honored]);
        assert_eq!(good.score, 100);
        let flaky = reputation_score(&[
            OutcomeKind::Honored,
            OutcomeKind::Cancelled,
            OutcomeKind::NoShow,
        ]);
        assert!(flaky.score < good.score);
        assert_eq!(reputation_score(&[]).score, 50);
    }

    fn rel(id: &str, city: Option<&str>, cadence: Option<u32>, days_ago: Option<i64>) -> RelationshipSlice {
        RelationshipSlice {
            relationship_id: id.to_string(),
            display_name: id.to_string(),
            city: city.map(str::to_string),
            cadence_days: cadence,
            last_interaction_ts: days_ago.map(|d| Utc::now() - Duration::days(d)),
        }
    }

    #[test]
    fn drift_orders_by_overdue() {
        let now = Utc::now();
        let report = drift_report(
            &[
                rel("fresh", None, Some(30), Some(5)),
                rel("stale", None, Some(30), Some(90)),
                rel("very_stale", None, Some(14), Some(100)),
                rel("no_cadence", None, None, Some(400)),
            ],
            now,
        );
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].relationship_id, "very_stale");
        assert_eq!(report[1].relationship_id, "stale");
    }

    #[test]
    fn reconnections_prefer_city_match() {
        let now = Utc::now();
        let ranked = rank_reconnections(
            &[
                rel("far_stale", Some("Berlin"), None, Some(200)),
                rel("local", Some("Lisbon"), None, Some(10)),
            ],
            Some("lisbon"),
            now,
        );
        assert_eq!(ranked[0].relationship_id, "local");
        assert!(ranked[0].reason.contains("Lisbon"));
    }
}
