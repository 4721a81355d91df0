//! Busy-interval merge and gap computation.
//!
//! Availability is computed by collecting busy intervals from several
//! sources (events, working-hours inversions, trips, cutoffs, buffers,
//! milestones), merging them with a left-to-right sweep, and reading the
//! gaps. Adjacent intervals count as overlapping so the merged set is
//! gap-free wherever coverage is continuous.
//!
//! Date-only values (`YYYY-MM-DD`) are expanded to UTC midnight before any
//! comparison so all-day and timed entries sort coherently.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Parse an ISO-8601 event time. Accepts RFC 3339 datetimes and date-only
/// values, which expand to `00:00:00Z` on that date.
pub fn normalize_time(raw: &str) -> EngineResult<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| EngineError::validation(format!("invalid date: {:?}", raw)))?;
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EngineError::validation(format!("invalid timestamp: {:?}", raw)))
}

/// Exclusive end for a date-only value: midnight of the following day.
pub fn all_day_end(raw: &str) -> EngineResult<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| EngineError::validation(format!("invalid date: {:?}", raw)))?;
    let next = date
        .succ_opt()
        .ok_or_else(|| EngineError::validation(format!("date out of range: {:?}", raw)))?;
    Ok(DateTime::from_naive_utc_and_offset(
        next.and_hms_opt(0, 0, 0).expect("midnight is valid"),
        Utc,
    ))
}

/// One merged busy block. `accounts` unions every contributor; `sources`
/// records which availability rule produced the block (event, working_hours,
/// trip, cutoff, buffer, milestone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub accounts: BTreeSet<String>,
    pub sources: BTreeSet<String>,
}

impl BusyInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, account: &str, source: &str) -> Self {
        let mut accounts = BTreeSet::new();
        if !account.is_empty() {
            accounts.insert(account.to_string());
        }
        let mut sources = BTreeSet::new();
        sources.insert(source.to_string());
        Self {
            start,
            end,
            accounts,
            sources,
        }
    }
}

/// A free window between merged busy blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FreeInterval {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Merge busy intervals: sort by start, sweep left to right, extend the
/// current block while `next.start <= current.end` (adjacency counts as
/// overlap), unioning contributor sets. O(n log n) in the input size, and
/// idempotent: `merge_busy(merge_busy(i)) == merge_busy(i)`.
pub fn merge_busy(mut intervals: Vec<BusyInterval>) -> Vec<BusyInterval> {
    intervals.retain(|i| i.end >= i.start);
    intervals.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));

    let mut merged: Vec<BusyInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(current) if interval.start <= current.end => {
                if interval.end > current.end {
                    current.end = interval.end;
                }
                current.accounts.extend(interval.accounts);
                current.sources.extend(interval.sources);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Gaps of a merged interval set inside `[range_start, range_end)`.
/// Input must already be merged; zero-width gaps are dropped.
pub fn free_gaps(
    merged: &[BusyInterval],
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Vec<FreeInterval> {
    let mut gaps = Vec::new();
    let mut cursor = range_start;
    for interval in merged {
        if interval.end <= cursor {
            continue;
        }
        if interval.start >= range_end {
            break;
        }
        if interval.start > cursor {
            gaps.push(FreeInterval {
                start: cursor,
                end: interval.start.min(range_end),
            });
        }
        cursor = cursor.max(interval.end);
        if cursor >= range_end {
            return gaps;
        }
    }
    if cursor < range_end {
        gaps.push(FreeInterval {
            start: cursor,
            end: range_end,
        });
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> DateTime<Utc> {
        normalize_time(raw).unwrap()
    }

    fn busy(start: &str, end: &str, account: &str) -> BusyInterval {
        BusyInterval::new(ts(start), ts(end), account, "event")
    }

    #[test]
    fn date_only_expands_to_utc_midnight() {
        assert_eq!(ts("2026-02-16"), ts("2026-02-16T00:00:00Z"));
    }

    #[test]
    fn date_only_and_datetime_sort_coherently() {
        let mut points = vec![
            ts("2026-02-16T00:00:00Z"),
            ts("2026-02-15"),
            ts("2026-02-16"),
        ];
        points.sort();
        assert_eq!(points[0], ts("2026-02-15"));
        assert_eq!(points[1], points[2]);
    }

    #[test]
    fn merge_extends_on_adjacency() {
        let merged = merge_busy(vec![
            busy("2026-02-16T10:00:00Z", "2026-02-16T11:00:00Z", "a"),
            busy("2026-02-16T11:00:00Z", "2026-02-16T12:00:00Z", "b"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, ts("2026-02-16T10:00:00Z"));
        assert_eq!(merged[0].end, ts("2026-02-16T12:00:00Z"));
        assert_eq!(merged[0].accounts.len(), 2);
    }

    #[test]
    fn merge_keeps_disjoint_blocks() {
        let merged = merge_busy(vec![
            busy("2026-02-16T10:00:00Z", "2026-02-16T11:00:00Z", "a"),
            busy("2026-02-16T12:00:00Z", "2026-02-16T13:00:00Z", "a"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let input = vec![
            busy("2026-02-16T09:00:00Z", "2026-02-16T10:30:00Z", "a"),
            busy("2026-02-16T10:00:00Z", "2026-02-16T11:00:00Z", "b"),
            busy("2026-02-16T14:00:00Z", "2026-02-16T15:00:00Z", "a"),
        ];
        let once = merge_busy(input);
        let twice = merge_busy(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn gaps_cover_range_edges() {
        let merged = merge_busy(vec![busy(
            "2026-02-16T10:00:00Z",
            "2026-02-16T11:00:00Z",
            "a",
        )]);
        let gaps = free_gaps(&merged, ts("2026-02-16T08:00:00Z"), ts("2026-02-16T12:00:00Z"));
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].start, ts("2026-02-16T08:00:00Z"));
        assert_eq!(gaps[0].end, ts("2026-02-16T10:00:00Z"));
        assert_eq!(gaps[1].start, ts("2026-02-16T11:00:00Z"));
        assert_eq!(gaps[1].end, ts("2026-02-16T12:00:00Z"));
    }

    #[test]
    fn full_coverage_yields_no_gaps() {
        let merged = merge_busy(vec![busy("2026-02-16", "2026-02-17", "a")]);
        let gaps = free_gaps(&merged, ts("2026-02-16T00:00:00Z"), ts("2026-02-17T00:00:00Z"));
        assert!(gaps.is_empty());
    }
}
