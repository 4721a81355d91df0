//! Cognitive load, context switches, and deep-work extraction.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::MeetingSlice;
use crate::interval::FreeInterval;

/// Gap under which two meetings on different accounts count as a context
/// switch.
const SWITCH_GAP_MINUTES: i64 = 15;

/// Per-day cognitive load summary. `score` is 0–100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLoad {
    pub date: NaiveDate,
    pub meeting_count: u32,
    pub meeting_minutes: i64,
    pub context_switches: u32,
    pub longest_focus_minutes: i64,
    pub score: u32,
}

/// A detected account/topic switch between adjacent meetings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSwitch {
    pub at: DateTime<Utc>,
    pub from_account: String,
    pub to_account: String,
    pub gap_minutes: i64,
}

/// A free window long enough for focused work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepWorkWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub minutes: i64,
}

/// Detect context switches: adjacent meetings on different accounts with a
/// gap under [`SWITCH_GAP_MINUTES`]. Input need not be sorted.
pub fn context_switches(slices: &[MeetingSlice]) -> Vec<ContextSwitch> {
    let mut sorted: Vec<&MeetingSlice> = slices.iter().collect();
    sorted.sort_by(|a, b| a.start.cmp(&b.start));

    let mut switches = Vec::new();
    for pair in sorted.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.account == next.account {
            continue;
        }
        let gap = (next.start - prev.end).num_minutes();
        if (0..SWITCH_GAP_MINUTES).contains(&gap) {
            switches.push(ContextSwitch {
                at: next.start,
                from_account: prev.account.clone(),
                to_account: next.account.clone(),
                gap_minutes: gap,
            });
        }
    }
    switches
}

/// Per-day load: meeting volume, switches, and the longest in-day focus
/// stretch, folded into a 0–100 score. A day with no meetings scores 0.
pub fn daily_cognitive_load(slices: &[MeetingSlice]) -> Vec<DailyLoad> {
    let switches = context_switches(slices);
    let mut by_day: BTreeMap<NaiveDate, Vec<&MeetingSlice>> = BTreeMap::new();
    for slice in slices {
        by_day.entry(slice.start.date_naive()).or_default().push(slice);
    }

    by_day
        .into_iter()
        .map(|(date, mut day_slices)| {
            day_slices.sort_by(|a, b| a.start.cmp(&b.start));
            let meeting_count = day_slices.len() as u32;
            let meeting_minutes: i64 = day_slices.iter().map(|s| s.minutes()).sum();
            let day_switches = switches
                .iter()
                .filter(|s| s.at.date_naive() == date)
                .count() as u32;

            let mut longest_focus = 0i64;
            for pair in day_slices.windows(2) {
                longest_focus = longest_focus.max((pair[1].start - pair[0].end).num_minutes());
            }

            // Volume, fragmentation, and switching each contribute; a
            // long uninterrupted stretch earns credit back.
            let volume = (meeting_minutes as f64 / 480.0 * 50.0).min(50.0);
            let fragmentation = (f64::from(meeting_count) * 4.0).min(25.0);
            let switching = (f64::from(day_switches) * 6.0).min(25.0);
            let focus_credit = (longest_focus as f64 / 120.0 * 10.0).min(10.0);
            let score = (volume + fragmentation + switching - focus_credit)
                .clamp(0.0, 100.0)
                .round() as u32;

            DailyLoad {
                date,
                meeting_count,
                meeting_minutes,
                context_switches: day_switches,
                longest_focus_minutes: longest_focus,
                score,
            }
        })
        .collect()
}

/// Filter free gaps down to deep-work candidates of at least
/// `min_minutes`.
pub fn deep_work_windows(gaps: &[FreeInterval], min_minutes: i64) -> Vec<DeepWorkWindow> {
    gaps.iter()
        .filter(|gap| gap.duration_minutes() >= min_minutes)
        .map(|gap| DeepWorkWindow {
            start: gap.start,
            end: gap.end,
            minutes: gap.duration_minutes(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::normalize_time;

    fn slice(account: &str, start: &str, end: &str) -> MeetingSlice {
        MeetingSlice {
            account: account.to_string(),
            title: "m".to_string(),
            start: normalize_time(start).unwrap(),
            end: normalize_time(end).unwrap(),
            attendee_count: 2,
        }
    }

    #[test]
    fn switch_requires_account_change_and_tight_gap() {
        let slices = vec![
            slice("a", "2026-02-16T10:00:00Z", "2026-02-16T10:30:00Z"),
            slice("b", "2026-02-16T10:35:00Z", "2026-02-16T11:00:00Z"),
            slice("b", "2026-02-16T11:05:00Z", "2026-02-16T11:30:00Z"),
            slice("a", "2026-02-16T13:00:00Z", "2026-02-16T13:30:00Z"),
        ];
        let switches = context_switches(&slices);
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].from_account, "a");
        assert_eq!(switches[0].to_account, "b");
    }

    #[test]
    fn empty_day_scores_zero() {
        assert!(daily_cognitive_load(&[]).is_empty());
    }

    #[test]
    fn heavier_day_scores_higher() {
        let light = daily_cognitive_load(&[slice(
            "a",
            "2026-02-16T10:00:00Z",
            "2026-02-16T10:30:00Z",
        )]);
        let heavy = daily_cognitive_load(&[
            slice("a", "2026-02-16T09:00:00Z", "2026-02-16T10:30:00Z"),
            slice("b", "2026-02-16T10:40:00Z", "2026-02-16T12:00:00Z"),
            slice("a", "2026-02-16T12:05:00Z", "2026-02-16T14:00:00Z"),
            slice("b", "2026-02-16T14:10:00Z", "2026-02-16T16:00:00Z"),
        ]);
        assert!(heavy[0].score > light[0].score);
    }

    #[test]
    fn deep_work_filters_short_gaps() {
        let gaps = vec![
            FreeInterval {
                start: normalize_time("2026-02-16T09:00:00Z").unwrap(),
                end: normalize_time("2026-02-16T09:45:00Z").unwrap(),
            },
            FreeInterval {
                start: normalize_time("2026-02-16T13:00:00Z").unwrap(),
                end: normalize_time("2026-02-16T16:00:00Z").unwrap(),
            },
        ];
        let windows = deep_work_windows(&gaps, 90);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].minutes, 180);
    }
}
