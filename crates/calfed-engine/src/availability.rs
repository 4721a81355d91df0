//! Availability computation.
//!
//! Collects busy intervals from every source the spec names — opaque
//! events, working-hours inversions, trip blocks, daily cutoffs, buffers,
//! and milestone days — merges them, and reads the gaps. The result is
//! deterministic over a store snapshot and gap-free wherever coverage is
//! continuous.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use calfed_core::constraint::{parse_hhmm, Constraint, ConstraintConfig, ConstraintKind};
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::{CanonicalEvent, EventSource, Transparency};
use calfed_core::ids::AccountId;
use calfed_core::interval::{
    all_day_end, free_gaps, merge_busy, normalize_time, BusyInterval, FreeInterval,
};

use crate::constraints;
use crate::events;

/// Merged busy blocks and the gaps between them for one range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub busy: Vec<BusyInterval>,
    pub free: Vec<FreeInterval>,
}

/// Resolve a local wall-clock instant, tolerating DST transitions: an
/// ambiguous time takes the earlier offset and a nonexistent time slides
/// forward an hour.
fn local_instant(tz: Tz, date: NaiveDate, minutes: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_num_seconds_from_midnight_opt(minutes * 60, 0)?;
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            Some(dt.with_timezone(&Utc))
        }
        chrono::LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

fn event_interval(event: &CanonicalEvent) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
    let start = normalize_time(&event.start_ts)?;
    let end = if event.all_day && !event.end_ts.contains('T') {
        // Date-only ends are inclusive: the block covers the end date.
        all_day_end(&event.end_ts)?
    } else {
        normalize_time(&event.end_ts)?
    };
    Ok((start, end))
}

/// Local dates a timezone-aware rule must consider for the range, padded
/// one day on each side for offset spill-over.
fn local_dates(tz: Tz, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> Vec<NaiveDate> {
    let first = range_start.with_timezone(&tz).date_naive() - Duration::days(1);
    let last = range_end.with_timezone(&tz).date_naive() + Duration::days(1);
    let mut dates = Vec::new();
    let mut cursor = first;
    while cursor <= last {
        dates.push(cursor);
        cursor += Duration::days(1);
    }
    dates
}

fn utc_day(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start =
        DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).expect("midnight"), Utc);
    (start, start + Duration::days(1))
}

/// Compute availability for `[range_start, range_end)`, optionally
/// restricted to a set of origin accounts (system-derived blocks always
/// count).
pub fn compute(
    conn: &mut SqliteConnection,
    range_start_raw: &str,
    range_end_raw: &str,
    accounts: Option<&[AccountId]>,
) -> EngineResult<AvailabilityReport> {
    let range_start = normalize_time(range_start_raw)?;
    let range_end = normalize_time(range_end_raw)?;
    if range_start >= range_end {
        return Err(EngineError::validation("availability range is empty"));
    }

    let all_constraints = constraints::list(conn, None)?;
    let mut busy: Vec<BusyInterval> = Vec::new();

    // Dates forced free by an override; rule-derived blocks skip them.
    let mut override_free: HashSet<NaiveDate> = HashSet::new();
    for constraint in &all_constraints {
        if constraint.kind != ConstraintKind::Override {
            continue;
        }
        if let Ok(ConstraintConfig::Override(config)) = constraint.typed_config() {
            if let Ok(date) = NaiveDate::parse_from_str(&config.date, "%Y-%m-%d") {
                if config.available {
                    override_free.insert(date);
                } else {
                    let (day_start, day_end) = utc_day(date);
                    if day_end > range_start && day_start < range_end {
                        busy.push(BusyInterval::new(day_start, day_end, "", "override"));
                    }
                }
            }
        }
    }

    // 1 + 3: opaque events, trip blocks included as system-source rows.
    let mut in_range_events: Vec<(CanonicalEvent, DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    for event in events::list_non_cancelled(conn)? {
        if event.transparency != Transparency::Opaque {
            continue;
        }
        if let Some(filter) = accounts {
            let selected = filter.contains(&event.origin_account_id)
                || event.source == EventSource::System;
            if !selected {
                continue;
            }
        }
        let (start, end) = match event_interval(&event) {
            Ok(bounds) => bounds,
            Err(error) => {
                tracing::warn!(
                    canonical_event_id = %event.canonical_event_id,
                    error = %error,
                    "skipping event with unparseable times"
                );
                continue;
            }
        };
        if end <= range_start || start >= range_end {
            continue;
        }
        let source = if event.source == EventSource::System {
            "trip"
        } else {
            "event"
        };
        busy.push(BusyInterval::new(
            start,
            end,
            event.origin_account_id.as_str(),
            source,
        ));
        in_range_events.push((event, start, end));
    }

    // 2: outside-working-hours blocks. Windows from every working_hours
    // constraint are unioned per day, then complemented over the range.
    let working_hours: Vec<&Constraint> = all_constraints
        .iter()
        .filter(|c| {
            c.kind == ConstraintKind::WorkingHours && c.active_during(range_start, range_end)
        })
        .collect();
    if !working_hours.is_empty() {
        let mut windows: Vec<BusyInterval> = Vec::new();
        for constraint in &working_hours {
            let config = match constraint.typed_config() {
                Ok(ConstraintConfig::WorkingHours(config)) => config,
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(
                        constraint_id = %constraint.constraint_id,
                        error = %error,
                        "skipping working_hours with invalid config"
                    );
                    continue;
                }
            };
            let tz: Tz = config
                .timezone
                .parse()
                .map_err(|_| EngineError::validation("invalid working_hours timezone"))?;
            let open = parse_hhmm(&config.start)?;
            let close = parse_hhmm(&config.end)?;
            for date in local_dates(tz, range_start, range_end) {
                let weekday = date.weekday().number_from_monday() as u8;
                if !config.days.contains(&weekday) {
                    continue;
                }
                if override_free.contains(&date) {
                    continue;
                }
                let (Some(open_at), Some(close_at)) =
                    (local_instant(tz, date, open), local_instant(tz, date, close))
                else {
                    continue;
                };
                if close_at > open_at {
                    windows.push(BusyInterval::new(open_at, close_at, "", "window"));
                }
            }
        }
        let merged_windows = merge_busy(windows);
        for gap in free_gaps(&merged_windows, range_start, range_end) {
            busy.push(BusyInterval::new(gap.start, gap.end, "", "working_hours"));
        }
    }

    // 4: daily cutoffs; the earliest cutoff per day wins via the merge.
    for constraint in &all_constraints {
        if constraint.kind != ConstraintKind::NoMeetingsAfter
            || !constraint.active_during(range_start, range_end)
        {
            continue;
        }
        let config = match constraint.typed_config() {
            Ok(ConstraintConfig::NoMeetingsAfter(config)) => config,
            _ => continue,
        };
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| EngineError::validation("invalid cutoff timezone"))?;
        let cutoff = parse_hhmm(&config.cutoff)?;
        for date in local_dates(tz, range_start, range_end) {
            let weekday = date.weekday().number_from_monday() as u8;
            if !config.days.is_empty() && !config.days.contains(&weekday) {
                continue;
            }
            if override_free.contains(&date) {
                continue;
            }
            let (Some(from), Some(until)) = (
                local_instant(tz, date, cutoff),
                local_instant(tz, date + Duration::days(1), 0),
            ) else {
                continue;
            };
            if until > range_start && from < range_end {
                busy.push(BusyInterval::new(from, until, "", "cutoff"));
            }
        }
    }

    // 5: travel/prep buffers around matching events.
    for constraint in &all_constraints {
        if constraint.kind != ConstraintKind::Buffer
            || !constraint.active_during(range_start, range_end)
        {
            continue;
        }
        let config = match constraint.typed_config() {
            Ok(ConstraintConfig::Buffer(config)) => config,
            _ => continue,
        };
        for (event, start, end) in &in_range_events {
            if event.all_day {
                continue;
            }
            if let Some(needle) = &config.title_contains {
                if !event.title.to_lowercase().contains(&needle.to_lowercase()) {
                    continue;
                }
            }
            if config.before_minutes > 0 {
                busy.push(BusyInterval::new(
                    *start - Duration::minutes(i64::from(config.before_minutes)),
                    *start,
                    event.origin_account_id.as_str(),
                    "buffer",
                ));
            }
            if config.after_minutes > 0 {
                busy.push(BusyInterval::new(
                    *end,
                    *end + Duration::minutes(i64::from(config.after_minutes)),
                    event.origin_account_id.as_str(),
                    "buffer",
                ));
            }
        }
    }

    // 6: milestone day blocks, recurring ones expanded per year.
    let lookahead_days = (range_end - range_start).num_days().max(1) as u32 + 1;
    for upcoming in crate::relationships::upcoming_milestones(conn, lookahead_days, range_start)? {
        if override_free.contains(&upcoming.occurs_on) {
            continue;
        }
        let (day_start, day_end) = utc_day(upcoming.occurs_on);
        if day_end > range_start && day_start < range_end {
            busy.push(BusyInterval::new(day_start, day_end, "", "milestone"));
        }
    }

    // 7: merge, clamp, and read the gaps.
    let mut merged = merge_busy(busy);
    for interval in &mut merged {
        if interval.start < range_start {
            interval.start = range_start;
        }
        if interval.end > range_end {
            interval.end = range_end;
        }
    }
    merged.retain(|i| i.end > i.start);
    let free = free_gaps(&merged, range_start, range_end);

    Ok(AvailabilityReport {
        range_start,
        range_end,
        busy: merged,
        free,
    })
}
