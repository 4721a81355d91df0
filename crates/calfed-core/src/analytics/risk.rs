//! Overcommit risk and probabilistic availability.

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use super::load::DailyLoad;
use super::MeetingSlice;

/// Per-day overcommit risk, 0–100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayRisk {
    pub date: chrono::NaiveDate,
    pub score: u32,
    pub drivers: Vec<String>,
}

/// Busy probability for one weekday/hour bucket, learned from history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotProbability {
    /// ISO weekday, 1 = Monday.
    pub weekday: u8,
    /// Hour of day, UTC.
    pub hour: u8,
    pub samples: u32,
    pub busy_samples: u32,
    pub p_free: f64,
}

/// Derive risk scores from load summaries. Risk leads load: a packed,
/// fragmented day is risky even before anything slips.
pub fn day_risk_scores(loads: &[DailyLoad]) -> Vec<DayRisk> {
    loads
        .iter()
        .map(|load| {
            let mut drivers = Vec::new();
            let mut score = f64::from(load.score) * 0.6;
            if load.meeting_minutes > 360 {
                score += 20.0;
                drivers.push("over six meeting hours".to_string());
            }
            if load.context_switches >= 3 {
                score += 15.0;
                drivers.push("frequent context switching".to_string());
            }
            if load.longest_focus_minutes < 30 && load.meeting_count >= 3 {
                score += 15.0;
                drivers.push("no recovery window".to_string());
            }
            DayRisk {
                date: load.date,
                score: score.clamp(0.0, 100.0).round() as u32,
                drivers,
            }
        })
        .collect()
}

/// Build a weekday/hour busy-probability grid from historical meetings.
/// `weeks_observed` is how many weeks the slice spans; each bucket's
/// sample count is that span, and `p_free` is the unbusy fraction with a
/// +1 smoothing prior so sparse history does not read as certainty.
pub fn slot_probabilities(history: &[MeetingSlice], weeks_observed: u32) -> Vec<SlotProbability> {
    let weeks = weeks_observed.max(1);
    // bucket index: (weekday-1) * 24 + hour
    let mut busy = [0u32; 7 * 24];
    for slice in history {
        let mut cursor = slice.start;
        while cursor < slice.end {
            let weekday = cursor.weekday().number_from_monday() as usize;
            let hour = cursor.hour() as usize;
            busy[(weekday - 1) * 24 + hour] += 1;
            cursor += chrono::Duration::hours(1);
        }
    }

    let mut grid = Vec::with_capacity(7 * 24);
    for weekday in 1u8..=7 {
        for hour in 0u8..24 {
            let busy_samples = busy[(usize::from(weekday) - 1) * 24 + usize::from(hour)].min(weeks);
            let p_free =
                1.0 - (f64::from(busy_samples) + 1.0) / (f64::from(weeks) + 2.0);
            grid.push(SlotProbability {
                weekday,
                hour,
                samples: weeks,
                busy_samples,
                p_free,
            });
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::normalize_time;

    #[test]
    fn risk_grows_with_fragmentation() {
        let calm = DailyLoad {
            date: chrono::NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
            meeting_count: 1,
            meeting_minutes: 60,
            context_switches: 0,
            longest_focus_minutes: 240,
            score: 15,
        };
        let frantic = DailyLoad {
            context_switches: 4,
            meeting_count: 7,
            meeting_minutes: 420,
            longest_focus_minutes: 10,
            score: 85,
            ..calm.clone()
        };
        let scores = day_risk_scores(&[calm, frantic]);
        assert!(scores[1].score > scores[0].score);
        assert!(!scores[1].drivers.is_empty());
    }

    #[test]
    fn recurring_slot_reads_mostly_busy() {
        // Same Monday 14:00 slot busy four weeks running.
        let history: Vec<MeetingSlice> = [
            "2026-01-05", "2026-01-12", "2026-01-19", "2026-01-26",
        ]
        .iter()
        .map(|day| MeetingSlice {
            account: "a".to_string(),
            title: "standup".to_string(),
            start: normalize_time(&format!("{}T14:00:00Z", day)).unwrap(),
            end: normalize_time(&format!("{}T15:00:00Z", day)).unwrap(),
            attendee_count: 5,
        })
        .collect();

        let grid = slot_probabilities(&history, 4);
        let monday_two = grid
            .iter()
            .find(|slot| slot.weekday == 1 && slot.hour == 14)
            .unwrap();
        let monday_six = grid
            .iter()
            .find(|slot| slot.weekday == 1 && slot.hour == 18)
            .unwrap();
        assert!(monday_two.p_free < 0.25);
        assert!(monday_six.p_free > 0.75);
    }
}
