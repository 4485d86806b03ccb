use std::sync::OnceLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use regex::Regex;

use crate::models::{AlternativeSlot, ClinicHours};
use crate::services::calendar::CalendarStore;

pub const MAX_ALTERNATIVES: usize = 3;

fn twelve_hour_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*([AP])\.?\s*M\.?$").expect("valid 12-hour regex")
    })
}

fn twenty_four_hour_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("valid 24-hour regex"))
}

fn ordinal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})(st|nd|rd|th)\b").expect("valid ordinal regex"))
}

/// Parses `"H[:MM] AM/PM"` or 24-hour `"HH:MM"`.
pub fn normalize_time(raw: &str) -> Option<NaiveTime> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if cleaned.is_empty() {
        return None;
    }

    if let Some(caps) = twelve_hour_re().captures(&cleaned) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
        if !(1..=12).contains(&hour) {
            return None;
        }
        let hour = match (&caps[3], hour) {
            ("A", 12) => 0,
            ("A", h) => h,
            ("P", 12) => 12,
            (_, h) => h + 12,
        };
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    let caps = twenty_four_hour_re().captures(&cleaned)?;
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Canonical `HH:MM` form of a free-form time, if it parses.
pub fn to_24h(raw: &str) -> Option<String> {
    normalize_time(raw).map(|t| t.format("%H:%M").to_string())
}

/// Parses canonical and common natural date forms relative to `today`.
pub fn normalize_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lowered = raw.trim().trim_end_matches('.').to_lowercase();
    let text = ordinal_re().replace_all(&lowered, "$1").to_string();
    let text = text.trim();

    match text {
        "" => return None,
        "today" => return Some(today),
        "tomorrow" => return today.succ_opt(),
        "day after tomorrow" | "the day after tomorrow" => {
            return today.checked_add_signed(Duration::days(2))
        }
        _ => {}
    }

    let weekday_name = text
        .strip_prefix("next ")
        .or_else(|| text.strip_prefix("this "))
        .or_else(|| text.strip_prefix("on "))
        .unwrap_or(text);
    if let Ok(weekday) = weekday_name.parse::<Weekday>() {
        return Some(next_weekday(today, weekday));
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%B %d, %Y", "%B %d %Y", "%b %d, %Y", "%b %d %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date);
        }
    }

    let with_year = format!("{} {}", text.trim_end_matches(','), today.year());
    for fmt in ["%B %d %Y", "%b %d %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&with_year, fmt) {
            return Some(date);
        }
    }

    None
}

/// First date strictly after `today` that falls on `weekday`.
fn next_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let current = today.weekday().num_days_from_monday() as i64;
    let target = weekday.num_days_from_monday() as i64;
    let mut ahead = (target - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    today + Duration::days(ahead)
}

pub fn canonical_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `November 1`
pub fn long_date(date: NaiveDate) -> String {
    date.format("%B %-d").to_string()
}

/// `2:00 PM`
pub fn twelve_hour(time: NaiveTime) -> String {
    time.format("%-I:%M %p").to_string()
}

pub fn weekday_name(date: NaiveDate) -> String {
    date.format("%A").to_string()
}

/// Open slots to offer when the requested one is taken.
///
/// Scans the requested day in clinic-hour steps. If that day has nothing
/// free, the following day is probed once and its first open slot is
/// returned, tagged with its own date.
pub fn alternative_slots(
    calendar: &dyn CalendarStore,
    hours: &ClinicHours,
    date: NaiveDate,
) -> Vec<AlternativeSlot> {
    let booked = booked_times(calendar, date);
    let same_day: Vec<AlternativeSlot> = hours
        .slots()
        .into_iter()
        .filter(|slot| !booked.contains(slot))
        .take(MAX_ALTERNATIVES)
        .map(|slot| AlternativeSlot {
            time: slot.format("%H:%M").to_string(),
            formatted: twelve_hour(slot),
            date: None,
            formatted_date: None,
        })
        .collect();

    if !same_day.is_empty() {
        return same_day;
    }

    let Some(next_day) = date.succ_opt() else {
        return Vec::new();
    };
    let next_booked = booked_times(calendar, next_day);
    hours
        .slots()
        .into_iter()
        .find(|slot| !next_booked.contains(slot))
        .map(|slot| AlternativeSlot {
            time: slot.format("%H:%M").to_string(),
            formatted: twelve_hour(slot),
            date: Some(canonical_date(next_day)),
            formatted_date: Some(long_date(next_day)),
        })
        .into_iter()
        .collect()
}

fn booked_times(calendar: &dyn CalendarStore, date: NaiveDate) -> Vec<NaiveTime> {
    calendar
        .list_appointments(Some(date))
        .into_iter()
        .map(|apt| apt.time)
        .collect()
}
