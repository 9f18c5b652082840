//! Timestamp and display-string helpers shared by the registry and engine.

use chrono::{Datelike, NaiveDateTime};

/// Sentinel stored in `last_attendance` before the first marked attendance.
pub const NEVER: &str = "Never";

/// `last_attendance` format.
pub const ATTENDANCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// `registration_date` format (ISO 8601, microsecond precision).
pub const REGISTRATION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
/// Display format for registration dates.
pub const DISPLAY_DATE_FORMAT: &str = "%d/%m/%Y";

pub fn format_attendance(at: NaiveDateTime) -> String {
    at.format(ATTENDANCE_FORMAT).to_string()
}

pub fn format_registration(at: NaiveDateTime) -> String {
    at.format(REGISTRATION_FORMAT).to_string()
}

/// Parse either stored timestamp form, with or without fractional seconds.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Coarse "N units ago" rendering of a stored timestamp.
///
/// Missing, sentinel, or unparsable values render as "Never"; timestamps in
/// the future count as "0 seconds ago".
pub fn relative_time(raw: Option<&str>, now: NaiveDateTime) -> String {
    let Some(then) = raw.filter(|r| *r != NEVER).and_then(parse_timestamp) else {
        return NEVER.to_string();
    };

    let secs = (now - then).num_seconds().max(0);
    let (count, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else if secs < 30 * 86_400 {
        (secs / 86_400, "day")
    } else {
        let months = months_between(then, now);
        if months < 12 {
            (months.max(1), "month")
        } else {
            (months / 12, "year")
        }
    };
    let plural = if count == 1 { "" } else { "s" };
    format!("{count} {unit}{plural} ago")
}

fn months_between(then: NaiveDateTime, now: NaiveDateTime) -> i64 {
    let mut months = (now.year() - then.year()) as i64 * 12 + now.month() as i64 - then.month() as i64;
    if (now.day(), now.time()) < (then.day(), then.time()) {
        months -= 1;
    }
    months.max(0)
}

/// Upper-case the first letter of every word, lower-case the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

/// Upper-case the first character, lower-case the rest.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_both_forms() {
        let t = at(2024, 3, 1, 9);
        assert_eq!(parse_timestamp(&format_attendance(t)), Some(t));
        assert_eq!(parse_timestamp(&format_registration(t)), Some(t));
        assert_eq!(parse_timestamp("2024-03-01T09:00:00"), Some(t));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_relative_time_units() {
        let now = at(2024, 6, 15, 12);
        let ago = |then: NaiveDateTime| relative_time(Some(&format_attendance(then)), now);
        assert_eq!(ago(now), "0 seconds ago");
        assert_eq!(ago(now - chrono::Duration::seconds(1)), "1 second ago");
        assert_eq!(ago(now - chrono::Duration::minutes(5)), "5 minutes ago");
        assert_eq!(ago(at(2024, 6, 15, 11)), "1 hour ago");
        assert_eq!(ago(at(2024, 6, 12, 12)), "3 days ago");
        assert_eq!(ago(at(2024, 4, 15, 12)), "2 months ago");
        assert_eq!(ago(at(2022, 6, 1, 12)), "2 years ago");
    }

    #[test]
    fn test_relative_time_never() {
        let now = at(2024, 6, 15, 12);
        assert_eq!(relative_time(None, now), "Never");
        assert_eq!(relative_time(Some("Never"), now), "Never");
        assert_eq!(relative_time(Some("garbage"), now), "Never");
    }

    #[test]
    fn test_relative_time_future_clamps() {
        let now = at(2024, 6, 15, 12);
        assert_eq!(relative_time(Some("2024-06-16 12:00:00"), now), "0 seconds ago");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("ada lovelace"), "Ada Lovelace");
        assert_eq!(title_case("COMPUTER science"), "Computer Science");
        assert_eq!(title_case("o'brien-smith"), "O'Brien-Smith");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("ada LOVELACE"), "Ada lovelace");
        assert_eq!(capitalize(""), "");
    }
}
