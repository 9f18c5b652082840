//! Per-student attendance cooldown.

use chrono::{Duration, NaiveDateTime};

use crate::format::{parse_timestamp, NEVER};

/// Whether a student may be marked now, and what to tell them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    pub message: String,
}

impl Eligibility {
    fn allow(message: &str) -> Self {
        Self {
            eligible: true,
            message: message.to_string(),
        }
    }

    fn deny(message: String) -> Self {
        Self {
            eligible: false,
            message,
        }
    }
}

/// Decide eligibility from the stored `last_attendance` value.
///
/// A missing field counts as never attended. A value that is neither the
/// sentinel nor a parsable timestamp blocks marking.
pub fn evaluate_eligibility(
    last_attendance: Option<&str>,
    now: NaiveDateTime,
    cooldown: Duration,
) -> Eligibility {
    let raw = match last_attendance.map(str::trim) {
        None | Some(NEVER) | Some("") => return Eligibility::allow("First time attendance"),
        Some(raw) => raw,
    };

    let Some(last) = parse_timestamp(raw) else {
        tracing::warn!(value = raw, "unparsable last_attendance");
        return Eligibility::deny("Check failed".to_string());
    };

    let elapsed = now - last;
    if elapsed >= cooldown {
        return Eligibility::allow("Ready to mark");
    }

    let remaining_hours = (cooldown - elapsed).num_seconds() as f64 / 3600.0;
    Eligibility::deny(format!("Already marked. Wait {remaining_hours:.1} hours"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    #[test]
    fn test_never_is_eligible() {
        let e = evaluate_eligibility(Some("Never"), noon(), Duration::hours(24));
        assert_eq!(e, Eligibility::allow("First time attendance"));
        assert!(evaluate_eligibility(None, noon(), Duration::hours(24)).eligible);
    }

    #[test]
    fn test_within_cooldown_reports_remaining() {
        let e = evaluate_eligibility(Some("2024-09-02 11:00:00"), noon(), Duration::hours(24));
        assert!(!e.eligible);
        assert_eq!(e.message, "Already marked. Wait 23.0 hours");
    }

    #[test]
    fn test_exactly_at_cooldown_is_eligible() {
        let e = evaluate_eligibility(Some("2024-09-01 12:00:00"), noon(), Duration::hours(24));
        assert_eq!(e, Eligibility::allow("Ready to mark"));
    }

    #[test]
    fn test_partial_hours_round_to_one_decimal() {
        // 90 minutes elapsed of a 24h cooldown leaves 22.5h.
        let e = evaluate_eligibility(Some("2024-09-02 10:30:00"), noon(), Duration::hours(24));
        assert_eq!(e.message, "Already marked. Wait 22.5 hours");
    }

    #[test]
    fn test_malformed_timestamp_blocks() {
        let e = evaluate_eligibility(Some("last tuesday"), noon(), Duration::hours(24));
        assert_eq!(e, Eligibility::deny("Check failed".to_string()));
    }
}
