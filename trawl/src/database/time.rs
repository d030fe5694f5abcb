//! Timestamp helpers shared by the persistence layer.
//!
//! All timestamps are stored as RFC 3339 UTC strings and all date-only
//! fields as `YYYY-MM-DD` strings, so that SQL string comparison orders
//! them chronologically.

use chrono::{DateTime, NaiveDate, Utc};

/// Current instant as an RFC 3339 UTC string.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Format a date as the canonical `YYYY-MM-DD` storage form.
pub fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a stored `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_round_trip() {
        let d = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        assert_eq!(date_str(d), "2025-07-01");
        assert_eq!(parse_date("2025-07-01"), Some(d));
    }

    #[test]
    fn test_rfc3339_ordering_is_lexicographic() {
        let earlier = "2025-07-01T00:00:00+00:00";
        let later = "2025-07-02T00:00:00+00:00";
        assert!(earlier < later);
        assert!(parse_rfc3339(earlier).unwrap() < parse_rfc3339(later).unwrap());
    }
}
