//! Timestamp encoding for SQLite TEXT columns.
//!
//! Every stored instant is UTC with a fixed number of fractional digits, so
//! plain string comparison in SQL (`created_at < ?1`, `ORDER BY`) matches
//! chronological order.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Current time at the precision that survives a round trip through the database.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoding_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let c = a + chrono::Duration::seconds(10);
        let (sa, sb, sc) = (format_ts(&a), format_ts(&b), format_ts(&c));
        assert!(sa < sb && sb < sc);
        assert_eq!(sa, "2024-01-01T09:00:00.000000Z");
        assert_eq!(parse_ts(&sb).unwrap(), b);

        let n = now();
        assert_eq!(parse_ts(&format_ts(&n)).unwrap(), n);
    }
}
