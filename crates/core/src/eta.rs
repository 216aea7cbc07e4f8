//! ETA parsing in a fixed, configured timezone.
//!
//! ETAs arrive as wall-clock strings (`YYYY-MM-DD HH:MM:SS`) with no offset.
//! They are always interpreted in the configured timezone, never the host's
//! local zone, and resolved to an absolute UTC instant.

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::error::DomainError;

/// Wall-clock format of ETA values.
pub const ETA_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timezone used when none is configured.
pub const DEFAULT_TIMEZONE: &str = "Asia/Jakarta";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EtaError {
    #[error("malformed ETA {input:?}: expected YYYY-MM-DD HH:MM:SS")]
    Malformed { input: String },

    /// The wall-clock time falls into a DST gap of the zone.
    #[error("ETA {input:?} does not exist in {tz}")]
    Nonexistent { input: String, tz: Tz },
}

/// Resolve an ETA string to an absolute instant.
///
/// A wall-clock time that occurs twice (DST fall-back) resolves to the earlier
/// of the two instants.
pub fn parse_eta(input: &str, tz: Tz) -> Result<DateTime<Utc>, EtaError> {
    let trimmed = input.trim();
    let naive = NaiveDateTime::parse_from_str(trimmed, ETA_FORMAT).map_err(|_| {
        EtaError::Malformed {
            input: input.to_string(),
        }
    })?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => Ok(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(EtaError::Nonexistent {
            input: trimmed.to_string(),
            tz,
        }),
    }
}

/// Render an instant as an ETA string in `tz`.
pub fn format_eta(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format(ETA_FORMAT).to_string()
}

/// Parse an IANA timezone name (e.g. `Asia/Jakarta`).
pub fn parse_timezone(name: &str) -> Result<Tz, DomainError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| DomainError::validation(format!("unknown timezone {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn wall_clock_is_read_in_the_configured_zone() {
        let at = parse_eta("2024-08-05 10:30:00", chrono_tz::Asia::Jakarta).unwrap();
        assert_eq!(at, utc(2024, 8, 5, 3, 30, 0));

        let at = parse_eta("2024-08-05 10:30:00", chrono_tz::UTC).unwrap();
        assert_eq!(at, utc(2024, 8, 5, 10, 30, 0));
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let at = parse_eta("  2024-08-05 10:30:00\n", chrono_tz::UTC).unwrap();
        assert_eq!(at, utc(2024, 8, 5, 10, 30, 0));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for bad in ["", "tomorrow", "2024-08-05", "2024-08-05T10:30:00", "2024-13-01 00:00:00"] {
            let err = parse_eta(bad, chrono_tz::UTC).unwrap_err();
            assert!(matches!(err, EtaError::Malformed { .. }), "{bad:?} -> {err:?}");
        }
    }

    #[test]
    fn dst_gap_is_an_error() {
        let err = parse_eta("2024-03-10 02:30:00", chrono_tz::America::New_York).unwrap_err();
        assert!(matches!(err, EtaError::Nonexistent { .. }));
    }

    #[test]
    fn dst_overlap_picks_the_earlier_instant() {
        // 01:30 happens first in EDT (UTC-4), then again in EST (UTC-5).
        let at = parse_eta("2024-11-03 01:30:00", chrono_tz::America::New_York).unwrap();
        assert_eq!(at, utc(2024, 11, 3, 5, 30, 0));
    }

    #[test]
    fn format_is_the_inverse_of_parse() {
        let tz = chrono_tz::Asia::Jakarta;
        let at = parse_eta("2024-08-05 10:05:00", tz).unwrap();
        assert_eq!(format_eta(at, tz), "2024-08-05 10:05:00");
    }

    #[test]
    fn timezone_names() {
        assert_eq!(parse_timezone("Asia/Jakarta").unwrap(), chrono_tz::Asia::Jakarta);
        assert_eq!(parse_timezone(DEFAULT_TIMEZONE).unwrap(), chrono_tz::Asia::Jakarta);
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}
