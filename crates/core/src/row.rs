//! Ingestion boundary: row-records -> jobs.
//!
//! Rows are plain string maps produced by whatever reads the tabular input.
//! Mapping is pure: problems with reserved columns are returned as warnings
//! and the job proceeds with a fallback value.

use std::collections::BTreeMap;
use std::fmt;

use chrono_tz::Tz;

use crate::eta::{parse_eta, EtaError};
use crate::job::{FieldMap, Job, DEFAULT_MAX_ATTEMPTS};
use crate::priority::Priority;

/// One input row: column name -> cell value.
pub type RowRecord = BTreeMap<String, String>;

/// Reserved column holding the ETA.
pub const ETA_KEY: &str = "eta";
/// Reserved column holding the priority.
pub const PRIORITY_KEY: &str = "priority";
/// Optional reserved column overriding the row number.
pub const ROW_ID_KEY: &str = "row_id";

/// Settings applied to every ingested row. Defaults to `Asia/Jakarta`.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub timezone: Tz,
    pub max_attempts: u32,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Jakarta,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// A recoverable problem found while mapping a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestWarning {
    /// Priority value not understood; `normal` used instead
    InvalidPriority { value: String },
    /// ETA unusable; the job is dispatched immediately
    InvalidEta(EtaError),
    /// `row_id` column is not a positive integer; positional row number used
    InvalidRowId { value: String },
}

impl fmt::Display for IngestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestWarning::InvalidPriority { value } => {
                write!(f, "unknown priority {value:?}, using normal")
            }
            IngestWarning::InvalidEta(err) => write!(f, "{err}, dispatching immediately"),
            IngestWarning::InvalidRowId { value } => {
                write!(f, "row_id {value:?} is not a positive integer")
            }
        }
    }
}

/// Result of mapping one row.
#[derive(Debug, Clone)]
pub struct IngestedRow {
    pub job: Job,
    pub warnings: Vec<IngestWarning>,
}

impl Job {
    /// Map one row to a job.
    ///
    /// `position` is the 1-based position of the row in its source. Reserved
    /// columns are consumed; every other non-blank cell becomes a field.
    pub fn from_row(position: u64, record: &RowRecord, options: &IngestOptions) -> IngestedRow {
        let mut warnings = Vec::new();

        let fields: FieldMap = record
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let row = match reserved(record, ROW_ID_KEY) {
            None => position,
            Some(raw) => match raw.parse::<u64>() {
                Ok(id) if id > 0 => id,
                _ => {
                    warnings.push(IngestWarning::InvalidRowId {
                        value: raw.to_string(),
                    });
                    position
                }
            },
        };

        let (priority, rejected) = Priority::parse_lenient(reserved(record, PRIORITY_KEY));
        if let Some(value) = rejected {
            warnings.push(IngestWarning::InvalidPriority { value });
        }

        let mut job = Job::new(fields)
            .with_row(row)
            .with_priority(priority)
            .with_max_attempts(options.max_attempts);

        if let Some(raw) = reserved(record, ETA_KEY) {
            match parse_eta(raw, options.timezone) {
                Ok(_) => job.eta = Some(raw.to_string()),
                Err(err) => warnings.push(IngestWarning::InvalidEta(err)),
            }
        }

        IngestedRow { job, warnings }
    }
}

/// Map a sequence of rows, numbering them from 1 in input order.
pub fn ingest_rows<I>(rows: I, options: &IngestOptions) -> Vec<IngestedRow>
where
    I: IntoIterator<Item = RowRecord>,
{
    rows.into_iter()
        .enumerate()
        .map(|(i, record)| Job::from_row(i as u64 + 1, &record, options))
        .collect()
}

fn is_reserved(key: &str) -> bool {
    key.eq_ignore_ascii_case(ETA_KEY)
        || key.eq_ignore_ascii_case(PRIORITY_KEY)
        || key.eq_ignore_ascii_case(ROW_ID_KEY)
}

/// Value of a reserved column (matched case-insensitively), if non-blank.
fn reserved<'a>(record: &'a RowRecord, key: &str) -> Option<&'a str> {
    record
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> RowRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn options() -> IngestOptions {
        IngestOptions {
            timezone: chrono_tz::Asia::Jakarta,
            max_attempts: 5,
        }
    }

    #[test]
    fn reserved_columns_are_split_from_fields() {
        let row = record(&[
            ("entry.1", "Option 1"),
            ("entry.2", "Test User"),
            ("eta", "2024-08-05 10:00:00"),
            ("priority", "HIGH"),
        ]);

        let IngestedRow { job, warnings } = Job::from_row(1, &row, &options());

        assert!(warnings.is_empty());
        assert_eq!(job.fields.len(), 2);
        assert_eq!(job.fields["entry.2"], "Test User");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.eta.as_deref(), Some("2024-08-05 10:00:00"));
        assert_eq!(job.row, Some(1));
        assert_eq!(job.max_attempts, 5);
    }

    #[test]
    fn blank_cells_are_dropped() {
        let row = record(&[("entry.1", "  "), ("entry.2", "x"), ("eta", ""), ("priority", "")]);
        let IngestedRow { job, warnings } = Job::from_row(3, &row, &options());

        assert!(warnings.is_empty());
        assert_eq!(job.fields.keys().collect::<Vec<_>>(), vec!["entry.2"]);
        assert!(job.eta.is_none());
        assert_eq!(job.priority, Priority::Normal);
    }

    #[test]
    fn invalid_priority_falls_back_with_warning() {
        let row = record(&[("entry.1", "a"), ("priority", "urgent")]);
        let IngestedRow { job, warnings } = Job::from_row(1, &row, &options());

        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(
            warnings,
            vec![IngestWarning::InvalidPriority {
                value: "urgent".to_string()
            }]
        );
    }

    #[test]
    fn invalid_eta_makes_the_job_immediate() {
        let row = record(&[("entry.1", "a"), ("eta", "next tuesday")]);
        let IngestedRow { job, warnings } = Job::from_row(1, &row, &options());

        assert!(job.eta.is_none());
        assert!(matches!(warnings[..], [IngestWarning::InvalidEta(EtaError::Malformed { .. })]));
    }

    #[test]
    fn explicit_row_id_wins_over_position() {
        let row = record(&[("entry.1", "a"), ("row_id", "42")]);
        assert_eq!(Job::from_row(1, &row, &options()).job.row, Some(42));

        let row = record(&[("entry.1", "a"), ("row_id", "zero")]);
        let ingested = Job::from_row(9, &row, &options());
        assert_eq!(ingested.job.row, Some(9));
        assert_eq!(ingested.warnings.len(), 1);
    }

    #[test]
    fn rows_are_numbered_in_input_order() {
        let rows = vec![
            record(&[("entry.1", "a")]),
            record(&[("entry.1", "b")]),
            record(&[("entry.1", "c")]),
        ];
        let jobs = ingest_rows(rows, &options());
        let numbers: Vec<_> = jobs.iter().map(|r| r.job.row).collect();
        assert_eq!(numbers, vec![Some(1), Some(2), Some(3)]);
    }
}
