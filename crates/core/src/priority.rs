//! Job priority classes.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Priority class of a job.
///
/// The derived ordering is the drain order: `High < Normal < Low`, so sorting
/// ascending puts the work that must be delivered first at the front.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All classes in drain order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Position in [`Priority::ALL`]; handy for per-class arrays.
    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Parse a user-supplied value, falling back to `Normal`.
    ///
    /// Returns the parsed priority and, when the input was present but not
    /// understood, the rejected value so the caller can warn about it.
    pub fn parse_lenient(input: Option<&str>) -> (Priority, Option<String>) {
        match input.map(str::trim).filter(|s| !s.is_empty()) {
            None => (Priority::Normal, None),
            Some(raw) => match raw.parse() {
                Ok(p) => (p, None),
                Err(_) => (Priority::Normal, Some(raw.to_string())),
            },
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(DomainError::validation(format!(
                "unknown priority {other:?} (expected high, normal or low)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" Low ".parse::<Priority>().unwrap(), Priority::Low);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Normal);
    }

    #[test]
    fn lenient_parse_defaults_to_normal() {
        assert_eq!(Priority::parse_lenient(None), (Priority::Normal, None));
        assert_eq!(Priority::parse_lenient(Some("  ")), (Priority::Normal, None));
        assert_eq!(
            Priority::parse_lenient(Some("urgent")),
            (Priority::Normal, Some("urgent".to_string()))
        );
        assert_eq!(Priority::parse_lenient(Some("High")), (Priority::High, None));
    }

    #[test]
    fn ordering_matches_drain_order() {
        let mut ps = vec![Priority::Low, Priority::High, Priority::Normal];
        ps.sort();
        assert_eq!(ps, Priority::ALL.to_vec());
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }
}
