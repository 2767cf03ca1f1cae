use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use lims_templates::validation::is_valid_prefix;

use crate::CoreError;

/// Default number of zero-padded digits in an EUID sequence
pub const DEFAULT_SEQUENCE_WIDTH: usize = 7;

/// Widest sequence that still fits in a `u64`
pub const MAX_SEQUENCE_WIDTH: usize = 19;

/// External Unique ID, `{PREFIX}-{zero padded sequence}`, e.g. `CON-0000001`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Euid(pub String);

impl Euid {
    /// Format an allocated counter value.
    ///
    /// Values that no longer fit in `width` digits mean the counter is
    /// exhausted and are reported as an allocation error.
    pub fn format(prefix: &str, value: u64, width: usize) -> Result<Self, CoreError> {
        let max = max_sequence(width)?;
        if value > max {
            return Err(CoreError::AllocationError(format!(
                "Sequence for prefix '{}' exhausted: {} exceeds {} ({} digits)",
                prefix, value, max, width
            )));
        }
        Ok(Euid(format!("{}-{:0width$}", prefix, value, width = width)))
    }

    /// Parse and check the `{PREFIX}-{digits}` shape
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::ValidationError {
            field: "euid".to_string(),
            reason: format!("'{}' {}", s, reason),
        };

        let (prefix, digits) = s.split_once('-').ok_or_else(|| invalid("has no '-' separator"))?;
        if !is_valid_prefix(prefix) {
            return Err(invalid("has an invalid prefix"));
        }
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("has a non-numeric sequence"));
        }
        if digits.parse::<u64>().is_err() {
            return Err(invalid("has a sequence out of range"));
        }
        Ok(Euid(s.to_string()))
    }

    /// The string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix part, e.g. `CON`
    pub fn prefix(&self) -> &str {
        self.0.split_once('-').map(|(p, _)| p).unwrap_or(&self.0)
    }

    /// Numeric sequence part, if well formed
    pub fn sequence(&self) -> Option<u64> {
        self.0.split_once('-').and_then(|(_, s)| s.parse().ok())
    }
}

/// Largest sequence value representable in `width` digits
pub fn max_sequence(width: usize) -> Result<u64, CoreError> {
    if width == 0 || width > MAX_SEQUENCE_WIDTH {
        return Err(CoreError::ConfigurationError(format!(
            "EUID sequence width must be between 1 and {}, got {}",
            MAX_SEQUENCE_WIDTH, width
        )));
    }
    Ok(10u64.pow(width as u32) - 1)
}

impl fmt::Display for Euid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Euid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Euid::parse(s)
    }
}

impl From<&str> for Euid {
    fn from(s: &str) -> Self {
        Euid(s.to_string())
    }
}

/// Per-prefix monotonic counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounter {
    /// Template prefix
    pub prefix: String,
    /// Last value handed out, 0 before the first allocation
    pub last_value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pads_to_width() {
        assert_eq!(Euid::format("CON", 1, 7).unwrap().as_str(), "CON-0000001");
        assert_eq!(Euid::format("SMP", 42, 3).unwrap().as_str(), "SMP-042");
    }

    #[test]
    fn test_format_detects_exhaustion() {
        assert!(Euid::format("CON", 999, 3).is_ok());
        let err = Euid::format("CON", 1000, 3).unwrap_err();
        assert_eq!(err.error_code(), "ERR_CORE_ALLOCATION");
    }

    #[test]
    fn test_width_bounds() {
        assert!(max_sequence(0).is_err());
        assert!(max_sequence(20).is_err());
        assert_eq!(max_sequence(19).unwrap(), 9_999_999_999_999_999_999);
        assert_eq!(max_sequence(7).unwrap(), 9_999_999);
    }

    #[test]
    fn test_parse() {
        let euid = Euid::parse("CON-0000012").unwrap();
        assert_eq!(euid.prefix(), "CON");
        assert_eq!(euid.sequence(), Some(12));

        assert!(Euid::parse("CON0000012").is_err());
        assert!(Euid::parse("con-0000012").is_err());
        assert!(Euid::parse("CON-12a").is_err());
        assert!(Euid::parse("CON-").is_err());
        assert!("DAT-1".parse::<Euid>().is_ok());
    }
}
