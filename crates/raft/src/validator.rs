//! Checks applied to every entry before it enters the log.

use conductor_storage::{BlockAddress, LogBlock};
use thiserror::Error;

/// Why an entry was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The entry does not start right after the previous one
    #[error("Expected lowest position {expected}, got {actual}")]
    Gap {
        /// `previous.highest + 1`
        expected: i64,
        /// The entry's lowest position
        actual: i64,
    },

    /// The entry was written in an older term than the entry before it
    #[error("Entry term {actual} is below the previous entry's term {previous}")]
    TermRegression {
        /// Term of the previous application entry
        previous: u64,
        /// The entry's term
        actual: u64,
    },

    /// The entry's range is empty or negative
    #[error("Invalid position range [{lowest}, {highest}]")]
    InvalidRange {
        /// Lowest position
        lowest: i64,
        /// Highest position
        highest: i64,
    },
}

/// Decides whether `candidate` may follow `previous`, the last application
/// entry already in the log.
pub trait EntryValidator: Send + Sync + 'static {
    /// Validate one entry
    fn validate(
        &self,
        previous: Option<&BlockAddress>,
        candidate: &LogBlock,
    ) -> Result<(), ValidationError>;
}

/// Keeps terms monotonic and positions contiguous across application entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct GapValidator;

impl EntryValidator for GapValidator {
    fn validate(
        &self,
        previous: Option<&BlockAddress>,
        candidate: &LogBlock,
    ) -> Result<(), ValidationError> {
        if let Some(previous) = previous.filter(|previous| candidate.term < previous.term) {
            return Err(ValidationError::TermRegression {
                previous: previous.term,
                actual: candidate.term,
            });
        }

        if !candidate.is_application() {
            return Ok(());
        }

        if candidate.lowest_position < 0 || candidate.lowest_position > candidate.highest_position
        {
            return Err(ValidationError::InvalidRange {
                lowest: candidate.lowest_position,
                highest: candidate.highest_position,
            });
        }

        match previous {
            Some(previous) if candidate.lowest_position != previous.highest_position + 1 => {
                Err(ValidationError::Gap {
                    expected: previous.highest_position + 1,
                    actual: candidate.lowest_position,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn previous(highest: i64) -> BlockAddress {
        BlockAddress {
            index: 3,
            term: 1,
            lowest_position: 1,
            highest_position: highest,
        }
    }

    fn block(lowest: i64, highest: i64) -> LogBlock {
        LogBlock::application(1, lowest, highest, Bytes::new())
    }

    #[test]
    fn test_contiguous_entry_is_accepted() {
        assert!(GapValidator.validate(Some(&previous(10)), &block(11, 12)).is_ok());
    }

    #[test]
    fn test_gap_and_overlap_are_rejected() {
        assert_eq!(
            GapValidator.validate(Some(&previous(10)), &block(13, 14)),
            Err(ValidationError::Gap {
                expected: 11,
                actual: 13
            })
        );
        assert!(GapValidator.validate(Some(&previous(10)), &block(10, 12)).is_err());
    }

    #[test]
    fn test_first_entry_is_accepted_anywhere() {
        assert!(GapValidator.validate(None, &block(42, 42)).is_ok());
    }

    #[test]
    fn test_initial_entries_are_not_checked() {
        assert!(GapValidator
            .validate(Some(&previous(10)), &LogBlock::initial(2))
            .is_ok());
    }

    #[test]
    fn test_older_term_is_rejected() {
        let previous = BlockAddress {
            term: 3,
            ..previous(10)
        };
        assert_eq!(
            GapValidator.validate(Some(&previous), &block(11, 12)),
            Err(ValidationError::TermRegression {
                previous: 3,
                actual: 1
            })
        );
        assert!(GapValidator
            .validate(Some(&previous), &LogBlock::initial(2))
            .is_err());
        assert!(GapValidator
            .validate(Some(&previous), &LogBlock::application(4, 11, 11, Bytes::new()))
            .is_ok());
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        assert!(matches!(
            GapValidator.validate(None, &block(5, 4)),
            Err(ValidationError::InvalidRange { .. })
        ));
    }
}
