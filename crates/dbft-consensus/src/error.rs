use dbft_primitives::{CodecError, Height, ProposalSlot, ValidatorIndex, View};
use thiserror::Error;

/// Errors raised by the dBFT consensus core.
///
/// Protocol violations (wrong origin, mismatched height or view, malformed
/// content) mean the sender is Byzantine or buggy: the caller drops the
/// payload and moves on. Persistence failures are fatal to the service.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown validator index {index}, set size is {set_size}")]
    UnknownValidator { index: ValidatorIndex, set_size: u16 },

    #[error("height mismatch: at {current}, payload targets {received}")]
    HeightMismatch { current: Height, received: Height },

    #[error("view mismatch: at {current}, payload targets {received}")]
    ViewMismatch { current: View, received: View },

    #[error(
        "validator {actual} is not the expected primary {expected} for slot {slot:?}"
    )]
    WrongOrigin {
        slot: ProposalSlot,
        expected: ValidatorIndex,
        actual: ValidatorIndex,
    },

    #[error("prepare request carries a duplicate transaction hash")]
    DuplicateTxHash,

    #[error("prepare request carries {count} transactions, limit is {limit}")]
    TooManyTransactions { count: usize, limit: usize },

    #[error("proposal timestamp {timestamp} outside ({lower}, {upper})")]
    TimestampOutOfRange {
        timestamp: u64,
        lower: u64,
        upper: u64,
    },

    #[error("no prepare request stored for slot {slot:?}")]
    MissingPrepareRequest { slot: ProposalSlot },

    #[error("local node is watch-only and cannot author payloads")]
    WatchOnly,

    #[error("local node does not own proposal slot {slot:?}")]
    NotSlotOwner { slot: ProposalSlot },

    #[error("recovery log persistence failed: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("consensus service halted: {reason}")]
    Halted { reason: String },
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formats() {
        let cases: Vec<(ConsensusError, &[&str])> = vec![
            (
                ConsensusError::UnknownValidator { index: 9, set_size: 4 },
                &["unknown validator", "9", "4"],
            ),
            (
                ConsensusError::HeightMismatch { current: 10, received: 12 },
                &["height mismatch", "10", "12"],
            ),
            (
                ConsensusError::ViewMismatch { current: 0, received: 2 },
                &["view mismatch", "0", "2"],
            ),
            (
                ConsensusError::WrongOrigin {
                    slot: ProposalSlot::Priority,
                    expected: 2,
                    actual: 3,
                },
                &["expected primary 2", "3", "Priority"],
            ),
            (
                ConsensusError::TooManyTransactions { count: 600, limit: 512 },
                &["600", "512"],
            ),
            (
                ConsensusError::TimestampOutOfRange { timestamp: 5, lower: 10, upper: 20 },
                &["timestamp 5", "10", "20"],
            ),
            (
                ConsensusError::Halted { reason: "disk full".into() },
                &["halted", "disk full"],
            ),
        ];

        for (err, keywords) in &cases {
            let text = err.to_string();
            for kw in *keywords {
                assert!(text.contains(kw), "Display for {err:?} should contain '{kw}'");
            }
        }
    }

    #[test]
    fn test_codec_error_converts() {
        let err: ConsensusError = CodecError::MalformedPayload("trailing bytes").into();
        assert!(err.to_string().contains("trailing bytes"));
    }
}
