//! Core types for the OFDM receiver front-end
//!
//! The receiver works on complex baseband I/Q samples and emits soft-decision
//! bits for an external Viterbi decoder.
//!
//! ## Soft-decision bits
//!
//! A soft bit is a signed integer in `[-A, +A]` whose sign carries the hard
//! decision and whose magnitude carries confidence:
//!
//! ```text
//! logical 0  ->  -A
//! logical 1  ->  +A
//! uncertain  ->   0
//! ```
//!
//! This matches the convention of soft-decision Viterbi decoders where the
//! branch metric accumulates the received levels directly.

use num_complex::Complex64;
use thiserror::Error;

/// A single complex baseband I/Q sample.
pub type IQSample = Complex64;

/// A soft-decision bit for the downstream Viterbi decoder.
pub type SoftBit = i8;

/// Soft-decision level representing a confident logical `1`.
pub const SOFT_DECISION_HIGH: SoftBit = 127;

/// Soft-decision level representing a confident logical `0`.
pub const SOFT_DECISION_LOW: SoftBit = -127;

/// Result type for receiver construction and configuration.
pub type DspResult<T> = Result<T, DspError>;

/// Errors reported at construction time.
///
/// The sample path itself never fails: once a demodulator is built,
/// `process` absorbs desyncs internally and reports them through counters.
#[derive(Debug, Error)]
pub enum DspError {
    #[error("invalid OFDM parameters: {0}")]
    InvalidParams(String),

    #[error("PRS reference length {actual} does not match FFT size {expected}")]
    ReferenceLengthMismatch { expected: usize, actual: usize },

    #[error("carrier mapper is not a permutation of [0, {0})")]
    InvalidCarrierMapper(usize),

    #[error("failed to spawn {role} thread: {source}")]
    ThreadSpawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_decision_range_symmetric() {
        assert_eq!(SOFT_DECISION_HIGH, -SOFT_DECISION_LOW);
    }

    #[test]
    fn test_error_display() {
        let e = DspError::ReferenceLengthMismatch {
            expected: 2048,
            actual: 1024,
        };
        assert!(e.to_string().contains("2048"));
        assert!(e.to_string().contains("1024"));
    }
}
