//! Errors raised by conditioning layers

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("Empty conditioning sequence")]
    EmptySequence,

    #[error("Sequence length {seq_len} exceeds max_seq_len {max_seq_len}")]
    SequenceTooLong { seq_len: usize, max_seq_len: usize },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}
