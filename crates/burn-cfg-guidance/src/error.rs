//! Errors raised when configuring guidance

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuidanceError {
    #[error("Invalid {name}: {value} (expected {expected})")]
    InvalidScale {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
}
