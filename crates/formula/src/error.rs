//! Formula error types

use thiserror::Error;

/// Result type alias for formula parsing
pub type Result<T> = std::result::Result<T, FormulaError>;

/// Errors raised while tokenizing or parsing a formula
///
/// Parse errors surface at policy-assignment time, never per reading.
#[derive(Debug, Error)]
pub enum FormulaError {
    #[error("Unexpected character '{found}' at position {position}")]
    UnexpectedCharacter { found: char, position: usize },

    #[error("Unexpected token '{found}' at position {position}: {expected}")]
    UnexpectedToken {
        found: String,
        position: usize,
        expected: String,
    },

    #[error("Unexpected end of formula: {expected}")]
    UnexpectedEnd { expected: String },

    #[error("Invalid number '{text}' at position {position}")]
    InvalidNumber { text: String, position: usize },

    #[error("Unterminated attribute reference at position {position}")]
    UnterminatedReference { position: usize },
}
