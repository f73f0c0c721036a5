//! Core error types for SensorLink

use thiserror::Error;

/// Result type alias using SensorLink's core Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the core data model
///
/// Raised by the identifier newtypes and the enum literal parsers;
/// value coercion stays `Option`-typed because a failed cast is
/// legitimate pipeline control flow, not an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier or enum literal failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Environment input could not be interpreted
    #[error("Configuration error: {0}")]
    Configuration(String),
}
