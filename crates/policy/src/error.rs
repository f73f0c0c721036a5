//! Policy Engine Error Types

use thiserror::Error;

/// Policy engine operation errors
///
/// Persistence failures are deliberately not represented: the store is
/// best-effort and logs instead of propagating.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Policy descriptor failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote policy lookup failed
    #[error("Network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;
