use thiserror::Error;

/// Errors reported by the loop controller. Neither is fatal to the session:
/// a rejected call leaves the controller exactly as it was.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CcrError {
    /// A configuration value was malformed or out of range.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },

    /// `advance` was called with a non-positive or non-finite step.
    #[error("invalid time step: {0} s (must be positive and finite)")]
    InvalidTimeStep(f64),
}

impl CcrError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        CcrError::InvalidConfiguration {
            field,
            reason: reason.into(),
        }
    }
}

pub type CcrResult<T> = Result<T, CcrError>;
