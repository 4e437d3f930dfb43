use super::models::ValidationReport;
use thiserror::Error;

/// Conditions a validation caller has to handle.
///
/// Per-scope backend failures are not errors: they are recorded in the
/// report and the run continues.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Content validation is already ongoing")]
    AlreadyRunning,

    /// Stopped on request; carries everything found before the stop.
    #[error("Content validation was aborted after {} diff entries", .report.entries.len())]
    Aborted { report: Box<ValidationReport> },

    #[error("No content validation is running")]
    NotRunning,

    #[error("An abort was already requested for the running content validation")]
    AbortAlreadyRequested,

    #[error("Invalid validation options: {0}")]
    InvalidOptions(String),

    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl ValidationError {
    /// The partial report of an aborted run.
    pub fn partial_report(&self) -> Option<&ValidationReport> {
        match self {
            ValidationError::Aborted { report } => Some(report),
            _ => None,
        }
    }
}
