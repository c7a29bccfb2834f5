use crate::schema::Period;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason class attached to every failure a run can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    AuthenticationFailure,
    NavigationFailure,
    ExtractionFailure,
    ArtifactTimeout,
    CancellationRequested,
}

impl FailureClass {
    /// Fatal classes stop the period loop; the rest skip one period.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FailureClass::AuthenticationFailure | FailureClass::NavigationFailure
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureClass::AuthenticationFailure => "AuthenticationFailure",
            FailureClass::NavigationFailure => "NavigationFailure",
            FailureClass::ExtractionFailure => "ExtractionFailure",
            FailureClass::ArtifactTimeout => "ArtifactTimeout",
            FailureClass::CancellationRequested => "CancellationRequested",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("No usable line items for period {period}: {reason}")]
    Extraction { period: Period, reason: String },

    #[error("Artifact for period {period} not captured: {reason}")]
    ArtifactTimeout { period: Period, reason: String },

    #[error("Run cancelled by the control surface")]
    Cancelled,

    #[error("Activation check refused the run: {0}")]
    ActivationDenied(String),

    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Invalid period '{0}': expected MM/YYYY or YYYY-MM")]
    InvalidPeriod(String),

    #[error("Invalid date range: end {end} is before start {start}")]
    InvalidRange { start: Period, end: Period },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sheet '{0}' already carries its total column and accepts no more rows")]
    SheetSealed(String),

    #[error("Portal interaction error: {0}")]
    Portal(String),

    #[error("Document merge failed: {0}")]
    Merge(String),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Workbook write error: {0}")]
    WorkbookWrite(#[from] rust_xlsxwriter::XlsxError),

    #[error("Workbook read error: {0}")]
    WorkbookRead(#[from] calamine::XlsxError),

    #[cfg(feature = "http-gate")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "browser")]
    #[error("Browser error: {0}")]
    Browser(#[from] chromiumoxide::error::CdpError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl HarvestError {
    /// Taxonomy class for run-level failures, `None` for library errors.
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            HarvestError::Authentication(_) => Some(FailureClass::AuthenticationFailure),
            HarvestError::Navigation(_) => Some(FailureClass::NavigationFailure),
            HarvestError::Extraction { .. } => Some(FailureClass::ExtractionFailure),
            HarvestError::ArtifactTimeout { .. } => Some(FailureClass::ArtifactTimeout),
            HarvestError::Cancelled => Some(FailureClass::CancellationRequested),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class().map(FailureClass::is_fatal).unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classes() {
        assert!(FailureClass::AuthenticationFailure.is_fatal());
        assert!(FailureClass::NavigationFailure.is_fatal());
        assert!(!FailureClass::ExtractionFailure.is_fatal());
        assert!(!FailureClass::ArtifactTimeout.is_fatal());
        assert!(!FailureClass::CancellationRequested.is_fatal());
    }

    #[test]
    fn test_error_classification() {
        let period = Period::new(2024, 3).unwrap();
        let err = HarvestError::Extraction {
            period,
            reason: "no rows".to_string(),
        };
        assert_eq!(err.class(), Some(FailureClass::ExtractionFailure));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("03/2024"));

        let err = HarvestError::Navigation("back button lost".to_string());
        assert!(err.is_fatal());

        let err = HarvestError::SheetSealed("Credits".to_string());
        assert_eq!(err.class(), None);
        assert!(!err.is_fatal());
    }
}
