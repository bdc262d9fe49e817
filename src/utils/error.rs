//! Error Handling Module
//!
//! Defines the error type shared by every stage of the fine-tuning run.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for SoftCon fine-tuning operations
#[derive(Error, Debug)]
pub enum SoftconError {
    /// Invalid run parameters (unknown country, too many samples, bad fractions)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reading the patch metadata tables
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Error reading or decoding a patch from the image store
    #[error("Patch store error for '{0}': {1}")]
    Store(String, String),

    /// Error with dataset operations or band transforms
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error with model assembly
    #[error("Model error: {0}")]
    Model(String),

    /// Error reading the pretrained checkpoint
    #[error("Checkpoint error at '{0}': {1}")]
    Checkpoint(PathBuf, String),

    /// Error with training or saving the trained model
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience Result type for fine-tuning operations
pub type Result<T> = std::result::Result<T, SoftconError>;

impl From<parquet::errors::ParquetError> for SoftconError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        SoftconError::Metadata(err.to_string())
    }
}

impl From<serde_json::Error> for SoftconError {
    fn from(err: serde_json::Error) -> Self {
        SoftconError::Serialization(err.to_string())
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Wrap the error as a dataset error, prefixed with a lazily built message
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| SoftconError::Dataset(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| SoftconError::Dataset(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SoftconError::Config("country 'Atlantis' has no train patches".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: country 'Atlantis' has no train patches"
        );
    }

    #[test]
    fn test_store_error_names_patch() {
        let err = SoftconError::Store("S2A_MSIL2A_0001".to_string(), "missing".to_string());
        assert!(format!("{}", err).contains("S2A_MSIL2A_0001"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint.pth");
        let err: SoftconError = io.into();
        assert!(matches!(err, SoftconError::Io(_)));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let err = result.with_context(|| "Failed to read patch".to_string()).unwrap_err();
        assert_eq!(format!("{}", err), "Dataset error: Failed to read patch: file not found");
    }

    #[test]
    fn test_option_context() {
        let none: Option<u8> = None;
        let err = none.with_context(|| "no band B04".to_string()).unwrap_err();
        assert_eq!(format!("{}", err), "Dataset error: no band B04");
    }
}
