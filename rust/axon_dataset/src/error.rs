//! Error types for Axon dataset bridge operations
//!
//! Every failure inside the bridge is a [`DatasetError`]. The C layer turns
//! each variant into a status code plus a human-readable message; nothing else
//! about the error crosses the boundary.

use thiserror::Error;

/// Error types for bridge operations
#[derive(Error, Debug)]
pub enum DatasetError {
    /// Handle does not resolve to a live object of the expected type
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input: unknown format id, bad URI, schema mismatch
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The calling thread cannot reach the host runtime
    #[error("Runtime detached: {0}")]
    RuntimeDetachment(String),

    /// A host-side reservation or iterator capability reported a failure
    #[error("Host rejected: {0}")]
    HostRejected(String),

    /// Operation is not meaningful for this object
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Arrow conversion error
    #[error("Arrow error: {0}")]
    ArrowError(String),

    /// Parquet decode or encode error
    #[error("Parquet error: {0}")]
    ParquetError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<arrow::error::ArrowError> for DatasetError {
    fn from(err: arrow::error::ArrowError) -> Self {
        DatasetError::ArrowError(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for DatasetError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        DatasetError::ParquetError(err.to_string())
    }
}

impl From<std::io::Error> for DatasetError {
    fn from(err: std::io::Error) -> Self {
        DatasetError::IoError(err.to_string())
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, DatasetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    // ==========================================================================
    // Display Tests
    // ==========================================================================

    #[test]
    fn test_not_found_error() {
        let error = DatasetError::NotFound("handle 42".to_string());
        assert_eq!(error.to_string(), "Not found: handle 42");
    }

    #[test]
    fn test_invalid_argument_error() {
        let error = DatasetError::InvalidArgument("illegal file format id: 7".to_string());
        assert!(error.to_string().contains("Invalid argument"));
        assert!(error.to_string().contains("illegal file format id: 7"));
    }

    #[test]
    fn test_runtime_detachment_error() {
        let error = DatasetError::RuntimeDetachment("thread not attached".to_string());
        assert!(error.to_string().starts_with("Runtime detached"));
    }

    #[test]
    fn test_all_variants_display() {
        let variants = vec![
            DatasetError::NotFound("a".to_string()),
            DatasetError::InvalidArgument("b".to_string()),
            DatasetError::RuntimeDetachment("c".to_string()),
            DatasetError::HostRejected("d".to_string()),
            DatasetError::Unsupported("e".to_string()),
            DatasetError::ArrowError("f".to_string()),
            DatasetError::ParquetError("g".to_string()),
            DatasetError::IoError("h".to_string()),
        ];

        for error in variants {
            let display = format!("{}", error);
            assert!(!display.is_empty());
        }
    }

    // ==========================================================================
    // Conversion Tests
    // ==========================================================================

    #[test]
    fn test_from_io_error() {
        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: DatasetError = io_error.into();

        match error {
            DatasetError::IoError(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected IoError variant"),
        }
    }

    #[test]
    fn test_from_arrow_error() {
        let arrow_error =
            arrow::error::ArrowError::SchemaError("schema mismatch".to_string());
        let error: DatasetError = arrow_error.into();

        match error {
            DatasetError::ArrowError(msg) => assert!(msg.contains("schema mismatch")),
            _ => panic!("Expected ArrowError variant"),
        }
    }

    #[test]
    fn test_from_parquet_error() {
        let parquet_error = parquet::errors::ParquetError::General("bad footer".to_string());
        let error: DatasetError = parquet_error.into();
        assert!(matches!(error, DatasetError::ParquetError(ref m) if m.contains("bad footer")));
    }
}
