use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the segmentation pipeline.
///
/// # Why structured errors
///
/// Each variant captures context specific to its error domain (configuration,
/// filesystem, image handling, inference), providing detailed diagnostic
/// information without requiring callers to parse error strings. The thiserror
/// crate generates Display implementations automatically from format strings,
/// reducing boilerplate while maintaining type safety.
#[derive(Error, Debug)]
pub enum CellSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {operation} failed (image: {name})")]
    Image {
        name: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

impl CellSegError {
    /// Shorthand for configuration failures detected before inference starts.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CellSegError>;

/// Convert anyhow errors to configuration errors.
///
/// # Why this conversion exists
///
/// Some dependencies return anyhow::Error which lacks structured error
/// information. Rather than propagating the generic error type throughout the
/// codebase, we convert to our domain-specific error type at boundaries.
impl From<anyhow::Error> for CellSegError {
    fn from(err: anyhow::Error) -> Self {
        CellSegError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has context should construct CellSegError::FileSystem directly
/// with the specific path and operation; this conversion is the fallback.
impl From<std::io::Error> for CellSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image errors.
impl From<image::ImageError> for CellSegError {
    fn from(err: image::ImageError) -> Self {
        Self::Image {
            name: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
impl From<ort::Error> for CellSegError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to inference errors.
///
/// # Why the inference category
///
/// Shape errors occur during tensor operations which are part of model
/// inference, so they're categorized as inference errors rather than a
/// separate tensor error type. This keeps the error hierarchy flat and
/// focused on user-facing error domains.
impl From<ndarray::ShapeError> for CellSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Inference {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
