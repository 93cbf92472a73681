use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::artifact::FetchError;

/// Structured error types for the background removal service.
///
/// # Why structured errors
///
/// Each variant maps to one failure class of a request (missing upload, undecodable
/// bytes, model failure, PNG serialization, model provisioning). Callers classify
/// with [`RmbgError::kind`] instead of parsing error strings, and the HTTP layer
/// maps kinds to status codes without exposing the inner error.
#[derive(Error, Debug)]
pub enum RmbgError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Missing input: {reason}")]
    MissingInput { reason: String },

    #[error("Upload too large: {reason}")]
    UploadTooLarge { reason: String },

    #[error("Decode error: {operation} failed")]
    Decode {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Inference error: {operation} failed at {stage}")]
    Inference {
        stage: Stage,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Encode error: {operation} failed")]
    Encode {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Provisioning error: fetching {url} failed")]
    Provisioning {
        url: String,
        #[source]
        source: Arc<FetchError>,
    },
}

pub type Result<T> = std::result::Result<T, RmbgError>;

/// Caller-visible classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    MissingInput,
    UploadTooLarge,
    Decode,
    Inference,
    Encode,
    Provisioning,
}

/// Where in the request lifecycle a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Startup,
    Validate,
    Provision,
    Decode,
    Segment,
    Composite,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Startup => "startup",
            Stage::Validate => "validate",
            Stage::Provision => "provision",
            Stage::Decode => "decode",
            Stage::Segment => "segment",
            Stage::Composite => "composite",
            Stage::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// A classified failure plus its originating stage. Only ever logged or
/// turned into a response, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub stage: Stage,
}

impl RmbgError {
    pub fn missing_input(reason: impl Into<String>) -> Self {
        Self::MissingInput {
            reason: reason.into(),
        }
    }

    pub fn inference(
        stage: Stage,
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Inference {
            stage,
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::MissingInput { .. } => ErrorKind::MissingInput,
            Self::UploadTooLarge { .. } => ErrorKind::UploadTooLarge,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::Encode { .. } => ErrorKind::Encode,
            Self::Provisioning { .. } => ErrorKind::Provisioning,
        }
    }

    pub const fn failure_record(&self) -> FailureRecord {
        let stage = match self {
            Self::Configuration { .. } => Stage::Startup,
            Self::MissingInput { .. } | Self::UploadTooLarge { .. } => Stage::Validate,
            Self::Decode { .. } => Stage::Decode,
            Self::Inference { stage, .. } => *stage,
            Self::Encode { .. } => Stage::Encode,
            Self::Provisioning { .. } => Stage::Provision,
        };
        FailureRecord {
            kind: self.kind(),
            stage,
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
///
/// Anything ort reports happens while building or running the session, so it is
/// always a model-invocation failure from the caller's point of view.
impl From<ort::Error> for RmbgError {
    fn from(err: ort::Error) -> Self {
        Self::inference(Stage::Segment, "ort operation", err)
    }
}

/// Convert ndarray shape errors to inference errors.
///
/// # Why inference category
///
/// Shape errors only occur while reshaping model outputs, which means the model
/// returned something malformed.
impl From<ndarray::ShapeError> for RmbgError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference(Stage::Segment, "tensor shape conversion", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_stage_classification() {
        let err = RmbgError::missing_input("no file field");
        assert_eq!(
            err.failure_record(),
            FailureRecord {
                kind: ErrorKind::MissingInput,
                stage: Stage::Validate,
            }
        );

        let err = RmbgError::inference(
            Stage::Composite,
            "mask application",
            "dimension mismatch",
        );
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(err.failure_record().stage, Stage::Composite);

        let err = RmbgError::Provisioning {
            url: "https://example.invalid/u2net.onnx".to_string(),
            source: Arc::new(FetchError::Status {
                url: "https://example.invalid/u2net.onnx".to_string(),
                status: 404,
            }),
        };
        assert_eq!(err.kind(), ErrorKind::Provisioning);
        assert_eq!(err.failure_record().stage, Stage::Provision);
    }

    #[test]
    fn test_display_does_not_include_source() {
        let err = RmbgError::Decode {
            operation: "image decoding".to_string(),
            source: "secret internal detail".into(),
        };
        assert_eq!(err.to_string(), "Decode error: image decoding failed");
    }

    #[test]
    fn test_shape_error_is_inference() {
        let shape_err = ndarray::Array2::<f32>::zeros((2, 2))
            .into_shape_with_order((3, 3))
            .unwrap_err();
        let err: RmbgError = shape_err.into();
        assert_eq!(err.kind(), ErrorKind::Inference);
    }
}
