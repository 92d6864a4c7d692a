use dp_dataset::DatasetError;
use dp_preprocess::PreprocessError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// External error taxonomy: every failure surfaced by the service maps to
/// exactly one kind, which fixes the HTTP status of the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    UnprocessableEntity,
    InternalError,
}

impl ErrorKind {
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnprocessableEntity => 422,
            Self::InternalError => 500,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("the request body is not valid {format}: {detail}")]
    MalformedBody {
        format: &'static str,
        detail: String,
    },
    #[error("`data_descriptor.origin` must be a non-empty string")]
    MissingOrigin,
    #[error("each operation must provide a non-empty `expr`")]
    EmptyOperationExpr,
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("declared content type \"{declared}\" does not match the {actual} request body")]
    ContentTypeMismatch {
        declared: String,
        actual: &'static str,
    },
    #[error("each `data` row must be an object")]
    NonObjectRow,
    #[error("row values must be scalars; nested objects and sequences are not supported")]
    NestedValue,
    #[error("`_meta` must be a mapping of scalars and nested mappings")]
    InvalidMeta,
    #[error("operation parameters must be scalar values")]
    InvalidParam,
    #[error("`drop_outliers_percent` must be a number")]
    InvalidMultiplierOption,
    #[error("dataset exceeds the row ceiling ({limit} rows)")]
    TooManyRows { limit: usize },
    #[error("expression exceeds the length ceiling ({limit} characters)")]
    ExpressionTooLong { limit: usize },
    #[error("failed to encode the response: {0}")]
    Encode(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
}

impl ServiceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedBody { .. } | Self::MissingOrigin | Self::EmptyOperationExpr => {
                ErrorKind::InvalidRequest
            }
            Self::UnsupportedContentType(_)
            | Self::ContentTypeMismatch { .. }
            | Self::NonObjectRow
            | Self::NestedValue
            | Self::InvalidMeta
            | Self::InvalidParam
            | Self::InvalidMultiplierOption
            | Self::TooManyRows { .. }
            | Self::ExpressionTooLong { .. }
            | Self::Dataset(_) => ErrorKind::UnprocessableEntity,
            Self::Encode(_) | Self::Preprocess(_) => ErrorKind::InternalError,
        }
    }
}

/// Wire shape of a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub details: String,
    pub timestamp: String,
}
