//! Error types for sale event decoding

use thiserror::Error;

/// Why a payload could not be turned into a `SaleEvent`
///
/// Every variant is recoverable: the consumer drops the event and keeps going.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not valid JSON
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Valid JSON, but not an object
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{field}`")]
    MissingField { field: &'static str },

    #[error("field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field `{field}` is invalid: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl DecodeError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) | DecodeError::NotAnObject => "malformed",
            DecodeError::MissingField { .. } => "missing_field",
            DecodeError::WrongType { .. } => "wrong_type",
            DecodeError::InvalidValue { .. } => "invalid_value",
        }
    }
}
