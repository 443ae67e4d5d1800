use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use sales_event_schema::DecodeError;
use thiserror::Error;

use crate::PurchaseResponse;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] DecodeError),

    /// The event validated but could not be serialized for the log.
    #[error("failed to encode sale: {0}")]
    Encode(String),

    #[error("publish timed out after {0} ms")]
    PublishTimeout(u64),

    #[error("publish failed: {0}")]
    Publish(String),
}

impl BridgeError {
    pub fn outcome(&self) -> &'static str {
        match self {
            BridgeError::InvalidRequest(_) => "invalid",
            BridgeError::Encode(_) => "encode_error",
            BridgeError::PublishTimeout(_) => "timeout",
            BridgeError::Publish(_) => "publish_error",
        }
    }
}

/// `SaleEvent::encode` only fails inside the serializer, never on request content.
pub fn encode_error(err: DecodeError) -> BridgeError {
    BridgeError::Encode(err.to_string())
}

impl ResponseError for BridgeError {
    fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Encode(_) | BridgeError::PublishTimeout(_) | BridgeError::Publish(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(PurchaseResponse {
            status: self.to_string(),
            success: false,
        })
    }
}
