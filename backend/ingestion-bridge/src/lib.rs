//! HTTP front door for sale events: validate, append to the `sales` topic, report status.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod producer;

pub use error::BridgeError;
pub use producer::{KafkaSaleLog, SaleLog};

/// Body returned by `POST /purchase`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseResponse {
    pub status: String,
    pub success: bool,
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn SaleLog>,
    /// Deadline for one append
    pub publish_timeout: Duration,
}

impl AppState {
    pub fn new(log: Arc<dyn SaleLog>, publish_timeout: Duration) -> Self {
        Self {
            log,
            publish_timeout,
        }
    }
}
