//! Sales aggregator: consumes sale events from the `sales` topic as a consumer-group member
//! and maintains real-time analytics in Redis.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod services;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::{AppError, Result};
