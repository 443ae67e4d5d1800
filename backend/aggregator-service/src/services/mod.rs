pub mod aggregator;
pub mod worker;

pub use aggregator::{AggregatorConfig, ApplyReport, RecordOutcome, SaleAggregator, StepFailure};
pub use worker::AggregatorWorker;
