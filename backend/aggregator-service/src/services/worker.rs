use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::coordinator::{
    ClaimControl, ClaimExit, ClaimHandler, LogRecord, OffsetCommitter, PartitionClaim,
};
use crate::metrics;
use crate::store::AnalyticsStore;

use super::aggregator::{RecordOutcome, SaleAggregator};

/// Consumer-group handler: one `consume_claim` call per owned partition.
pub struct AggregatorWorker<S: AnalyticsStore + ?Sized> {
    aggregator: SaleAggregator<S>,
}

impl<S: AnalyticsStore + ?Sized> AggregatorWorker<S> {
    pub fn new(aggregator: SaleAggregator<S>) -> Self {
        Self { aggregator }
    }

    pub fn aggregator(&self) -> &SaleAggregator<S> {
        &self.aggregator
    }
}

#[async_trait]
impl<S> ClaimHandler for AggregatorWorker<S>
where
    S: AnalyticsStore + ?Sized + 'static,
{
    async fn setup(&self, claims: &[PartitionClaim]) {
        info!(
            "Claims assigned: {}",
            claims
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    async fn consume_claim(
        &self,
        claim: PartitionClaim,
        mut records: mpsc::Receiver<LogRecord>,
        committer: Arc<dyn OffsetCommitter>,
        mut control: watch::Receiver<ClaimControl>,
    ) -> ClaimExit {
        info!(claim = %claim, "Consuming claim");
        let mut processed: u64 = 0;

        let exit = loop {
            let state = *control.borrow();
            match state {
                ClaimControl::Revoked => break ClaimExit::Revoked,
                ClaimControl::Shutdown => break ClaimExit::Shutdown,
                ClaimControl::Active => {}
            }

            let record = tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() {
                        // Coordinator went away without a signal
                        break ClaimExit::Shutdown;
                    }
                    continue;
                }
                next = records.recv() => match next {
                    Some(record) => record,
                    None => break ClaimExit::Drained,
                },
            };

            if let RecordOutcome::Applied(report) = self.aggregator.process_record(&record).await {
                if !report.is_complete() {
                    debug!(
                        claim = %claim,
                        offset = record.offset,
                        failures = report.failures.len(),
                        "Sale applied partially"
                    );
                }
            }
            processed += 1;

            // The partition may belong to another replica by now; leave the offset to it.
            let state = *control.borrow();
            if state == ClaimControl::Revoked {
                warn!(
                    claim = %claim,
                    offset = record.offset,
                    "Claim revoked while processing, offset not committed"
                );
                break ClaimExit::Revoked;
            }

            if let Err(e) = committer.mark_processed(&record) {
                warn!(claim = %claim, offset = record.offset, error = %e, "Failed to mark offset");
                metrics::record_offset_commit_failure();
            }
        };

        info!(claim = %claim, processed, ?exit, "Claim loop finished");
        exit
    }

    async fn cleanup(&self, claims: &[PartitionClaim]) {
        info!(
            "Claims released: {}",
            claims
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}
