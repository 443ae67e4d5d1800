//! Partition task bookkeeping, independent of the log client
//!
//! The dispatcher owns one task per claimed partition, feeds it through a bounded channel and
//! applies rebalance events to the [`ClaimRegistry`]. It never blocks on a full channel: the
//! record is parked in the partition's backlog and the caller is told to pause the partition.

use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    ClaimControl, ClaimExit, ClaimHandler, ClaimRegistry, ClaimState, LogRecord, OffsetCommitter,
    PartitionClaim, RebalanceEvent,
};
use crate::metrics;

/// Control senders shared with the rebalance callbacks.
pub type ControlMap = Arc<Mutex<HashMap<PartitionClaim, watch::Sender<ClaimControl>>>>;

pub fn lock_controls(
    controls: &ControlMap,
) -> MutexGuard<'_, HashMap<PartitionClaim, watch::Sender<ClaimControl>>> {
    controls.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send `signal` to every claim that currently has a task.
pub fn signal_all(controls: &ControlMap, signal: ClaimControl) {
    for control in lock_controls(controls).values() {
        let _ = control.send(signal);
    }
}

struct PartitionTask {
    records: mpsc::Sender<LogRecord>,
    handle: JoinHandle<ClaimExit>,
    /// Records that arrived while the channel was full, in log order
    backlog: VecDeque<LogRecord>,
}

/// Where a polled record went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    /// No task owns the partition; the record is left uncommitted.
    Dropped,
    /// The channel is full. The caller should pause this partition.
    Backpressure(PartitionClaim),
    /// Appended behind an existing backlog; the partition is already paused.
    Queued,
}

pub struct ClaimDispatcher<H: ClaimHandler> {
    handler: Arc<H>,
    committer: Arc<dyn OffsetCommitter>,
    controls: ControlMap,
    registry: ClaimRegistry,
    tasks: HashMap<PartitionClaim, PartitionTask>,
    claim_buffer: usize,
}

impl<H: ClaimHandler> ClaimDispatcher<H> {
    pub fn new(
        handler: Arc<H>,
        committer: Arc<dyn OffsetCommitter>,
        controls: ControlMap,
        claim_buffer: usize,
    ) -> Self {
        Self {
            handler,
            committer,
            controls,
            registry: ClaimRegistry::new(),
            tasks: HashMap::new(),
            claim_buffer: claim_buffer.max(1),
        }
    }

    pub fn owns(&self, claim: &PartitionClaim) -> bool {
        self.tasks.contains_key(claim)
    }

    pub fn state(&self, claim: &PartitionClaim) -> ClaimState {
        self.registry.state(claim)
    }

    pub fn has_backlog(&self) -> bool {
        self.tasks.values().any(|task| !task.backlog.is_empty())
    }

    pub async fn handle_rebalance(&mut self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(claims) => self.assign(claims).await,
            RebalanceEvent::Revoked(claims) => self.revoke(claims).await,
            RebalanceEvent::Error(reason) => {
                // librdkafka drops the whole assignment after a rebalance error
                warn!("Rebalance error, releasing every claim: {}", reason);
                let mut claims: Vec<_> = self.tasks.keys().cloned().collect();
                for claim in self.registry.active() {
                    if !claims.contains(&claim) {
                        claims.push(claim);
                    }
                }
                self.revoke(claims).await;
            }
        }

        metrics::set_active_claims(self.registry.active_count());
    }

    async fn assign(&mut self, claims: Vec<PartitionClaim>) {
        let mut claimed = Vec::with_capacity(claims.len());
        for claim in claims {
            // Still held from a previous generation: release it before claiming again
            if self.tasks.contains_key(&claim) || self.registry.state(&claim).is_active() {
                self.revoke(vec![claim.clone()]).await;
            }
            if self.registry.transition(&claim, ClaimState::Claimed).is_ok() {
                claimed.push(claim);
            }
        }
        if claimed.is_empty() {
            return;
        }

        self.handler.setup(&claimed).await;

        for claim in claimed {
            let (records_tx, records_rx) = mpsc::channel(self.claim_buffer);
            let (control_tx, control_rx) = watch::channel(ClaimControl::Active);
            lock_controls(&self.controls).insert(claim.clone(), control_tx);

            let handler = self.handler.clone();
            let committer = self.committer.clone();
            let task_claim = claim.clone();
            let handle = tokio::spawn(async move {
                handler
                    .consume_claim(task_claim, records_rx, committer, control_rx)
                    .await
            });

            let _ = self.registry.transition(&claim, ClaimState::Consuming);
            self.tasks.insert(
                claim,
                PartitionTask {
                    records: records_tx,
                    handle,
                    backlog: VecDeque::new(),
                },
            );
        }
    }

    async fn revoke(&mut self, claims: Vec<PartitionClaim>) {
        let mut released = Vec::with_capacity(claims.len());
        for claim in claims {
            if let Some(control) = lock_controls(&self.controls).remove(&claim) {
                let _ = control.send(ClaimControl::Revoked);
            }
            if let Some(task) = self.tasks.remove(&claim) {
                if !task.backlog.is_empty() {
                    debug!(claim = %claim, dropped = task.backlog.len(), "Discarding backlog of revoked claim");
                }
                drop(task.records);
                match task.handle.await {
                    Ok(exit) => debug!(claim = %claim, ?exit, "Partition task joined"),
                    Err(e) => error!(claim = %claim, "Partition task panicked: {}", e),
                }
            }
            if self.registry.state(&claim).is_active()
                && self.registry.transition(&claim, ClaimState::Revoked).is_ok()
            {
                released.push(claim);
            }
        }
        if !released.is_empty() {
            self.handler.cleanup(&released).await;
        }
    }

    /// Hand `record` to its partition task without waiting.
    pub fn route(&mut self, record: LogRecord) -> Routed {
        let claim = record.claim();
        let Some(task) = self.tasks.get_mut(&claim) else {
            // Not ours (anymore); the owner will read it from the committed offset
            debug!(claim = %claim, offset = record.offset, "Dropping record for unowned partition");
            return Routed::Dropped;
        };

        if !task.backlog.is_empty() {
            task.backlog.push_back(record);
            return Routed::Queued;
        }

        match task.records.try_send(record) {
            Ok(()) => Routed::Delivered,
            Err(TrySendError::Full(record)) => {
                debug!(claim = %claim, offset = record.offset, "Partition buffer full");
                task.backlog.push_back(record);
                Routed::Backpressure(claim)
            }
            Err(TrySendError::Closed(record)) => {
                debug!(
                    claim = %claim,
                    offset = record.offset,
                    "Partition task already stopped, record left uncommitted"
                );
                Routed::Dropped
            }
        }
    }

    /// Move backlogged records into their channels. Returns the claims whose backlog emptied,
    /// which the caller can resume.
    pub fn flush_backlogs(&mut self) -> Vec<PartitionClaim> {
        let mut drained = Vec::new();
        for (claim, task) in self.tasks.iter_mut() {
            if task.backlog.is_empty() {
                continue;
            }
            while let Some(record) = task.backlog.pop_front() {
                match task.records.try_send(record) {
                    Ok(()) => {}
                    Err(TrySendError::Full(record)) => {
                        task.backlog.push_front(record);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        task.backlog.clear();
                        break;
                    }
                }
            }
            if task.backlog.is_empty() {
                drained.push(claim.clone());
            }
        }
        drained
    }

    /// Stop every task, wait for all of them, then commit synchronously.
    pub async fn drain(mut self) {
        info!("Draining {} partition tasks", self.tasks.len());
        signal_all(&self.controls, ClaimControl::Shutdown);

        let (claims, handles): (Vec<_>, Vec<_>) = self
            .tasks
            .drain()
            .map(|(claim, task)| {
                drop(task.records);
                (claim, task.handle)
            })
            .unzip();
        for (claim, joined) in claims.iter().zip(join_all(handles).await) {
            match joined {
                Ok(exit) => debug!(claim = %claim, ?exit, "Partition task joined"),
                Err(e) => error!(claim = %claim, "Partition task panicked: {}", e),
            }
        }

        let mut closed = Vec::new();
        for claim in self.registry.active() {
            if self.registry.transition(&claim, ClaimState::Closed).is_ok() {
                closed.push(claim);
            }
        }
        if !closed.is_empty() {
            self.handler.cleanup(&closed).await;
        }
        metrics::set_active_claims(0);

        match self.committer.flush() {
            Ok(()) => info!("Final offset commit completed"),
            Err(e) => {
                error!("Final offset commit failed: {}", e);
                metrics::record_offset_commit_failure();
            }
        }

        lock_controls(&self.controls).clear();
    }
}
