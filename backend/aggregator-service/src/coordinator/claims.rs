use std::collections::HashMap;
use tracing::{debug, warn};

use super::{CoordinatorError, PartitionClaim};

/// Ownership state of one partition on this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unassigned,
    Claimed,
    Consuming,
    Revoked,
    Closed,
}

impl ClaimState {
    pub fn can_transition_to(self, next: ClaimState) -> bool {
        use ClaimState::*;
        matches!(
            (self, next),
            (Unassigned, Claimed)
                | (Claimed, Consuming)
                | (Claimed, Revoked)
                | (Claimed, Closed)
                | (Consuming, Revoked)
                | (Consuming, Closed)
                | (Revoked, Claimed)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, ClaimState::Claimed | ClaimState::Consuming)
    }
}

/// Per-partition state machine for the claims this replica has seen.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    states: HashMap<PartitionClaim, ClaimState>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, claim: &PartitionClaim) -> ClaimState {
        self.states
            .get(claim)
            .copied()
            .unwrap_or(ClaimState::Unassigned)
    }

    /// Move `claim` to `to`, returning the previous state.
    pub fn transition(
        &mut self,
        claim: &PartitionClaim,
        to: ClaimState,
    ) -> Result<ClaimState, CoordinatorError> {
        let from = self.state(claim);
        if !from.can_transition_to(to) {
            warn!(claim = %claim, ?from, ?to, "Rejected claim transition");
            return Err(CoordinatorError::InvalidTransition {
                claim: claim.clone(),
                from,
                to,
            });
        }

        debug!(claim = %claim, ?from, ?to, "Claim transition");
        self.states.insert(claim.clone(), to);
        Ok(from)
    }

    /// Claims currently owned (claimed or consuming), sorted.
    pub fn active(&self) -> Vec<PartitionClaim> {
        let mut claims: Vec<_> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_active())
            .map(|(claim, _)| claim.clone())
            .collect();
        claims.sort();
        claims
    }

    pub fn active_count(&self) -> usize {
        self.states.values().filter(|s| s.is_active()).count()
    }
}
