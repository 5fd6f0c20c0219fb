//! Raft -- persistent state durability.

use super::*;

use crate::server::{StoreAction, StoreResult};
use crate::utils::QuorumsetError;

// RaftReplica durable state persistence
impl RaftReplica {
    /// Composes the durable image of my hard state. The log vector includes
    /// the sentinel, which carries the snapshot's last included term.
    fn hard_state(&self) -> DurableState {
        DurableState {
            curr_term: self.curr_term,
            voted_for: self.voted_for,
            start_slot: self.start_slot,
            log: self.log.clone(),
        }
    }

    /// Persists my hard state, completing before return. Every reply whose
    /// correctness depends on a state mutation must be preceded by a call
    /// to this (or to `persist_state_with_snapshot`).
    pub(super) async fn persist_state(&mut self) -> Result<(), QuorumsetError> {
        let state = self.hard_state();
        match self
            .storage_hub
            .do_sync_action(
                0, // using 0 as dummy store action ID
                StoreAction::Save {
                    state,
                    sync: self.config.logger_sync,
                },
            )
            .await?
        {
            StoreResult::Save => Ok(()),
            _ => logged_err!(self.id; "unexpected store result type for save"),
        }
    }

    /// Persists my hard state together with the current snapshot blob as one
    /// atomic combined write.
    pub(super) async fn persist_state_with_snapshot(
        &mut self,
    ) -> Result<(), QuorumsetError> {
        let state = self.hard_state();
        let snapshot = self.snapshot.clone();
        match self
            .storage_hub
            .do_sync_action(
                0, // using 0 as dummy store action ID
                StoreAction::SaveWithSnapshot {
                    state,
                    snapshot,
                    sync: self.config.logger_sync,
                },
            )
            .await?
        {
            StoreResult::SaveWithSnapshot => Ok(()),
            _ => logged_err!(
                self.id;
                "unexpected store result type for save with snapshot"
            ),
        }
    }
}
