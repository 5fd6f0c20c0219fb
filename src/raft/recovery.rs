//! Raft -- recovery from durable storage.

use super::*;

use crate::server::{StoreAction, StoreResult};
use crate::utils::QuorumsetError;

// RaftReplica recovery from durable storage
impl RaftReplica {
    /// Recovers state from the durable backer file, called once at the start
    /// of `run()`. On a fresh backer, writes out the initial image with a
    /// zero-term sentinel instead.
    pub(super) async fn recover_from_store(
        &mut self,
    ) -> Result<(), QuorumsetError> {
        debug_assert!(self.log.is_empty());

        match self
            .storage_hub
            .do_sync_action(
                0, // using 0 as dummy store action ID
                StoreAction::Load,
            )
            .await?
        {
            StoreResult::Load {
                state: Some(state),
                snapshot,
            } => {
                if state.log.is_empty() {
                    return logged_err!(
                        self.id;
                        "corrupted persistent image: no sentinel entry"
                    );
                }

                self.curr_term = state.curr_term;
                self.voted_for = state.voted_for;
                self.start_slot = state.start_slot;
                self.log = state.log;
                self.snapshot = snapshot.unwrap_or_default();

                // everything up to the snapshotted prefix is by definition
                // committed. The restarted service rebuilds its image from
                // the snapshot, so that is its first delivery
                self.last_commit = self.start_slot;
                self.last_exec = 0;
                self.deliver_snapshot()?;

                pf_info!(self.id; "recovered from storage: term {} voted {:?} |log| {} start {}",
                                  self.curr_term, self.voted_for,
                                  self.log.len(), self.start_slot);
            }

            StoreResult::Load { state: None, .. } => {
                // backer file is empty: bootstrap with the zero sentinel and
                // make the initial image durable
                self.log.push(LogEntry::sentinel(0));
                self.persist_state().await?;
            }

            _ => {
                return logged_err!(self.id; "unexpected store result type for load");
            }
        }

        self.publish_state()?;
        Ok(())
    }
}
