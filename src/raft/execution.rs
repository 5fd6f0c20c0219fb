//! Raft -- committed entry delivery.

use super::*;

use crate::utils::QuorumsetError;

// RaftReplica committed entry delivery to the service
impl RaftReplica {
    /// Hands all newly committed entries to the applier queue in slot order
    /// and advances `last_exec`.
    pub(super) fn deliver_committed(&mut self) -> Result<(), QuorumsetError> {
        while self.last_exec < self.last_commit {
            let slot = self.last_exec + 1;
            let entry = &self.log[slot - self.start_slot];
            self.tx_deliver
                .send(ApplyMsg::Entry {
                    index: slot,
                    term: entry.term,
                    command: entry.command.clone(),
                })
                .map_err(QuorumsetError::msg)?;
            self.last_exec = slot;
            pf_trace!(self.id; "delivered entry at slot {}", slot);
        }

        Ok(())
    }

    /// Hands the freshly installed snapshot to the applier queue, unless
    /// deliveries have already progressed past it. Ordered strictly before
    /// any later entry delivery by virtue of the single applier queue.
    pub(super) fn deliver_snapshot(&mut self) -> Result<(), QuorumsetError> {
        if self.last_exec < self.start_slot {
            self.tx_deliver
                .send(ApplyMsg::Snapshot {
                    index: self.start_slot,
                    term: self.log[0].term,
                    data: self.snapshot.clone(),
                })
                .map_err(QuorumsetError::msg)?;
            self.last_exec = self.start_slot;
            pf_debug!(self.id; "delivered snapshot at slot {}", self.start_slot);
        }

        Ok(())
    }

    /// Applier task function: forwards queued notifications to the service's
    /// apply channel, absorbing its backpressure so the event loop never
    /// blocks on a slow service.
    pub(super) async fn applier_task(
        me: ReplicaId,
        mut rx_deliver: mpsc::UnboundedReceiver<ApplyMsg>,
        tx_apply: mpsc::Sender<ApplyMsg>,
    ) {
        pf_debug!(me; "applier task spawned");

        while let Some(msg) = rx_deliver.recv().await {
            if tx_apply.send(msg).await.is_err() {
                pf_warn!(me; "service dropped the apply channel");
                break;
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "applier task exited");
    }
}
