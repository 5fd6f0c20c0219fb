//! Raft -- service request entrance.

use super::*;

use crate::utils::QuorumsetError;

// RaftReplica service requests entrance
impl RaftReplica {
    /// Handler of a command submission from the service. A non-leader
    /// replies not-leader immediately; the leader appends the entry to its
    /// log, makes it durable, answers with the slot the entry will occupy if
    /// it commits, and kicks an immediate replication round.
    async fn handle_submit(
        &mut self,
        command: Vec<u8>,
        reply: oneshot::Sender<(Option<usize>, Term, bool)>,
    ) -> Result<(), QuorumsetError> {
        if self.role != Role::Leader {
            let _ = reply.send((None, self.curr_term, false));
            return Ok(());
        }

        // append entry to my own log and persist before replying
        let slot = self.start_slot + self.log.len();
        self.log.push(LogEntry {
            term: self.curr_term,
            command,
        });
        self.persist_state().await?;
        pf_debug!(self.id; "appended proposal at slot {} term {}",
                           slot, self.curr_term);

        let _ = reply.send((Some(slot), self.curr_term, true));

        // a lone replica commits on its own appends; otherwise trigger a
        // replication round right away instead of waiting for the next tick
        self.advance_commit_index()?;
        self.bcast_entries()?;

        Ok(())
    }

    /// Synthesized handler of service requests.
    pub(super) async fn handle_api_request(
        &mut self,
        req: ApiRequest,
    ) -> Result<(), QuorumsetError> {
        match req {
            ApiRequest::Submit { command, reply } => {
                self.handle_submit(command, reply).await
            }
            ApiRequest::TakeSnapshot {
                index,
                snapshot,
                reply,
            } => self.handle_take_snapshot(index, snapshot, reply).await,
        }
    }
}
