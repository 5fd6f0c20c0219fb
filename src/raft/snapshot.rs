//! Raft -- snapshotting & log compaction.

use super::*;

use crate::utils::QuorumsetError;

// RaftReplica snapshotting & log compaction logic
impl RaftReplica {
    /// Handler of the service's TakeSnapshot request: the service declares
    /// that `snapshot` covers all indices up to and including `index`, so the
    /// log prefix through `index` collapses into a fresh sentinel. Requests
    /// covering an already-compacted prefix are ignored; snapshotting past
    /// the commit index or the log end is a service protocol violation and
    /// panics, per the durable-safety policy.
    pub(super) async fn handle_take_snapshot(
        &mut self,
        index: usize,
        snapshot: Vec<u8>,
        reply: oneshot::Sender<()>,
    ) -> Result<(), QuorumsetError> {
        if index <= self.start_slot {
            let _ = reply.send(());
            return Ok(()); // more recent snapshot already in place
        }

        let last_slot = self.start_slot + self.log.len() - 1;
        if index > self.last_commit || index > last_slot {
            panic!(
                "({}) service snapshots at slot {} which is past commit {} or log end {}",
                self.id, index, self.last_commit, last_slot
            );
        }

        pf_debug!(self.id; "taking snapshot: start {} -> {} commit {}",
                           self.start_slot, index, self.last_commit);

        // the entry at `index` becomes the new sentinel, keeping only its
        // term; everything before it is dropped from memory
        self.log.drain(0..(index - self.start_slot));
        self.log[0].command.clear();
        self.start_slot = index;
        self.snapshot = snapshot;

        // combined write of trimmed state + new snapshot must be atomic
        self.persist_state_with_snapshot().await?;

        pf_info!(self.id; "took snapshot up to: start {}", self.start_slot);
        let _ = reply.send(());
        Ok(())
    }

    /// Handler of InstallSnapshot message from leader.
    pub(super) async fn handle_msg_install_snapshot(
        &mut self,
        leader: ReplicaId,
        term: Term,
        last_incl_slot: usize,
        last_incl_term: Term,
        data: Vec<u8>,
    ) -> Result<(), QuorumsetError> {
        pf_trace!(self.id; "received InstallSnapshot <- {} at slot {} term {}",
                           leader, last_incl_slot, last_incl_term);
        self.check_term(term).await?;

        // reply my term if the message is from a previous term, without
        // touching my election timer
        if term < self.curr_term {
            self.transport_hub.send_msg(
                PeerMsg::InstallSnapshotReply {
                    term: self.curr_term,
                    last_incl_slot,
                },
                leader,
            )?;
            return Ok(());
        }

        if self.role == Role::Candidate {
            self.role = Role::Follower;
            self.publish_state()?;
        }
        self.leader = Some(leader);
        self.heard_heartbeat(leader)?;

        // ignore if my own snapshot is at least as recent; the echo reply
        // still lets the leader advance its next_slot for me
        if last_incl_slot <= self.start_slot {
            self.transport_hub.send_msg(
                PeerMsg::InstallSnapshotReply {
                    term: self.curr_term,
                    last_incl_slot,
                },
                leader,
            )?;
            return Ok(());
        }

        let last_slot = self.start_slot + self.log.len() - 1;
        if last_incl_slot <= last_slot
            && self.log[last_incl_slot - self.start_slot].term
                == last_incl_term
        {
            // the snapshot is a prefix of my log; keep the consistent tail
            // (it agrees by Log Matching) and collapse the covered entries
            // into the sentinel
            self.log.drain(0..(last_incl_slot - self.start_slot));
            self.log[0].command.clear();
        } else {
            // my log conflicts with or falls behind the snapshot entirely;
            // discard it all
            self.log = vec![LogEntry::sentinel(last_incl_term)];
        }
        self.start_slot = last_incl_slot;

        // the snapshot's prefix is by definition committed
        if self.last_commit < self.start_slot {
            self.last_commit = self.start_slot;
        }
        self.snapshot = data;

        // atomically persist trimmed state + snapshot bytes, then hand the
        // snapshot to the applier
        self.persist_state_with_snapshot().await?;
        self.deliver_snapshot()?;

        pf_info!(self.id; "installed snapshot <- {} up to: start {}",
                          leader, self.start_slot);

        self.transport_hub.send_msg(
            PeerMsg::InstallSnapshotReply {
                term: self.curr_term,
                last_incl_slot,
            },
            leader,
        )?;
        Ok(())
    }

    /// Handler of InstallSnapshot reply from follower.
    pub(super) async fn handle_msg_install_snapshot_reply(
        &mut self,
        peer: ReplicaId,
        term: Term,
        last_incl_slot: usize,
    ) -> Result<(), QuorumsetError> {
        if self.check_term(term).await? || self.role != Role::Leader {
            return Ok(());
        }
        if term < self.curr_term {
            return Ok(()); // stale reply from an old term of mine
        }
        self.heard_heartbeat(peer)?;

        // the follower now covers everything through the snapshot; resume
        // AppendEntries from the slot after it. The snapshotted prefix is
        // committed, so counting it as matched is sound
        if last_incl_slot + 1 > self.next_slot[&peer] {
            *self.next_slot.get_mut(&peer).unwrap() = last_incl_slot + 1;
        }
        if last_incl_slot > self.match_slot[&peer] {
            *self.match_slot.get_mut(&peer).unwrap() = last_incl_slot;
        }
        pf_trace!(self.id; "received InstallSnapshotReply <- {} at slot {}",
                           peer, last_incl_slot);

        Ok(())
    }
}
