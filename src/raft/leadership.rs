//! Raft -- leader election.

use super::*;

use crate::utils::QuorumsetError;

use rand::prelude::*;

// RaftReplica leader election timeout logic
impl RaftReplica {
    /// Checks if the given term is larger than mine. If so, adopts the term,
    /// clears my vote and leader knowledge, persists the two critical fields,
    /// and converts my role back to follower. Returns true if my role was not
    /// follower but is now converted to follower, and false otherwise.
    pub(super) async fn check_term(
        &mut self,
        term: Term,
    ) -> Result<bool, QuorumsetError> {
        if term > self.curr_term {
            self.curr_term = term;
            self.voted_for = None;
            self.leader = None;
            self.votes_granted.clear();
            self.votes_denied.clear();

            // make the two critical fields durable before acting on the
            // new term in any way
            self.persist_state().await?;

            // refresh heartbeat hearing timer
            self.kickoff_hb_hear_timer()?;

            let was_follower = self.role == Role::Follower;
            self.role = Role::Follower;
            self.publish_state()?;
            if !was_follower {
                pf_info!(self.id; "converted back to follower at term {}",
                                  self.curr_term);
            }
            Ok(!was_follower)
        } else {
            Ok(false)
        }
    }

    /// If the current leader times out, becomes a candidate and starts a new
    /// election. Also fires for a candidate whose previous election stalled,
    /// restarting the candidacy with a fresh term.
    pub(super) async fn become_a_candidate(
        &mut self,
    ) -> Result<(), QuorumsetError> {
        if self.role == Role::Leader {
            return Ok(());
        }
        self.role = Role::Candidate;
        self.leader = None;

        // increment current term and vote for myself
        self.curr_term += 1;
        self.voted_for = Some(self.id);
        self.votes_granted.clear();
        self.votes_granted.set(self.id, true)?;
        self.votes_denied.clear();
        pf_info!(self.id; "starting election with term {}...", self.curr_term);

        // make the two critical fields durable before soliciting votes
        self.persist_state().await?;
        self.publish_state()?;

        // reset election timeout timer
        self.kickoff_hb_hear_timer()?;

        // a cluster of one is its own majority
        if self.votes_granted.count() >= self.quorum_cnt {
            return self.become_the_leader();
        }

        // broadcast RequestVote to all other peers
        let last_slot = self.start_slot + self.log.len() - 1;
        let last_term = self.log[last_slot - self.start_slot].term;
        self.transport_hub.bcast_msg(PeerMsg::RequestVote {
            term: self.curr_term,
            last_slot,
            last_term,
        })?;
        pf_trace!(self.id; "broadcast RequestVote with term {} last {} term {}",
                           self.curr_term, last_slot, last_term);

        Ok(())
    }

    /// Becomes the leader after enough votes granted to me.
    pub(super) fn become_the_leader(&mut self) -> Result<(), QuorumsetError> {
        pf_info!(self.id; "elected to be leader with term {}", self.curr_term);
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.publish_state()?;

        // re-initialize next_slot and match_slot information. A fresh leader
        // never rewrites its own log; reconciliation happens through the
        // AppendEntries consistency checks
        for slot in self.next_slot.values_mut() {
            *slot = self.start_slot + self.log.len();
        }
        for slot in self.match_slot.values_mut() {
            *slot = self.start_slot;
        }

        // clear peers' heartbeat reply counters, and broadcast a round now
        self.clear_reply_cnts();
        self.bcast_entries()?;

        Ok(())
    }

    /// Sends a replication round to all peers: a log suffix (possibly empty,
    /// the plain heartbeat case) to each follower, or a snapshot to any
    /// follower that has fallen behind the compacted prefix.
    pub(super) fn bcast_entries(&mut self) -> Result<(), QuorumsetError> {
        for peer in 0..self.population {
            if peer == self.id {
                continue;
            }
            self.send_append_entries(peer)?;
        }

        // update max heartbeat reply counters and their repetitions seen,
        // and peers' liveness status accordingly
        self.update_bcast_cnts()?;

        // I also heard this heartbeat from myself
        self.heard_heartbeat(self.id)?;

        Ok(())
    }

    /// Heard a heartbeat-equivalent from some replica. Resets election timer.
    pub(super) fn heard_heartbeat(
        &mut self,
        peer: ReplicaId,
    ) -> Result<(), QuorumsetError> {
        if peer != self.id {
            // update the peer's reply cnt and its liveness status accordingly
            self.update_heard_cnt(peer)?;
        }

        // reset hearing timer
        self.kickoff_hb_hear_timer()?;

        Ok(())
    }

    /// Chooses a random timeout from the min-max range and kicks off the
    /// heartbeat hearing timer.
    pub(super) fn kickoff_hb_hear_timer(&mut self) -> Result<(), QuorumsetError> {
        if self.config.disable_hb_timer {
            return Ok(());
        }
        let timeout_ms = thread_rng().gen_range(
            self.config.hb_hear_timeout_min..=self.config.hb_hear_timeout_max,
        );
        self.hb_hear_timer
            .kickoff(Duration::from_millis(timeout_ms))?;
        Ok(())
    }

    /// Clears peers' heartbeat reply counter statistics.
    pub(super) fn clear_reply_cnts(&mut self) {
        for cnts in self.hb_reply_cnts.values_mut() {
            *cnts = (1, 0, 0);
        }
    }

    /// Called upon each broadcast; updates peers' max heartbeat reply
    /// counters and their repetitions seen, and speculates peer deaths.
    /// This tracking is observability only, never consulted for safety.
    pub(super) fn update_bcast_cnts(&mut self) -> Result<(), QuorumsetError> {
        let repeat_threshold = (self.config.hb_hear_timeout_min
            / self.config.hb_send_interval_ms)
            as u8;

        for (&peer, cnts) in self.hb_reply_cnts.iter_mut() {
            if cnts.0 > cnts.1 {
                // more replies have been received from this peer; it is
                // probably alive
                cnts.1 = cnts.0;
                cnts.2 = 0;
            } else {
                // did not hear from this peer since my last broadcast;
                // increment repetition count
                cnts.2 += 1;
                if cnts.2 > repeat_threshold {
                    if self.peer_alive.get(peer)? {
                        self.peer_alive.set(peer, false)?;
                        pf_info!(self.id; "peer_alive updated: {:?}",
                                          self.peer_alive);
                    }
                    cnts.2 = 0;
                }
            }
        }

        Ok(())
    }

    /// Called upon each hearing; updates a peer's heard counter and
    /// speculates the peer being back up.
    pub(super) fn update_heard_cnt(
        &mut self,
        peer: ReplicaId,
    ) -> Result<(), QuorumsetError> {
        if let Some(cnts) = self.hb_reply_cnts.get_mut(&peer) {
            cnts.0 += 1;

            if !self.peer_alive.get(peer)? {
                self.peer_alive.set(peer, true)?;
                pf_info!(self.id; "peer_alive updated: {:?}", self.peer_alive);
            }

            Ok(())
        } else {
            logged_err!(self.id; "peer {} not found in hb_reply_cnts", peer)
        }
    }
}
