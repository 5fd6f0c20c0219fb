//! Raft -- peer-peer messaging.

use std::cmp;

use super::*;

use crate::utils::QuorumsetError;

// RaftReplica peer-peer messages handling
impl RaftReplica {
    /// Sends one replication message to the given follower: the pending log
    /// suffix starting at its `next_slot`, or a snapshot if that slot has
    /// been absorbed into the compacted prefix.
    pub(super) fn send_append_entries(
        &mut self,
        peer: ReplicaId,
    ) -> Result<(), QuorumsetError> {
        let last_slot = self.start_slot + self.log.len() - 1;
        let next = cmp::min(self.next_slot[&peer], last_slot + 1);

        if next <= self.start_slot {
            // follower's pending slot lies in the snapshotted prefix
            self.transport_hub.send_msg(
                PeerMsg::InstallSnapshot {
                    term: self.curr_term,
                    last_incl_slot: self.start_slot,
                    last_incl_term: self.log[0].term,
                    data: self.snapshot.clone(),
                },
                peer,
            )?;
            pf_trace!(self.id; "sent InstallSnapshot -> {} at slot {} term {}",
                               peer, self.start_slot, self.log[0].term);
        } else {
            let prev_slot = next - 1;
            let prev_term = self.log[prev_slot - self.start_slot].term;
            let entries: Vec<LogEntry> =
                self.log[(next - self.start_slot)..].to_vec();

            if !entries.is_empty() {
                pf_trace!(self.id; "sent AppendEntries -> {} with slots {} - {}",
                                   peer, next, last_slot);
            }
            self.transport_hub.send_msg(
                PeerMsg::AppendEntries {
                    term: self.curr_term,
                    prev_slot,
                    prev_term,
                    entries,
                    leader_commit: self.last_commit,
                },
                peer,
            )?;
        }

        Ok(())
    }

    /// Scans for newly commitable slots after a `match_slot` update. An entry
    /// is declared committed only once a majority stores it AND its term is
    /// the current term; entries of older terms ride along implicitly
    /// (Raft paper section 5.4.2).
    pub(super) fn advance_commit_index(&mut self) -> Result<(), QuorumsetError> {
        let mut new_commit = self.last_commit;
        for slot in (self.last_commit + 1)..(self.start_slot + self.log.len()) {
            if self.log[slot - self.start_slot].term != self.curr_term {
                continue; // cannot decide commit using non-latest term
            }

            let match_cnt = 1 + self
                .match_slot
                .values()
                .filter(|&&s| s >= slot)
                .count() as u8;
            if match_cnt >= self.quorum_cnt {
                new_commit = slot;
            }
        }

        if new_commit > self.last_commit {
            pf_debug!(self.id; "advancing commit index -> {}", new_commit);
            self.last_commit = new_commit;
            self.deliver_committed()?;
        }

        Ok(())
    }

    /// Handler of AppendEntries message from leader.
    async fn handle_msg_append_entries(
        &mut self,
        leader: ReplicaId,
        term: Term,
        prev_slot: usize,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: usize,
    ) -> Result<(), QuorumsetError> {
        if !entries.is_empty() {
            pf_trace!(self.id; "received AppendEntries <- {} for slots {} - {} term {}",
                               leader, prev_slot + 1,
                               prev_slot + entries.len(), term);
        }
        self.check_term(term).await?;

        // reply false if term smaller than mine
        if term < self.curr_term {
            self.transport_hub.send_msg(
                PeerMsg::AppendEntriesReply {
                    term: self.curr_term,
                    end_slot: prev_slot + entries.len(),
                    conflict: Some((0, self.start_slot + self.log.len())),
                },
                leader,
            )?;
            pf_trace!(self.id; "sent AppendEntriesReply -> {} term {} stale",
                               leader, self.curr_term);
            return Ok(()); // do not touch my election timer
        }

        // a candidate that sees an AppendEntries of its own term promptly
        // obeys the already-elected leader
        if self.role == Role::Candidate {
            self.role = Role::Follower;
            self.publish_state()?;
        }

        // update my knowledge of who's the current leader, and reset
        // election timeout timer
        self.leader = Some(leader);
        self.heard_heartbeat(leader)?;

        let last_slot = self.start_slot + self.log.len() - 1;

        // reply false if my log does not contain an entry at prev_slot
        // matching prev_term; include a conflict hint so the leader can jump
        // back more than one slot per round
        if prev_slot < self.start_slot || prev_slot > last_slot {
            // prefix compacted away, or log too short: hint where my log
            // actually ends (or where my snapshot begins)
            let hint_slot = if prev_slot < self.start_slot {
                self.start_slot + 1
            } else {
                last_slot + 1
            };
            self.transport_hub.send_msg(
                PeerMsg::AppendEntriesReply {
                    term: self.curr_term,
                    end_slot: prev_slot + entries.len(),
                    conflict: Some((0, hint_slot)),
                },
                leader,
            )?;
            pf_trace!(self.id; "sent AppendEntriesReply -> {} term {} hint {} fail",
                               leader, self.curr_term, hint_slot);
            return Ok(());
        }
        if self.log[prev_slot - self.start_slot].term != prev_term {
            // conflicting term at prev_slot: hint that term and the first
            // slot carrying it so the leader can skip the whole term
            let conflict_term = self.log[prev_slot - self.start_slot].term;
            let mut conflict_slot = prev_slot;
            while conflict_slot > self.start_slot + 1
                && self.log[conflict_slot - 1 - self.start_slot].term
                    == conflict_term
            {
                conflict_slot -= 1;
            }
            self.transport_hub.send_msg(
                PeerMsg::AppendEntriesReply {
                    term: self.curr_term,
                    end_slot: prev_slot + entries.len(),
                    conflict: Some((conflict_term, conflict_slot)),
                },
                leader,
            )?;
            pf_trace!(self.id; "sent AppendEntriesReply -> {} term {} conflict {} @ {} fail",
                               leader, self.curr_term, conflict_term, conflict_slot);
            return Ok(());
        }

        // walk the incoming suffix to find the first slot where terms
        // disagree. Entries already matching are left untouched: a shorter
        // re-delivery of an older prefix must never truncate committed state
        let num_entries = entries.len();
        let mut truncated = false;
        let mut first_new = prev_slot + 1 + num_entries;
        for (slot, new_entry) in entries
            .iter()
            .enumerate()
            .map(|(s, e)| (s + prev_slot + 1, e))
        {
            if slot > last_slot {
                first_new = slot;
                break;
            } else if self.log[slot - self.start_slot].term != new_entry.term {
                // conflict: truncate my log here
                self.log.truncate(slot - self.start_slot);
                truncated = true;
                first_new = slot;
                break;
            }
        }

        // append the remaining new entries, if any, and persist
        let num_appended = prev_slot + 1 + num_entries - first_new;
        if num_appended > 0 {
            let keep = num_entries - num_appended;
            self.log.extend(entries.into_iter().skip(keep));
        }
        if truncated || num_appended > 0 {
            self.persist_state().await?;
        }
        let end_slot = prev_slot + num_entries;

        // reply success; an empty-entries heartbeat is acknowledged the same
        // way as a reverse heartbeat for peer health tracking
        self.transport_hub.send_msg(
            PeerMsg::AppendEntriesReply {
                term: self.curr_term,
                end_slot,
                conflict: None,
            },
            leader,
        )?;

        // if leader_commit is larger than my last_commit, update last_commit
        // and hand newly committed entries to the applier
        if leader_commit > self.last_commit {
            let new_last_slot = self.start_slot + self.log.len() - 1;
            let new_commit = cmp::min(leader_commit, new_last_slot);
            if new_commit > self.last_commit {
                self.last_commit = new_commit;
                self.deliver_committed()?;
            }
        }

        Ok(())
    }

    /// Handler of AppendEntries reply from follower.
    async fn handle_msg_append_entries_reply(
        &mut self,
        peer: ReplicaId,
        term: Term,
        end_slot: usize,
        conflict: Option<(Term, usize)>,
    ) -> Result<(), QuorumsetError> {
        if self.check_term(term).await? || self.role != Role::Leader {
            return Ok(());
        }
        if term < self.curr_term {
            return Ok(()); // stale reply from an old term of mine
        }
        self.heard_heartbeat(peer)?;

        match conflict {
            None => {
                // success: ratchet up next_slot and match_slot for follower.
                // Replies are self-correlating through end_slot, so a stale
                // or reordered reply can never move progress backwards
                if end_slot + 1 > self.next_slot[&peer] {
                    *self.next_slot.get_mut(&peer).unwrap() = end_slot + 1;
                }
                if end_slot > self.match_slot[&peer] {
                    *self.match_slot.get_mut(&peer).unwrap() = end_slot;
                    pf_trace!(self.id; "received AppendEntriesReply <- {} term {} end {} ok",
                                       peer, term, end_slot);

                    // some match_slot was updated; check if any additional
                    // entries are now committed
                    self.advance_commit_index()?;
                }
            }

            Some((conflict_term, conflict_slot)) => {
                // failed: adjust next_slot for the follower and retry
                pf_trace!(self.id; "received AppendEntriesReply <- {} term {} conflict {} @ {}",
                                   peer, term, conflict_term, conflict_slot);
                let next = if conflict_term == 0 {
                    // the follower's log ends before prev_slot, or its own
                    // snapshot starts after it; jump straight to its hint
                    // (possibly forward, when its snapshot is ahead of mine)
                    cmp::max(1, conflict_slot)
                } else {
                    // conflicting term at prev_slot: bypass all entries of
                    // that term in one round
                    if self.next_slot[&peer] <= 1 {
                        return Ok(()); // cannot move backward any more
                    }
                    let mut next = self.next_slot[&peer] - 1;
                    while next > 1
                        && next > self.start_slot
                        && next >= conflict_slot
                        && next - self.start_slot < self.log.len()
                        && self.log[next - self.start_slot].term
                            == conflict_term
                    {
                        next -= 1;
                    }
                    next
                };
                *self.next_slot.get_mut(&peer).unwrap() = next;

                // retry immediately instead of waiting a full heartbeat
                self.send_append_entries(peer)?;
            }
        }

        Ok(())
    }

    /// Handler of RequestVote message from candidate.
    async fn handle_msg_request_vote(
        &mut self,
        candidate: ReplicaId,
        term: Term,
        last_slot: usize,
        last_term: Term,
    ) -> Result<(), QuorumsetError> {
        pf_trace!(self.id; "received RequestVote <- {} with term {} last {} term {}",
                           candidate, term, last_slot, last_term);
        self.check_term(term).await?;

        // if the given term is smaller than mine, reply false without
        // touching my election timer
        if term < self.curr_term {
            self.transport_hub.send_msg(
                PeerMsg::RequestVoteReply {
                    term: self.curr_term,
                    granted: false,
                },
                candidate,
            )?;
            pf_trace!(self.id; "sent RequestVoteReply -> {} term {} false",
                               candidate, self.curr_term);
            return Ok(());
        }

        // grant iff I did not vote for anyone else in my current term and
        // the candidate's log is at least as up-to-date as mine
        let my_last_slot = self.start_slot + self.log.len() - 1;
        let my_last_term = self.log[my_last_slot - self.start_slot].term;
        let can_vote =
            self.voted_for.is_none() || self.voted_for == Some(candidate);
        let up_to_date = last_term > my_last_term
            || (last_term == my_last_term && last_slot >= my_last_slot);

        if can_vote && up_to_date {
            // update voted_for and make the field durable before replying
            if self.voted_for != Some(candidate) {
                self.voted_for = Some(candidate);
                self.persist_state().await?;
            }

            self.transport_hub.send_msg(
                PeerMsg::RequestVoteReply {
                    term: self.curr_term,
                    granted: true,
                },
                candidate,
            )?;
            pf_trace!(self.id; "sent RequestVoteReply -> {} term {} granted",
                               candidate, self.curr_term);

            // granting a vote counts as hearing from a live peer; hold off
            // my own candidacy for a while
            self.heard_heartbeat(candidate)?;
        } else {
            self.transport_hub.send_msg(
                PeerMsg::RequestVoteReply {
                    term: self.curr_term,
                    granted: false,
                },
                candidate,
            )?;
            pf_trace!(self.id; "sent RequestVoteReply -> {} term {} false",
                               candidate, self.curr_term);
        }

        Ok(())
    }

    /// Handler of RequestVote reply from peer.
    async fn handle_msg_request_vote_reply(
        &mut self,
        peer: ReplicaId,
        term: Term,
        granted: bool,
    ) -> Result<(), QuorumsetError> {
        pf_trace!(self.id; "received RequestVoteReply <- {} with term {} {}",
                           peer, term,
                           if granted { "granted" } else { "false" });
        if self.check_term(term).await? || self.role != Role::Candidate {
            return Ok(());
        }
        if term < self.curr_term {
            return Ok(()); // reply from a superseded election of mine
        }

        if granted {
            // bookkeep this vote; a majority of grants wins the election
            self.votes_granted.set(peer, true)?;
            if self.votes_granted.count() >= self.quorum_cnt {
                self.become_the_leader()?;
            }
        } else {
            // a majority of explicit denials loses it; revert to follower
            // in the same term and wait for the winner's heartbeat
            self.votes_denied.set(peer, true)?;
            if self.votes_denied.count() >= self.quorum_cnt {
                pf_info!(self.id; "election lost with term {}", self.curr_term);
                self.role = Role::Follower;
                self.publish_state()?;
            }
        }

        Ok(())
    }

    /// Synthesized handler of receiving message from peer.
    pub(super) async fn handle_msg_recv(
        &mut self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<(), QuorumsetError> {
        if peer == self.id || peer >= self.population {
            pf_warn!(self.id; "ignoring message from invalid peer {}", peer);
            return Ok(());
        }

        match msg {
            PeerMsg::AppendEntries {
                term,
                prev_slot,
                prev_term,
                entries,
                leader_commit,
            } => {
                self.handle_msg_append_entries(
                    peer,
                    term,
                    prev_slot,
                    prev_term,
                    entries,
                    leader_commit,
                )
                .await
            }
            PeerMsg::AppendEntriesReply {
                term,
                end_slot,
                conflict,
            } => {
                self.handle_msg_append_entries_reply(
                    peer, term, end_slot, conflict,
                )
                .await
            }
            PeerMsg::RequestVote {
                term,
                last_slot,
                last_term,
            } => {
                self.handle_msg_request_vote(peer, term, last_slot, last_term)
                    .await
            }
            PeerMsg::RequestVoteReply { term, granted } => {
                self.handle_msg_request_vote_reply(peer, term, granted).await
            }
            PeerMsg::InstallSnapshot {
                term,
                last_incl_slot,
                last_incl_term,
                data,
            } => {
                self.handle_msg_install_snapshot(
                    peer,
                    term,
                    last_incl_slot,
                    last_incl_term,
                    data,
                )
                .await
            }
            PeerMsg::InstallSnapshotReply {
                term,
                last_incl_slot,
            } => {
                self.handle_msg_install_snapshot_reply(
                    peer,
                    term,
                    last_incl_slot,
                )
                .await
            }
        }
    }
}
