//! Raft consensus replica core.
//!
//! ATC '14 version of Raft. References:
//!   - <https://raft.github.io/raft.pdf>
//!   - <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//!
//! The co-located service submits opaque commands through a `RaftHandle` and
//! observes committed commands, in index order, on the apply channel it
//! passed in at construction. Peer replicas talk to each other through the
//! transport hub; durability goes through the storage hub.

mod durability;
mod execution;
mod leadership;
mod messages;
mod recovery;
mod request;
mod snapshot;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::server::{ReplicaId, StorageHub, TransportHub};
use crate::utils::{Bitmap, QuorumsetError, Timer};

use bincode::{Decode, Encode};

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Interval, MissedTickBehavior};

/// Term number type, defined for better code readability.
pub type Term = u64;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Path to backing store file.
    pub backer_path: String,

    /// Whether to call `fsync()`/`fdatasync()` on the backer file.
    pub logger_sync: bool,

    /// Min timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_min: u64,
    /// Max timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_max: u64,

    /// Interval of leader sending AppendEntries heartbeats to followers.
    pub hb_send_interval_ms: u64,

    /// Disable election timeouts (to pin down roles during tests).
    pub disable_hb_timer: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            backer_path: "/tmp/quorumset.raft.store".into(),
            logger_sync: false,
            hb_hear_timeout_min: 500,
            hb_hear_timeout_max: 1000,
            hb_send_interval_ms: 50,
            disable_hb_timer: false,
        }
    }
}

/// In-mem + persistent log entry, containing a term and an opaque service
/// command. The slot at the head of the in-mem log is the sentinel covering
/// the snapshotted prefix: it carries the last included term and an empty
/// command.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Encode, Decode)]
pub(crate) struct LogEntry {
    /// Term number.
    term: Term,

    /// Service command bytes; empty for the sentinel.
    command: Vec<u8>,
}

impl LogEntry {
    /// Creates a sentinel entry of given term.
    fn sentinel(term: Term) -> Self {
        LogEntry {
            term,
            command: Vec::new(),
        }
    }
}

/// Durable hard state blob as handed to the storage hub. The log vector
/// includes the sentinel, whose term is the snapshot's last included term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DurableState {
    curr_term: Term,
    voted_for: Option<ReplicaId>,
    start_slot: usize,
    log: Vec<LogEntry>,
}

/// Replica role.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Peer-peer message type.
#[derive(Debug, Clone, Encode, Decode)]
pub(crate) enum PeerMsg {
    /// AppendEntries from leader to followers; empty `entries` is the plain
    /// heartbeat case.
    AppendEntries {
        term: Term,
        prev_slot: usize,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: usize,
    },

    /// AppendEntries reply from follower to leader. `end_slot` echoes
    /// `prev_slot + entries.len()` of the acknowledged message. On failure,
    /// `conflict` carries `(conflict_term, conflict_slot)`; a zero
    /// `conflict_term` means the prefix was missing entirely (log too short,
    /// or already absorbed into a snapshot).
    AppendEntriesReply {
        term: Term,
        end_slot: usize,
        conflict: Option<(Term, usize)>,
    },

    /// RequestVote from candidate to all peers.
    RequestVote {
        term: Term,
        last_slot: usize,
        last_term: Term,
    },

    /// RequestVote reply from peer to candidate.
    RequestVoteReply { term: Term, granted: bool },

    /// InstallSnapshot from leader to a lagging follower.
    InstallSnapshot {
        term: Term,
        last_incl_slot: usize,
        last_incl_term: Term,
        data: Vec<u8>,
    },

    /// InstallSnapshot reply from follower to leader, echoing the offered
    /// snapshot's last included slot.
    InstallSnapshotReply { term: Term, last_incl_slot: usize },
}

/// Notification delivered to the service on the apply channel, in strictly
/// increasing index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed log entry.
    Entry {
        index: usize,
        term: Term,
        command: Vec<u8>,
    },

    /// A snapshot installed from the leader; covers all indices up to and
    /// including `index`.
    Snapshot {
        index: usize,
        term: Term,
        data: Vec<u8>,
    },
}

/// Service-side request into the replica event loop.
#[derive(Debug)]
pub(crate) enum ApiRequest {
    /// Propose a new command for replication.
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<(Option<usize>, Term, bool)>,
    },

    /// The service has taken a snapshot covering indices up to `index`;
    /// compact the log accordingly.
    TakeSnapshot {
        index: usize,
        snapshot: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
}

/// Raft replica module.
pub struct RaftReplica {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Majority quorum size.
    quorum_cnt: u8,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// StorageHub module.
    storage_hub: StorageHub<DurableState>,

    /// TransportHub module.
    transport_hub: TransportHub<PeerMsg>,

    /// Receiver side of the service request channel.
    rx_api: mpsc::UnboundedReceiver<ApiRequest>,

    /// Sender side of the service request channel, cloned into handles.
    tx_api: mpsc::UnboundedSender<ApiRequest>,

    /// Publisher of `(term, is_leader)`, read by `RaftHandle::get_state()`.
    tx_state: watch::Sender<(Term, bool)>,

    /// Kept so the state watch never closes; cloned into handles.
    rx_state: watch::Receiver<(Term, bool)>,

    /// Termination signal receiver.
    rx_kill: watch::Receiver<bool>,

    /// Termination signal sender, cloned into handles.
    tx_kill: Arc<watch::Sender<bool>>,

    /// Sender side of the applier queue.
    tx_deliver: mpsc::UnboundedSender<ApplyMsg>,

    /// Join handle of the applier task.
    _applier_handle: JoinHandle<()>,

    /// Who do I think is the effective leader of the cluster right now?
    leader: Option<ReplicaId>,

    /// My current role.
    role: Role,

    /// Timer for hearing heartbeat from leader.
    hb_hear_timer: Timer,

    /// Interval for sending heartbeat to followers.
    hb_send_interval: Interval,

    /// Heartbeat reply counters for approximate detection of follower health.
    /// Tuple of (#hb_replied, #hb_replied seen at last send, repetition).
    hb_reply_cnts: HashMap<ReplicaId, (u64, u64, u8)>,

    /// Approximate health status tracking of peer replicas.
    peer_alive: Bitmap,

    /// Latest term seen.
    curr_term: Term,

    /// Candidate ID that received my vote in current term.
    voted_for: Option<ReplicaId>,

    /// Votes granted to me in my current candidacy.
    votes_granted: Bitmap,

    /// Votes explicitly denied to me in my current candidacy.
    votes_denied: Bitmap,

    /// In-memory log of entries; offset 0 is the sentinel, so the entry at
    /// offset `k` lives at logical slot `start_slot + k`.
    log: Vec<LogEntry>,

    /// Slot index covered by the latest snapshot (sentinel's logical slot).
    start_slot: usize,

    /// Cached copy of the latest snapshot blob.
    snapshot: Vec<u8>,

    /// Slot index of highest log entry known to be committed.
    last_commit: usize,

    /// Slot index of highest log entry delivered to the service.
    last_exec: usize,

    /// For each peer, index of the next log slot to send.
    next_slot: HashMap<ReplicaId, usize>,

    /// For each peer, index of the highest log slot known to be replicated.
    match_slot: HashMap<ReplicaId, usize>,
}

impl RaftReplica {
    /// Creates a new Raft replica module and sets up its hubs. `peer_addrs`
    /// lists the peers to proactively connect to (at cluster bootstrap, the
    /// already-up lower-ID peers; after a restart, everyone else); the
    /// remaining peers are waited for to connect in. Returns after the full
    /// group is connected.
    pub async fn new_and_setup(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
        config_str: Option<&str>,
        tx_apply: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self, QuorumsetError> {
        if population == 0 || me >= population {
            return logged_err!(me; "invalid population {}", population);
        }
        let quorum_cnt = (population / 2) + 1;

        let config = parsed_config!(config_str => ReplicaConfig;
                                    backer_path, logger_sync,
                                    hb_hear_timeout_min, hb_hear_timeout_max,
                                    hb_send_interval_ms, disable_hb_timer)?;
        if config.hb_hear_timeout_min < 100 {
            return logged_err!(
                me;
                "invalid config.hb_hear_timeout_min '{}'",
                config.hb_hear_timeout_min
            );
        }
        if config.hb_hear_timeout_max < config.hb_hear_timeout_min + 100 {
            return logged_err!(
                me;
                "invalid config.hb_hear_timeout_max '{}'",
                config.hb_hear_timeout_max
            );
        }
        if config.hb_send_interval_ms == 0 {
            return logged_err!(
                me;
                "invalid config.hb_send_interval_ms '{}'",
                config.hb_send_interval_ms
            );
        }

        // setup storage hub module
        let storage_hub =
            StorageHub::new_and_setup(me, Path::new(&config.backer_path))
                .await?;

        // setup transport hub module; proactively connect to the given
        // peers, then wait for the whole population to be connected
        let mut transport_hub =
            TransportHub::new_and_setup(me, population, p2p_addr).await?;
        for (&peer, &conn_addr) in &peer_addrs {
            transport_hub.connect_to_peer(peer, conn_addr).await?;
        }
        transport_hub.wait_for_group(population).await?;

        let mut hb_send_interval =
            time::interval(Duration::from_millis(config.hb_send_interval_ms));
        hb_send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let hb_reply_cnts = (0..population)
            .filter_map(|p| if p == me { None } else { Some((p, (1, 0, 0))) })
            .collect();

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_state, rx_state) = watch::channel((0, false));
        let (tx_kill, rx_kill) = watch::channel(false);

        // spawn the applier task, decoupling deliveries to the service from
        // the event loop so a slow service never blocks the replica
        let (tx_deliver, rx_deliver) = mpsc::unbounded_channel();
        let applier_handle =
            tokio::spawn(Self::applier_task(me, rx_deliver, tx_apply));

        Ok(RaftReplica {
            id: me,
            population,
            quorum_cnt,
            config,
            storage_hub,
            transport_hub,
            rx_api,
            tx_api,
            tx_state,
            rx_state,
            rx_kill,
            tx_kill: Arc::new(tx_kill),
            tx_deliver,
            _applier_handle: applier_handle,
            leader: None,
            role: Role::Follower,
            hb_hear_timer: Timer::new(),
            hb_send_interval,
            hb_reply_cnts,
            peer_alive: Bitmap::new(population, true),
            curr_term: 0,
            voted_for: None,
            votes_granted: Bitmap::new(population, false),
            votes_denied: Bitmap::new(population, false),
            log: vec![],
            start_slot: 0,
            snapshot: Vec::new(),
            last_commit: 0,
            last_exec: 0,
            next_slot: (0..population)
                .filter_map(|s| if s == me { None } else { Some((s, 1)) })
                .collect(),
            match_slot: (0..population)
                .filter_map(|s| if s == me { None } else { Some((s, 0)) })
                .collect(),
        })
    }

    /// Sets up a replica and spawns its event loop onto the runtime,
    /// returning the service handle promptly.
    pub async fn spawn(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
        config_str: Option<&str>,
        tx_apply: mpsc::Sender<ApplyMsg>,
    ) -> Result<RaftHandle, QuorumsetError> {
        let mut replica = Self::new_and_setup(
            me,
            population,
            p2p_addr,
            peer_addrs,
            config_str,
            tx_apply,
        )
        .await?;
        let handle = replica.handle();

        tokio::spawn(async move {
            if let Err(e) = replica.run().await {
                pf_error!(me; "replica event loop exited with error: {}", e);
            }
        });

        Ok(handle)
    }

    /// Creates a cheap cloneable service handle onto this replica.
    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            id: self.id,
            tx_api: self.tx_api.clone(),
            rx_state: self.rx_state.clone(),
            tx_kill: self.tx_kill.clone(),
        }
    }

    /// Publishes `(curr_term, is_leader)` for `RaftHandle::get_state()`.
    fn publish_state(&self) -> Result<(), QuorumsetError> {
        self.tx_state
            .send((self.curr_term, self.role == Role::Leader))
            .map_err(QuorumsetError::msg)
    }

    /// Main event loop. Returns `Ok(())` upon a termination signal; any
    /// error escaping a handler (storage loss, protocol violation) is
    /// unrecoverable and halts the replica.
    pub async fn run(&mut self) -> Result<(), QuorumsetError> {
        // recover persistent state & snapshot from durable storage
        self.recover_from_store().await?;

        // kick off leader activity hearing timer
        self.kickoff_hb_hear_timer()?;

        let mut rx_kill = self.rx_kill.clone();
        if *rx_kill.borrow() {
            return Ok(()); // killed before the loop ever started
        }
        loop {
            tokio::select! {
                // service request
                req = self.rx_api.recv() => {
                    if let Some(req) = req {
                        self.handle_api_request(req).await?;
                    }
                },

                // message from peer
                msg = self.transport_hub.recv_msg() => {
                    match msg {
                        Ok((peer, msg)) => {
                            self.handle_msg_recv(peer, msg).await?;
                        },
                        Err(_e) => continue, // transport hiccup; ignore
                    }
                },

                // leader inactivity timeout
                _ = self.hb_hear_timer.timeout() => {
                    self.become_a_candidate().await?;
                },

                // leader sending heartbeat
                _ = self.hb_send_interval.tick(),
                        if self.role == Role::Leader => {
                    self.bcast_entries()?;
                },

                // receiving termination signal
                _ = rx_kill.changed() => {
                    pf_warn!(self.id; "replica caught termination signal");
                    let _ = self.transport_hub.leave();
                    return Ok(());
                },
            }
        }
    }

    /// Returns my replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }
}

/// Cloneable service-side handle to a running Raft replica.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    /// The replica's ID.
    id: ReplicaId,

    /// Sender side of the service request channel.
    tx_api: mpsc::UnboundedSender<ApiRequest>,

    /// Watcher of the replica's published `(term, is_leader)`.
    rx_state: watch::Receiver<(Term, bool)>,

    /// Termination signal sender.
    tx_kill: Arc<watch::Sender<bool>>,
}

impl RaftHandle {
    /// Proposes a command for replication. Returns `(Some(index), term,
    /// true)` with the slot the command will occupy if committed, or
    /// `(None, term, false)` if this replica is not the leader. Returns
    /// gracefully with a not-leader result if the replica has been killed.
    pub async fn submit(
        &self,
        command: Vec<u8>,
    ) -> Result<(Option<usize>, Term, bool), QuorumsetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx_api
            .send(ApiRequest::Submit {
                command,
                reply: reply_tx,
            })
            .is_err()
        {
            let (term, _) = *self.rx_state.borrow();
            return Ok((None, term, false));
        }
        match reply_rx.await {
            Ok(result) => Ok(result),
            Err(_) => {
                let (term, _) = *self.rx_state.borrow();
                Ok((None, term, false))
            }
        }
    }

    /// Asks the replica for its current term and whether it believes it is
    /// the leader.
    pub fn get_state(&self) -> (Term, bool) {
        *self.rx_state.borrow()
    }

    /// The service declares that its state-machine image `snapshot` covers
    /// all indices up to and including `index`; the replica compacts its log
    /// accordingly. Silently ignored if `index` is already covered by a
    /// previous snapshot. Panics if the service snapshots past the commit
    /// index or beyond the log.
    pub async fn take_snapshot(
        &self,
        index: usize,
        snapshot: Vec<u8>,
    ) -> Result<(), QuorumsetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx_api
            .send(ApiRequest::TakeSnapshot {
                index,
                snapshot,
                reply: reply_tx,
            })
            .is_err()
        {
            return Ok(()); // replica killed; nothing to compact
        }
        let _ = reply_rx.await;
        Ok(())
    }

    /// Legacy hook kept for services that expect a two-phase snapshot
    /// handshake: snapshots are applied inline through the apply channel, so
    /// this always approves and performs no additional work.
    pub fn cond_install_snapshot(
        &self,
        _last_incl_term: Term,
        _last_incl_index: usize,
        _snapshot: &[u8],
    ) -> bool {
        true
    }

    /// Requests replica shutdown. Idempotent.
    pub fn kill(&self) {
        if self.tx_kill.send(true).is_err() {
            pf_debug!(self.id; "kill requested but replica already gone");
        }
    }
}

#[cfg(test)]
mod raft_tests {
    use super::*;
    use tokio::fs;

    /// Spawns a replica under test plus a bare transport hub that the test
    /// body uses to play the role of peer 1.
    async fn setup_replica_with_stub(
        my_port: u16,
        stub_port: u16,
        backer_path: &str,
        tx_apply: mpsc::Sender<ApplyMsg>,
    ) -> Result<(RaftHandle, TransportHub<PeerMsg>), QuorumsetError> {
        if fs::try_exists(backer_path).await? {
            fs::remove_file(backer_path).await?;
        }

        let stub: TransportHub<PeerMsg> = TransportHub::new_and_setup(
            1,
            2,
            format!("127.0.0.1:{}", stub_port).parse()?,
        )
        .await?;

        let config = format!(
            "backer_path = '{}'\n\
             disable_hb_timer = true",
            backer_path
        );
        let handle = RaftReplica::spawn(
            0,
            2,
            format!("127.0.0.1:{}", my_port).parse()?,
            HashMap::from([(1, format!("127.0.0.1:{}", stub_port).parse()?)]),
            Some(&config),
            tx_apply,
        )
        .await?;

        Ok((handle, stub))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn vote_granting_and_stale_terms() -> Result<(), QuorumsetError> {
        let (tx_apply, _rx_apply) = mpsc::channel(64);
        let (handle, mut stub) = setup_replica_with_stub(
            52800,
            52801,
            "/tmp/test-quorumset-raft-0.store",
            tx_apply,
        )
        .await?;

        // a first-time vote request with a higher term gets granted
        stub.send_msg(
            PeerMsg::RequestVote {
                term: 5,
                last_slot: 0,
                last_term: 0,
            },
            0,
        )?;
        let (peer, msg) = stub.recv_msg().await?;
        assert_eq!(peer, 0);
        match msg {
            PeerMsg::RequestVoteReply { term, granted } => {
                assert_eq!(term, 5);
                assert!(granted);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }

        // a request from a previous term is denied, and the replica reports
        // its own newer term back
        stub.send_msg(
            PeerMsg::RequestVote {
                term: 3,
                last_slot: 9,
                last_term: 3,
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::RequestVoteReply { term, granted } => {
                assert_eq!(term, 5);
                assert!(!granted);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }

        // the replica never believed itself leader throughout
        assert_eq!(handle.get_state(), (5, false));

        // submitting to a non-leader is rejected with no index
        assert_eq!(handle.submit(b"cmd".to_vec()).await?, (None, 5, false));

        handle.kill();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn follower_replication_flow() -> Result<(), QuorumsetError> {
        let (tx_apply, mut rx_apply) = mpsc::channel(64);
        let (handle, mut stub) = setup_replica_with_stub(
            52810,
            52811,
            "/tmp/test-quorumset-raft-1.store",
            tx_apply,
        )
        .await?;

        // replicate two entries, with only the first committed
        stub.send_msg(
            PeerMsg::AppendEntries {
                term: 2,
                prev_slot: 0,
                prev_term: 0,
                entries: vec![
                    LogEntry {
                        term: 2,
                        command: b"alpha".to_vec(),
                    },
                    LogEntry {
                        term: 2,
                        command: b"beta".to_vec(),
                    },
                ],
                leader_commit: 1,
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::AppendEntriesReply {
                term,
                end_slot,
                conflict,
            } => {
                assert_eq!(term, 2);
                assert_eq!(end_slot, 2);
                assert_eq!(conflict, None);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }
        assert_eq!(
            rx_apply.recv().await,
            Some(ApplyMsg::Entry {
                index: 1,
                term: 2,
                command: b"alpha".to_vec(),
            })
        );

        // an empty heartbeat moving the commit index releases the second
        stub.send_msg(
            PeerMsg::AppendEntries {
                term: 2,
                prev_slot: 2,
                prev_term: 2,
                entries: vec![],
                leader_commit: 2,
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::AppendEntriesReply { end_slot, conflict, .. } => {
                assert_eq!(end_slot, 2);
                assert_eq!(conflict, None);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }
        assert_eq!(
            rx_apply.recv().await,
            Some(ApplyMsg::Entry {
                index: 2,
                term: 2,
                command: b"beta".to_vec(),
            })
        );

        // a probe far past the log end is rejected with a log-too-short hint
        stub.send_msg(
            PeerMsg::AppendEntries {
                term: 2,
                prev_slot: 10,
                prev_term: 2,
                entries: vec![],
                leader_commit: 2,
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::AppendEntriesReply { conflict, .. } => {
                assert_eq!(conflict, Some((0, 3)));
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }

        // a probe whose prev term disagrees is rejected with the conflicting
        // term and the first slot carrying it
        stub.send_msg(
            PeerMsg::AppendEntries {
                term: 2,
                prev_slot: 2,
                prev_term: 1,
                entries: vec![],
                leader_commit: 2,
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::AppendEntriesReply { conflict, .. } => {
                assert_eq!(conflict, Some((2, 1)));
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }

        handle.kill();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn follower_installs_snapshot() -> Result<(), QuorumsetError> {
        let (tx_apply, mut rx_apply) = mpsc::channel(64);
        let (handle, mut stub) = setup_replica_with_stub(
            52820,
            52821,
            "/tmp/test-quorumset-raft-2.store",
            tx_apply,
        )
        .await?;

        // an InstallSnapshot way past the (empty) log discards it entirely
        stub.send_msg(
            PeerMsg::InstallSnapshot {
                term: 4,
                last_incl_slot: 7,
                last_incl_term: 3,
                data: b"service-image".to_vec(),
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::InstallSnapshotReply {
                term,
                last_incl_slot,
            } => {
                assert_eq!(term, 4);
                assert_eq!(last_incl_slot, 7);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }
        assert_eq!(
            rx_apply.recv().await,
            Some(ApplyMsg::Snapshot {
                index: 7,
                term: 3,
                data: b"service-image".to_vec(),
            })
        );

        // an outdated snapshot is ignored but still echoed
        stub.send_msg(
            PeerMsg::InstallSnapshot {
                term: 4,
                last_incl_slot: 5,
                last_incl_term: 2,
                data: b"old-image".to_vec(),
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::InstallSnapshotReply { last_incl_slot, .. } => {
                assert_eq!(last_incl_slot, 5);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }

        // replication resumes after the snapshot
        stub.send_msg(
            PeerMsg::AppendEntries {
                term: 4,
                prev_slot: 7,
                prev_term: 3,
                entries: vec![LogEntry {
                    term: 4,
                    command: b"post-snap".to_vec(),
                }],
                leader_commit: 8,
            },
            0,
        )?;
        let (_, msg) = stub.recv_msg().await?;
        match msg {
            PeerMsg::AppendEntriesReply { end_slot, conflict, .. } => {
                assert_eq!(end_slot, 8);
                assert_eq!(conflict, None);
            }
            _ => panic!("unexpected message type: {:?}", msg),
        }
        assert_eq!(
            rx_apply.recv().await,
            Some(ApplyMsg::Entry {
                index: 8,
                term: 4,
                command: b"post-snap".to_vec(),
            })
        );

        handle.kill();
        Ok(())
    }
}
