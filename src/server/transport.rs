//! Peer-to-peer TCP transport module.
//!
//! Conceptually, peer messages travel over unreliable channels and would be
//! retried until delivered; using TCP per peer pair gives the same effect
//! while also preserving per-connection ordering, which the replica core
//! relies on for AppendEntries streams.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    Bitmap, QuorumsetError,
};

use bincode::{Decode, Encode};

use bytes::BytesMut;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Peer-peer message wrapper type that includes leave notification variants.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
enum PeerMessage<Msg> {
    /// Normal protocol-specific message.
    Msg { msg: Msg },

    /// Server leave notification.
    Leave,

    /// Reply to leave notification.
    LeaveReply,
}

/// Peer-to-peer TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ReplicaId, PeerMessage<Msg>)>,

    /// Map from peer ID -> sender side of its send channel, shared with the
    /// peer acceptor task.
    tx_sends:
        flashmap::ReadHandle<ReplicaId, mpsc::UnboundedSender<PeerMessage<Msg>>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ReplicaId, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<ReplicaId>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Encode + Decode<()> + Send + Sync + 'static,
{
    /// Creates a new peer-to-peer transport hub. Spawns the peer acceptor
    /// task listening on `p2p_addr`. Creates a recv channel for listening on
    /// peers' messages.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
    ) -> Result<Self, QuorumsetError> {
        if population <= me {
            return logged_err!(me; "invalid population {}", population);
        }

        let (tx_recv, rx_recv) =
            mpsc::unbounded_channel::<(ReplicaId, PeerMessage<Msg>)>();

        let (tx_sends_write, tx_sends_read) = flashmap::new::<
            ReplicaId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >();

        // the connect & connack channels are used to ask the peer acceptor
        // task to proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = PeerAcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            rx_connect,
            tx_connack,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            population,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
        })
    }

    /// Connects to a peer replica proactively; the acceptor task spawns the
    /// corresponding messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), QuorumsetError> {
        self.tx_connect
            .send((id, peer_addr))
            .map_err(QuorumsetError::msg)?;
        match self.rx_connack.recv().await {
            Some(ack_id) => {
                if ack_id != id {
                    logged_err!(self.me; "peer ID mismatch: expected {}, got {}",
                                         id, ack_id)
                } else {
                    Ok(())
                }
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Waits until enough peers have been connected to me to form a group of
    /// specified size.
    pub(crate) async fn wait_for_group(
        &self,
        group: u8,
    ) -> Result<(), QuorumsetError> {
        if group == 0 {
            logged_err!(self.me; "invalid group size {}", group)
        } else {
            while self.current_peers()?.count() + 1 < group {
                time::sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        }
    }

    /// Gets a bitmap where currently connected peers are set true.
    pub(crate) fn current_peers(&self) -> Result<Bitmap, QuorumsetError> {
        let tx_sends_guard = self.tx_sends.guard();
        let mut peers = Bitmap::new(self.population, false);
        for &id in tx_sends_guard.keys() {
            if let Err(e) = peers.set(id, true) {
                return logged_err!(self.me; "error setting peer {}: {}", id, e);
            }
        }
        Ok(peers)
    }

    /// Sends a message to a specified peer by sending to its send channel.
    /// A peer not currently connected, or one whose messenger is going away,
    /// is silently skipped; a later replication round retries.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: ReplicaId,
    ) -> Result<(), QuorumsetError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            if tx_send.send(PeerMessage::Msg { msg }).is_err() {
                pf_debug!(self.me; "dropped message to leaving peer {}", peer);
            }
        }
        Ok(())
    }

    /// Broadcasts a message to all currently connected peers.
    pub(crate) fn bcast_msg(&mut self, msg: Msg) -> Result<(), QuorumsetError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            if tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(PeerMessage::Msg { msg: msg.clone() })
                .is_err()
            {
                pf_debug!(self.me; "dropped message to leaving peer {}", peer);
            }
        }
        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ReplicaId, Msg), QuorumsetError> {
        loop {
            match self.rx_recv.recv().await {
                Some((id, peer_msg)) => match peer_msg {
                    PeerMessage::Msg { msg } => return Ok((id, msg)),
                    _ => continue, // ignore leave-related messages
                },
                None => {
                    return logged_err!(self.me; "recv channel has been closed")
                }
            }
        }
    }

    /// Broadcasts leave notifications to all peers.
    pub(crate) fn leave(&mut self) -> Result<(), QuorumsetError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(PeerMessage::Leave)
                .map_err(QuorumsetError::msg)?;
        }
        Ok(())
    }
}

/// TransportHub peer acceptor task.
struct PeerAcceptorTask<Msg> {
    me: ReplicaId,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
    tx_sends:
        flashmap::WriteHandle<ReplicaId, mpsc::UnboundedSender<PeerMessage<Msg>>>,

    peer_listener: TcpListener,

    rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<ReplicaId>,

    /// Connection generation per peer. Exit notices of superseded messenger
    /// tasks (a peer reconnected after restart) must not unregister the
    /// fresh connection.
    conn_gens: HashMap<ReplicaId, u64>,

    tx_exit: mpsc::UnboundedSender<(ReplicaId, u64)>,
    rx_exit: mpsc::UnboundedReceiver<(ReplicaId, u64)>,
}

impl<Msg> PeerAcceptorTask<Msg>
where
    Msg: fmt::Debug + Clone + Encode + Decode<()> + Send + Sync + 'static,
{
    /// Creates the peer acceptor task.
    fn new(
        me: ReplicaId,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            ReplicaId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        // the exit channel carries termination notices of messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        PeerAcceptorTask {
            me,
            tx_recv,
            tx_sends,
            peer_listener,
            rx_connect,
            tx_connack,
            conn_gens: HashMap::new(),
            tx_exit,
            rx_exit,
        }
    }

    /// Registers a new peer connection and spawns its messenger task.
    fn spawn_messenger(&mut self, id: ReplicaId, addr: SocketAddr, stream: TcpStream) {
        let gen = self.conn_gens.entry(id).or_insert(0);
        *gen += 1;
        let gen = *gen;

        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        drop(tx_sends_guard);

        let mut messenger = PeerMessengerTask::new(
            self.me,
            id,
            gen,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { messenger.run().await });
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: ReplicaId,
        conn_addr: SocketAddr,
    ) -> Result<(), QuorumsetError> {
        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_u8(self.me).await?; // send my ID

        {
            let tx_sends_guard = self.tx_sends.guard();
            if tx_sends_guard.contains_key(&id) {
                return logged_err!(self.me; "duplicate peer ID to connect: {}", id);
            }
        }

        self.spawn_messenger(id, conn_addr, stream);
        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), QuorumsetError> {
        let id = match stream.read_u8().await {
            Ok(id) => id, // receive peer's ID
            Err(e) => {
                return logged_err!(self.me; "error receiving new peer ID: {}", e);
            }
        };

        {
            // a fresh connection from an already-known peer means the peer
            // restarted; drop the stale registration in favor of the new one
            let mut tx_sends_guard = self.tx_sends.guard();
            if tx_sends_guard.contains_key(&id) {
                pf_warn!(self.me; "peer {} reconnected, replacing old entry", id);
                tx_sends_guard.remove(id);
            }
        }

        self.spawn_messenger(id, addr, stream);
        pf_debug!(self.me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a left peer connection, allowing the peer to come
    /// back with a fresh connection after a restart. An exit notice from a
    /// superseded messenger (older generation) is ignored.
    fn remove_left_peer(
        &mut self,
        id: ReplicaId,
        gen: u64,
    ) -> Result<(), QuorumsetError> {
        if self.conn_gens.get(&id) != Some(&gen) {
            return Ok(());
        }

        let mut tx_sends_guard = self.tx_sends.guard();
        if !tx_sends_guard.contains_key(&id) {
            return logged_err!(self.me; "peer {} not found among connected ones", id);
        }
        tx_sends_guard.remove(id);

        Ok(())
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    if to_connect.is_none() {
                        // channel closed, the hub has been dropped
                        break;
                    }
                    let (peer, conn_addr) = to_connect.unwrap();
                    if let Err(e) = self.connect_new_peer(peer, conn_addr).await {
                        pf_error!(self.me; "error connecting to new peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!(self.me; "error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!(self.me; "error accepting peer connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_peer(stream, addr).await {
                        pf_error!(self.me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                exited = self.rx_exit.recv() => {
                    let (id, gen) = exited.unwrap();
                    if let Err(e) = self.remove_left_peer(id, gen) {
                        pf_error!(self.me; "error removing left peer {}: {}", id, e);
                    }
                },
            }
        }

        pf_debug!(self.me; "peer_acceptor task exited");
    }
}

/// TransportHub per-peer messenger task.
struct PeerMessengerTask<Msg> {
    me: ReplicaId,

    /// Corresponding peer's ID.
    id: ReplicaId,
    /// My connection generation for this peer.
    gen: u64,
    /// Corresponding peer's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<(ReplicaId, u64)>,
}

// TransportHub peer_messenger task implementation
impl<Msg> PeerMessengerTask<Msg>
where
    Msg: fmt::Debug + Clone + Encode + Decode<()> + Send + Sync + 'static,
{
    /// Creates a per-peer messenger task.
    fn new(
        me: ReplicaId,
        id: ReplicaId,
        gen: u64,
        addr: SocketAddr,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
        tx_exit: mpsc::UnboundedSender<(ReplicaId, u64)>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        let read_buf = BytesMut::with_capacity(8 + 1024);
        let write_buf = BytesMut::with_capacity(8 + 1024);

        PeerMessengerTask {
            me,
            id,
            gen,
            addr,
            conn_read,
            conn_write,
            rx_send,
            read_buf,
            tx_recv,
            write_buf,
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Writes a message through the TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&PeerMessage<Msg>>,
    ) -> Result<bool, QuorumsetError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from the TcpStream: first 8 bytes being the message
    /// length, and the rest bytes being the message itself.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_msg(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<PeerMessage<Msg>, QuorumsetError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_messenger task for {} '{}' spawned",
                           self.id, self.addr);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(PeerMessage::Leave) => {
                            // I decide to leave, notify peer
                            if let Ok(true) = Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&PeerMessage::Leave),
                            ) {
                                pf_debug!(self.me; "sent leave notification -> {}",
                                                   self.id);
                            }
                        },

                        Some(PeerMessage::LeaveReply) => {
                            pf_error!(self.me; "proactively sending LeaveReply msg");
                        },

                        Some(PeerMessage::Msg { .. }) => {
                            match Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(msg.as_ref().unwrap()),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    pf_debug!(self.me; "should start retrying msg send -> {}",
                                                       self.id);
                                    self.retrying = true;
                                }
                                Err(_e) => {
                                    // peer probably unreachable; drop message,
                                    // the next replication round retries
                                }
                            }
                        },

                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_msg(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me; "finished retrying last msg send -> {}",
                                               self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(self.me; "still should retry last msg send -> {}",
                                               self.id);
                        }
                        Err(_e) => {}
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(PeerMessage::Leave) => {
                            // peer leaving, send dummy reply and break
                            if let Ok(true) = Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&PeerMessage::LeaveReply),
                            ) {
                                pf_debug!(self.me; "peer {} has left", self.id);
                            }
                            break;
                        },

                        Ok(PeerMessage::LeaveReply) => {
                            // my leave notification is acked by peer, break
                            break;
                        },

                        Ok(PeerMessage::Msg { .. }) => {
                            if let Err(e) = self.tx_recv.send((self.id, msg.unwrap())) {
                                pf_error!(self.me; "error sending to tx_recv for {}: {}",
                                                   self.id, e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send((self.id, self.gen)) {
            pf_error!(self.me; "error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!(self.me; "peer_messenger task for {} '{}' exited",
                           self.id, self.addr);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
    struct TestMsg(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_send_recv() -> Result<(), QuorumsetError> {
        let barrier = Arc::new(Barrier::new(3));
        let barrier1 = barrier.clone();
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // replica 1
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, 3, "127.0.0.1:31801".parse()?)
                    .await?;
            barrier1.wait().await;
            hub.connect_to_peer(2, "127.0.0.1:31802".parse()?).await?;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            // send a message to 0
            hub.send_msg(TestMsg("world".into()), 0)?;
            // recv another message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("nice".into()));
            // send another message to 0
            hub.send_msg(TestMsg("job!".into()), 0)?;
            // wait for termination message
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("terminate".into()));
            Ok::<(), QuorumsetError>(())
        });
        tokio::spawn(async move {
            // replica 2
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(2, 3, "127.0.0.1:31802".parse()?)
                    .await?;
            barrier2.wait().await;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            // send a message to 0
            hub.send_msg(TestMsg("world".into()), 0)?;
            // wait for termination message
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("terminate".into()));
            Ok::<(), QuorumsetError>(())
        });
        // replica 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 3, "127.0.0.1:31800".parse()?)
                .await?;
        barrier.wait().await;
        hub.connect_to_peer(1, "127.0.0.1:31801".parse()?).await?;
        hub.connect_to_peer(2, "127.0.0.1:31802".parse()?).await?;
        // send a message to 1 and 2
        hub.bcast_msg(TestMsg("hello".into()))?;
        // recv a message from both 1 and 2
        let (id, msg) = hub.recv_msg().await?;
        assert!(id == 1 || id == 2);
        assert_eq!(msg, TestMsg("world".into()));
        let (id, msg) = hub.recv_msg().await?;
        assert!(id == 1 || id == 2);
        assert_eq!(msg, TestMsg("world".into()));
        // send another message to 1 only
        hub.send_msg(TestMsg("nice".into()), 1)?;
        // recv another message from 1
        let (id, msg) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert_eq!(msg, TestMsg("job!".into()));
        // send termination message to 1 and 2
        hub.bcast_msg(TestMsg("terminate".into()))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_peer_leave() -> Result<(), QuorumsetError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        tokio::spawn(async move {
            // replica 1, which leaves and comes back
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, 2, "127.0.0.1:31811".parse()?)
                    .await?;
            barrier1.wait().await;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("goodbye".into()));
            // leave and come back with a fresh connection
            hub.leave()?;
            time::sleep(Duration::from_millis(200)).await;
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, 2, "127.0.0.1:31811".parse()?)
                    .await?;
            hub.connect_to_peer(0, "127.0.0.1:31810".parse()?).await?;
            // send a message to 0
            hub.send_msg(TestMsg("hello".into()), 0)?;
            Ok::<(), QuorumsetError>(())
        });
        // replica 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 2, "127.0.0.1:31810".parse()?)
                .await?;
        barrier.wait().await;
        hub.connect_to_peer(1, "127.0.0.1:31811".parse()?).await?;
        assert!(hub.current_peers()?.get(1)?);
        // send a message to 1
        hub.send_msg(TestMsg("goodbye".into()), 1)?;
        // recv a message from the reborn 1
        let (id, msg) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert_eq!(msg, TestMsg("hello".into()));
        Ok(())
    }
}
