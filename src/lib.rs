//! Public interface to the quorumset core library: a Raft consensus replica
//! that a co-located service embeds to replicate an ordered log of opaque
//! commands across a fixed cluster.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod raft;
mod server;

pub use raft::{
    ApplyMsg, RaftHandle, RaftReplica, ReplicaConfig, Term,
};
pub use server::ReplicaId;
pub use utils::{Bitmap, QuorumsetError, Timer};
