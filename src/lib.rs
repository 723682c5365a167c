//! Public interface to the ringvote core library: the five coordination
//! subsystems (§2) plus the shared data model, wire format, error type, and
//! logging/config macros, linked by both `ringvote_server` and
//! `ringvote_client`.

#[macro_use]
mod utils;

pub mod types;
pub mod wire;

pub mod ring;
pub mod discovery;
pub mod heartbeat;
pub mod election;
pub mod replication;
pub mod multicast;
pub mod service;
pub mod server;
pub mod client;

pub use server::{parse_config, RingVoteConfig, ServerNode};
pub use client::{ClientEvent, ClientStub};
pub use types::{ClientId, ClientRecord, Group, NodeId, Tally, Token, Vote, VoteId, VoteState};
pub use utils::{ErrorKind, RingVoteError};
