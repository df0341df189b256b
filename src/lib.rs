//! A Kademlia distributed hash table for BitTorrent-style trackerless node discovery.
//!
//! The crate is split in two layers:
//!
//! 1. [`DhtEngine`] is a sans-IO state machine: it owns the [`RoutingTable`] and the pending
//!    transactions, parses and answers KRPC datagrams, and drives bootstrap, the table fill and
//!    maintenance from explicit clock ticks. Outbound datagrams go through a [`Transport`].
//! 2. [`DhtNode`] runs an engine on a tokio UDP socket. It is available with the `runtime`
//!    feature, enabled by default.
//!
//! Notable differences with BEP 5:
//!
//! 1. Peer storage isn't implemented, inbound `get_peers` and `announce_peer` queries are
//!    answered with a "method unknown" error. Both can still be issued to other nodes.
//! 2. Buckets are never merged once split.

#![cfg_attr(doc_cfg, feature(doc_cfg))]

pub mod bencode;
mod config;
mod core;
mod engine;
mod error;
#[cfg(feature = "runtime")]
mod node;
mod transport;

#[cfg(feature = "runtime")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "runtime")))]
pub use crate::node::{DhtNode, NodeStats};
pub use crate::{
    config::{Config, BOOTSTRAP_NODES},
    core::{
        bucket::{Bucket, DEFAULT_BUCKET_CAPACITY},
        contact::{decode_compact_nodes, encode_compact_nodes, Contact, PortOrder, COMPACT_NODE_LEN},
        id::{Boundary, Distance, NodeId},
        message,
        routing_table::{Restored, RoutingTable, Search},
        traits::Transport,
        transaction::{Full, Token, TransactionRegistry},
    },
    engine::{Callback, DhtEngine, PeersReply},
    error::{DhtError, Result},
    transport::MemoryTransport,
};
