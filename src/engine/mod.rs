//! The sans-IO DHT engine.
//!
//! [`DhtEngine`] owns the routing table and the transaction registry. It never touches a socket
//! or a clock on its own: whoever drives it hands it inbound datagrams with
//! [`DhtEngine::handle_inbound_datagram`] and calls [`DhtEngine::tick`] periodically, passing the
//! current time to both. Outbound datagrams go through the [`Transport`] it was built with.
//!
//! RPC results are delivered through callbacks. A callback runs once, when the reply arrives, when
//! the transaction times out or right away if the query couldn't be sent. Cancelling a query drops
//! its callback instead.

mod maintenance;
mod pending;

use std::{collections::HashSet, net::SocketAddr};

use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng};
use time::OffsetDateTime;
use tracing::{debug, trace};

pub use self::pending::{Callback, PeersReply};
use self::pending::{Pending, Purpose};
use crate::{
    config::Config,
    core::{
        contact::{encode_compact_nodes, Contact},
        id::NodeId,
        message::{error_code, Body, Message, Query, Response},
        routing_table::RoutingTable,
        traits::Transport,
        transaction::{Full, Token, TransactionRegistry},
    },
    error::DhtError,
};

/// Progress of the lookup that populates the table around the local id.
#[derive(Debug)]
enum FillState {
    /// Waiting for a bootstrap node to answer or a snapshot to be restored.
    Idle,
    Running(Lookup),
    Finished,
}

#[derive(Debug, Default)]
struct Lookup {
    // Keyed by identity so reordered replies can't trigger duplicate queries.
    queried: HashSet<NodeId>,
    in_flight: usize,
    // Set while queries are being issued, replies completing synchronously must not recurse.
    advancing: bool,
}

#[derive(Debug, Default)]
struct Timers {
    bootstrap: Option<OffsetDateTime>,
    liveness: Option<OffsetDateTime>,
    persist: Option<OffsetDateTime>,
}

/// A single DHT node's routing and RPC state.
pub struct DhtEngine<T> {
    config: Config,
    table: RoutingTable,
    registry: TransactionRegistry<Pending>,
    transport: T,
    rng: StdRng,
    bootstrap_nodes: Vec<SocketAddr>,
    bootstrapped: bool,
    restored: usize,
    fill: FillState,
    timers: Timers,
}

impl<T: Transport> DhtEngine<T> {
    /// Creates an engine with an empty routing table.
    ///
    /// Bootstrap nodes given as literal socket addresses are used as is, host names must be
    /// resolved by the caller and added with [`DhtEngine::add_bootstrap_node`].
    pub fn new(config: Config, transport: T) -> Result<Self, DhtError> {
        let local_id = config.node_id.unwrap_or_else(NodeId::rand);
        let table = RoutingTable::new(local_id, config.bucket_capacity)?;
        let bootstrap_nodes = config
            .bootstrap_nodes
            .iter()
            .filter_map(|node| node.parse().ok())
            .collect();

        debug!("created dht engine with id {local_id}");

        Ok(Self {
            registry: TransactionRegistry::new(config.max_pending),
            config,
            table,
            transport,
            rng: StdRng::from_entropy(),
            bootstrap_nodes,
            bootstrapped: false,
            restored: 0,
            fill: FillState::Idle,
            timers: Timers::default(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.table.local_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns `true` once a bootstrap node has answered.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Returns `true` once the fill lookup has converged or was skipped.
    pub fn is_filled(&self) -> bool {
        matches!(self.fill, FillState::Finished)
    }

    /// Returns the number of outstanding queries.
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    pub fn bootstrap_nodes(&self) -> &[SocketAddr] {
        &self.bootstrap_nodes
    }

    pub fn add_bootstrap_node(&mut self, addr: SocketAddr) {
        if !self.bootstrap_nodes.contains(&addr) {
            self.bootstrap_nodes.push(addr);
        }
    }

    /// Returns up to `quantity` known contacts sorted by distance to the target.
    pub fn find_nearest(&self, target: &NodeId, quantity: usize) -> Vec<Contact> {
        self.table.find_nearest(target, quantity)
    }

    /// Pings the address, the callback receives the responder's id.
    ///
    /// Returns the transaction token, `None` if the query couldn't be sent in which case the
    /// callback has already been invoked with the error.
    pub fn ping(
        &mut self,
        addr: SocketAddr,
        now: OffsetDateTime,
        callback: Callback<NodeId>,
    ) -> Option<Token> {
        self.send_query(addr, Query::Ping, Purpose::Ping(callback), now)
    }

    /// Asks the node at `addr` for the contacts it knows closest to the target.
    pub fn find_node(
        &mut self,
        addr: SocketAddr,
        target: NodeId,
        now: OffsetDateTime,
        callback: Callback<Vec<Contact>>,
    ) -> Option<Token> {
        self.send_query(
            addr,
            Query::FindNode { target },
            Purpose::FindNode(callback),
            now,
        )
    }

    /// Asks the node at `addr` for peers of the info hash.
    pub fn get_peers(
        &mut self,
        addr: SocketAddr,
        info_hash: NodeId,
        now: OffsetDateTime,
        callback: Callback<PeersReply>,
    ) -> Option<Token> {
        self.send_query(
            addr,
            Query::GetPeers { info_hash },
            Purpose::GetPeers(callback),
            now,
        )
    }

    /// Announces that this node serves the info hash on `port`, `token` is the write token from
    /// a prior `get_peers` reply by the same node. With `implied_port` the receiver uses the
    /// query's source port instead.
    #[allow(clippy::too_many_arguments)]
    pub fn announce_peer(
        &mut self,
        addr: SocketAddr,
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
        now: OffsetDateTime,
        callback: Callback<NodeId>,
    ) -> Option<Token> {
        let query = Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        };

        self.send_query(addr, query, Purpose::AnnouncePeer(callback), now)
    }

    /// Forgets a pending query. The callback is dropped without being invoked and a late reply
    /// is ignored.
    pub fn cancel(&mut self, token: &Token) -> bool {
        let Some(pending) = self.registry.cancel(token) else {
            return false;
        };

        trace!("cancelled {} query {token}", pending.purpose.name());
        // The lookup resumes on the next tick.
        if let (Purpose::Fill, FillState::Running(lookup)) = (&pending.purpose, &mut self.fill) {
            lookup.in_flight = lookup.in_flight.saturating_sub(1);
        }

        true
    }

    /// Processes a datagram received from `from`. Malformed datagrams are dropped.
    pub fn handle_inbound_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: OffsetDateTime,
    ) {
        let message = match Message::parse(datagram) {
            Ok(message) => message,
            Err(e) => {
                self.handle_malformed(datagram, e, from, now);
                return;
            }
        };

        match message.body {
            Body::Query { id, query } => self.answer(message.transaction, id, query, from, now),
            Body::Response(response) => {
                self.handle_reply(&message.transaction, Ok(response), from, now)
            }
            Body::Error { code, message: text } => self.handle_reply(
                &message.transaction,
                Err(DhtError::Remote {
                    code,
                    message: text,
                }),
                from,
                now,
            ),
        }
    }

    /// Expires overdue transactions and runs whatever maintenance is due.
    pub fn tick(&mut self, now: OffsetDateTime) {
        for (token, pending) in self.registry.sweep(now) {
            debug!(
                "{} query {token} to {} timed out",
                pending.purpose.name(),
                pending.addr
            );
            self.complete(pending, Err(DhtError::Timeout), now);
        }

        self.maintain(now);
    }

    // Registers the transaction, then sends. On failure the purpose is completed with the error.
    fn send_query(
        &mut self,
        addr: SocketAddr,
        query: Query,
        purpose: Purpose,
        now: OffsetDateTime,
    ) -> Option<Token> {
        let token = match self.registry.new_token(&mut self.rng) {
            Ok(token) => token,
            Err(e) => {
                self.complete(Pending { addr, purpose }, Err(e), now);
                return None;
            }
        };

        let name = query.name().to_owned();
        let datagram = Message::query(
            Bytes::copy_from_slice(token.as_bytes()),
            self.local_id(),
            query,
        )
        .encode();

        let timeout = self.config.request_timeout;
        if let Err(Full(pending)) = self
            .registry
            .register(token, Pending { addr, purpose }, timeout, now)
        {
            self.complete(pending, Err(DhtError::TooManyPending), now);
            return None;
        }

        if let Err(e) = self.transport.send(&datagram, addr) {
            debug!("failed to send {name} to {addr}: {e}");
            if let Some(pending) = self.registry.cancel(&token) {
                self.complete(pending, Err(e), now);
            }
            return None;
        }

        trace!("sent {name} query {token} to {addr}");

        Some(token)
    }

    fn handle_reply(
        &mut self,
        transaction: &[u8],
        reply: Result<Response, DhtError>,
        from: SocketAddr,
        now: OffsetDateTime,
    ) {
        let Some(token) = Token::from_bytes(transaction) else {
            trace!("dropping reply from {from} with a foreign transaction id");
            return;
        };

        // Unknown, late and duplicate replies alike.
        let Some(pending) = self.registry.resolve(&token) else {
            trace!("dropping reply from {from} to unknown transaction {token}");
            return;
        };

        if let Ok(response) = &reply {
            if let Ok(id) = response.node_id() {
                self.observe(id, from, now);
            }
        }

        trace!("{} query {token} answered by {from}", pending.purpose.name());
        self.complete(pending, reply, now);
    }

    // A garbled reply still resolves its transaction, a garbled query gets a protocol error.
    fn handle_malformed(
        &mut self,
        datagram: &[u8],
        error: DhtError,
        from: SocketAddr,
        now: OffsetDateTime,
    ) {
        match Message::envelope(datagram) {
            Some((transaction, kind)) if matches!(&kind[..], b"r" | b"e") => {
                debug!("malformed reply from {from}: {error}");
                let reply = Err(DhtError::MalformedResponse(error.to_string()));
                self.handle_reply(&transaction, reply, from, now);
            }
            Some((transaction, kind)) if &kind[..] == b"q" => {
                debug!("malformed query from {from}: {error}");
                let reply = Message::error(transaction, error_code::PROTOCOL, "Protocol Error");
                if let Err(e) = self.transport.send(&reply.encode(), from) {
                    debug!("failed to reply to {from}: {e}");
                }
            }
            _ => debug!("dropping datagram from {from}: {error}"),
        }
    }

    // Runs the continuation of a finished transaction.
    fn complete(
        &mut self,
        pending: Pending,
        reply: Result<Response, DhtError>,
        now: OffsetDateTime,
    ) {
        let order = self.config.port_order;
        let Pending { addr, purpose } = pending;

        match purpose {
            Purpose::Bootstrap => self.on_bootstrap_reply(addr, reply),
            Purpose::Fill => self.on_fill_reply(addr, reply, now),
            Purpose::Liveness(id) => self.on_liveness_reply(id, reply),
            Purpose::Replacement { stale } => self.on_replacement_reply(stale, addr, reply, now),
            Purpose::Refresh => match reply.and_then(|response| response.contacts(order)) {
                Ok(contacts) => {
                    let learned = self.learn(&contacts);
                    trace!("refresh via {addr} learned {learned} contacts");
                }
                Err(e) => debug!("refresh via {addr} failed: {e}"),
            },
            Purpose::Ping(callback) => callback(reply.and_then(|response| response.node_id())),
            Purpose::FindNode(callback) => {
                let contacts = reply.and_then(|response| response.contacts(order));
                if let Ok(contacts) = &contacts {
                    self.learn(contacts);
                }
                callback(contacts)
            }
            Purpose::GetPeers(callback) => {
                let peers = reply.and_then(|response| PeersReply::from_response(response, order));
                if let Ok(peers) = &peers {
                    self.learn(&peers.nodes);
                }
                callback(peers)
            }
            Purpose::AnnouncePeer(callback) => {
                callback(reply.and_then(|response| response.node_id()))
            }
        }
    }

    // Answers an inbound query. The querying node is known to be alive.
    fn answer(
        &mut self,
        transaction: Bytes,
        id: NodeId,
        query: Query,
        from: SocketAddr,
        now: OffsetDateTime,
    ) {
        trace!("{} query from {from}", query.name());
        self.observe(id, from, now);

        let local_id = self.local_id();
        let reply = match query {
            Query::Ping => Message::response(transaction, Response::with_id(local_id)),
            Query::FindNode { target } => {
                let nearest = self
                    .table
                    .find_nearest(&target, self.config.bucket_capacity);
                let nodes = encode_compact_nodes(&nearest, self.config.port_order);

                Message::response(
                    transaction,
                    Response {
                        nodes: Some(nodes.into()),
                        ..Response::with_id(local_id)
                    },
                )
            }
            // Peer storage isn't implemented.
            Query::GetPeers { .. } | Query::AnnouncePeer { .. } | Query::Other(_) => {
                Message::error(transaction, error_code::METHOD_UNKNOWN, "Method Unknown")
            }
        };

        if let Err(e) = self.transport.send(&reply.encode(), from) {
            debug!("failed to reply to {from}: {e}");
        }
    }

    // Records a node seen alive at `addr`, inserting it if it is new.
    fn observe(&mut self, id: NodeId, addr: SocketAddr, now: OffsetDateTime) {
        if id == self.local_id() || self.table.touch(&id, now) {
            return;
        }

        let mut contact = Contact::new(id, addr);
        contact.touch(now);

        match self.table.insert(contact) {
            Ok(()) => trace!("inserted {id} at {addr}"),
            Err(e) => trace!("couldn't insert {id}: {e}"),
        }
    }

    // Inserts the contacts not yet known, returns how many were added.
    fn learn(&mut self, contacts: &[Contact]) -> usize {
        let local_id = self.local_id();

        contacts
            .iter()
            .filter(|contact| contact.id != local_id)
            .filter(|contact| self.table.insert(**contact).is_ok())
            .count()
    }
}
