use std::{fmt, net::SocketAddr};

use bytes::Bytes;

use crate::{
    core::{
        contact::{Contact, PortOrder},
        id::NodeId,
        message::Response,
    },
    error::DhtError,
};

/// Receives the outcome of an RPC.
pub type Callback<R> = Box<dyn FnOnce(Result<R, DhtError>) + Send>;

/// The decoded reply to a `get_peers` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeersReply {
    pub id: NodeId,
    /// The write token to present in a subsequent `announce_peer`.
    pub token: Option<Bytes>,
    pub peers: Vec<SocketAddr>,
    /// Contacts closer to the info hash, returned when the responder knows no peers.
    pub nodes: Vec<Contact>,
}

impl PeersReply {
    pub(crate) fn from_response(response: Response, order: PortOrder) -> Result<Self, DhtError> {
        let nodes = match response.nodes {
            Some(_) => response.contacts(order)?,
            None => Vec::new(),
        };

        Ok(Self {
            id: response.node_id()?,
            peers: response.peers(),
            token: response.token,
            nodes,
        })
    }
}

/// An outstanding query: where it went and what to do with the reply.
pub(crate) struct Pending {
    pub(crate) addr: SocketAddr,
    pub(crate) purpose: Purpose,
}

pub(crate) enum Purpose {
    /// A ping to a bootstrap node.
    Bootstrap,
    /// A `find_node` for the local id issued by the fill lookup.
    Fill,
    /// A liveness ping to a known contact.
    Liveness(NodeId),
    /// A `find_node` looking for contacts to replace one that went silent.
    Replacement { stale: NodeId },
    /// A `find_node` for a random id in an idle bucket.
    Refresh,
    Ping(Callback<NodeId>),
    FindNode(Callback<Vec<Contact>>),
    GetPeers(Callback<PeersReply>),
    AnnouncePeer(Callback<NodeId>),
}

impl Purpose {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Purpose::Bootstrap => "bootstrap",
            Purpose::Fill => "fill",
            Purpose::Liveness(_) => "liveness",
            Purpose::Replacement { .. } => "replacement",
            Purpose::Refresh => "refresh",
            Purpose::Ping(_) => "ping",
            Purpose::FindNode(_) => "find_node",
            Purpose::GetPeers(_) => "get_peers",
            Purpose::AnnouncePeer(_) => "announce_peer",
        }
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("addr", &self.addr)
            .field("purpose", &self.purpose.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{contact::encode_compact_nodes, message::compact_peer};

    #[test]
    fn peers_reply_with_values() {
        let id = NodeId::rand();
        let peer: SocketAddr = "10.1.2.3:51413".parse().unwrap();
        let response = Response {
            values: vec![compact_peer(&peer).unwrap()],
            token: Some(Bytes::from_static(b"tok")),
            ..Response::with_id(id)
        };

        let reply = PeersReply::from_response(response, PortOrder::BigEndian).unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.peers, vec![peer]);
        assert!(reply.nodes.is_empty());
        assert_eq!(reply.token, Some(Bytes::from_static(b"tok")));
    }

    #[test]
    fn peers_reply_with_nodes() {
        let contact = Contact::new(NodeId::rand(), "10.0.0.9:6881".parse().unwrap());
        let response = Response {
            nodes: Some(encode_compact_nodes([&contact], PortOrder::BigEndian).into()),
            ..Response::with_id(NodeId::rand())
        };

        let reply = PeersReply::from_response(response, PortOrder::BigEndian).unwrap();
        assert_eq!(reply.nodes, vec![contact]);
        assert!(reply.peers.is_empty());
    }

    #[test]
    fn peers_reply_malformed() {
        let response = Response {
            nodes: Some(Bytes::from(vec![0u8; 27])),
            ..Response::with_id(NodeId::rand())
        };
        assert!(matches!(
            PeersReply::from_response(response, PortOrder::BigEndian),
            Err(DhtError::MalformedResponse(_))
        ));

        assert!(matches!(
            PeersReply::from_response(Response::default(), PortOrder::BigEndian),
            Err(DhtError::MalformedResponse(_))
        ));
    }
}
