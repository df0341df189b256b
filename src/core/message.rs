//! KRPC message types.
//!
//! Every message is a bencoded dictionary with a transaction id `t` and a type `y`: `q` for
//! queries (method name in `q`, arguments in `a`), `r` for responses (values in `r`) and `e` for
//! errors (`[code, message]` in `e`).

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use bytes::Bytes;

use crate::{
    bencode::{self, dict, Value},
    core::{
        contact::{decode_compact_nodes, Contact, PortOrder},
        id::NodeId,
    },
    error::DhtError,
};

/// KRPC error codes.
pub mod error_code {
    pub const GENERIC: i64 = 201;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
}

// Compact peer info: 4-byte IPv4 address, 2-byte port.
const COMPACT_PEER_LEN: usize = 6;

/// A KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The transaction id, echoed back in responses and errors.
    pub transaction: Bytes,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// A query from the node with the given id.
    Query { id: NodeId, query: Query },
    Response(Response),
    Error { code: i64, message: String },
}

/// Query methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
    /// A method this node doesn't know, kept so it can be answered with an error.
    Other(String),
}

impl Query {
    /// The method name as it appears on the wire.
    pub fn name(&self) -> &str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::Other(name) => name,
        }
    }
}

/// The values of a response.
///
/// Fields are kept raw, the querying side knows what it asked for and validates accordingly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub id: Option<Bytes>,
    /// Concatenated compact node info.
    pub nodes: Option<Bytes>,
    /// Compact peer info strings.
    pub values: Vec<Bytes>,
    pub token: Option<Bytes>,
}

impl Response {
    /// A response carrying only the responder's id.
    pub fn with_id(id: NodeId) -> Self {
        Self {
            id: Some(Bytes::copy_from_slice(id.as_bytes())),
            ..Default::default()
        }
    }

    /// Returns the responder's id.
    pub fn node_id(&self) -> Result<NodeId, DhtError> {
        self.id
            .as_deref()
            .and_then(NodeId::from_slice)
            .ok_or_else(|| DhtError::MalformedResponse("missing or invalid id".into()))
    }

    /// Decodes the `nodes` value, fails if it is absent or not a whole number of records.
    pub fn contacts(&self, order: PortOrder) -> Result<Vec<Contact>, DhtError> {
        let nodes = self
            .nodes
            .as_deref()
            .ok_or_else(|| DhtError::MalformedResponse("missing nodes".into()))?;

        decode_compact_nodes(nodes, order)
    }

    /// Decodes the `values` peer list, entries of the wrong size are skipped.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.values
            .iter()
            .filter(|value| value.len() == COMPACT_PEER_LEN)
            .map(|value| {
                let ip = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([value[4], value[5]]))
            })
            .collect()
    }
}

/// Encodes an IPv4 peer as compact peer info, `None` for IPv6.
pub fn compact_peer(addr: &SocketAddr) -> Option<Bytes> {
    let SocketAddr::V4(v4) = addr else {
        return None;
    };

    let mut compact = Vec::with_capacity(COMPACT_PEER_LEN);
    compact.extend_from_slice(&v4.ip().octets());
    compact.extend_from_slice(&v4.port().to_be_bytes());

    Some(compact.into())
}

impl Message {
    pub fn query(transaction: Bytes, id: NodeId, query: Query) -> Self {
        Self {
            transaction,
            body: Body::Query { id, query },
        }
    }

    pub fn response(transaction: Bytes, response: Response) -> Self {
        Self {
            transaction,
            body: Body::Response(response),
        }
    }

    pub fn error(transaction: Bytes, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction,
            body: Body::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Parses a datagram.
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        let root = value
            .as_dict()
            .ok_or_else(|| invalid("expected a dictionary"))?;

        let transaction = root
            .get(&b"t"[..])
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| invalid("missing transaction id"))?;

        let body = match root.get(&b"y"[..]).and_then(Value::as_str) {
            Some("q") => parse_query(root)?,
            Some("r") => parse_response(root)?,
            Some("e") => parse_error(root)?,
            Some(kind) => return Err(invalid(format!("unknown message type {kind:?}"))),
            None => return Err(invalid("missing message type")),
        };

        Ok(Self { transaction, body })
    }

    /// Reads the transaction id and the message type `y` of a datagram [`Message::parse`]
    /// rejected, `None` if it isn't a dictionary carrying both.
    pub(crate) fn envelope(data: &[u8]) -> Option<(Bytes, Bytes)> {
        let value = bencode::decode(data).ok()?;
        let transaction = value.get(b"t")?.as_bytes()?.clone();
        let kind = value.get(b"y")?.as_bytes()?.clone();

        Some((transaction, kind))
    }

    /// Encodes the message as a bencoded dictionary.
    pub fn encode(&self) -> Vec<u8> {
        let transaction = Value::Bytes(self.transaction.clone());

        let root = match &self.body {
            Body::Query { id, query } => dict([
                ("t", transaction),
                ("y", Value::string("q")),
                ("q", Value::string(query.name())),
                ("a", query_args(id, query)),
            ]),
            Body::Response(response) => dict([
                ("t", transaction),
                ("y", Value::string("r")),
                ("r", response_values(response)),
            ]),
            Body::Error { code, message } => dict([
                ("t", transaction),
                ("y", Value::string("e")),
                (
                    "e",
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                ),
            ]),
        };

        bencode::encode(&root)
    }
}

fn invalid(reason: impl Into<String>) -> DhtError {
    DhtError::InvalidMessage(reason.into())
}

fn node_id_arg(args: &BTreeMap<Bytes, Value>, key: &str) -> Result<NodeId, DhtError> {
    args.get(key.as_bytes())
        .and_then(Value::as_bytes)
        .and_then(|raw| NodeId::from_slice(raw))
        .ok_or_else(|| invalid(format!("missing or invalid {key}")))
}

fn parse_query(root: &BTreeMap<Bytes, Value>) -> Result<Body, DhtError> {
    let name = root
        .get(&b"q"[..])
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing query method"))?;
    let args = root
        .get(&b"a"[..])
        .and_then(Value::as_dict)
        .ok_or_else(|| invalid("missing query arguments"))?;

    let id = node_id_arg(args, "id")?;

    let query = match name {
        "ping" => Query::Ping,
        "find_node" => Query::FindNode {
            target: node_id_arg(args, "target")?,
        },
        "get_peers" => Query::GetPeers {
            info_hash: node_id_arg(args, "info_hash")?,
        },
        "announce_peer" => {
            let port = args
                .get(&b"port"[..])
                .and_then(Value::as_integer)
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| invalid("missing or invalid port"))?;
            let token = args
                .get(&b"token"[..])
                .and_then(Value::as_bytes)
                .cloned()
                .ok_or_else(|| invalid("missing token"))?;
            let implied_port = args
                .get(&b"implied_port"[..])
                .and_then(Value::as_integer)
                .map_or(false, |flag| flag == 1);

            Query::AnnouncePeer {
                info_hash: node_id_arg(args, "info_hash")?,
                port,
                token,
                implied_port,
            }
        }
        other => Query::Other(other.to_owned()),
    };

    Ok(Body::Query { id, query })
}

fn parse_response(root: &BTreeMap<Bytes, Value>) -> Result<Body, DhtError> {
    let values = root
        .get(&b"r"[..])
        .and_then(Value::as_dict)
        .ok_or_else(|| invalid("missing response values"))?;

    let bytes = |key: &[u8]| values.get(key).and_then(Value::as_bytes).cloned();

    Ok(Body::Response(Response {
        id: bytes(b"id"),
        nodes: bytes(b"nodes"),
        values: values
            .get(&b"values"[..])
            .and_then(Value::as_list)
            .map(|list| list.iter().filter_map(Value::as_bytes).cloned().collect())
            .unwrap_or_default(),
        token: bytes(b"token"),
    }))
}

fn parse_error(root: &BTreeMap<Bytes, Value>) -> Result<Body, DhtError> {
    let list = root
        .get(&b"e"[..])
        .and_then(Value::as_list)
        .ok_or_else(|| invalid("missing error list"))?;

    let code = list
        .first()
        .and_then(Value::as_integer)
        .ok_or_else(|| invalid("missing error code"))?;
    let message = list
        .get(1)
        .and_then(Value::as_bytes)
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();

    Ok(Body::Error { code, message })
}

fn query_args(id: &NodeId, query: &Query) -> Value {
    let id = Value::bytes(id.as_bytes());

    match query {
        Query::Ping | Query::Other(_) => dict([("id", id)]),
        Query::FindNode { target } => dict([("id", id), ("target", Value::bytes(target.as_bytes()))]),
        Query::GetPeers { info_hash } => dict([
            ("id", id),
            ("info_hash", Value::bytes(info_hash.as_bytes())),
        ]),
        Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => dict([
            ("id", id),
            ("implied_port", Value::Integer((*implied_port).into())),
            ("info_hash", Value::bytes(info_hash.as_bytes())),
            ("port", Value::Integer((*port).into())),
            ("token", Value::Bytes(token.clone())),
        ]),
    }
}

fn response_values(response: &Response) -> Value {
    let mut values = BTreeMap::new();

    if let Some(id) = &response.id {
        values.insert(Bytes::from_static(b"id"), Value::Bytes(id.clone()));
    }
    if let Some(nodes) = &response.nodes {
        values.insert(Bytes::from_static(b"nodes"), Value::Bytes(nodes.clone()));
    }
    if !response.values.is_empty() {
        values.insert(
            Bytes::from_static(b"values"),
            Value::List(response.values.iter().cloned().map(Value::Bytes).collect()),
        );
    }
    if let Some(token) = &response.token {
        values.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
    }

    Value::Dict(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contact::encode_compact_nodes;

    fn transaction() -> Bytes {
        Bytes::from_static(b"aa")
    }

    #[test]
    fn ping_query_wire_format() {
        let id = NodeId::new(*b"abcdefghij0123456789");
        let message = Message::query(transaction(), id, Query::Ping);

        // The BEP 5 example.
        assert_eq!(
            message.encode(),
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe"
        );
        assert_eq!(Message::parse(&message.encode()).unwrap(), message);
    }

    #[test]
    fn find_node_response_wire_format() {
        let id = NodeId::new(*b"0123456789abcdefghij");
        let response = Response {
            nodes: Some(Bytes::from_static(b"def456...")),
            ..Response::with_id(id)
        };
        let message = Message::response(transaction(), response);

        assert_eq!(
            message.encode(),
            b"d1:rd2:id20:0123456789abcdefghij5:nodes9:def456...e1:t2:aa1:y1:re"
        );
    }

    #[test]
    fn error_wire_format() {
        let message = Message::error(transaction(), error_code::GENERIC, "A Generic Error Ocurred");

        assert_eq!(
            message.encode(),
            b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee"
        );
        assert_eq!(Message::parse(&message.encode()).unwrap(), message);
    }

    #[test]
    fn parse_queries() {
        let id = NodeId::rand();
        let info_hash = NodeId::rand();

        for query in [
            Query::FindNode {
                target: NodeId::rand(),
            },
            Query::GetPeers { info_hash },
            Query::AnnouncePeer {
                info_hash,
                port: 6881,
                token: Bytes::from_static(b"tok"),
                implied_port: true,
            },
            Query::Other("vote".into()),
        ] {
            let message = Message::query(transaction(), id, query);
            assert_eq!(Message::parse(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn parse_rejects_invalid() {
        for input in [
            &b"i1e"[..],
            b"d1:y1:qe",
            b"d1:t2:aa1:y1:xe",
            b"d1:t2:aa1:y1:q1:q4:pinge",
            // Short id.
            b"d1:ad2:id3:abce1:q4:ping1:t2:aa1:y1:qe",
            b"d1:t2:aa1:y1:re",
        ] {
            assert!(
                matches!(Message::parse(input), Err(DhtError::InvalidMessage(_))),
                "{input:?}"
            );
        }

        assert!(matches!(
            Message::parse(b"d1:t"),
            Err(DhtError::Bencode(_))
        ));
    }

    #[test]
    fn response_contacts() {
        let contacts = [
            Contact::new(NodeId::rand(), "10.0.0.1:6881".parse().unwrap()),
            Contact::new(NodeId::rand(), "10.0.0.2:6882".parse().unwrap()),
        ];
        let response = Response {
            nodes: Some(encode_compact_nodes(&contacts, PortOrder::BigEndian).into()),
            ..Response::with_id(NodeId::rand())
        };

        assert_eq!(response.contacts(PortOrder::BigEndian).unwrap(), contacts);
    }

    #[test]
    fn response_malformed() {
        let truncated = Response {
            nodes: Some(Bytes::from(vec![0u8; 25])),
            ..Response::with_id(NodeId::rand())
        };
        assert!(matches!(
            truncated.contacts(PortOrder::BigEndian),
            Err(DhtError::MalformedResponse(_))
        ));

        let missing = Response::default();
        assert!(matches!(
            missing.node_id(),
            Err(DhtError::MalformedResponse(_))
        ));
        assert!(matches!(
            missing.contacts(PortOrder::BigEndian),
            Err(DhtError::MalformedResponse(_))
        ));
    }

    #[test]
    fn response_peers() {
        let peer: SocketAddr = "192.168.1.7:51413".parse().unwrap();
        let response = Response {
            values: vec![
                compact_peer(&peer).unwrap(),
                Bytes::from_static(b"short"),
            ],
            token: Some(Bytes::from_static(b"secret")),
            ..Response::with_id(NodeId::rand())
        };

        let parsed = Message::parse(&Message::response(transaction(), response).encode()).unwrap();
        let Body::Response(parsed) = parsed.body else {
            panic!("expected a response");
        };

        assert_eq!(parsed.peers(), vec![peer]);
        assert_eq!(parsed.token.as_deref(), Some(&b"secret"[..]));
    }
}
