//! Remote node contacts and their compact wire encoding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use time::OffsetDateTime;

use crate::{core::id::NodeId, error::DhtError};

/// The size of a compact node info record: 20-byte id, 4-byte IPv4 address, 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

/// Byte order of the port in compact node info records.
///
/// BEP 5 mandates network (big-endian) order. Some legacy clients write the port little-endian,
/// talking to those requires [`PortOrder::LittleEndian`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl PortOrder {
    fn read(self, raw: [u8; 2]) -> u16 {
        match self {
            PortOrder::BigEndian => u16::from_be_bytes(raw),
            PortOrder::LittleEndian => u16::from_le_bytes(raw),
        }
    }

    fn write(self, port: u16) -> [u8; 2] {
        match self {
            PortOrder::BigEndian => port.to_be_bytes(),
            PortOrder::LittleEndian => port.to_le_bytes(),
        }
    }
}

/// A remote node's identifier and address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Time of the last successful liveness confirmation, `None` if never confirmed.
    pub last_seen: Option<OffsetDateTime>,
    /// Consecutive failed liveness probes.
    pub failures: u8,
}

impl Contact {
    /// Creates a contact that hasn't been confirmed alive yet.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: None,
            failures: 0,
        }
    }

    /// Records a successful liveness confirmation.
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_seen = Some(now);
        self.failures = 0;
    }

    /// Encodes the contact as compact node info, `None` for IPv6 addresses.
    pub fn to_compact(&self, order: PortOrder) -> Option<[u8; COMPACT_NODE_LEN]> {
        let SocketAddr::V4(v4) = self.addr else {
            return None;
        };

        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(self.id.as_bytes());
        compact[20..24].copy_from_slice(&v4.ip().octets());
        compact[24..].copy_from_slice(&order.write(v4.port()));

        Some(compact)
    }

    /// Decodes a single compact node info record.
    pub fn from_compact(record: &[u8], order: PortOrder) -> Option<Self> {
        if record.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_slice(&record[..20])?;
        let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
        let port = order.read([record[24], record[25]]);

        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }
}

/// Splits a `nodes` payload into contacts.
///
/// Fails with [`DhtError::MalformedResponse`] if the payload isn't a whole number of records.
pub fn decode_compact_nodes(payload: &[u8], order: PortOrder) -> Result<Vec<Contact>, DhtError> {
    if payload.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::MalformedResponse(format!(
            "compact node info of length {} is not a multiple of {COMPACT_NODE_LEN}",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|record| Contact::from_compact(record, order))
        .collect())
}

/// Concatenates the compact encoding of the contacts, IPv6 contacts are skipped.
pub fn encode_compact_nodes<'a>(
    contacts: impl IntoIterator<Item = &'a Contact>,
    order: PortOrder,
) -> Vec<u8> {
    contacts
        .into_iter()
        .filter_map(|contact| contact.to_compact(order))
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(raw: u16, port: u16) -> Contact {
        Contact::new(
            NodeId::from_u16(raw),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port),
        )
    }

    #[test]
    fn compact_layout() {
        let compact = contact(7, 6881).to_compact(PortOrder::BigEndian).unwrap();

        assert_eq!(compact[19], 7);
        assert_eq!(&compact[20..24], &[10, 0, 0, 1]);
        // 6881 = 0x1ae1
        assert_eq!(&compact[24..], &[0x1a, 0xe1]);

        let compact = contact(7, 6881)
            .to_compact(PortOrder::LittleEndian)
            .unwrap();
        assert_eq!(&compact[24..], &[0xe1, 0x1a]);
    }

    #[test]
    fn compact_ipv6_skipped() {
        let contact = Contact::new(NodeId::from_u16(1), "[::1]:6881".parse().unwrap());

        assert!(contact.to_compact(PortOrder::BigEndian).is_none());
        assert!(encode_compact_nodes([&contact], PortOrder::BigEndian).is_empty());
    }

    #[test]
    fn decode_nodes_payload() {
        let contacts = [contact(1, 1000), contact(2, 2000)];
        let payload = encode_compact_nodes(&contacts, PortOrder::BigEndian);
        assert_eq!(payload.len(), 2 * COMPACT_NODE_LEN);

        let decoded = decode_compact_nodes(&payload, PortOrder::BigEndian).unwrap();
        assert_eq!(decoded, contacts);

        // Reading with the other byte order swaps the port bytes.
        let swapped = decode_compact_nodes(&payload, PortOrder::LittleEndian).unwrap();
        assert_eq!(swapped[0].addr.port(), 1000u16.swap_bytes());
    }

    #[test]
    fn decode_nodes_rejects_partial_record() {
        assert!(matches!(
            decode_compact_nodes(&[0u8; 25], PortOrder::BigEndian),
            Err(DhtError::MalformedResponse(_))
        ));
        assert!(decode_compact_nodes(&[], PortOrder::BigEndian)
            .unwrap()
            .is_empty());
    }
}
