//! [`Transport`] implementations.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    core::{message::Message, traits::Transport},
    error::DhtError,
};

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), DhtError> {
        (**self).send(datagram, addr)
    }
}

#[cfg(feature = "runtime")]
impl Transport for tokio::net::UdpSocket {
    fn send(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), DhtError> {
        let sent = self.try_send_to(datagram, addr).map_err(DhtError::Transport)?;

        if sent != datagram.len() {
            return Err(DhtError::Transport(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram was truncated",
            )));
        }

        Ok(())
    }
}

/// An in-memory transport recording every datagram instead of sending it.
///
/// Useful to drive a [`DhtEngine`](crate::DhtEngine) deterministically: inspect what it sent
/// with [`MemoryTransport::take`] and feed it crafted replies.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Removes and returns the recorded datagrams, oldest first.
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Like [`MemoryTransport::take`], parsing each datagram. Unparseable datagrams are dropped.
    pub fn take_messages(&self) -> Vec<(SocketAddr, Message)> {
        self.take()
            .into_iter()
            .filter_map(|(addr, datagram)| {
                Message::parse(&datagram).ok().map(|message| (addr, message))
            })
            .collect()
    }

    /// Returns the number of datagrams recorded since the last take.
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), DhtError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(DhtError::Transport(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory transport is failing",
            )));
        }

        self.sent.lock().push((addr, datagram.to_vec()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::{id::NodeId, message::Query};

    #[test]
    fn memory_transport_records() {
        let transport = Arc::new(MemoryTransport::new());
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let message = Message::query(Bytes::from_static(b"aa"), NodeId::rand(), Query::Ping);

        transport.send(&message.encode(), addr).unwrap();
        assert_eq!(transport.len(), 1);

        transport.set_failing(true);
        assert!(matches!(
            transport.send(&message.encode(), addr),
            Err(DhtError::Transport(_))
        ));

        assert_eq!(transport.take_messages(), vec![(addr, message)]);
        assert!(transport.is_empty());
    }
}
