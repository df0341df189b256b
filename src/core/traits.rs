use std::net::SocketAddr;

use crate::error::DhtError;

/// The datagram sink the engine sends its queries and replies through.
///
/// The engine never receives on its own: inbound datagrams are handed to
/// [`DhtEngine::handle_inbound_datagram`](crate::DhtEngine::handle_inbound_datagram) by whoever
/// owns the socket. Implementations must not block, a full send buffer should be reported as an
/// error rather than waited on.
pub trait Transport {
    /// Sends a single datagram, errors are surfaced to the caller of the RPC that sent it.
    fn send(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), DhtError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), DhtError> {
        (**self).send(datagram, addr)
    }
}
