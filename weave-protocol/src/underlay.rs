//! Underlay contract consumed by sessions.
//!
//! The underlay is the transport connection beneath the session layer:
//! either a stream transport that already guarantees order and delivery, or
//! a datagram transport that guarantees neither. Concrete transports live
//! outside this crate; sessions only depend on this trait.

use crate::segment::Segment;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Delivery guarantees of the underlay transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// Ordered, reliable byte stream (TCP-like).
    ReliableStream,
    /// Unordered, lossy datagrams (UDP-like).
    UnreliableDatagram,
}

impl TransportProtocol {
    /// L4 header budget counted against the MTU when sizing fragments.
    pub fn header_size(self) -> usize {
        match self {
            TransportProtocol::ReliableStream => 20,
            TransportProtocol::UnreliableDatagram => 8,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(self, TransportProtocol::ReliableStream)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::ReliableStream => write!(f, "reliable-stream"),
            TransportProtocol::UnreliableDatagram => write!(f, "unreliable-datagram"),
        }
    }
}

/// IP version of the underlay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// L3 header budget counted against the MTU when sizing fragments.
    pub fn header_size(self) -> usize {
        match self {
            IpVersion::V4 => 20,
            IpVersion::V6 => 40,
        }
    }
}

/// A connection beneath the session layer.
///
/// One underlay may carry many sessions; a layer above the session objects
/// is responsible for serializing writes when sessions share an underlay.
pub trait Underlay: Send + Sync {
    fn ip_version(&self) -> IpVersion;

    fn transport_protocol(&self) -> TransportProtocol;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Emit a single already-framed segment on the transport.
    fn write_segment(&self, segment: &Segment) -> io::Result<()>;
}
