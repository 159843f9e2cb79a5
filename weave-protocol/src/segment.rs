//! Segment model for the session protocol.
//!
//! A segment is the on-wire unit of the session layer. Every segment carries
//! a protocol tag, a session ID and a sequence number; data and
//! acknowledgement segments additionally carry the acknowledgement cursor,
//! the advertised receive window and a fragment index. Session-control
//! segments (open/close) carry a status code instead.

use crate::underlay::{IpVersion, TransportProtocol};
use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// Maximum payload of a single application write.
pub const MAX_PDU: usize = 65536;

/// Maximum payload that may piggyback on a session-open segment.
pub const MAX_SESSION_OPEN_PAYLOAD: usize = 1024;

/// Wire size of a data/ack segment header:
/// protocol (1) + session ID (4) + seq (4) + unacked seq (4) +
/// window (2) + fragment (1) + payload length (2).
pub const DATA_ACK_HEADER_SIZE: usize = 18;

/// Which side of the session this endpoint plays.
///
/// The role decides which data and acknowledgement tags the endpoint emits
/// and which inbound tags it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Protocol tag of a segment. The eight values are bit-exact on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolKind {
    OpenSessionRequest = 0,
    OpenSessionResponse = 1,
    DataClientToServer = 2,
    DataServerToClient = 3,
    AckClientToServer = 4,
    AckServerToClient = 5,
    CloseSessionRequest = 6,
    CloseSessionResponse = 7,
}

impl ProtocolKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolKind::OpenSessionRequest),
            1 => Some(ProtocolKind::OpenSessionResponse),
            2 => Some(ProtocolKind::DataClientToServer),
            3 => Some(ProtocolKind::DataServerToClient),
            4 => Some(ProtocolKind::AckClientToServer),
            5 => Some(ProtocolKind::AckServerToClient),
            6 => Some(ProtocolKind::CloseSessionRequest),
            7 => Some(ProtocolKind::CloseSessionResponse),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the session-open handshake tags.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ProtocolKind::OpenSessionRequest | ProtocolKind::OpenSessionResponse
        )
    }

    /// True for the data tags of either direction.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            ProtocolKind::DataClientToServer | ProtocolKind::DataServerToClient
        )
    }

    /// True for the acknowledgement tags of either direction.
    pub fn is_ack(self) -> bool {
        matches!(
            self,
            ProtocolKind::AckClientToServer | ProtocolKind::AckServerToClient
        )
    }

    /// True for the session-close handshake tags.
    pub fn is_close(self) -> bool {
        matches!(
            self,
            ProtocolKind::CloseSessionRequest | ProtocolKind::CloseSessionResponse
        )
    }

    /// The data tag used by `role` when sending.
    pub fn data_for(role: Role) -> Self {
        match role {
            Role::Client => ProtocolKind::DataClientToServer,
            Role::Server => ProtocolKind::DataServerToClient,
        }
    }

    /// Whether a segment with this tag may arrive at an endpoint with `role`.
    pub fn accepted_by(self, role: Role) -> bool {
        match role {
            Role::Client => matches!(
                self,
                ProtocolKind::OpenSessionResponse
                    | ProtocolKind::DataServerToClient
                    | ProtocolKind::AckServerToClient
                    | ProtocolKind::CloseSessionRequest
                    | ProtocolKind::CloseSessionResponse
            ),
            Role::Server => matches!(
                self,
                ProtocolKind::OpenSessionRequest
                    | ProtocolKind::DataClientToServer
                    | ProtocolKind::AckClientToServer
                    | ProtocolKind::CloseSessionRequest
                    | ProtocolKind::CloseSessionResponse
            ),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::OpenSessionRequest => "open_session_request",
            ProtocolKind::OpenSessionResponse => "open_session_response",
            ProtocolKind::DataClientToServer => "data_client_to_server",
            ProtocolKind::DataServerToClient => "data_server_to_client",
            ProtocolKind::AckClientToServer => "ack_client_to_server",
            ProtocolKind::AckServerToClient => "ack_server_to_client",
            ProtocolKind::CloseSessionRequest => "close_session_request",
            ProtocolKind::CloseSessionResponse => "close_session_response",
        };
        write!(f, "{name}")
    }
}

/// Header of a session-control (open/close) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub protocol: ProtocolKind,
    pub session_id: u32,
    pub seq: u32,
    /// Handshake status code; 0 means success.
    pub status: u8,
    pub payload_len: u16,
}

/// Header of a data or acknowledgement segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAckHeader {
    pub protocol: ProtocolKind,
    pub session_id: u32,
    pub seq: u32,
    /// Oldest sequence number the sender has not yet seen delivered.
    pub unack_seq: u32,
    /// Remaining receive-buffer capacity advertised to the peer.
    pub window_size: u16,
    /// Count-down fragment index; 0 marks the last fragment of a message.
    pub fragment: u8,
    pub payload_len: u16,
}

/// Tagged segment metadata.
///
/// The protocol tag is redundant within each variant and is validated
/// against the session role on input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentMetadata {
    Session(SessionHeader),
    DataAck(DataAckHeader),
}

impl SegmentMetadata {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            SegmentMetadata::Session(h) => h.protocol,
            SegmentMetadata::DataAck(h) => h.protocol,
        }
    }

    pub fn session_id(&self) -> u32 {
        match self {
            SegmentMetadata::Session(h) => h.session_id,
            SegmentMetadata::DataAck(h) => h.session_id,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            SegmentMetadata::Session(h) => h.seq,
            SegmentMetadata::DataAck(h) => h.seq,
        }
    }
}

/// A segment travelling through the session pipeline.
///
/// The transmission bookkeeping (`tx_time`, `tx_count`) never goes on the
/// wire; the unreliable output loop uses it to schedule retransmissions.
#[derive(Debug, Clone)]
pub struct Segment {
    pub metadata: SegmentMetadata,
    pub payload: Bytes,
    tx_time: Option<Instant>,
    tx_count: u32,
}

impl Segment {
    /// Create a session-control segment with status 0 and no payload.
    pub fn new_session(protocol: ProtocolKind, session_id: u32, seq: u32) -> Self {
        Segment {
            metadata: SegmentMetadata::Session(SessionHeader {
                protocol,
                session_id,
                seq,
                status: 0,
                payload_len: 0,
            }),
            payload: Bytes::new(),
            tx_time: None,
            tx_count: 0,
        }
    }

    /// Create a data or acknowledgement segment.
    pub fn new_data(
        protocol: ProtocolKind,
        session_id: u32,
        seq: u32,
        unack_seq: u32,
        window_size: u16,
        fragment: u8,
        payload: Bytes,
    ) -> Self {
        Segment {
            metadata: SegmentMetadata::DataAck(DataAckHeader {
                protocol,
                session_id,
                seq,
                unack_seq,
                window_size,
                fragment,
                payload_len: payload.len() as u16,
            }),
            payload,
            tx_time: None,
            tx_count: 0,
        }
    }

    /// Attach a payload, keeping the header's payload length consistent.
    pub fn set_payload(&mut self, payload: Bytes) {
        match &mut self.metadata {
            SegmentMetadata::Session(h) => h.payload_len = payload.len() as u16,
            SegmentMetadata::DataAck(h) => h.payload_len = payload.len() as u16,
        }
        self.payload = payload;
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.metadata.protocol()
    }

    pub fn session_id(&self) -> u32 {
        self.metadata.session_id()
    }

    pub fn seq(&self) -> u32 {
        self.metadata.seq()
    }

    /// Fragment index of the segment. Session-control segments always
    /// terminate a message, so they report 0.
    pub fn fragment(&self) -> u8 {
        match &self.metadata {
            SegmentMetadata::Session(_) => 0,
            SegmentMetadata::DataAck(h) => h.fragment,
        }
    }

    pub fn payload_len(&self) -> u16 {
        match &self.metadata {
            SegmentMetadata::Session(h) => h.payload_len,
            SegmentMetadata::DataAck(h) => h.payload_len,
        }
    }

    /// Acknowledgement cursor carried by a data/ack segment.
    pub fn unack_seq(&self) -> Option<u32> {
        match &self.metadata {
            SegmentMetadata::Session(_) => None,
            SegmentMetadata::DataAck(h) => Some(h.unack_seq),
        }
    }

    /// Advertised window carried by a data/ack segment.
    pub fn window_size(&self) -> Option<u16> {
        match &self.metadata {
            SegmentMetadata::Session(_) => None,
            SegmentMetadata::DataAck(h) => Some(h.window_size),
        }
    }

    /// Status code carried by a session-control segment.
    pub fn status(&self) -> Option<u8> {
        match &self.metadata {
            SegmentMetadata::Session(h) => Some(h.status),
            SegmentMetadata::DataAck(_) => None,
        }
    }

    /// When the segment was last written to the underlay, if ever.
    pub fn tx_time(&self) -> Option<Instant> {
        self.tx_time
    }

    /// How many times the segment has been written to the underlay.
    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    /// Record a transmission.
    pub(crate) fn mark_sent(&mut self, at: Instant) {
        self.tx_time = Some(at);
        self.tx_count += 1;
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment{{{}, sid={}, seq={}, len={}}}",
            self.protocol(),
            self.session_id(),
            self.seq(),
            self.payload.len()
        )
    }
}

/// Largest payload a single data segment may carry given the link MTU and
/// the per-layer header budget beneath the segment header.
pub fn max_fragment_size(
    mtu: usize,
    ip_version: IpVersion,
    transport: TransportProtocol,
) -> usize {
    let overhead = ip_version.header_size() + transport.header_size() + DATA_ACK_HEADER_SIZE;
    mtu.saturating_sub(overhead).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kind_roundtrip() {
        for value in 0..8u8 {
            let kind = ProtocolKind::from_u8(value).unwrap();
            assert_eq!(kind.as_u8(), value);
        }
        assert!(ProtocolKind::from_u8(8).is_none());
        assert!(ProtocolKind::from_u8(255).is_none());
    }

    #[test]
    fn test_role_admission() {
        // A client never accepts segments a client emits.
        assert!(!ProtocolKind::OpenSessionRequest.accepted_by(Role::Client));
        assert!(!ProtocolKind::DataClientToServer.accepted_by(Role::Client));
        assert!(!ProtocolKind::AckClientToServer.accepted_by(Role::Client));
        assert!(ProtocolKind::OpenSessionResponse.accepted_by(Role::Client));
        assert!(ProtocolKind::DataServerToClient.accepted_by(Role::Client));
        assert!(ProtocolKind::AckServerToClient.accepted_by(Role::Client));

        // Mirror set for the server.
        assert!(ProtocolKind::OpenSessionRequest.accepted_by(Role::Server));
        assert!(!ProtocolKind::OpenSessionResponse.accepted_by(Role::Server));
        assert!(ProtocolKind::DataClientToServer.accepted_by(Role::Server));
        assert!(!ProtocolKind::DataServerToClient.accepted_by(Role::Server));

        // Close handshake tags are accepted by both sides.
        for role in [Role::Client, Role::Server] {
            assert!(ProtocolKind::CloseSessionRequest.accepted_by(role));
            assert!(ProtocolKind::CloseSessionResponse.accepted_by(role));
        }
    }

    #[test]
    fn test_data_segment_payload_len() {
        let seg = Segment::new_data(
            ProtocolKind::DataClientToServer,
            7,
            42,
            10,
            512,
            1,
            Bytes::from_static(b"payload"),
        );
        assert_eq!(seg.payload_len(), 7);
        assert_eq!(seg.seq(), 42);
        assert_eq!(seg.fragment(), 1);
        assert_eq!(seg.unack_seq(), Some(10));
        assert_eq!(seg.window_size(), Some(512));
        assert_eq!(seg.status(), None);
    }

    #[test]
    fn test_session_segment_piggyback() {
        let mut seg = Segment::new_session(ProtocolKind::OpenSessionResponse, 7, 0);
        assert_eq!(seg.payload_len(), 0);
        assert_eq!(seg.fragment(), 0);
        assert_eq!(seg.status(), Some(0));

        seg.set_payload(Bytes::from_static(b"hello"));
        assert_eq!(seg.payload_len(), 5);
        assert_eq!(&seg.payload[..], b"hello");
    }

    #[test]
    fn test_mark_sent() {
        let mut seg = Segment::new_session(ProtocolKind::CloseSessionRequest, 1, 9);
        assert_eq!(seg.tx_count(), 0);
        assert!(seg.tx_time().is_none());

        seg.mark_sent(Instant::now());
        seg.mark_sent(Instant::now());
        assert_eq!(seg.tx_count(), 2);
        assert!(seg.tx_time().is_some());
    }

    #[test]
    fn test_max_fragment_size() {
        // IPv4 + datagram: 20 + 8 + 18 bytes of headers.
        assert_eq!(
            max_fragment_size(1500, IpVersion::V4, TransportProtocol::UnreliableDatagram),
            1454
        );
        // IPv6 + stream: 40 + 20 + 18 bytes of headers.
        assert_eq!(
            max_fragment_size(1500, IpVersion::V6, TransportProtocol::ReliableStream),
            1422
        );
        // Tiny MTU never yields a zero fragment budget.
        assert_eq!(
            max_fragment_size(10, IpVersion::V6, TransportProtocol::ReliableStream),
            1
        );
    }
}
