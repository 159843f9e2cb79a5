//! Shared test harness for session integration tests.
//!
//! `MemoryUnderlay` stands in for a real transport: it records every
//! segment a session writes and can forward each write straight into a
//! peer session's inbound channel, which wires two sessions back to back
//! without sockets or framing.

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weave_protocol::segment::{ProtocolKind, Role, Segment};
use weave_protocol::session::Session;
use weave_protocol::underlay::{IpVersion, TransportProtocol, Underlay};

pub struct MemoryUnderlay {
    transport: TransportProtocol,
    local: SocketAddr,
    remote: SocketAddr,
    sent: Mutex<Vec<Segment>>,
    peer: Mutex<Option<Sender<Segment>>>,
}

impl MemoryUnderlay {
    pub fn new(transport: TransportProtocol) -> Self {
        MemoryUnderlay {
            transport,
            local: "127.0.0.1:7001".parse().unwrap(),
            remote: "127.0.0.1:7002".parse().unwrap(),
            sent: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        }
    }

    /// Forward every future write into `peer` (a session's inbound channel).
    pub fn connect_peer(&self, peer: Sender<Segment>) {
        *self.peer.lock() = Some(peer);
    }

    /// Snapshot of every segment written so far, in write order.
    pub fn sent(&self) -> Vec<Segment> {
        self.sent.lock().clone()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn count_sent(&self, protocol: ProtocolKind) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|seg| seg.protocol() == protocol)
            .count()
    }
}

impl Underlay for MemoryUnderlay {
    fn ip_version(&self) -> IpVersion {
        IpVersion::V4
    }

    fn transport_protocol(&self) -> TransportProtocol {
        self.transport
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn write_segment(&self, segment: &Segment) -> io::Result<()> {
        self.sent.lock().push(segment.clone());
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.send(segment.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer channel closed"))?;
        }
        Ok(())
    }
}

/// A session already attached to a fresh `MemoryUnderlay`.
pub fn attached_session(
    id: u32,
    role: Role,
    transport: TransportProtocol,
    mtu: usize,
) -> (Arc<Session>, Arc<MemoryUnderlay>) {
    let session = Arc::new(Session::new(id, role, mtu));
    let underlay = Arc::new(MemoryUnderlay::new(transport));
    session.attach(Arc::clone(&underlay) as Arc<dyn Underlay>);
    (session, underlay)
}

/// Two sessions of the same ID wired back to back through memory underlays.
#[allow(clippy::type_complexity)]
pub fn linked_sessions(
    id: u32,
    transport: TransportProtocol,
    mtu: usize,
) -> (
    (Arc<Session>, Arc<MemoryUnderlay>),
    (Arc<Session>, Arc<MemoryUnderlay>),
) {
    let (client, client_underlay) = attached_session(id, Role::Client, transport, mtu);
    let (server, server_underlay) = attached_session(id, Role::Server, transport, mtu);
    client_underlay.connect_peer(server.inbound_sender());
    server_underlay.connect_peer(client.inbound_sender());
    ((client, client_underlay), (server, server_underlay))
}

/// Single-fragment data segment for injection tests.
pub fn data_segment(
    protocol: ProtocolKind,
    session_id: u32,
    seq: u32,
    payload: &[u8],
) -> Segment {
    Segment::new_data(
        protocol,
        session_id,
        seq,
        0,
        4096,
        0,
        Bytes::copy_from_slice(payload),
    )
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
