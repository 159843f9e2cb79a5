//! Session state machine and the segment send/receive pipeline.
//!
//! A session presents a bidirectional, message-preserving byte channel to
//! the application while framing everything into numbered segments on the
//! wire. Four ordered containers move segments through the pipeline:
//!
//! ```text
//! write -> sendQueue -> output loop -> underlay
//! underlay -> inbound channel -> input loop -> recvBuf -> recvQueue -> read
//! ```
//!
//! Over a reliable underlay the receive buffer is bypassed and
//! acknowledgements are ignored; over an unreliable underlay the input loop
//! reorders through recvBuf and the output loop keeps sent-but-unacked
//! segments in sendBuf, bounded by the congestion window, retransmitting on
//! RTO expiry.

use crate::config::SessionConfig;
use crate::congestion::{CubicSendAlgorithm, RttStats};
use crate::queue::SegmentQueue;
use crate::segment::{
    max_fragment_size, ProtocolKind, Role, Segment, SegmentMetadata, MAX_PDU,
    MAX_SESSION_OPEN_PAYLOAD,
};
use crate::signal::Signal;
use crate::underlay::{TransportProtocol, Underlay};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Session lifecycle states. State only ever moves forward; a backward
/// transition is a bug and trips an assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Init,
    Attached,
    Opening,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Attached => "attached",
            SessionState::Opening => "opening",
            SessionState::Established => "established",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Errors surfaced by the session contract.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is not ready")]
    NotReady,

    #[error("session is closed")]
    ClosedPipe,

    #[error("buffer is too small for the reassembled message")]
    ShortBuffer,

    #[error("payload exceeds the maximum PDU")]
    ShortWrite,

    #[error("segment protocol is not valid for this session")]
    InvalidArgument,

    #[error("operation is not supported")]
    Unsupported,

    #[error("underlay error: {0}")]
    Io(#[from] io::Error),

    #[error("end of stream")]
    Eof,
}

/// Point-in-time counters of one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub segments_retransmitted: u64,
    pub next_seq: u32,
    pub next_recv: u32,
    pub unack_seq: u32,
    pub send_queue_len: usize,
    pub send_buf_len: usize,
    pub recv_buf_len: usize,
    pub recv_queue_len: usize,
}

/// Join handles of a session's two background loops.
pub struct SessionLoops {
    pub input: JoinHandle<Result<(), SessionError>>,
    pub output: JoinHandle<Result<(), SessionError>>,
}

impl SessionLoops {
    /// Wait for both loops to finish, propagating panics.
    pub fn join(self) -> (Result<(), SessionError>, Result<(), SessionError>) {
        let input = match self.input.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        };
        let output = match self.output.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        };
        (input, output)
    }
}

/// A single session multiplexed over an underlay connection.
pub struct Session {
    id: u32,
    role: Role,
    mtu: usize,
    poll_interval: Duration,

    conn: RwLock<Option<Arc<dyn Underlay>>>,
    state: RwLock<SessionState>,

    ready: Signal,
    established: Signal,
    done: Signal,

    send_queue: SegmentQueue,
    send_buf: SegmentQueue,
    recv_buf: SegmentQueue,
    recv_queue: SegmentQueue,
    inbound_tx: Sender<Segment>,
    inbound_rx: Receiver<Segment>,

    next_seq: AtomicU32,
    next_recv: AtomicU32,
    unack_seq: AtomicU32,
    peer_unack: AtomicU32,

    // The carryover buffer doubles as the read lock; writes serialize on
    // write_lock; close takes both.
    unread: Mutex<Vec<u8>>,
    write_lock: Mutex<()>,

    rtt_stats: Mutex<RttStats>,
    send_algorithm: Mutex<CubicSendAlgorithm>,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    retransmitted: AtomicU64,
}

impl Session {
    /// Create a session with default tunables and the given link MTU.
    pub fn new(id: u32, role: Role, mtu: usize) -> Self {
        Session::with_config(
            id,
            role,
            SessionConfig {
                mtu,
                ..SessionConfig::default()
            },
        )
    }

    pub fn with_config(id: u32, role: Role, config: SessionConfig) -> Self {
        let mut rtt_stats = RttStats::new();
        rtt_stats.set_max_ack_delay(2 * config.poll_interval);
        rtt_stats.set_rto_multiplier(config.rto_multiplier);
        let (inbound_tx, inbound_rx) = bounded(config.channel_capacity);
        Session {
            id,
            role,
            mtu: config.mtu,
            poll_interval: config.poll_interval,
            conn: RwLock::new(None),
            state: RwLock::new(SessionState::Init),
            ready: Signal::new(),
            established: Signal::new(),
            done: Signal::new(),
            send_queue: SegmentQueue::new(config.queue_capacity),
            send_buf: SegmentQueue::new(config.queue_capacity),
            recv_buf: SegmentQueue::new(config.queue_capacity),
            recv_queue: SegmentQueue::new(config.queue_capacity),
            inbound_tx,
            inbound_rx,
            next_seq: AtomicU32::new(0),
            next_recv: AtomicU32::new(0),
            unack_seq: AtomicU32::new(0),
            peer_unack: AtomicU32::new(0),
            unread: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
            rtt_stats: Mutex::new(rtt_stats),
            send_algorithm: Mutex::new(CubicSendAlgorithm::new(
                config.min_window,
                config.max_window,
            )),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            retransmitted: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Raised once the session is attached to an underlay.
    pub fn ready(&self) -> &Signal {
        &self.ready
    }

    /// Raised once the open handshake completes.
    pub fn established(&self) -> &Signal {
        &self.established
    }

    /// Raised once the session has fully terminated.
    pub fn done(&self) -> &Signal {
        &self.done
    }

    /// Producer end of the inbound segment channel, handed to the
    /// demultiplexer that owns the underlay.
    pub fn inbound_sender(&self) -> Sender<Segment> {
        self.inbound_tx.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.read().as_ref().map(|conn| conn.local_addr())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.read().as_ref().map(|conn| conn.remote_addr())
    }

    /// Deadlines are not supported by the session contract.
    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<(), SessionError> {
        Err(SessionError::Unsupported)
    }

    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<(), SessionError> {
        Err(SessionError::Unsupported)
    }

    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), SessionError> {
        Err(SessionError::Unsupported)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.bytes_out.load(Ordering::Relaxed),
            bytes_received: self.bytes_in.load(Ordering::Relaxed),
            segments_retransmitted: self.retransmitted.load(Ordering::Relaxed),
            next_seq: self.next_seq.load(Ordering::Relaxed),
            next_recv: self.next_recv.load(Ordering::Relaxed),
            unack_seq: self.unack_seq.load(Ordering::Relaxed),
            send_queue_len: self.send_queue.len(),
            send_buf_len: self.send_buf.len(),
            recv_buf_len: self.recv_buf.len(),
            recv_queue_len: self.recv_queue.len(),
        }
    }

    /// Bind the session to its underlay connection.
    pub fn attach(&self, conn: Arc<dyn Underlay>) {
        debug!("{} attaching to underlay", self);
        *self.conn.write() = Some(conn);
        self.forward_state_to(SessionState::Attached);
        self.ready.set();
    }

    fn underlay(&self) -> Result<Arc<dyn Underlay>, SessionError> {
        self.conn.read().clone().ok_or(SessionError::NotReady)
    }

    fn forward_state_to(&self, new: SessionState) {
        let mut state = self.state.write();
        assert!(
            new >= *state,
            "session {} state cannot move back from {} to {}",
            self.id,
            *state,
            new
        );
        if new != *state {
            trace!("{} state {} -> {}", self, *state, new);
        }
        *state = new;
    }

    /// Read one application message. The message boundary is preserved: a
    /// read returns exactly one message, or `ShortBuffer` when `buf` cannot
    /// hold it (the message is kept for a retry with a larger buffer).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if self.state() < SessionState::Attached {
            return Err(SessionError::NotReady);
        }
        if self.state() >= SessionState::Closed {
            return Err(SessionError::ClosedPipe);
        }
        let mut unread = self.unread.lock();
        trace!("{} trying to read up to {} bytes", self, buf.len());

        // Data the application failed to take last time due to short buffer.
        if !unread.is_empty() {
            if buf.len() < unread.len() {
                return Err(SessionError::ShortBuffer);
            }
            let n = unread.len();
            buf[..n].copy_from_slice(&unread);
            unread.clear();
            self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            return Ok(n);
        }

        // Pull fragments until one terminates the message.
        loop {
            let seg = match self.recv_queue.delete_min_blocking() {
                Some(seg) => seg,
                None => return Err(SessionError::Eof),
            };

            if self.role == Role::Client
                && seg.protocol() == ProtocolKind::OpenSessionResponse
                && matches!(
                    self.state(),
                    SessionState::Attached | SessionState::Opening
                )
            {
                self.forward_state_to(SessionState::Established);
                self.established.set();
            }

            unread.extend_from_slice(&seg.payload);
            if seg.fragment() == 0 {
                break;
            }
        }

        if buf.len() < unread.len() {
            return Err(SessionError::ShortBuffer);
        }
        let n = unread.len();
        buf[..n].copy_from_slice(&unread);
        unread.clear();
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Queue one application message for sending, fragmenting as needed.
    /// The first write on an attached session also emits the open-session
    /// handshake segment and piggybacks the payload onto it when it fits.
    pub fn write(&self, buf: &[u8]) -> Result<usize, SessionError> {
        if buf.len() > MAX_PDU {
            return Err(SessionError::ShortWrite);
        }
        if self.state() < SessionState::Attached {
            return Err(SessionError::NotReady);
        }
        if self.state() >= SessionState::Closed {
            return Err(SessionError::ClosedPipe);
        }
        let _write = self.write_lock.lock();

        if self.state() == SessionState::Attached {
            let protocol = match self.role {
                Role::Client => ProtocolKind::OpenSessionRequest,
                Role::Server => ProtocolKind::OpenSessionResponse,
            };
            let mut seg = Segment::new_session(
                protocol,
                self.id,
                self.next_seq.fetch_add(1, Ordering::Relaxed),
            );
            let piggybacked = !buf.is_empty() && buf.len() <= MAX_SESSION_OPEN_PAYLOAD;
            if buf.len() <= MAX_SESSION_OPEN_PAYLOAD {
                seg.set_payload(Bytes::copy_from_slice(buf));
            }
            trace!(
                "{} writing {} bytes with {}",
                self,
                seg.payload.len(),
                protocol
            );
            if !self.send_queue.insert_blocking(seg) {
                return Err(SessionError::ClosedPipe);
            }
            match self.role {
                Role::Client => self.forward_state_to(SessionState::Opening),
                Role::Server => {
                    self.forward_state_to(SessionState::Established);
                    self.established.set();
                }
            }
            if piggybacked {
                self.bytes_out.fetch_add(buf.len() as u64, Ordering::Relaxed);
                return Ok(buf.len());
            }
        }

        let conn = self.underlay()?;
        let fragment_size =
            max_fragment_size(self.mtu, conn.ip_version(), conn.transport_protocol());
        let n_fragments = if buf.len() > fragment_size {
            (buf.len() - 1) / fragment_size + 1
        } else {
            1
        };
        if n_fragments > u8::MAX as usize + 1 {
            return Err(SessionError::ShortWrite);
        }
        trace!("{} writing {} bytes in {} fragments", self, buf.len(), n_fragments);

        let protocol = ProtocolKind::data_for(self.role);
        let mut rest = buf;
        for fragment in (0..n_fragments).rev() {
            let part_len = fragment_size.min(rest.len());
            let (part, tail) = rest.split_at(part_len);
            let window = self.recv_buf.remaining().min(u16::MAX as usize) as u16;
            let seg = Segment::new_data(
                protocol,
                self.id,
                self.next_seq.fetch_add(1, Ordering::Relaxed),
                self.unack_seq.load(Ordering::Relaxed),
                window,
                fragment as u8,
                Bytes::copy_from_slice(part),
            );
            if !self.send_queue.insert_blocking(seg) {
                return Err(SessionError::ClosedPipe);
            }
            rest = tail;
        }
        self.bytes_out.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    /// Actively terminate the session. Blocks until the peer confirms the
    /// close or the session is torn down. Idempotent: closing a completed
    /// session only settles the state and emits nothing.
    pub fn close(&self) -> Result<(), SessionError> {
        if self.done.is_set() {
            self.forward_state_to(SessionState::Closed);
            debug!("{} is already closed", self);
            return Ok(());
        }

        debug!("closing {}", self);
        let _read = self.unread.lock();
        let _write = self.write_lock.lock();

        // A remote-initiated teardown may have won the race while we were
        // acquiring the locks.
        if self.done.is_set() {
            self.forward_state_to(SessionState::Closed);
            return Ok(());
        }

        self.forward_state_to(SessionState::Closing);
        let seg = Segment::new_session(
            ProtocolKind::CloseSessionRequest,
            self.id,
            self.next_seq.fetch_add(1, Ordering::Relaxed),
        );
        if self.send_queue.insert_blocking(seg) {
            self.done.wait();
        }
        self.forward_state_to(SessionState::Closed);
        Ok(())
    }

    /// Terminate immediately: raise `done`, kill the four containers so
    /// every blocked caller wakes, and settle the state.
    fn shutdown(&self) {
        trace!("shutting down {}", self);
        self.done.set();
        self.send_queue.close();
        self.send_buf.close();
        self.recv_buf.close();
        self.recv_queue.close();
        self.forward_state_to(SessionState::Closed);
    }

    /// Consume segments from the inbound channel until cancelled or done.
    /// Segments with a protocol tag that is invalid for this session's role
    /// are dropped; any other input failure is fatal to the session.
    pub fn run_input_loop(&self, cancel: &Signal) -> Result<(), SessionError> {
        loop {
            if cancel.is_set() || self.done.is_set() {
                return Ok(());
            }
            match self.inbound_rx.recv_timeout(self.poll_interval) {
                Ok(seg) => match self.input(seg) {
                    Ok(()) => {}
                    Err(SessionError::InvalidArgument) => {
                        debug!("{} dropped segment with invalid protocol", self);
                    }
                    Err(err) => {
                        warn!("{} input failed: {}", self, err);
                        self.shutdown();
                        return Err(err);
                    }
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Drive the send path until cancelled or done. Underlay write errors
    /// are fatal and tear the session down.
    pub fn run_output_loop(&self, cancel: &Signal) -> Result<(), SessionError> {
        let transport = self.underlay()?.transport_protocol();
        loop {
            if cancel.is_set() || self.done.is_set() {
                return Ok(());
            }
            let result = match transport {
                TransportProtocol::ReliableStream => self.output_reliable(),
                TransportProtocol::UnreliableDatagram => self.output_unreliable(),
            };
            if let Err(err) = result {
                warn!("{} output failed: {}", self, err);
                self.shutdown();
                return Err(err);
            }
        }
    }

    /// Spawn the two background loops on named threads.
    pub fn spawn_loops(self: Arc<Self>, cancel: &Signal) -> io::Result<SessionLoops> {
        let input = {
            let session = Arc::clone(&self);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("weave-input-{}", self.id))
                .spawn(move || session.run_input_loop(&cancel))?
        };
        let output = {
            let session = self;
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("weave-output-{}", session.id))
                .spawn(move || session.run_output_loop(&cancel))?
        };
        Ok(SessionLoops { input, output })
    }

    fn input(&self, seg: Segment) -> Result<(), SessionError> {
        trace!("{} input {}", self, seg);
        let protocol = seg.protocol();
        if !protocol.accepted_by(self.role) {
            return Err(SessionError::InvalidArgument);
        }
        if protocol.is_open() || protocol.is_data() {
            self.input_data(seg)
        } else if protocol.is_ack() {
            self.input_ack(seg)
        } else {
            self.input_close(seg)
        }
    }

    fn input_data(&self, seg: Segment) -> Result<(), SessionError> {
        match self.underlay()?.transport_protocol() {
            TransportProtocol::ReliableStream => {
                // The underlay already delivered in order.
                self.recv_queue.insert_blocking(seg);
                Ok(())
            }
            TransportProtocol::UnreliableDatagram => {
                self.recv_buf.insert_blocking(seg);
                // Lift everything that became contiguous; anything below
                // the cursor is a duplicate and is discarded.
                loop {
                    let next = self.next_recv.load(Ordering::Relaxed);
                    let seg = match self.recv_buf.delete_min_if(|s| s.seq() <= next) {
                        Some(seg) => seg,
                        None => return Ok(()),
                    };
                    if seg.seq() == next {
                        self.recv_queue.insert_blocking(seg);
                        self.next_recv.store(next + 1, Ordering::Relaxed);
                        self.unack_seq.store(next + 1, Ordering::Relaxed);
                    } else {
                        trace!("{} dropping duplicate segment seq={}", self, seg.seq());
                    }
                }
            }
        }
    }

    fn input_ack(&self, seg: Segment) -> Result<(), SessionError> {
        match self.underlay()?.transport_protocol() {
            TransportProtocol::ReliableStream => {
                // Nothing to do: the underlay guarantees delivery.
                Ok(())
            }
            TransportProtocol::UnreliableDatagram => {
                let header = match &seg.metadata {
                    SegmentMetadata::DataAck(header) => header,
                    SegmentMetadata::Session(_) => return Err(SessionError::InvalidArgument),
                };
                let unack = header.unack_seq;
                self.peer_unack.fetch_max(unack, Ordering::Relaxed);

                let mut acked = 0u32;
                while let Some(acked_seg) = self.send_buf.delete_min_if(|s| s.seq() < unack) {
                    if let Some(sent_at) = acked_seg.tx_time() {
                        self.rtt_stats.lock().update_sample(sent_at.elapsed());
                    }
                    acked += 1;
                }
                if acked > 0 {
                    self.send_algorithm.lock().on_ack(acked);
                }
                Ok(())
            }
        }
    }

    fn input_close(&self, seg: Segment) -> Result<(), SessionError> {
        if seg.protocol() == ProtocolKind::CloseSessionRequest {
            let response = Segment::new_session(
                ProtocolKind::CloseSessionResponse,
                self.id,
                self.next_seq.fetch_add(1, Ordering::Relaxed),
            );
            // Side-channel write, best effort, never retried.
            if let Err(err) = self.output(&response) {
                debug!("{} close response dropped: {}", self, err);
            }
        }
        trace!("shutdown {} requested by peer", self);
        self.shutdown();
        Ok(())
    }

    fn output(&self, seg: &Segment) -> Result<(), SessionError> {
        trace!("{} output {}", self, seg);
        let conn = self.underlay()?;
        conn.write_segment(seg)?;
        Ok(())
    }

    fn output_reliable(&self) -> Result<(), SessionError> {
        loop {
            match self.send_queue.delete_min() {
                Some(seg) => self.output(&seg)?,
                None => {
                    thread::sleep(self.poll_interval);
                    return Ok(());
                }
            }
        }
    }

    fn output_unreliable(&self) -> Result<(), SessionError> {
        // Trim segments the peer has confirmed.
        let acked = self.peer_unack.load(Ordering::Relaxed);
        while self.send_buf.delete_min_if(|s| s.seq() < acked).is_some() {}

        // Refill the in-flight buffer up to the congestion window.
        let window = self.send_algorithm.lock().congestion_window() as usize;
        while self.send_buf.len() < window {
            match self.send_queue.delete_min() {
                Some(seg) => {
                    if !self.send_buf.insert_blocking(seg) {
                        return Ok(());
                    }
                }
                None => break,
            }
        }

        // Flush: first transmissions plus RTO-expired retransmissions.
        let rto = self.rtt_stats.lock().retransmission_timeout();
        let mut in_flight = Vec::with_capacity(self.send_buf.len());
        let mut wrote = 0usize;
        let mut lost = false;
        while let Some(mut seg) = self.send_buf.delete_min() {
            let due = match seg.tx_time() {
                None => true,
                Some(sent_at) => sent_at.elapsed() >= rto,
            };
            if due {
                self.output(&seg)?;
                if seg.tx_count() > 0 {
                    lost = true;
                    self.retransmitted.fetch_add(1, Ordering::Relaxed);
                }
                seg.mark_sent(Instant::now());
                wrote += 1;
            }
            in_flight.push(seg);
        }
        for seg in in_flight {
            if !self.send_buf.insert_blocking(seg) {
                return Ok(());
            }
        }
        if lost {
            self.send_algorithm.lock().on_loss();
        }
        if wrote == 0 {
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conn.read().as_ref() {
            None => write!(f, "Session{{{}}}", self.id),
            Some(conn) => write!(
                f,
                "Session{{{} - {} - {}}}",
                self.id,
                conn.local_addr(),
                conn.remote_addr()
            ),
        }
    }
}
