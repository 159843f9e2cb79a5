//! Core implementation of the weave session layer.
//!
//! This crate implements the reliable, multiplexed session protocol that
//! runs on top of an underlay connection: the segment model, the ordered
//! segment containers, the session state machine with its input/output
//! pipelines, fragmentation and reassembly, and congestion control.
//! Concrete underlay transports, wire encoding and session dispatch live
//! above this crate and consume the `Underlay` trait and the inbound
//! segment channel.

pub mod config;
pub mod congestion;
pub mod queue;
pub mod segment;
pub mod session;
pub mod signal;
pub mod underlay;

pub use config::SessionConfig;
pub use congestion::{CubicSendAlgorithm, RttStats};
pub use queue::SegmentQueue;
pub use segment::{
    max_fragment_size, ProtocolKind, Role, Segment, SegmentMetadata, MAX_PDU,
    MAX_SESSION_OPEN_PAYLOAD,
};
pub use session::{Session, SessionError, SessionLoops, SessionState, SessionStats};
pub use signal::Signal;
pub use underlay::{IpVersion, TransportProtocol, Underlay};
