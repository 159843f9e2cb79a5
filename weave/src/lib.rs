//! Weave - reliable multiplexed session layer
//!
//! High-level Rust API for running many reliable, message-preserving
//! sessions over a single stream or datagram underlay connection.

pub use weave_protocol as protocol;

// Re-export commonly used types
pub use protocol::{
    Role, Segment, Session, SessionConfig, SessionError, SessionState, Signal,
    TransportProtocol, Underlay,
};
