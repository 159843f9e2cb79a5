//! Session tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capacity of each of the four per-session segment containers.
pub const SEGMENT_QUEUE_CAPACITY: usize = 4096;
/// Capacity of the inbound segment channel between demultiplexer and session.
pub const SEGMENT_CHANNEL_CAPACITY: usize = 256;
/// Lower bound of the congestion window, in segments.
pub const MIN_WINDOW_SIZE: u32 = 32;
/// Upper bound of the congestion window, in segments.
pub const MAX_WINDOW_SIZE: u32 = 4096;
/// How long the output loop sleeps when it finds nothing to send.
pub const SEGMENT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Default scaling applied to the computed retransmission timeout.
pub const DEFAULT_RTO_MULTIPLIER: f64 = 1.5;

/// Tunable constants of one session. `Default` carries the protocol's
/// standard values; deployments override fields selectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// L2 maximum transmission unit of the underlay link.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Capacity of the four ordered segment containers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of the inbound segment channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Congestion window lower bound, in segments.
    #[serde(default = "default_min_window")]
    pub min_window: u32,
    /// Congestion window upper bound, in segments.
    #[serde(default = "default_max_window")]
    pub max_window: u32,
    /// Output-loop poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Scaling applied to the retransmission timeout.
    #[serde(default = "default_rto_multiplier")]
    pub rto_multiplier: f64,
}

fn default_mtu() -> usize {
    1500
}

fn default_queue_capacity() -> usize {
    SEGMENT_QUEUE_CAPACITY
}

fn default_channel_capacity() -> usize {
    SEGMENT_CHANNEL_CAPACITY
}

fn default_min_window() -> u32 {
    MIN_WINDOW_SIZE
}

fn default_max_window() -> u32 {
    MAX_WINDOW_SIZE
}

fn default_poll_interval() -> Duration {
    SEGMENT_POLL_INTERVAL
}

fn default_rto_multiplier() -> f64 {
    DEFAULT_RTO_MULTIPLIER
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mtu: default_mtu(),
            queue_capacity: default_queue_capacity(),
            channel_capacity: default_channel_capacity(),
            min_window: default_min_window(),
            max_window: default_max_window(),
            poll_interval: default_poll_interval(),
            rto_multiplier: default_rto_multiplier(),
        }
    }
}
