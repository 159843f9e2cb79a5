//! RTT estimation and the CUBIC send window.
//!
//! `RttStats` tracks smoothed round-trip time and its mean deviation with
//! the usual exponential moving averages and derives the retransmission
//! timeout. `CubicSendAlgorithm` maintains a congestion window in segment
//! units, bounded by a fixed minimum and maximum, that the unreliable
//! output loop consults to cap how much of the send buffer may be in
//! flight.

use std::time::{Duration, Instant};

/// Smoothing gain for the RTT mean.
const RTT_ALPHA: f64 = 0.125;
/// Smoothing gain for the RTT deviation.
const RTT_BETA: f64 = 0.25;
/// Deviation multiplier in the timeout formula.
const RTO_K: f64 = 4.0;

const INITIAL_RTT: Duration = Duration::from_millis(100);
const DEFAULT_RTO_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(20);

/// Round-trip time statistics with a configurable retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttStats {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    mean_deviation: Duration,
    max_ack_delay: Duration,
    rto_multiplier: f64,
    samples: u64,
}

impl RttStats {
    pub fn new() -> Self {
        RttStats {
            latest_rtt: INITIAL_RTT,
            min_rtt: INITIAL_RTT,
            smoothed_rtt: INITIAL_RTT,
            mean_deviation: INITIAL_RTT / 2,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            rto_multiplier: DEFAULT_RTO_MULTIPLIER,
            samples: 0,
        }
    }

    /// The longest the peer may sit on an acknowledgement; folded into the
    /// retransmission timeout so delayed acks are not taken for losses.
    pub fn set_max_ack_delay(&mut self, delay: Duration) {
        self.max_ack_delay = delay;
    }

    pub fn set_rto_multiplier(&mut self, multiplier: f64) {
        self.rto_multiplier = multiplier;
    }

    /// Record one RTT sample.
    pub fn update_sample(&mut self, rtt: Duration) {
        self.latest_rtt = rtt;
        if self.samples == 0 {
            self.smoothed_rtt = rtt;
            self.mean_deviation = rtt / 2;
            self.min_rtt = rtt;
        } else {
            if rtt < self.min_rtt {
                self.min_rtt = rtt;
            }
            let sample = rtt.as_secs_f64();
            let smoothed = self.smoothed_rtt.as_secs_f64();
            let deviation = self.mean_deviation.as_secs_f64();
            let error = (sample - smoothed).abs();
            self.mean_deviation =
                Duration::from_secs_f64((1.0 - RTT_BETA) * deviation + RTT_BETA * error);
            self.smoothed_rtt =
                Duration::from_secs_f64((1.0 - RTT_ALPHA) * smoothed + RTT_ALPHA * sample);
        }
        self.samples += 1;
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    /// Retransmission timeout: `(srtt + 4 * var + max_ack_delay)` scaled by
    /// the RTO multiplier.
    pub fn retransmission_timeout(&self) -> Duration {
        let base = self.smoothed_rtt
            + Duration::from_secs_f64(RTO_K * self.mean_deviation.as_secs_f64())
            + self.max_ack_delay;
        base.mul_f64(self.rto_multiplier)
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Cubic growth coefficient.
const CUBIC_C: f64 = 0.4;
/// Multiplicative decrease factor on loss.
const CUBIC_BETA: f64 = 0.7;

/// CUBIC congestion window, in segment units.
#[derive(Debug, Clone)]
pub struct CubicSendAlgorithm {
    min_window: u32,
    max_window: u32,
    window: f64,
    ssthresh: f64,
    w_max: f64,
    k: f64,
    epoch_start: Option<Instant>,
}

impl CubicSendAlgorithm {
    pub fn new(min_window: u32, max_window: u32) -> Self {
        CubicSendAlgorithm {
            min_window,
            max_window,
            window: min_window as f64,
            ssthresh: max_window as f64,
            w_max: 0.0,
            k: 0.0,
            epoch_start: None,
        }
    }

    /// Current congestion window, clamped to the configured bounds.
    pub fn congestion_window(&self) -> u32 {
        (self.window as u32).clamp(self.min_window, self.max_window)
    }

    pub fn in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    /// Credit `acked` newly acknowledged segments to the window.
    pub fn on_ack(&mut self, acked: u32) {
        if acked == 0 {
            return;
        }
        if self.in_slow_start() {
            self.window += acked as f64;
        } else {
            let epoch = *self.epoch_start.get_or_insert_with(Instant::now);
            let t = epoch.elapsed().as_secs_f64();
            let target = CUBIC_C * (t - self.k).powi(3) + self.w_max;
            if target > self.window {
                // Concave/convex region: close in on the cubic target.
                self.window += (target - self.window) * acked as f64 / self.window;
            } else {
                // Linear floor below the plateau.
                self.window += acked as f64 / self.window;
            }
        }
        self.window = self
            .window
            .clamp(self.min_window as f64, self.max_window as f64);
    }

    /// Register a loss event: multiplicative decrease and a new cubic epoch.
    pub fn on_loss(&mut self) {
        self.w_max = self.window;
        self.window = (self.window * CUBIC_BETA).max(self.min_window as f64);
        self.ssthresh = self.window;
        self.k = (self.w_max * (1.0 - CUBIC_BETA) / CUBIC_C).cbrt();
        self.epoch_start = Some(Instant::now());
    }
}
