//! Admission control of outgoing datagrams.
//!
//! The limiter keeps an exponentially weighted history of the number of datagrams
//! sent per second. Below 90% of the maximum rate every datagram is admitted;
//! above that, datagrams are dropped with a probability that grows as the
//! estimated rate approaches the maximum.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::logging::{Logger, debug};

/// Default maximum number of datagrams per second.
pub const DEFAULT_MAX_MSG_RATE: u32 = 20;

/// Weight of the history, `e^(-5/60)`.
pub const HISTORY_WEIGHT: f64 = 0.92004441462932322925;

/// Counters of the current one-second window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub second: u64,
    pub sent: u32,
    pub dropped: u32,
}

pub struct RateLimiter<R: Rng = StdRng> {
    max_rate: u32,
    history: f64,
    window: Window,
    rng: R,
    logger: Logger,
}

impl RateLimiter<StdRng> {
    pub fn new(max_rate: u32, logger: Logger) -> Self {
        Self::with_rng(max_rate, StdRng::from_os_rng(), logger)
    }
}

impl<R: Rng> RateLimiter<R> {
    pub fn with_rng(max_rate: u32, rng: R, logger: Logger) -> Self {
        Self {
            max_rate: max_rate.max(1),
            history: 0.0,
            window: Window::default(),
            rng,
            logger,
        }
    }

    pub fn max_rate(&self) -> u32 {
        self.max_rate
    }

    /// Changes the maximum rate. Non-positive values are ignored and `false` is returned.
    pub fn set_max_rate(&mut self, rate: i64) -> bool {
        match u32::try_from(rate) {
            Ok(rate) if rate > 0 => {
                self.max_rate = rate;
                true
            }
            _ => false,
        }
    }

    /// The smoothed number of datagrams sent per second, not counting the current second.
    pub fn history(&self) -> f64 {
        self.history
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Decides whether a datagram can be sent now.
    pub fn should_send(&mut self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.should_send_at(now)
    }

    /// Decides whether a datagram can be sent, `now` being the current time in seconds.
    pub fn should_send_at(&mut self, now: u64) -> bool {
        if now != self.window.second {
            self.history = self.history * HISTORY_WEIGHT + f64::from(self.window.sent) * (1.0 - HISTORY_WEIGHT);
            if self.window.dropped > 0 {
                debug!(
                    self.logger,
                    "rate limiter: {} datagrams sent, {} dropped during second {}, history {:.2}",
                    self.window.sent,
                    self.window.dropped,
                    self.window.second,
                    self.history
                );
            }
            self.window = Window {
                second: now,
                sent: 0,
                dropped: 0,
            };
        }

        let blended = self.history * HISTORY_WEIGHT + f64::from(self.window.sent) * (1.0 - HISTORY_WEIGHT);
        let max = f64::from(self.max_rate);
        let tenth = self.max_rate / 10;

        let admit = if blended < max - f64::from(tenth) {
            true
        } else {
            let r = self.rng.random_range(0..tenth.max(1));
            f64::from(r) < max - blended
        };

        if admit {
            self.window.sent += 1;
        } else {
            self.window.dropped += 1;
        }
        admit
    }
}
