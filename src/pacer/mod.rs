#[cfg(test)]
mod pacer_test;

use std::time::{Duration, Instant};

/// Both pacers re-evaluate on this interval.
pub(crate) const PACER_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
/// Sender rate is raised once pressure exceeds rate by this factor.
pub(crate) const OVERSHOOT_FACTOR: f64 = 1.1;
const RATE_INCREASE_FACTOR: f64 = 1.1;
const RATE_DECREASE_FACTOR: f64 = 0.9;
/// The receiver window never halves below this.
pub(crate) const WINDOW_FLOOR: u32 = 2;

/// Sender-side emit pacer: a token bucket refilled at `rate` chunks per
/// second, with the rate adapted multiplicatively to observed pull pressure.
#[derive(Debug)]
pub(crate) struct EmitPacer {
    rate: f64,
    rate_min: f64,
    rate_max: f64,
    tokens: f64,
    last_refill: Instant,
    last_update: Instant,
    requests_in_interval: u64,
    adjustments: u64,
}

impl EmitPacer {
    pub(crate) fn new(rate: f64, rate_min: f64, rate_max: f64, now: Instant) -> Self {
        let mut pacer = EmitPacer {
            rate,
            rate_min,
            rate_max,
            tokens: 0.0,
            last_refill: now,
            last_update: now,
            requests_in_interval: 0,
            adjustments: 0,
        };
        // The bucket starts full.
        pacer.tokens = pacer.burst();
        pacer
    }

    /// Bucket capacity: one update interval's worth of emissions, at least one.
    fn burst(&self) -> f64 {
        (self.rate * PACER_UPDATE_INTERVAL.as_secs_f64()).max(1.0)
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + self.rate * dt).min(self.burst());
        self.last_refill = now;
    }

    pub(crate) fn on_request(&mut self) {
        self.requests_in_interval += 1;
    }

    /// Takes one emission token if available.
    pub(crate) fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// When the next token becomes available; `None` if one is ready now.
    pub(crate) fn next_token_at(&mut self, now: Instant) -> Option<Instant> {
        self.refill(now);
        if self.tokens >= 1.0 {
            return None;
        }
        let wait = (1.0 - self.tokens) / self.rate;
        Some(now + Duration::from_secs_f64(wait))
    }

    /// Applies the rate-adjustment rules once per update interval.
    /// Returns true when the rate changed.
    pub(crate) fn maybe_update(&mut self, pressure: f64, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_update) < PACER_UPDATE_INTERVAL {
            return false;
        }
        self.last_update = now;
        let had_requests = self.requests_in_interval > 0;
        self.requests_in_interval = 0;

        let old = self.rate;
        if pressure > self.rate * OVERSHOOT_FACTOR {
            self.rate = (self.rate * RATE_INCREASE_FACTOR).min(self.rate_max);
        } else if !had_requests {
            self.rate = (self.rate * RATE_DECREASE_FACTOR).max(self.rate_min);
        }

        if self.rate != old {
            self.adjustments += 1;
            return true;
        }
        false
    }

    pub(crate) fn next_update_at(&self) -> Instant {
        self.last_update + PACER_UPDATE_INTERVAL
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn adjustments(&self) -> u64 {
        self.adjustments
    }
}

/// Receiver-side window pacer: AIMD over request concurrency, not byte rate.
/// Halve on every retransmit, add one per clean interval that filled the
/// window.
#[derive(Debug)]
pub(crate) struct WindowPacer {
    window: u32,
    window_max: u32,
    received_in_interval: u32,
    retransmits_in_interval: u32,
    last_update: Instant,
}

impl WindowPacer {
    pub(crate) fn new(initial: u32, max: u32, now: Instant) -> Self {
        WindowPacer {
            window: initial,
            window_max: max,
            received_in_interval: 0,
            retransmits_in_interval: 0,
            last_update: now,
        }
    }

    pub(crate) fn on_retransmit(&mut self) {
        self.retransmits_in_interval += 1;
        self.window = (self.window / 2).max(WINDOW_FLOOR);
    }

    pub(crate) fn on_received(&mut self) {
        self.received_in_interval += 1;
    }

    /// Returns true when the window grew.
    pub(crate) fn maybe_update(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_update) < PACER_UPDATE_INTERVAL {
            return false;
        }
        self.last_update = now;
        let grow =
            self.retransmits_in_interval == 0 && self.received_in_interval >= self.window;
        self.received_in_interval = 0;
        self.retransmits_in_interval = 0;
        if grow && self.window < self.window_max {
            self.window += 1;
            return true;
        }
        false
    }

    pub(crate) fn next_update_at(&self) -> Instant {
        self.last_update + PACER_UPDATE_INTERVAL
    }

    pub(crate) fn window(&self) -> u32 {
        self.window
    }
}
