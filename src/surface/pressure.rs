use std::time::{Duration, Instant};

/// Decay timescale for pull pressure: one second, so pressure reflects only
/// recent load and never grows without bound.
pub(crate) const PRESSURE_DECAY: Duration = Duration::from_secs(1);

/// Exponentially decayed event counter. Each recorded event adds one; the
/// accumulated value decays with an e-folding time of `PRESSURE_DECAY`.
#[derive(Debug, Clone)]
pub(crate) struct DecayingCounter {
    value: f64,
    last: Instant,
}

impl DecayingCounter {
    pub(crate) fn new(now: Instant) -> Self {
        DecayingCounter {
            value: 0.0,
            last: now,
        }
    }

    fn decay(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        if dt > 0.0 {
            self.value *= (-dt / PRESSURE_DECAY.as_secs_f64()).exp();
            self.last = now;
        }
    }

    pub(crate) fn record(&mut self, now: Instant) {
        self.decay(now);
        self.value += 1.0;
    }

    pub(crate) fn value(&mut self, now: Instant) -> f64 {
        self.decay(now);
        self.value
    }
}
