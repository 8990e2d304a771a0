//! Exponential smoothing used for the achieved capture rate and drop fraction.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::packet::Port;

/// Weight kept by the running average on each update.
pub const SMOOTHING_FACTOR: f64 = 0.5;

/// `factor * previous + (1 - factor) * sample`
pub fn exponential_smooth(previous: f64, sample: f64, factor: f64) -> f64 {
    factor * previous + (1.0 - factor) * sample
}

/// Smoothed achieved frame rate from successive capture instants.
#[derive(Debug, Default)]
pub struct RateEstimator {
    last_tick: Option<Instant>,
    avg_delta: Option<f64>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing from `now`; the next `tick` measures its delta from here.
    pub fn start(&mut self, now: Instant) {
        self.last_tick = Some(now);
        self.avg_delta = None;
    }

    /// Fold the delta since the previous tick into the average and return the
    /// smoothed rate in frames per second.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let Some(last) = self.last_tick.replace(now) else {
            return 0.0;
        };
        let delta = now.saturating_duration_since(last).as_secs_f64();
        let avg = match self.avg_delta {
            Some(avg) => exponential_smooth(avg, delta, SMOOTHING_FACTOR),
            None => delta,
        };
        self.avg_delta = Some(avg);
        if avg > 0.0 {
            1.0 / avg
        } else {
            0.0
        }
    }

    pub fn fps(&self) -> f64 {
        match self.avg_delta {
            Some(avg) if avg > 0.0 => 1.0 / avg,
            _ => 0.0,
        }
    }
}

/// Per-port smoothed fraction of cycles in which the port contributed nothing.
#[derive(Debug, Clone)]
pub struct DropTracker {
    rates: BTreeMap<Port, f64>,
}

impl DropTracker {
    pub fn new(ports: impl IntoIterator<Item = Port>) -> Self {
        Self {
            rates: ports.into_iter().map(|port| (port, 0.0)).collect(),
        }
    }

    pub fn record(&mut self, port: Port, dropped: bool) {
        let sample = if dropped { 1.0 } else { 0.0 };
        let rate = self.rates.entry(port).or_insert(0.0);
        *rate = exponential_smooth(*rate, sample, SMOOTHING_FACTOR).clamp(0.0, 1.0);
    }

    pub fn rates(&self) -> &BTreeMap<Port, f64> {
        &self.rates
    }
}
