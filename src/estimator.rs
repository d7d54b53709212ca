//! Moving-window activity statistics used by SH slot selection.
//
// Grounded on examples/original_source/MovingAverage.{hpp,cpp},
// ContentionEstimator.{hpp,cpp} and CongestionEstimator.{hpp,cpp}.

use std::collections::{HashMap, HashSet};

use crate::mac_id::MacId;

/// Fixed-size moving average over the last `window` values, represented as
/// a ring buffer (per spec.md section 9: "represent as ring buffers of
/// unsigned counts; window reset is a ring replacement preserving index").
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: Vec<f64>,
    next: usize,
    filled: usize,
}

impl MovingAverage {
    pub fn new(horizon: usize) -> Self {
        let horizon = horizon.max(1);
        MovingAverage { window: vec![0.0; horizon], next: 0, filled: 0 }
    }

    pub fn put(&mut self, value: f64) {
        self.window[self.next] = value;
        self.next = (self.next + 1) % self.window.len();
        self.filled = (self.filled + 1).min(self.window.len());
    }

    pub fn get(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.window.iter().take(self.filled).sum::<f64>() / self.filled as f64
    }

    pub fn reset(&mut self, new_horizon: usize) {
        *self = MovingAverage::new(new_horizon);
    }
}

/// Keeps a moving average of the number of non-beacon broadcasts heard per
/// neighbor, used to estimate the channel access rate for SH slot selection.
#[derive(Debug, Clone)]
pub struct ContentionEstimator {
    horizon: usize,
    avg_broadcast_rate_per_id: HashMap<MacId, MovingAverage>,
    broadcast_this_slot: HashSet<MacId>,
}

impl ContentionEstimator {
    pub fn new(horizon: usize) -> Self {
        ContentionEstimator { horizon, avg_broadcast_rate_per_id: HashMap::new(), broadcast_this_slot: HashSet::new() }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Report the reception of a non-beacon broadcast during the current
    /// slot, from `id`.
    pub fn report_non_beacon_broadcast(&mut self, id: MacId) {
        self.broadcast_this_slot.insert(id);
    }

    /// Flush the per-slot report into the moving averages. Every known
    /// neighbor gets a `0` or `1` sample for this slot, whether or not they
    /// were heard.
    pub fn on_slot_end(&mut self) {
        for (id, avg) in self.avg_broadcast_rate_per_id.iter_mut() {
            avg.put(if self.broadcast_this_slot.contains(id) { 1.0 } else { 0.0 });
        }
        let horizon = self.horizon;
        for id in self.broadcast_this_slot.drain() {
            // `or_insert_with` only runs for a neighbor not already in the
            // map; one already tracked got its sample from the loop above.
            self.avg_broadcast_rate_per_id.entry(id).or_insert_with(|| {
                let mut avg = MovingAverage::new(horizon);
                avg.put(1.0);
                avg
            });
        }
    }

    pub fn get_contention_estimate(&self, id: MacId) -> f64 {
        self.avg_broadcast_rate_per_id.get(&id).map(|a| a.get()).unwrap_or(0.0)
    }

    pub fn get_num_active_neighbors(&self) -> usize {
        self.avg_broadcast_rate_per_id.values().filter(|a| a.get() > 0.0).count()
    }

    pub fn get_active_neighbors(&self) -> Vec<MacId> {
        self.avg_broadcast_rate_per_id.iter().filter(|(_, a)| a.get() > 0.0).map(|(id, _)| *id).collect()
    }

    /// Average broadcast rate among active neighbors.
    pub fn get_average_non_beacon_broadcast_rate(&self) -> f64 {
        let active: Vec<f64> = self.avg_broadcast_rate_per_id.values().map(|a| a.get()).filter(|r| *r > 0.0).collect();
        if active.is_empty() {
            return 0.0;
        }
        active.iter().sum::<f64>() / active.len() as f64
    }

    pub fn get_channel_access_probability(&self, id: MacId) -> f64 {
        self.get_contention_estimate(id)
    }
}

/// Keeps a moving average of total (beacon + non-beacon) broadcast activity
/// across all neighbors, used to judge overall channel congestion.
#[derive(Debug, Clone)]
pub struct CongestionEstimator {
    congestion_average: MovingAverage,
    active_neighbors: HashSet<MacId>,
    last_active_neighbors: HashSet<MacId>,
    horizon: usize,
    broadcast_reported_this_slot: bool,
}

impl CongestionEstimator {
    pub fn new(horizon: usize) -> Self {
        CongestionEstimator {
            congestion_average: MovingAverage::new(horizon),
            active_neighbors: HashSet::new(),
            last_active_neighbors: HashSet::new(),
            horizon,
            broadcast_reported_this_slot: false,
        }
    }

    pub fn report_broadcast(&mut self, id: MacId) {
        self.broadcast_reported_this_slot = true;
        self.active_neighbors.insert(id);
    }

    pub fn on_slot_end(&mut self) {
        self.congestion_average.put(if self.broadcast_reported_this_slot { 1.0 } else { 0.0 });
        self.broadcast_reported_this_slot = false;
        self.last_active_neighbors = core::mem::take(&mut self.active_neighbors);
    }

    pub fn reset(&mut self, new_horizon: usize) {
        self.horizon = new_horizon;
        self.congestion_average.reset(new_horizon);
        self.active_neighbors.clear();
        self.last_active_neighbors.clear();
    }

    pub fn get_congestion(&self) -> f64 {
        self.congestion_average.get()
    }

    pub fn get_num_active_neighbors(&self) -> usize {
        self.last_active_neighbors.len()
    }

    pub fn is_active(&self, id: MacId) -> bool {
        self.last_active_neighbors.contains(&id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(n: u32) -> MacId {
        MacId::new(n)
    }

    #[test]
    fn moving_average_converges() {
        let mut m = MovingAverage::new(4);
        for _ in 0..4 {
            m.put(1.0);
        }
        assert_eq!(m.get(), 1.0);
    }

    #[test]
    fn moving_average_is_partial_before_full() {
        let mut m = MovingAverage::new(4);
        m.put(2.0);
        assert_eq!(m.get(), 2.0);
    }

    #[test]
    fn contention_estimator_tracks_per_neighbor_rate() {
        let mut c = ContentionEstimator::new(4);
        for _ in 0..4 {
            c.report_non_beacon_broadcast(id(4));
            c.on_slot_end();
        }
        assert_eq!(c.get_contention_estimate(id(4)), 1.0);
        assert_eq!(c.get_num_active_neighbors(), 1);
    }

    #[test]
    fn congestion_estimator_tracks_activity() {
        let mut c = CongestionEstimator::new(4);
        c.report_broadcast(id(5));
        c.on_slot_end();
        assert!(c.is_active(id(5)));
        assert!(c.get_congestion() > 0.0);
    }
}
