//! Tracks recently observed, active neighbors.
//
// Grounded on examples/original_source/NeighborObserver.{hpp,cpp}.

use std::collections::HashMap;

use crate::estimator::MovingAverage;
use crate::mac_id::MacId;
use crate::packet::LinkProposal;

/// Keeps track of recently observed, active neighbors: their last-seen
/// counter, their advertised next-broadcast slot, and any link proposals
/// they have advertised (so [`crate::link::sh::ShLinkManager`] can avoid
/// proposing resources a neighbor has already claimed).
#[derive(Debug, Clone)]
pub struct NeighborObserver {
    max_last_seen: u32,
    active_neighbors: HashMap<MacId, u32>,
    advertised_broadcast_slots: HashMap<MacId, u32>,
    advertised_link_proposals: HashMap<MacId, Vec<(u64, LinkProposal)>>,
    avg_last_seen: HashMap<MacId, MovingAverage>,
}

impl NeighborObserver {
    const NUM_SLOTS_TO_AVERAGE: usize = 10;

    pub fn new(max_time_slots_until_not_active: u32) -> Self {
        NeighborObserver {
            max_last_seen: max_time_slots_until_not_active,
            active_neighbors: HashMap::new(),
            advertised_broadcast_slots: HashMap::new(),
            advertised_link_proposals: HashMap::new(),
            avg_last_seen: HashMap::new(),
        }
    }

    /// Record that a packet was heard from `id` in the current slot.
    pub fn report_activity(&mut self, id: MacId) {
        let last_seen = self.active_neighbors.insert(id, 0).unwrap_or(0);
        self.avg_last_seen.entry(id).or_insert_with(|| MovingAverage::new(Self::NUM_SLOTS_TO_AVERAGE)).put(last_seen as f64);
    }

    /// Record that `id` advertised its next broadcast at `advertised_slot_offset`.
    pub fn report_broadcast_slot_advertisement(&mut self, id: MacId, advertised_slot_offset: u32) {
        self.advertised_broadcast_slots.insert(id, advertised_slot_offset);
    }

    pub fn get_next_expected_broadcast_slot_offset(&self, id: MacId) -> Option<u32> {
        self.advertised_broadcast_slots.get(&id).copied()
    }

    pub fn clear_advertised_link_proposals(&mut self, id: MacId) {
        self.advertised_link_proposals.remove(&id);
    }

    pub fn add_advertised_link_proposal(&mut self, id: MacId, current_slot: u64, proposal: LinkProposal) {
        self.advertised_link_proposals.entry(id).or_default().push((current_slot, proposal));
    }

    pub fn get_advertised_link_proposals(&self, id: MacId) -> &[(u64, LinkProposal)] {
        self.advertised_link_proposals.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Advance every last-seen counter by one slot, dropping neighbors past
    /// the configured activity window and its advertised slot.
    pub fn on_slot_end(&mut self) {
        let mut expired = Vec::new();
        for (id, last_seen) in self.active_neighbors.iter_mut() {
            *last_seen += 1;
            if *last_seen > self.max_last_seen {
                expired.push(*id);
            }
        }
        for id in expired {
            self.active_neighbors.remove(&id);
            self.advertised_broadcast_slots.remove(&id);
            self.advertised_link_proposals.remove(&id);
        }
        for slot in self.advertised_broadcast_slots.values_mut() {
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn get_num_active_neighbors(&self) -> usize {
        self.active_neighbors.len()
    }

    pub fn is_active(&self, id: MacId) -> bool {
        self.active_neighbors.contains_key(&id)
    }

    pub fn get_active_neighbors(&self) -> Vec<MacId> {
        self.active_neighbors.keys().copied().collect()
    }

    pub fn get_avg_beacon_delay(&self) -> f64 {
        if self.avg_last_seen.is_empty() {
            return 0.0;
        }
        self.avg_last_seen.values().map(|a| a.get()).sum::<f64>() / self.avg_last_seen.len() as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::LinkProposal;

    fn id(n: u32) -> MacId {
        MacId::new(n)
    }

    #[test]
    fn tracks_advertised_broadcast_slots() {
        let mut n = NeighborObserver::new(10);
        n.report_activity(id(4));
        n.report_broadcast_slot_advertisement(id(4), 7);
        assert_eq!(n.get_next_expected_broadcast_slot_offset(id(4)), Some(7));
        n.on_slot_end();
        assert_eq!(n.get_next_expected_broadcast_slot_offset(id(4)), Some(6));
    }

    #[test]
    fn expires_neighbors_past_the_window() {
        let mut n = NeighborObserver::new(2);
        n.report_activity(id(4));
        for _ in 0..3 {
            n.on_slot_end();
        }
        assert!(!n.is_active(id(4)));
    }

    #[test]
    fn link_proposals_roundtrip() {
        let mut n = NeighborObserver::new(10);
        let p = LinkProposal { center_freq_khz: 1000, slot_offset: 5, period_exp: 0, num_tx_initiator: 2, num_tx_recipient: 2, slot_duration: 10 };
        n.add_advertised_link_proposal(id(4), 0, p.clone());
        assert_eq!(n.get_advertised_link_proposals(id(4)).len(), 1);
        n.clear_advertised_link_proposals(id(4));
        assert!(n.get_advertised_link_proposals(id(4)).is_empty());
    }
}
