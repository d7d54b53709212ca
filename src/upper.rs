//! The upper-layer (RLC/ARQ) collaborator.
//
// spec.md section 6: upper-layer segmentation, retransmission and
// reassembly are opaque; the MAC only pulls segments to fill a transmit
// opportunity and pushes received packets back up. Grounded on the
// teacher's `sixlo`/`ip6` layering (a lower layer pulling from / pushing to
// a fixed upper-layer trait each tick).

use crate::mac_id::MacId;
use crate::packet::Packet;

/// Everything the MAC core needs from the layer above it.
pub trait UpperLayer {
    /// Whether `link_id` still has data queued above the MAC.
    fn is_there_more_data(&self, link_id: MacId) -> bool;

    /// Pull up to `max_bits` of payload destined for `link_id`. May return
    /// fewer bits, or none, if the upper layer has nothing ready yet.
    fn request_segment(&mut self, max_bits: u32, link_id: MacId) -> Option<Vec<u8>>;

    /// Deliver a packet received from the lower (MAC) layer.
    fn receive_from_lower(&mut self, packet: Packet);

    /// Notify the upper layer that a new link to `peer_id` is usable.
    fn notify_about_new_link(&mut self, peer_id: MacId);

    /// Hand a packet destined for a higher layer still (relay case).
    fn inject_into_upper(&mut self, packet: Packet);

    fn get_max_num_rtx_attempts(&self) -> u32;
}

/// In-memory upper layer used by tests: a fixed queue of segments per link
/// and a record of everything delivered.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct MockUpperLayer {
    pub max_rtx_attempts: u32,
    queued: std::collections::HashMap<MacId, Vec<Vec<u8>>>,
    pub delivered: Vec<Packet>,
    pub new_links: Vec<MacId>,
}

#[cfg(any(test, feature = "test-util"))]
impl MockUpperLayer {
    pub fn new(max_rtx_attempts: u32) -> Self {
        MockUpperLayer { max_rtx_attempts, ..Default::default() }
    }

    pub fn queue(&mut self, link_id: MacId, segment: Vec<u8>) {
        self.queued.entry(link_id).or_default().push(segment);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl UpperLayer for MockUpperLayer {
    fn is_there_more_data(&self, link_id: MacId) -> bool {
        self.queued.get(&link_id).map(|q| !q.is_empty()).unwrap_or(false)
    }

    fn request_segment(&mut self, _max_bits: u32, link_id: MacId) -> Option<Vec<u8>> {
        self.queued.get_mut(&link_id).and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) })
    }

    fn receive_from_lower(&mut self, packet: Packet) {
        self.delivered.push(packet);
    }

    fn notify_about_new_link(&mut self, peer_id: MacId) {
        self.new_links.push(peer_id);
    }

    fn inject_into_upper(&mut self, packet: Packet) {
        self.delivered.push(packet);
    }

    fn get_max_num_rtx_attempts(&self) -> u32 {
        self.max_rtx_attempts
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queued_segments_drain_in_order() {
        let mut upper = MockUpperLayer::new(3);
        let link = MacId::new(4);
        upper.queue(link, vec![1, 2, 3]);
        upper.queue(link, vec![4, 5]);
        assert!(upper.is_there_more_data(link));
        assert_eq!(upper.request_segment(64, link), Some(vec![1, 2, 3]));
        assert_eq!(upper.request_segment(64, link), Some(vec![4, 5]));
        assert!(!upper.is_there_more_data(link));
    }

    #[test]
    fn notify_about_new_link_is_recorded() {
        let mut upper = MockUpperLayer::new(3);
        upper.notify_about_new_link(MacId::new(5));
        assert_eq!(upper.new_links, vec![MacId::new(5)]);
    }
}
