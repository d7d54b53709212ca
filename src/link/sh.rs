//! Shared-channel broadcast scheduler and link-establishment control traffic.
//
// Grounded on BCLinkManager.{hpp,cpp} and spec.md section 4.3.

use std::collections::VecDeque;

use crate::config::{Config, ContentionMethod};
use crate::error::Result;
use crate::estimator::{CongestionEstimator, ContentionEstimator, MovingAverage};
use crate::mac_id::MacId;
use crate::neighbor::NeighborObserver;
use crate::packet::{BaseHeader, Header, LinkReplyHeader, LinkRequestHeader, Packet};
use crate::reservation::{Reservation, ReservationTable};
use crate::rng::DeterministicRng;

/// Shift every offset in `req` back by `elapsed`, the number of slots that
/// passed between when its proposals were computed and the slot it actually
/// goes out on (spec.md section 4.4).
fn normalize_request(mut req: LinkRequestHeader, elapsed: u32) -> LinkRequestHeader {
    for proposal in req.proposals.iter_mut() {
        proposal.slot_offset = proposal.slot_offset.saturating_sub(elapsed);
    }
    req.reply_offset = req.reply_offset.saturating_sub(elapsed);
    req
}

/// As [`normalize_request`], for the chosen resource a reply communicates.
fn normalize_reply(mut rep: LinkReplyHeader, elapsed: u32) -> LinkReplyHeader {
    rep.chosen.slot_offset = rep.chosen.slot_offset.saturating_sub(elapsed);
    rep
}

/// `n! / (k! (n-k)!)`, ported from `BCLinkManager::nchoosek`'s recursive
/// `n*C(n-1,k-1)/k` form.
fn nchoosek(n: u32, k: u32) -> f64 {
    if k == 0 || k == n {
        return 1.0;
    }
    if k > n {
        return 0.0;
    }
    (n as f64 / k as f64) * nchoosek(n - 1, k - 1)
}

/// Owns the single SH channel: when to transmit, what to fill the slot
/// with, and parsing of every received SH packet.
pub struct ShLinkManager {
    target_collision_prob: f64,
    contention_method: ContentionMethod,
    min_num_candidate_slots: u32,
    max_num_candidate_slots: u32,
    always_schedule_next_broadcast_slot: bool,
    advertise_next_slot_in_current_header: bool,

    min_beacon_gap: u32,
    min_beacon_interval: u32,
    max_beacon_interval: u32,

    next_broadcast_slot: Option<u32>,
    next_beacon_slot: Option<u32>,
    slots_since_last_beacon: u32,

    /// Queued alongside the slot they were enqueued at: a request/reply's
    /// proposed offsets are only meaningful relative to the slot they were
    /// computed at, and queueing delay before the SH layer actually gets a
    /// transmit opportunity means that slot may no longer be "now" by the
    /// time it goes out (spec.md section 4.4: normalize by the slots
    /// elapsed since the offsets were computed).
    pending_requests: VecDeque<(u64, LinkRequestHeader)>,
    pending_replies: VecDeque<(u64, LinkReplyHeader)>,

    avg_num_slots_inbetween_packet_generations: MovingAverage,
    last_broadcast_slot: Option<u64>,
}

impl ShLinkManager {
    pub fn new(config: &Config) -> Self {
        ShLinkManager {
            target_collision_prob: config.target_collision_prob,
            contention_method: config.contention_method,
            min_num_candidate_slots: config.min_num_candidate_slots,
            max_num_candidate_slots: config.max_num_candidate_slots,
            always_schedule_next_broadcast_slot: config.always_schedule_next_broadcast_slot,
            advertise_next_slot_in_current_header: config.advertise_next_slot_in_current_header,
            min_beacon_gap: config.min_beacon_gap,
            min_beacon_interval: config.min_beacon_interval,
            max_beacon_interval: config.max_beacon_interval,
            next_broadcast_slot: None,
            next_beacon_slot: Some(config.min_beacon_interval),
            slots_since_last_beacon: 0,
            pending_requests: VecDeque::new(),
            pending_replies: VecDeque::new(),
            avg_num_slots_inbetween_packet_generations: MovingAverage::new(100),
            last_broadcast_slot: None,
        }
    }

    pub fn enqueue_request(&mut self, header: LinkRequestHeader, enqueued_at_slot: u64) {
        self.pending_requests.push_back((enqueued_at_slot, header));
    }

    pub fn enqueue_reply(&mut self, header: LinkReplyHeader, enqueued_at_slot: u64) {
        self.pending_replies.push_back((enqueued_at_slot, header));
    }

    pub fn cancel_request(&mut self, dest: MacId) -> usize {
        let before = self.pending_requests.len();
        self.pending_requests.retain(|(_, r)| r.dest != dest);
        before - self.pending_requests.len()
    }

    pub fn cancel_reply(&mut self, dest: MacId) -> usize {
        let before = self.pending_replies.len();
        self.pending_replies.retain(|(_, r)| r.dest != dest);
        before - self.pending_replies.len()
    }

    pub fn has_pending_traffic(&self) -> bool {
        !self.pending_requests.is_empty() || !self.pending_replies.is_empty()
    }

    pub fn has_pending_for(&self, dest: MacId) -> bool {
        self.pending_requests.iter().any(|(_, r)| r.dest == dest) || self.pending_replies.iter().any(|(_, r)| r.dest == dest)
    }

    pub fn next_broadcast_slot(&self) -> Option<u32> {
        self.next_broadcast_slot
    }

    pub fn can_send_link_reply(&self, table: &ReservationTable, offset: usize, transmitter_idle: bool) -> bool {
        matches!(table.get_reservation(offset), Ok(Reservation::Idle)) && transmitter_idle
    }

    /// Number of candidate slots to scan for, per the configured
    /// contention-estimation method (spec.md section 4.3).
    pub fn choose_num_candidates(&self, contention: &ContentionEstimator) -> u32 {
        let p_coll = self.target_collision_prob;
        let n = contention.get_num_active_neighbors() as u32;
        let k = match self.contention_method {
            ContentionMethod::NaiveRandomAccess => 100.0,
            ContentionMethod::AllActiveAgainAssumption => {
                if n == 0 {
                    1.0
                } else {
                    (1.0 / (1.0 - (1.0 - p_coll).powf(1.0 / n as f64))).ceil()
                }
            }
            ContentionMethod::BinomialEstimate => {
                let r = contention.get_average_non_beacon_broadcast_rate();
                let mut sum = 0.0;
                for np in 0..=n {
                    let per_np_k = if np == 0 { 1.0 } else { (1.0 / (1.0 - (1.0 - p_coll).powf(1.0 / np as f64))).ceil() };
                    let weight = nchoosek(n, np) * r.powi(np as i32) * (1.0 - r).powi((n - np) as i32);
                    sum += weight * per_np_k;
                }
                sum.ceil()
            }
            ContentionMethod::PoissonBinomialEstimate => {
                let active = contention.get_active_neighbors();
                if active.is_empty() {
                    1.0
                } else {
                    let avg_k: f64 = active
                        .iter()
                        .map(|id| {
                            let p = contention.get_channel_access_probability(*id).max(1e-6);
                            (1.0 / (1.0 - (1.0 - p_coll).powf(1.0 / p))).ceil()
                        })
                        .sum::<f64>()
                        / active.len() as f64;
                    avg_k.ceil()
                }
            }
        };
        (k as u32).clamp(self.min_num_candidate_slots, self.max_num_candidate_slots)
    }

    pub fn get_avg_num_slots_inbetween_packet_generation(&self) -> f64 {
        self.avg_num_slots_inbetween_packet_generations.get()
    }

    fn record_generation_gap(&mut self, current_slot: u64) {
        if let Some(last) = self.last_broadcast_slot {
            self.avg_num_slots_inbetween_packet_generations.put((current_slot - last) as f64);
        }
        self.last_broadcast_slot = Some(current_slot);
    }

    /// Compute a candidate count, scan the SH table for that many idle
    /// slots at or beyond `min_offset`, and uniformly pick one (spec.md
    /// section 4.3). Marks the chosen slot `Tx` and records it.
    pub fn schedule_broadcast_slot(
        &mut self,
        table: &mut ReservationTable,
        min_offset: usize,
        contention: &ContentionEstimator,
        rng: &mut DeterministicRng,
        current_slot: u64,
        self_id: MacId,
    ) -> Result<Option<u32>> {
        let k = self.choose_num_candidates(contention) as usize;
        let mut candidates = Vec::with_capacity(k);
        let mut t = min_offset;
        while candidates.len() < k && t < table.horizon() {
            if matches!(table.get_reservation(t), Ok(Reservation::Idle)) {
                candidates.push(t);
            }
            t += 1;
        }
        if candidates.is_empty() {
            self.next_broadcast_slot = None;
            return Ok(None);
        }
        let chosen = *rng.choose(&candidates);
        table.mark(chosen, Reservation::Tx(self_id))?;
        self.next_broadcast_slot = Some(chosen as u32);
        self.record_generation_gap(current_slot);
        Ok(Some(chosen as u32))
    }

    /// A remote advertisement collided with our own scheduled slot;
    /// re-run slot selection, keeping the remote's claim as `Rx`.
    pub fn broadcast_collision_detected(
        &mut self,
        table: &mut ReservationTable,
        min_offset: usize,
        contention: &ContentionEstimator,
        rng: &mut DeterministicRng,
        current_slot: u64,
        self_id: MacId,
    ) -> Result<Option<u32>> {
        self.schedule_broadcast_slot(table, min_offset, contention, rng, current_slot, self_id)
    }

    fn due_for_beacon(&self) -> bool {
        matches!(self.next_beacon_slot, Some(0)) && self.slots_since_last_beacon >= self.min_beacon_gap
    }

    /// Schedule the next beacon between `min_beacon_interval` and
    /// `max_beacon_interval` slots out.
    pub fn reschedule_beacon(&mut self, rng: &mut DeterministicRng) {
        let span: Vec<u32> = (self.min_beacon_interval..=self.max_beacon_interval).collect();
        let next = *rng.choose(&span);
        self.next_beacon_slot = Some(next);
        self.slots_since_last_beacon = 0;
    }

    pub fn on_slot_start(&mut self) {
        if let Some(slot) = self.next_beacon_slot {
            self.next_beacon_slot = Some(slot.saturating_sub(1));
        }
        self.slots_since_last_beacon = self.slots_since_last_beacon.saturating_add(1);
    }

    /// Assemble the packet to transmit during our scheduled broadcast
    /// slot: a beacon if due, else queued requests/replies by priority,
    /// else upper-layer broadcast data, fit to `capacity_bits`.
    pub fn assemble_packet(
        &mut self,
        self_id: MacId,
        next_slot_offset: u32,
        capacity_bits: u32,
        current_slot: u64,
        rng: &mut DeterministicRng,
        mut take_broadcast_data: impl FnMut(u32) -> Option<Vec<u8>>,
    ) -> Packet {
        let mut packet = Packet::new(BaseHeader { source: self_id, next_slot_offset });
        let mut used_bits = Header::Base(BaseHeader { source: self_id, next_slot_offset }).bits();

        if self.due_for_beacon() {
            packet.add_message(Header::Beacon, None);
            used_bits += Header::Beacon.bits();
            self.reschedule_beacon(rng);
            return packet;
        }

        while let Some((_, req)) = self.pending_requests.front() {
            let bits = Header::LinkRequest(req.clone()).bits();
            if used_bits + bits > capacity_bits {
                break;
            }
            used_bits += bits;
            let (enqueued_at, req) = self.pending_requests.pop_front().unwrap();
            let elapsed = current_slot.saturating_sub(enqueued_at) as u32;
            packet.add_message(Header::LinkRequest(normalize_request(req, elapsed)), None);
        }
        while let Some((_, rep)) = self.pending_replies.front() {
            let bits = Header::LinkReply(*rep).bits();
            if used_bits + bits > capacity_bits {
                break;
            }
            used_bits += bits;
            let (enqueued_at, rep) = self.pending_replies.pop_front().unwrap();
            let elapsed = current_slot.saturating_sub(enqueued_at) as u32;
            packet.add_message(Header::LinkReply(normalize_reply(rep, elapsed)), None);
        }

        if used_bits < capacity_bits {
            let remaining_bytes = (capacity_bits - used_bits) / 8;
            if remaining_bytes > 0 {
                if let Some(segment) = take_broadcast_data(remaining_bytes * 8) {
                    packet.add_message(Header::Broadcast, Some(segment));
                }
            }
        }
        packet
    }

    /// Update contention/congestion estimators and the neighbor observer
    /// from a received SH packet's base header, and pre-mark the sender's
    /// advertised next slot as `Rx` so we don't plan over it.
    pub fn parse_base_header(
        &mut self,
        table: &mut ReservationTable,
        neighbors: &mut NeighborObserver,
        contention: &mut ContentionEstimator,
        congestion: &mut CongestionEstimator,
        sender: MacId,
        next_slot_offset: u32,
        is_beacon: bool,
    ) -> Result<()> {
        neighbors.report_activity(sender);
        congestion.report_broadcast(sender);
        if !is_beacon {
            contention.report_non_beacon_broadcast(sender);
        }
        neighbors.report_broadcast_slot_advertisement(sender, next_slot_offset);
        if matches!(table.get_reservation(next_slot_offset as usize), Ok(Reservation::Idle)) {
            table.mark(next_slot_offset as usize, Reservation::Rx(sender))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::estimator::ContentionEstimator;

    fn id(n: u32) -> MacId {
        MacId::new(n)
    }

    #[test]
    fn naive_random_access_is_fixed_at_100() {
        let mut c = Config::default();
        c.contention_method = ContentionMethod::NaiveRandomAccess;
        c.max_num_candidate_slots = 200;
        let sh = ShLinkManager::new(&c);
        let contention = ContentionEstimator::new(100);
        assert_eq!(sh.choose_num_candidates(&contention), 100);
    }

    #[test]
    fn candidate_count_is_clamped() {
        let mut c = Config::default();
        c.contention_method = ContentionMethod::NaiveRandomAccess;
        c.max_num_candidate_slots = 10;
        let sh = ShLinkManager::new(&c);
        let contention = ContentionEstimator::new(100);
        assert_eq!(sh.choose_num_candidates(&contention), 10);
    }

    #[test]
    fn schedule_broadcast_slot_marks_tx() {
        let c = Config::default();
        let mut sh = ShLinkManager::new(&c);
        let mut table = ReservationTable::new(32);
        let contention = ContentionEstimator::new(100);
        let mut rng = DeterministicRng::from_seed(1);
        let chosen = sh.schedule_broadcast_slot(&mut table, 1, &contention, &mut rng, 0, id(4)).unwrap();
        assert!(chosen.is_some());
        assert_eq!(table.get_reservation(chosen.unwrap() as usize).unwrap(), Reservation::Tx(id(4)));
    }

    #[test]
    fn cancel_request_removes_matching_entries() {
        let c = Config::default();
        let mut sh = ShLinkManager::new(&c);
        sh.enqueue_request(LinkRequestHeader { dest: id(5), proposals: vec![], reply_offset: 1, timeout: 1, burst_length_tx: 1, burst_length_rx: 1, burst_offset: 1, is_renewal: false }, 0);
        assert_eq!(sh.cancel_request(id(5)), 1);
        assert!(!sh.has_pending_traffic());
    }

    #[test]
    fn assemble_packet_normalizes_stale_offsets_by_queue_delay() {
        use crate::packet::LinkProposal;

        let c = Config::default();
        let mut sh = ShLinkManager::new(&c);
        let mut rng = DeterministicRng::from_seed(1);
        let proposal = LinkProposal { center_freq_khz: 2000, slot_offset: 10, period_exp: 0, num_tx_initiator: 1, num_tx_recipient: 1, slot_duration: 1 };
        sh.enqueue_request(
            LinkRequestHeader { dest: id(5), proposals: vec![proposal], reply_offset: 6, timeout: 1, burst_length_tx: 1, burst_length_rx: 1, burst_offset: 1, is_renewal: false },
            0,
        );
        // The request sat in queue for 4 slots before this node's own
        // broadcast slot came up.
        let packet = sh.assemble_packet(id(4), 0, 10_000, 4, &mut rng, |_| None);
        let req = packet.find_link_request().unwrap();
        assert_eq!(req.proposals[0].slot_offset, 6);
        assert_eq!(req.reply_offset, 2);
    }
}
