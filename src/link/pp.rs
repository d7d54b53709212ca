//! Bilateral point-to-point link state machine, one instance per peer.
//
// Grounded on P2PLinkManager.{hpp,cpp} and spec.md section 4.4.

use crate::channel::FrequencyChannel;
use crate::config::Config;
use crate::estimator::MovingAverage;
use crate::mac_id::MacId;
use crate::packet::{ChosenResource, LinkProposal, LinkReplyHeader, LinkRequestHeader};

/// Link lifecycle states (spec.md section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    NotEstablished,
    AwaitingRequestGeneration,
    AwaitingReply,
    AwaitingDataTx,
    Established,
}

/// One peer's bilateral link state.
pub struct PpLinkManager {
    pub peer: MacId,
    pub status: LinkStatus,
    pub is_initiator: bool,
    pub channel: Option<FrequencyChannel>,
    pub period_exp: u8,
    pub burst_length_tx: u32,
    pub burst_length_rx: u32,
    pub burst_offset: u32,
    pub timeout: u32,
    pub next_burst_in: u32,
    pub time_slots_until_reply: Option<u32>,

    pub reported_resource_requirement: u32,
    pub outgoing_traffic_estimate: MovingAverage,

    pub establishment_attempts: u32,
    pub missed_reply_count: u32,
    pub empty_burst_count: u32,
    pub renewal_attempts_remaining: u32,
    renewal_requested: bool,

    config: PpConfig,
}

/// Snapshot of the `Config` fields this link manager needs, avoiding a
/// borrow of the whole `Config` for the link's lifetime.
#[derive(Debug, Clone, Copy)]
struct PpConfig {
    default_pp_link_timeout: u32,
    default_burst_offset: u32,
    adaptive_burst_offset: bool,
    min_consecutive_tx_slots: u32,
    max_consecutive_tx_slots: u32,
    force_bidirectional_links: bool,
    max_pp_establishment_attempts: u32,
    max_no_of_tolerable_empty_bursts: u32,
    renewal_attempts: u32,
}

impl From<&Config> for PpConfig {
    fn from(c: &Config) -> Self {
        PpConfig {
            default_pp_link_timeout: c.default_pp_link_timeout,
            default_burst_offset: c.default_burst_offset,
            adaptive_burst_offset: c.adaptive_burst_offset,
            min_consecutive_tx_slots: c.min_consecutive_tx_slots,
            max_consecutive_tx_slots: c.max_consecutive_tx_slots,
            force_bidirectional_links: c.force_bidirectional_links,
            max_pp_establishment_attempts: c.max_pp_establishment_attempts,
            max_no_of_tolerable_empty_bursts: c.max_no_of_tolerable_empty_bursts,
            renewal_attempts: c.renewal_attempts,
        }
    }
}

impl PpLinkManager {
    pub fn new(peer: MacId, config: &Config) -> Self {
        PpLinkManager {
            peer,
            status: LinkStatus::NotEstablished,
            is_initiator: false,
            channel: None,
            period_exp: 0,
            burst_length_tx: config.min_consecutive_tx_slots,
            burst_length_rx: 1,
            burst_offset: config.default_burst_offset,
            timeout: config.default_pp_link_timeout,
            next_burst_in: 0,
            time_slots_until_reply: None,
            reported_resource_requirement: 1,
            outgoing_traffic_estimate: MovingAverage::new(50),
            establishment_attempts: 0,
            missed_reply_count: 0,
            empty_burst_count: 0,
            renewal_attempts_remaining: config.renewal_attempts,
            renewal_requested: false,
            config: PpConfig::from(config),
        }
    }

    /// `notifyOutgoing`: upper layer has `bits` queued for this peer and no
    /// link is currently established. Transitions `NotEstablished ->
    /// AwaitingRequestGeneration`.
    pub fn notify_outgoing(&mut self, bits: u32) {
        self.outgoing_traffic_estimate.put(bits as f64);
        if self.status == LinkStatus::NotEstablished {
            self.status = LinkStatus::AwaitingRequestGeneration;
            self.is_initiator = true;
        }
    }

    pub fn estimate_burst_length_tx(&self, datarate: u32) -> u32 {
        let raw = (self.outgoing_traffic_estimate.get() / datarate.max(1) as f64).ceil() as u32;
        raw.clamp(self.config.min_consecutive_tx_slots, self.config.max_consecutive_tx_slots)
    }

    pub fn estimate_burst_length_rx(&self) -> u32 {
        if self.config.force_bidirectional_links {
            self.reported_resource_requirement.max(1)
        } else {
            self.reported_resource_requirement
        }
    }

    pub fn compute_burst_offset(&self, num_neighbors: u32, num_pp_channels: u32, burst_length: u32) -> u32 {
        if self.config.adaptive_burst_offset && num_pp_channels > 0 {
            let adaptive = burst_length + (4 * num_neighbors * burst_length).div_ceil(num_pp_channels);
            adaptive.max(burst_length)
        } else {
            self.config.default_burst_offset
        }
    }

    /// `AwaitingRequestGeneration -> AwaitingReply`: build the outgoing
    /// request from locally selected proposals, record reply-wait state.
    pub fn populate_request(&mut self, proposals: Vec<LinkProposal>, reply_offset: u32, burst_length_tx: u32, burst_length_rx: u32, burst_offset: u32) -> LinkRequestHeader {
        self.burst_length_tx = burst_length_tx;
        self.burst_length_rx = burst_length_rx;
        self.burst_offset = burst_offset;
        self.time_slots_until_reply = Some(reply_offset);
        self.status = LinkStatus::AwaitingReply;
        LinkRequestHeader { dest: self.peer, proposals, reply_offset, timeout: self.timeout, burst_length_tx, burst_length_rx, burst_offset, is_renewal: false }
    }

    /// One slot has passed while `AwaitingReply`; decrements the reply
    /// countdown. Per the preserved open question, this is the single
    /// decrement-and-check site (spec.md section 9).
    pub fn on_slot_end_awaiting_reply(&mut self) -> ReplyOutcome {
        match self.time_slots_until_reply {
            Some(0) => ReplyOutcome::Missed,
            Some(n) => {
                self.time_slots_until_reply = Some(n - 1);
                ReplyOutcome::Waiting
            }
            None => ReplyOutcome::Waiting,
        }
    }

    /// A `LinkReply` arrived while `AwaitingReply`: transition to
    /// `Established`.
    pub fn receive_reply(&mut self, chosen: ChosenResource, channel: FrequencyChannel, burst_length_tx: u32, burst_length_rx: u32, burst_offset: u32, timeout: u32, first_burst_in: u32) {
        self.channel = Some(channel);
        self.burst_length_tx = burst_length_tx;
        self.burst_length_rx = burst_length_rx;
        self.burst_offset = burst_offset;
        self.timeout = timeout;
        self.next_burst_in = first_burst_in;
        self.time_slots_until_reply = None;
        self.status = LinkStatus::Established;
        let _ = chosen;
    }

    /// Reply missed its deadline: count the attempt and either retry
    /// (`AwaitingRequestGeneration`) or give up (`NotEstablished`).
    pub fn on_reply_missed(&mut self) -> EstablishmentOutcome {
        self.establishment_attempts += 1;
        self.missed_reply_count += 1;
        self.cancel();
        if self.establishment_attempts < self.config.max_pp_establishment_attempts {
            self.status = LinkStatus::AwaitingRequestGeneration;
            self.is_initiator = true;
            EstablishmentOutcome::Retrying
        } else {
            self.status = LinkStatus::NotEstablished;
            EstablishmentOutcome::GaveUp
        }
    }

    /// As responder: a `LinkRequest` addressed to us arrived while
    /// `NotEstablished`. Caller has already checked viability and picked a
    /// proposal; this only records the resulting state.
    pub fn accept_request(&mut self, chosen: ChosenResource, channel: FrequencyChannel, burst_length_tx: u32, burst_length_rx: u32, burst_offset: u32, timeout: u32) {
        self.is_initiator = false;
        self.channel = Some(channel);
        self.burst_length_tx = burst_length_tx;
        self.burst_length_rx = burst_length_rx;
        self.burst_offset = burst_offset;
        self.timeout = timeout;
        self.next_burst_in = chosen.slot_offset;
        self.status = LinkStatus::AwaitingDataTx;
    }

    pub fn build_reply(&self, chosen: ChosenResource) -> LinkReplyHeader {
        LinkReplyHeader { dest: self.peer, chosen, burst_length_tx: self.burst_length_tx, burst_length_rx: self.burst_length_rx, burst_offset: self.burst_offset, timeout: self.timeout, is_renewal: false }
    }

    /// Extend an `Established` link by `additional_timeout` more bursts at
    /// the same cadence instead of tearing down and re-handshaking
    /// (spec.md supplement: link renewal).
    pub fn apply_renewal(&mut self, additional_timeout: u32) {
        self.timeout = additional_timeout;
    }

    /// The peer's first data packet actually arrived: `AwaitingDataTx ->
    /// Established`.
    pub fn on_first_data_received(&mut self) {
        if self.status == LinkStatus::AwaitingDataTx {
            self.status = LinkStatus::Established;
            self.empty_burst_count = 0;
        }
    }

    /// Expected the peer's first data this slot but nothing arrived.
    pub fn on_first_data_missed(&mut self) -> bool {
        self.empty_burst_count += 1;
        self.empty_burst_count >= self.config.max_no_of_tolerable_empty_bursts
    }

    /// At a burst end while `Established`: decrement the remaining-burst
    /// timeout. Returns `true` if the link has now expired.
    pub fn decrement_timeout(&mut self) -> bool {
        if self.renewal_requested && self.timeout <= self.config.renewal_attempts.max(1) {
            // renewal already requested; keep counting down regardless
        } else if self.config.renewal_attempts > 0 && self.timeout == self.config.renewal_attempts {
            self.renewal_requested = true;
        }
        if self.timeout == 0 {
            return true;
        }
        self.timeout -= 1;
        self.timeout == 0
    }

    pub fn should_request_renewal(&self) -> bool {
        self.renewal_requested && self.renewal_attempts_remaining > 0
    }

    pub fn mark_renewal_sent(&mut self) {
        self.renewal_requested = false;
        self.renewal_attempts_remaining = self.renewal_attempts_remaining.saturating_sub(1);
    }

    pub fn record_reported_tx_slots(&mut self, peer_burst_length_tx: u32) {
        self.reported_resource_requirement = peer_burst_length_tx;
    }

    /// `cancelLink`: idempotent. Resets to `NotEstablished` and clears all
    /// link-specific state; resource unlocking/unscheduling is done by the
    /// caller against the `ReservationManager` before or after this call.
    pub fn cancel(&mut self) {
        self.status = LinkStatus::NotEstablished;
        self.channel = None;
        self.is_initiator = false;
        self.time_slots_until_reply = None;
        self.next_burst_in = 0;
        self.renewal_requested = false;
    }

    pub fn is_established(&self) -> bool {
        self.status == LinkStatus::Established
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Waiting,
    Missed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishmentOutcome {
    Retrying,
    GaveUp,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelRole;

    fn id(n: u32) -> MacId {
        MacId::new(n)
    }

    #[test]
    fn notify_outgoing_starts_establishment() {
        let config = Config::default();
        let mut pp = PpLinkManager::new(id(5), &config);
        pp.notify_outgoing(512);
        assert_eq!(pp.status, LinkStatus::AwaitingRequestGeneration);
        assert!(pp.is_initiator);
    }

    #[test]
    fn missed_reply_retries_until_max_attempts() {
        let mut config = Config::default();
        config.max_pp_establishment_attempts = 2;
        let mut pp = PpLinkManager::new(id(5), &config);
        pp.notify_outgoing(10);
        pp.populate_request(vec![], 3, 1, 1, 10);
        assert_eq!(pp.on_reply_missed(), EstablishmentOutcome::Retrying);
        pp.populate_request(vec![], 3, 1, 1, 10);
        assert_eq!(pp.on_reply_missed(), EstablishmentOutcome::GaveUp);
        assert_eq!(pp.status, LinkStatus::NotEstablished);
    }

    #[test]
    fn established_link_ticks_down_to_expiry() {
        let mut config = Config::default();
        config.default_pp_link_timeout = 2;
        config.renewal_attempts = 0;
        let mut pp = PpLinkManager::new(id(5), &config);
        pp.accept_request(ChosenResource { center_freq_khz: 2000, slot_offset: 4 }, FrequencyChannel::new(ChannelRole::Pp, 2000, 100), 1, 1, 10, 2);
        pp.on_first_data_received();
        assert!(pp.is_established());
        assert!(!pp.decrement_timeout());
        assert!(pp.decrement_timeout());
    }

    #[test]
    fn cancel_is_idempotent() {
        let config = Config::default();
        let mut pp = PpLinkManager::new(id(5), &config);
        pp.notify_outgoing(10);
        pp.cancel();
        let after_first = (pp.status, pp.channel.clone().map(|c| c.center_freq_khz));
        pp.cancel();
        let after_second = (pp.status, pp.channel.clone().map(|c| c.center_freq_khz));
        assert_eq!(after_first, after_second);
    }
}
