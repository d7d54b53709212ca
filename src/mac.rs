//! Per-slot MAC core driver.
//
// Grounded on spec.md section 4.6 and the teacher's `mac/core.rs`
// (a generic `Mac<R, T>` driving a radio + timer each tick). Here the
// tick is externally supplied (`update(Δ)`) rather than wall-clock driven,
// per spec.md section 5 ("no async/await; every handler runs to
// completion within its slot phase").

use std::collections::HashMap;

use log::{debug, info, trace, warn};

use crate::channel::FrequencyChannel;
use crate::config::Config;
use crate::estimator::{CongestionEstimator, ContentionEstimator};
use crate::link::pp::{EstablishmentOutcome, PpLinkManager, ReplyOutcome};
use crate::link::sh::ShLinkManager;
use crate::link::LinkStatus;
use crate::mac_id::MacId;
use crate::neighbor::NeighborObserver;
use crate::packet::{BaseHeader, ChosenResource, Header, LinkProposal, Packet};
use crate::phy::Phy;
use crate::reservation::Reservation;
use crate::reservation_manager::ReservationManager;
use crate::rng::DeterministicRng;
use crate::third_party::ThirdPartyLink;
use crate::upper::UpperLayer;

fn unordered_pair(a: MacId, b: MacId) -> (MacId, MacId) {
    if a.raw() <= b.raw() {
        (a, b)
    } else {
        (b, a)
    }
}

/// The MAC core. Owns every table, every link manager, and drives them
/// through the three-phase `update -> execute -> on_slot_end` loop.
pub struct Mac<P: Phy, U: UpperLayer> {
    id: MacId,
    config: Config,
    reservations: ReservationManager,
    sh: ShLinkManager,
    pp_links: HashMap<MacId, PpLinkManager>,
    /// Proposal cells tentatively locked by an in-flight (not yet
    /// answered) request, released once the reply arrives or the request
    /// is abandoned: only the proposal the peer actually chose becomes a
    /// real `Tx`/`Rx` reservation via [`ReservationManager::schedule_bursts`].
    /// Each entry tagged with the slot it was locked at, so a long wait in
    /// `AwaitingReply` can be normalized against how many slots have
    /// shifted under it since (`ReservationManager::advance` shifts every
    /// cell every slot).
    pp_pending_locks: HashMap<MacId, (u64, Vec<(FrequencyChannel, usize)>)>,
    pp_pending_sh_lock: HashMap<MacId, (u64, usize)>,
    third_party: HashMap<(MacId, MacId), ThirdPartyLink>,
    contention: ContentionEstimator,
    congestion: CongestionEstimator,
    neighbors: NeighborObserver,
    rng: DeterministicRng,
    current_slot: u64,
    /// Peers whose `AwaitingRequestGeneration` link is waiting for this
    /// node's own SH transmit opportunity before proposals are picked and
    /// locked (spec.md section 4.4: the transition fires when "SH
    /// transmits our request", not the instant the upper layer asks).
    pending_generation: Vec<MacId>,
    pub phy: P,
    pub upper: U,
    pub stat_num_third_party_requests_rcvd: u64,
    pub stat_num_third_party_replies_rcvd: u64,
    pub stat_num_pp_establishment_exceeded: u64,
    pub stat_num_pp_requests_rcvd: u64,
    pub stat_num_pp_replies_sent: u64,
}

impl<P: Phy, U: UpperLayer> Mac<P, U> {
    pub fn new(id: MacId, config: Config, sh_channel: FrequencyChannel, pp_channels: Vec<FrequencyChannel>, rng_seed: u64, phy: P, upper: U) -> Self {
        let horizon = config.planning_horizon as usize;
        Mac {
            id,
            sh: ShLinkManager::new(&config),
            reservations: ReservationManager::new(horizon, sh_channel, pp_channels, config.num_receivers as usize),
            pp_links: HashMap::new(),
            pp_pending_locks: HashMap::new(),
            pp_pending_sh_lock: HashMap::new(),
            third_party: HashMap::new(),
            contention: ContentionEstimator::new(5000),
            congestion: CongestionEstimator::new(5000),
            neighbors: NeighborObserver::new(5000),
            rng: DeterministicRng::from_seed(rng_seed),
            current_slot: 0,
            pending_generation: Vec::new(),
            config,
            phy,
            upper,
            stat_num_third_party_requests_rcvd: 0,
            stat_num_third_party_replies_rcvd: 0,
            stat_num_pp_establishment_exceeded: 0,
            stat_num_pp_requests_rcvd: 0,
            stat_num_pp_replies_sent: 0,
        }
    }

    pub fn id(&self) -> MacId {
        self.id
    }

    pub fn current_slot(&self) -> u64 {
        self.current_slot
    }

    pub fn pp_link(&self, peer: MacId) -> Option<&PpLinkManager> {
        self.pp_links.get(&peer)
    }

    pub fn third_party_link(&self, a: MacId, b: MacId) -> Option<&ThirdPartyLink> {
        self.third_party.get(&unordered_pair(a, b))
    }

    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    pub fn next_broadcast_slot(&self) -> Option<u32> {
        self.sh.next_broadcast_slot()
    }

    pub fn has_pending_sh_traffic_for(&self, peer: MacId) -> bool {
        self.sh.has_pending_for(peer)
    }

    fn pp_link_mut(&mut self, peer: MacId) -> &mut PpLinkManager {
        let config = &self.config;
        self.pp_links.entry(peer).or_insert_with(|| PpLinkManager::new(peer, config))
    }

    /// Release every proposal cell and the SH reply slot tentatively
    /// locked for `peer`'s in-flight request. Idempotent: a cell already
    /// converted to a real `Tx`/`Rx` reservation (the peer's chosen
    /// proposal) is no longer `Locked` and is left untouched.
    fn release_pending_locks(&mut self, peer: MacId) {
        if let Some((created_at, cells)) = self.pp_pending_locks.remove(&peer) {
            let elapsed = self.current_slot.saturating_sub(created_at) as usize;
            for (channel, offset) in cells {
                let Some(offset) = offset.checked_sub(elapsed) else { continue };
                if let Some(table) = self.reservations.pp_table_mut(&channel) {
                    let _ = table.unlock_either_id(offset, peer, peer);
                }
            }
        }
        if let Some((created_at, offset)) = self.pp_pending_sh_lock.remove(&peer) {
            let elapsed = self.current_slot.saturating_sub(created_at) as usize;
            if let Some(offset) = offset.checked_sub(elapsed) {
                let _ = self.reservations.sh_table_mut().unlock_either_id(offset, peer, peer);
            }
        }
    }

    /// Upper layer has data for `link_id`. `MacId::BROADCAST` routes to
    /// the SH broadcast path implicitly (no per-peer state needed); any
    /// other id drives that peer's [`PpLinkManager`].
    pub fn notify_outgoing(&mut self, link_id: MacId, bits: u32) {
        if link_id == MacId::BROADCAST {
            return;
        }
        let became_pending = {
            let link = self.pp_link_mut(link_id);
            link.notify_outgoing(bits);
            link.status == LinkStatus::AwaitingRequestGeneration
        };
        if became_pending && !self.pending_generation.contains(&link_id) {
            self.pending_generation.push(link_id);
        }
    }

    /// Resolve every peer waiting on `AwaitingRequestGeneration`: pick and
    /// lock proposals, build the request header, and enqueue it on SH.
    /// Only called from [`Self::execute`] at the moment this node's own SH
    /// slot actually transmits, so every offset `generate_request` computes
    /// is anchored to the slot the request goes out on.
    fn generate_pending_requests(&mut self) {
        if self.pending_generation.is_empty() {
            return;
        }
        let num_neighbors = self.neighbors.get_num_active_neighbors() as u32;
        let num_pp_channels = self.reservations.all_pp_channels().count() as u32;
        let datarate = self.phy.get_current_datarate();
        for peer in std::mem::take(&mut self.pending_generation) {
            if self.pp_links.get(&peer).map(|l| l.status) == Some(LinkStatus::AwaitingRequestGeneration) {
                self.generate_request(peer, num_neighbors, num_pp_channels, datarate);
            }
        }
    }

    /// `AwaitingRequestGeneration -> AwaitingReply`: pick PP resources,
    /// lock them, and enqueue the request on SH (spec.md section 4.4).
    fn generate_request(&mut self, peer: MacId, num_neighbors: u32, num_pp_channels: u32, datarate: u32) {
        self.release_pending_locks(peer);
        let burst_length_tx;
        let burst_length_rx;
        let burst_offset;
        {
            let link = self.pp_link_mut(peer);
            burst_length_tx = link.estimate_burst_length_tx(datarate);
            burst_length_rx = link.estimate_burst_length_rx();
            burst_offset = link.compute_burst_offset(num_neighbors, num_pp_channels, burst_length_tx + burst_length_rx);
        }
        let burst_length = burst_length_tx + burst_length_rx;
        let timeout = self.config.default_pp_link_timeout;

        let reply_offset = {
            let mut offset = 1usize;
            while offset < self.reservations.horizon() && !matches!(self.reservations.sh_table().get_reservation(offset), Ok(Reservation::Idle)) {
                offset += 1;
            }
            offset as u32
        };

        let mut proposals = Vec::new();
        let channels: Vec<FrequencyChannel> = self.reservations.get_sorted_p2p_reservation_tables().into_iter().cloned().collect();
        for channel in channels.iter().take(self.config.min_num_supported_pp_links.max(1) as usize + 2) {
            let Some(table) = self.reservations.pp_table(channel) else { continue };
            let tx_idle = |t: usize, span: usize| self.reservations.is_transmitter_idle(t, span);
            let rx_idle = |t: usize, span: usize| self.reservations.is_any_receiver_idle(t, span);
            let candidates = table.find_pp_candidates(3, 1, Some(burst_offset as usize), burst_length as usize, burst_length_tx as usize, timeout as usize, tx_idle, rx_idle);
            for start in candidates {
                proposals.push((channel.clone(), LinkProposal { center_freq_khz: channel.center_freq_khz, slot_offset: start as u32, period_exp: 0, num_tx_initiator: burst_length_tx, num_tx_recipient: burst_length_rx, slot_duration: 1 }));
            }
        }

        if proposals.is_empty() {
            warn!("no viable PP resources for peer {}, retrying later", peer);
            return;
        }

        let mut locked = Vec::new();
        for (channel, proposal) in &proposals {
            if let Some(table) = self.reservations.pp_table_mut(channel) {
                for k in 0..timeout as usize {
                    let start = proposal.slot_offset as usize + k * burst_offset as usize;
                    for offset in start..start + burst_length as usize {
                        if table.lock(offset, peer).is_ok() {
                            locked.push((channel.clone(), offset));
                        }
                    }
                }
            }
        }
        self.pp_pending_locks.insert(peer, (self.current_slot, locked));
        let _ = self.reservations.sh_table_mut().lock(reply_offset as usize, peer);
        self.pp_pending_sh_lock.insert(peer, (self.current_slot, reply_offset as usize));

        let proposal_list: Vec<LinkProposal> = proposals.into_iter().map(|(_, p)| p).collect();
        let header = self.pp_link_mut(peer).populate_request(proposal_list, reply_offset, burst_length_tx, burst_length_rx, burst_offset);
        debug!("enqueuing link request to {}", peer);
        self.sh.enqueue_request(header, self.current_slot);
    }

    /// One slot tick: advance every table, let PHY advance, let every
    /// link manager mark its RX/TX intent, tune receivers (spec.md
    /// section 4.6 `update`).
    pub fn update(&mut self, delta: u32) {
        self.reservations.advance(delta as usize);
        self.phy.update(delta);
        self.current_slot += delta as u64;
        self.sh.on_slot_start();

        let expired: Vec<(MacId, MacId)> = self.third_party.values_mut().filter_map(|link| if link.on_slot_end() { Some((link.id_initiator, link.id_recipient)) } else { None }).collect();
        let current_slot = self.current_slot;
        for key in expired {
            if let Some(link) = self.third_party.get_mut(&key) {
                let reservations = &mut self.reservations;
                link.reset(|channel| reservations.pp_table_mut(channel), current_slot);
            }
        }

        // One receiver permanently covers SH: it carries beacons, link
        // control traffic and third-party broadcasts a node must be able
        // to hear with no prior reservation.
        let _ = self.phy.tune_receiver(0, self.reservations.sh_channel());
        let mut receiver_index = 1usize;
        let sh_channel = self.reservations.sh_channel().clone();
        for (reservation, channel) in self.reservations.collect_current_reservations() {
            if reservation.is_rx() && channel != sh_channel {
                let _ = self.phy.tune_receiver(receiver_index, &channel);
                receiver_index += 1;
            }
        }
        if receiver_index > self.config.num_receivers as usize {
            warn!("more simultaneous RX reservations than receivers");
        }
    }

    /// Transmit whatever is scheduled this slot (spec.md section 4.6
    /// `execute`).
    pub fn execute(&mut self) {
        let current = self.reservations.collect_current_reservations();
        let mut transmitter_index = 0usize;
        for (reservation, channel) in current {
            match reservation {
                Reservation::Idle | Reservation::Busy(_) => {}
                Reservation::Rx(_) | Reservation::RxBeacon => {
                    trace!("expecting reception on {}", channel);
                }
                Reservation::Tx(peer) => {
                    if let Some(packet) = self.produce_pp_packet(peer) {
                        let _ = self.phy.transmit(transmitter_index, &channel, packet);
                        transmitter_index += 1;
                    }
                }
                Reservation::TxBeacon => {
                    self.generate_pending_requests();
                    if let Some(packet) = self.produce_sh_packet() {
                        let _ = self.phy.transmit(transmitter_index, &channel, packet);
                        transmitter_index += 1;
                    }
                }
            }
            if transmitter_index > self.config.num_transmitters as usize {
                warn!("more simultaneous TX reservations than transmitters");
                break;
            }
        }
    }

    /// As the established link's initiator: reserve the next `timeout`
    /// bursts at the same cadence and ask the peer to keep using them,
    /// instead of tearing the link down (spec.md supplement: link renewal).
    fn send_renewal_request(&mut self, peer: MacId) {
        let Some(link) = self.pp_links.get(&peer) else { return };
        if link.status != LinkStatus::Established {
            return;
        }
        let Some(channel) = link.channel.clone() else { return };
        let additional_timeout = self.config.default_pp_link_timeout;
        let first_burst_in = link.next_burst_in + link.timeout * link.burst_offset;
        let burst_offset = link.burst_offset;
        let burst_length_tx = link.burst_length_tx;
        let burst_length_rx = link.burst_length_rx;
        let period_exp = link.period_exp;

        if self
            .reservations
            .schedule_bursts(&channel, additional_timeout, first_burst_in, burst_offset, burst_length_tx, burst_length_rx, self.id, peer, true)
            .is_err()
        {
            warn!("could not reserve renewal slots with {}", peer);
            return;
        }

        let link = self.pp_link_mut(peer);
        link.apply_renewal(additional_timeout);
        link.mark_renewal_sent();

        let proposal = LinkProposal { center_freq_khz: channel.center_freq_khz, slot_offset: first_burst_in, period_exp, num_tx_initiator: burst_length_tx, num_tx_recipient: burst_length_rx, slot_duration: 1 };
        let header = crate::packet::LinkRequestHeader { dest: peer, proposals: vec![proposal], reply_offset: 0, timeout: additional_timeout, burst_length_tx, burst_length_rx, burst_offset, is_renewal: true };
        debug!("requesting renewal with {}", peer);
        self.sh.enqueue_request(header, self.current_slot);
    }

    /// As the responder: the peer's `Established` link with us asked for
    /// more bursts at the same cadence. Apply it directly, no viability
    /// scan or tie-break needed since the resources are already ours.
    fn handle_incoming_renewal_request(&mut self, initiator: MacId, request: crate::packet::LinkRequestHeader) {
        let Some(proposal) = request.proposals.first().copied() else { return };
        let Some(channel) = self.reservations.get_freq_channel_by_center_freq(proposal.center_freq_khz).cloned() else { return };
        if self
            .reservations
            .schedule_bursts(&channel, request.timeout, proposal.slot_offset, request.burst_offset, request.burst_length_tx, request.burst_length_rx, self.id, initiator, false)
            .is_err()
        {
            warn!("could not accept renewal slots from {}", initiator);
            return;
        }
        let link = self.pp_link_mut(initiator);
        if link.status != LinkStatus::Established {
            return;
        }
        link.apply_renewal(request.timeout);
        let reply = crate::packet::LinkReplyHeader {
            dest: initiator,
            chosen: ChosenResource { center_freq_khz: proposal.center_freq_khz, slot_offset: proposal.slot_offset },
            burst_length_tx: request.burst_length_tx,
            burst_length_rx: request.burst_length_rx,
            burst_offset: request.burst_offset,
            timeout: request.timeout,
            is_renewal: true,
        };
        self.sh.enqueue_reply(reply, self.current_slot);
        info!("renewed link with {}", initiator);
    }

    fn produce_sh_packet(&mut self) -> Option<Packet> {
        let next_slot_offset = self.sh.next_broadcast_slot().unwrap_or(0);
        let datarate = self.phy.get_current_datarate();
        let current_slot = self.current_slot;
        let id = self.id;
        let upper = &mut self.upper;
        Some(self.sh.assemble_packet(id, next_slot_offset, datarate, current_slot, &mut self.rng, |max_bits| upper.request_segment(max_bits, MacId::BROADCAST)))
    }

    fn produce_pp_packet(&mut self, peer: MacId) -> Option<Packet> {
        let datarate = self.phy.get_current_datarate();
        let has_more = self.upper.is_there_more_data(peer);
        let segment = self.upper.request_segment(datarate, peer);
        let link = self.pp_links.get_mut(&peer)?;
        let mut packet = Packet::new(BaseHeader { source: self.id, next_slot_offset: link.burst_offset });
        packet.add_message(Header::Unicast { dest: peer }, segment);
        let _ = has_more;
        Some(packet)
    }

    /// Dispatch receptions, tick estimators and link managers, schedule
    /// the next SH slot (spec.md section 4.6 `on_slot_end`).
    pub fn on_slot_end(&mut self) {
        let received = self.phy.receive();
        let mut by_origin: Vec<Packet> = Vec::new();
        let mut per_channel_count: HashMap<usize, u32> = HashMap::new();
        for (receiver_index, packet) in &received {
            *per_channel_count.entry(*receiver_index).or_default() += 1;
        }
        for (receiver_index, packet) in received {
            if packet.is_dme {
                warn!("dropping DME packet");
                continue;
            }
            if packet.has_channel_error {
                warn!("dropping packet with channel error");
                continue;
            }
            if per_channel_count.get(&receiver_index).copied().unwrap_or(0) > 1 {
                debug!("collision on receiver {}, keeping highest SNR", receiver_index);
            }
            by_origin.push(packet);
        }

        for packet in by_origin {
            self.dispatch_received(packet);
        }

        let mut expired_links = Vec::new();
        let mut renewals_due = Vec::new();
        let mut retries_due = Vec::new();
        let mut gave_up = Vec::new();
        for link in self.pp_links.values_mut() {
            if link.status == LinkStatus::AwaitingReply {
                if let ReplyOutcome::Missed = link.on_slot_end_awaiting_reply() {
                    match link.on_reply_missed() {
                        EstablishmentOutcome::Retrying => {
                            info!("peer {}: reply missed, retrying", link.peer);
                            retries_due.push(link.peer);
                        }
                        EstablishmentOutcome::GaveUp => {
                            self.stat_num_pp_establishment_exceeded += 1;
                            info!("peer {}: exceeded max establishment attempts", link.peer);
                            gave_up.push(link.peer);
                        }
                    }
                }
            }
            if link.status == LinkStatus::AwaitingDataTx {
                let expecting_first_data = match &link.channel {
                    Some(c) => self.reservations.pp_table(c).map(|t| matches!(t.get_reservation(0), Ok(Reservation::Rx(p)) if p == link.peer)).unwrap_or(false),
                    None => false,
                };
                if expecting_first_data && link.on_first_data_missed() {
                    info!("giving up on {}: too many empty bursts awaiting first data", link.peer);
                    link.cancel();
                    expired_links.push(link.peer);
                }
            }
            if link.status == LinkStatus::Established {
                let is_burst_end = match &link.channel {
                    Some(c) => self.reservations.pp_table(c).map(|t| matches!(t.is_burst_end(0, link.peer), Ok(true))).unwrap_or(false),
                    None => false,
                };
                if is_burst_end {
                    if link.decrement_timeout() {
                        info!("link with {} expired", link.peer);
                        link.cancel();
                        expired_links.push(link.peer);
                    } else if link.is_initiator && link.should_request_renewal() {
                        renewals_due.push(link.peer);
                    }
                }
            }
        }
        for peer in expired_links {
            self.sh.cancel_request(peer);
            self.sh.cancel_reply(peer);
        }
        for peer in renewals_due {
            self.send_renewal_request(peer);
        }
        for peer in gave_up {
            self.release_pending_locks(peer);
        }
        for peer in retries_due {
            if !self.pending_generation.contains(&peer) {
                self.pending_generation.push(peer);
            }
        }

        self.contention.on_slot_end();
        self.congestion.on_slot_end();
        self.neighbors.on_slot_end();

        let has_pending_traffic = self.sh.has_pending_traffic() || !self.pending_generation.is_empty();
        if self.sh.next_broadcast_slot().is_none() && (has_pending_traffic || self.config.always_schedule_next_broadcast_slot) {
            let min_offset = if has_pending_traffic { 1 } else { self.sh.get_avg_num_slots_inbetween_packet_generation().round().max(1.0) as usize };
            let id = self.id;
            let current_slot = self.current_slot;
            let contention = &self.contention;
            let rng = &mut self.rng;
            let _ = self.sh.schedule_broadcast_slot(self.reservations.sh_table_mut(), min_offset, contention, rng, current_slot, id);
        }
    }

    fn dispatch_received(&mut self, packet: Packet) {
        let source = packet.base_header().source;
        let next_slot_offset = packet.base_header().next_slot_offset;
        let is_beacon = packet.is_beacon();
        let _ = self.sh.parse_base_header(self.reservations.sh_table_mut(), &mut self.neighbors, &mut self.contention, &mut self.congestion, source, next_slot_offset, is_beacon);

        if let Some(request) = packet.find_link_request() {
            if request.dest == self.id {
                self.handle_incoming_request(source, request.clone());
            } else {
                self.mirror_request(source, request.dest, request);
            }
        }
        if let Some(reply) = packet.find_link_reply() {
            if reply.dest == self.id {
                self.handle_incoming_reply(source, *reply);
            } else {
                self.mirror_reply(reply.dest, source, reply);
            }
        }
        if packet.is_unicast_to(self.id) {
            if let Some(link) = self.pp_links.get_mut(&source) {
                if link.status == LinkStatus::AwaitingDataTx {
                    link.on_first_data_received();
                    self.upper.notify_about_new_link(source);
                }
            }
            self.upper.receive_from_lower(packet);
        }
    }

    /// Two nodes can trigger `notify_outgoing` toward each other in the same
    /// slot and each generate a request before either sees the other's. The
    /// lower id always keeps pursuing its own attempt and ignores an
    /// incoming request while one is in flight; the higher id defers and
    /// accepts, so exactly one link results instead of both sides looping.
    fn handle_incoming_request(&mut self, initiator: MacId, request: crate::packet::LinkRequestHeader) {
        if request.is_renewal {
            self.handle_incoming_renewal_request(initiator, request);
            return;
        }
        self.stat_num_pp_requests_rcvd += 1;
        if let Some(link) = self.pp_links.get(&initiator) {
            if link.status != LinkStatus::NotEstablished && self.id < initiator {
                debug!("ignoring link request from {}: already pursuing our own request as the lower id", initiator);
                return;
            }
        }
        let transmitter_idle = self.reservations.is_transmitter_idle(request.reply_offset as usize, 1);
        if !self.sh.can_send_link_reply(self.reservations.sh_table(), request.reply_offset as usize, transmitter_idle) {
            warn!("cannot accept link request from {}: reply slot unavailable", initiator);
            return;
        }
        let viable: Vec<LinkProposal> = request
            .proposals
            .iter()
            .filter(|p| {
                self.reservations
                    .get_freq_channel_by_center_freq(p.center_freq_khz)
                    .and_then(|c| self.reservations.pp_table(c))
                    .map(|t| t.is_idle_span(p.slot_offset as usize, (p.num_tx_initiator + p.num_tx_recipient) as usize).unwrap_or(false))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if viable.is_empty() {
            warn!("no viable proposal from {}", initiator);
            return;
        }
        let chosen_proposal = *self.rng.choose(&viable);
        let chosen = ChosenResource { center_freq_khz: chosen_proposal.center_freq_khz, slot_offset: chosen_proposal.slot_offset };
        let Some(channel) = self.reservations.get_freq_channel_by_center_freq(chosen.center_freq_khz).cloned() else { return };

        let _ = self.reservations.schedule_bursts(&channel, request.timeout, chosen.slot_offset, request.burst_offset, chosen_proposal.num_tx_initiator, chosen_proposal.num_tx_recipient, self.id, initiator, false);

        let link = self.pp_link_mut(initiator);
        link.accept_request(chosen, channel, chosen_proposal.num_tx_initiator, chosen_proposal.num_tx_recipient, request.burst_offset, request.timeout);
        let reply = link.build_reply(chosen);
        self.sh.enqueue_reply(reply, self.current_slot);
        self.stat_num_pp_replies_sent += 1;
        self.sh.cancel_request(initiator);
        info!("accepted link request from {}", initiator);
    }

    fn handle_incoming_reply(&mut self, recipient: MacId, reply: crate::packet::LinkReplyHeader) {
        if reply.is_renewal {
            debug!("renewal confirmed by {}", recipient);
            return;
        }
        let Some(channel) = self.reservations.get_freq_channel_by_center_freq(reply.chosen.center_freq_khz).cloned() else { return };
        let timeout = reply.timeout;
        let _ = self.reservations.schedule_bursts(&channel, timeout, reply.chosen.slot_offset, reply.burst_offset, reply.burst_length_tx, reply.burst_length_rx, self.id, recipient, true);
        self.release_pending_locks(recipient);
        let link = self.pp_link_mut(recipient);
        link.receive_reply(reply.chosen, channel, reply.burst_length_tx, reply.burst_length_rx, reply.burst_offset, reply.timeout, reply.chosen.slot_offset);
        self.upper.notify_about_new_link(recipient);
        info!("link with {} established", recipient);
    }

    fn mirror_request(&mut self, initiator: MacId, recipient: MacId, request: &crate::packet::LinkRequestHeader) {
        self.stat_num_third_party_requests_rcvd += 1;
        let key = unordered_pair(initiator, recipient);
        let expected_reply = self.neighbors.get_next_expected_broadcast_slot_offset(recipient).or_else(|| self.neighbors.get_next_expected_broadcast_slot_offset(initiator));
        let timeout = request.timeout;
        let proposals = request.proposals.clone();
        let current_slot = self.current_slot;
        let link = self.third_party.entry(key).or_insert_with(|| ThirdPartyLink::new(initiator, recipient));
        link.on_request_overheard(expected_reply);
        for proposal in &proposals {
            if let Some(channel) = self.reservations.get_freq_channel_by_center_freq(proposal.center_freq_khz).cloned() {
                if let Some(table) = self.reservations.pp_table_mut(&channel) {
                    link.lock_proposal_on(table, &channel, proposal, timeout, current_slot);
                }
            }
        }
    }

    fn mirror_reply(&mut self, initiator: MacId, recipient: MacId, reply: &crate::packet::LinkReplyHeader) {
        self.stat_num_third_party_replies_rcvd += 1;
        let key = unordered_pair(initiator, recipient);
        let Some(channel) = self.reservations.get_freq_channel_by_center_freq(reply.chosen.center_freq_khz).cloned() else { return };
        let Some(link) = self.third_party.get_mut(&key) else { return };
        let period_exp = 0u8;
        let current_slot = self.current_slot;
        let reservations = &mut self.reservations;
        if let Some(table) = reservations.pp_table_mut(&channel) {
            link.on_reply_overheard(|_| None, table, &channel, reply.chosen, reply.burst_length_tx, reply.burst_length_rx, reply.burst_offset, reply.timeout, period_exp, current_slot);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelRole;
    use crate::phy::MockPhy;
    use crate::upper::MockUpperLayer;

    fn sh_channel() -> FrequencyChannel {
        FrequencyChannel::new(ChannelRole::Sh, 1000, 200)
    }
    fn pp_channel(freq: u64) -> FrequencyChannel {
        FrequencyChannel::new(ChannelRole::Pp, freq, 200)
    }

    fn make_mac(id: u32) -> Mac<MockPhy, MockUpperLayer> {
        let mut config = Config::default();
        config.planning_horizon = 64;
        config.contention_method = crate::config::ContentionMethod::NaiveRandomAccess;
        config.min_num_candidate_slots = 3;
        config.max_num_candidate_slots = 3;
        Mac::new(MacId::new(id), config, sh_channel(), vec![pp_channel(2000), pp_channel(3000)], 7, MockPhy::new(1000), MockUpperLayer::new(3))
    }

    #[test]
    fn solo_broadcast_schedules_within_min_candidates() {
        let mut mac = make_mac(4);
        mac.upper.queue(MacId::BROADCAST, vec![1, 2, 3]);
        for _ in 0..5 {
            mac.update(1);
            mac.execute();
            mac.on_slot_end();
            if mac.sh.next_broadcast_slot().is_some() {
                break;
            }
        }
        assert!(mac.sh.next_broadcast_slot().is_some());
        assert!(mac.sh.next_broadcast_slot().unwrap() <= 3);
    }

    #[test]
    fn notify_outgoing_waits_for_generation_until_sh_transmits() {
        let mut mac = make_mac(4);
        mac.notify_outgoing(MacId::new(5), 512);
        // Proposals aren't picked and the request isn't enqueued the
        // instant upper-layer data shows up: only once this node's SH
        // slot actually transmits.
        assert_eq!(mac.pp_link(MacId::new(5)).unwrap().status, LinkStatus::AwaitingRequestGeneration);
        for _ in 0..20 {
            mac.update(1);
            mac.execute();
            mac.on_slot_end();
            if mac.pp_link(MacId::new(5)).unwrap().status == LinkStatus::AwaitingReply {
                break;
            }
        }
        assert_eq!(mac.pp_link(MacId::new(5)).unwrap().status, LinkStatus::AwaitingReply);
    }
}
