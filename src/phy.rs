//! The physical-layer collaborator.
//
// spec.md section 6: "the PHY interface is a collaborator, not part of
// this module's scope. Model it as a trait the MAC core drives, the same
// way the implementation drives `ieee802154::Device` / `radio::Radio`."
// Grounded on the teacher's `mac_802154/mod.rs` (`Radio` generic bound)
// and `mac/core.rs` driving a `radio::Radio` trait object each tick.

use crate::channel::FrequencyChannel;
use crate::packet::Packet;

/// Everything the MAC core needs from the physical layer each slot.
/// Framing, modulation, channel coding and antenna control all live behind
/// this trait; the MAC core only schedules when to call it.
pub trait Phy {
    type Error: core::fmt::Debug;

    /// Currently configured datarate in bits/slot, used to size how much
    /// upper-layer payload fits in a transmit opportunity.
    fn get_current_datarate(&self) -> u32;

    /// Tune one receiver chain onto `channel` for the current slot.
    fn tune_receiver(&mut self, receiver_index: usize, channel: &FrequencyChannel) -> Result<(), Self::Error>;

    /// Transmit `packet` on `channel` using the given transmitter chain.
    fn transmit(&mut self, transmitter_index: usize, channel: &FrequencyChannel, packet: Packet) -> Result<(), Self::Error>;

    /// Drain whatever was received since the last call, one packet per
    /// receiver chain that actually heard something this slot.
    fn receive(&mut self) -> Vec<(usize, Packet)>;

    /// Let the PHY advance its own internal clock by `delta` slots.
    fn update(&mut self, delta: u32);

    fn is_transmitter_idle(&self, transmitter_index: usize) -> bool;
    fn is_any_receiver_idle(&self) -> bool;
}

/// In-memory PHY used by tests: queues outgoing packets per transmitter and
/// lets a test inject "received" packets directly, without any actual radio
/// modelling.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct MockPhy {
    pub datarate: u32,
    transmitted: Vec<(usize, u64, Packet)>,
    inbox: Vec<(usize, Packet)>,
    busy_transmitters: std::collections::HashSet<usize>,
    busy_receivers: std::collections::HashSet<usize>,
    tuned_frequencies_khz: std::collections::HashSet<u64>,
}

#[cfg(any(test, feature = "test-util"))]
impl MockPhy {
    pub fn new(datarate: u32) -> Self {
        MockPhy { datarate, ..Default::default() }
    }

    pub fn inject_received(&mut self, receiver_index: usize, packet: Packet) {
        self.inbox.push((receiver_index, packet));
    }

    pub fn sent(&self) -> &[(usize, u64, Packet)] {
        &self.transmitted
    }

    /// Drain every transmitted packet, for a test harness relaying them to
    /// other nodes' `inject_received` over a shared in-memory bus.
    pub fn drain_sent(&mut self) -> Vec<(usize, u64, Packet)> {
        core::mem::take(&mut self.transmitted)
    }

    /// Whether a receiver chain is currently tuned to `center_freq_khz`,
    /// for a bus deciding which nodes overhear a given transmission.
    pub fn is_tuned_to(&self, center_freq_khz: u64) -> bool {
        self.tuned_frequencies_khz.contains(&center_freq_khz)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Phy for MockPhy {
    type Error = core::convert::Infallible;

    fn get_current_datarate(&self) -> u32 {
        self.datarate
    }

    fn tune_receiver(&mut self, receiver_index: usize, channel: &FrequencyChannel) -> Result<(), Self::Error> {
        self.busy_receivers.remove(&receiver_index);
        self.tuned_frequencies_khz.insert(channel.center_freq_khz);
        Ok(())
    }

    fn transmit(&mut self, transmitter_index: usize, channel: &FrequencyChannel, packet: Packet) -> Result<(), Self::Error> {
        self.transmitted.push((transmitter_index, channel.center_freq_khz, packet));
        Ok(())
    }

    fn receive(&mut self) -> Vec<(usize, Packet)> {
        core::mem::take(&mut self.inbox)
    }

    fn update(&mut self, _delta: u32) {
        self.tuned_frequencies_khz.clear();
    }

    fn is_transmitter_idle(&self, transmitter_index: usize) -> bool {
        !self.busy_transmitters.contains(&transmitter_index)
    }

    fn is_any_receiver_idle(&self) -> bool {
        true
    }
}
