//! Owns every [`ReservationTable`] for one node.
//
// Grounded on spec.md section 4.2 and call sites across
// P2PLinkManager.cpp / BCLinkManager.cpp / ThirdPartyLink.cpp
// (`getP2PReservationTables`, `getReservationTable`,
// `getFreqChannelByCenterFreq`, `getBroadcastReservationTable`).

use crate::channel::{ChannelRole, FrequencyChannel};
use crate::error::Result;
use crate::mac_id::MacId;
use crate::reservation::{Reservation, ReservationTable};

/// Owns the single SH table, every PP table, the transmitter aggregate
/// table and one table per receiver; answers global availability queries.
pub struct ReservationManager {
    horizon: usize,
    sh_channel: FrequencyChannel,
    sh_table: ReservationTable,
    pp_tables: Vec<(FrequencyChannel, ReservationTable)>,
    tx_table: ReservationTable,
    rx_tables: Vec<ReservationTable>,
}

impl ReservationManager {
    pub fn new(horizon: usize, sh_channel: FrequencyChannel, pp_channels: Vec<FrequencyChannel>, num_receivers: usize) -> Self {
        let pp_tables = pp_channels.into_iter().map(|c| (c, ReservationTable::new(horizon))).collect();
        ReservationManager {
            horizon,
            sh_table: ReservationTable::new(horizon),
            sh_channel,
            pp_tables,
            tx_table: ReservationTable::new(horizon),
            rx_tables: (0..num_receivers.max(1)).map(|_| ReservationTable::new(horizon)).collect(),
        }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn sh_channel(&self) -> &FrequencyChannel {
        &self.sh_channel
    }

    pub fn sh_table(&self) -> &ReservationTable {
        &self.sh_table
    }

    pub fn sh_table_mut(&mut self) -> &mut ReservationTable {
        &mut self.sh_table
    }

    pub fn pp_table(&self, channel: &FrequencyChannel) -> Option<&ReservationTable> {
        self.pp_tables.iter().find(|(c, _)| c == channel).map(|(_, t)| t)
    }

    pub fn pp_table_mut(&mut self, channel: &FrequencyChannel) -> Option<&mut ReservationTable> {
        self.pp_tables.iter_mut().find(|(c, _)| c == channel).map(|(_, t)| t)
    }

    pub fn get_freq_channel_by_center_freq(&self, center_freq_khz: u64) -> Option<&FrequencyChannel> {
        if self.sh_channel.center_freq_khz == center_freq_khz {
            return Some(&self.sh_channel);
        }
        self.pp_tables.iter().map(|(c, _)| c).find(|c| c.center_freq_khz == center_freq_khz)
    }

    /// PP channels ordered from most idle to least idle, used to pick the
    /// least-loaded channel first during proposal generation.
    pub fn get_sorted_p2p_reservation_tables(&self) -> Vec<&FrequencyChannel> {
        let mut entries: Vec<(&FrequencyChannel, usize)> = self.pp_tables.iter().map(|(c, t)| (c, t.idle_count())).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(c, _)| c).collect()
    }

    pub fn all_pp_channels(&self) -> impl Iterator<Item = &FrequencyChannel> {
        self.pp_tables.iter().map(|(c, _)| c)
    }

    /// All `{reservation, channel}` pairs active at offset 0, excluding
    /// Idle. Returns owned channels (cheap to clone) rather than borrows,
    /// so callers are free to mutate `self` while handling each entry.
    pub fn collect_current_reservations(&self) -> Vec<(Reservation, FrequencyChannel)> {
        let mut out = Vec::new();
        if let Ok(r) = self.sh_table.get_reservation(0) {
            if !r.is_idle() {
                out.push((r, self.sh_channel.clone()));
            }
        }
        for (channel, table) in &self.pp_tables {
            if let Ok(r) = table.get_reservation(0) {
                if !r.is_idle() {
                    out.push((r, channel.clone()));
                }
            }
        }
        out
    }

    pub fn advance(&mut self, delta: usize) {
        self.sh_table.advance(delta);
        for (_, t) in self.pp_tables.iter_mut() {
            t.advance(delta);
        }
        self.tx_table.advance(delta);
        for t in self.rx_tables.iter_mut() {
            t.advance(delta);
        }
    }

    pub fn is_transmitter_idle(&self, t: usize, span: usize) -> bool {
        self.tx_table.is_idle_span(t, span).unwrap_or(false)
    }

    pub fn is_any_receiver_idle(&self, t: usize, span: usize) -> bool {
        self.rx_tables.iter().any(|r| r.is_idle_span(t, span).unwrap_or(false))
    }

    fn first_idle_receiver_mut(&mut self, t: usize, span: usize) -> Option<&mut ReservationTable> {
        self.rx_tables.iter_mut().find(|r| r.is_idle_span(t, span).unwrap_or(false))
    }

    /// Mark `timeout`-many bursts of `{burst_length_tx TX, burst_length_rx
    /// RX}` (or the reverse, if `!is_initiator`) starting at `first_burst_in`
    /// on `channel`'s table, the transmitter table and one receiver table,
    /// for the link between `self_id` and `peer_id`. Returns every cell
    /// touched. Conflicts at this stage are a torn invariant (slot
    /// selection must already have verified viability) and propagate as
    /// [`crate::error::CoreError`].
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_bursts(
        &mut self,
        channel: &FrequencyChannel,
        timeout: u32,
        first_burst_in: u32,
        burst_offset: u32,
        burst_length_tx: u32,
        burst_length_rx: u32,
        self_id: MacId,
        peer_id: MacId,
        is_initiator: bool,
    ) -> Result<Vec<(FrequencyChannel, usize)>> {
        let mut touched = Vec::new();
        let is_sh = *channel == self.sh_channel;
        for k in 0..timeout {
            let start = first_burst_in + k * burst_offset;
            for i in 0..burst_length_tx {
                let offset = (start + i) as usize;
                let (mine, theirs) = if is_initiator { (Reservation::Tx(peer_id), Reservation::Rx(self_id)) } else { (Reservation::Rx(peer_id), Reservation::Tx(self_id)) };
                let _ = theirs; // documents the peer's mirrored reservation; not locally stored
                if is_sh {
                    self.sh_table.mark(offset, mine)?;
                } else if let Some(t) = self.pp_table_mut(channel) {
                    t.mark(offset, mine)?;
                }
                if is_initiator {
                    self.tx_table.mark(offset, Reservation::Tx(peer_id))?;
                } else if let Some(rx) = self.first_idle_receiver_mut(offset, 1) {
                    rx.mark(offset, Reservation::Rx(peer_id))?;
                }
                touched.push((channel.clone(), offset));
            }
            for i in burst_length_tx..(burst_length_tx + burst_length_rx) {
                let offset = (start + i) as usize;
                let mine = if is_initiator { Reservation::Rx(peer_id) } else { Reservation::Tx(peer_id) };
                if is_sh {
                    self.sh_table.mark(offset, mine)?;
                } else if let Some(t) = self.pp_table_mut(channel) {
                    t.mark(offset, mine)?;
                }
                if !is_initiator {
                    self.tx_table.mark(offset, Reservation::Tx(peer_id))?;
                } else if let Some(rx) = self.first_idle_receiver_mut(offset, 1) {
                    rx.mark(offset, Reservation::Rx(peer_id))?;
                }
                touched.push((channel.clone(), offset));
            }
        }
        Ok(touched)
    }

    /// Number of currently occupied (non-idle) cells across every PP table,
    /// for `getNumUtilizedP2PResources` (spec.md section 9 open question:
    /// computed for real, not stubbed).
    pub fn num_utilized_p2p_resources(&self) -> usize {
        self.pp_tables.iter().map(|(_, t)| t.horizon() - t.idle_count()).sum()
    }
}
