//! Shadow state machine mirroring an overheard {initiator, recipient} link.
//
// Grounded on ThirdPartyLink.{hpp,cpp} and spec.md section 4.5.

use crate::channel::FrequencyChannel;
use crate::mac_id::MacId;
use crate::packet::{ChosenResource, LinkProposal};
use crate::reservation::{Reservation, ReservationTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThirdPartyStatus {
    Uninitialized,
    ReceivedRequestAwaitingReply,
    ReceivedReplyLinkEstablished,
}

/// Owned by the MAC, keyed by the unordered pair (initiator, recipient).
/// Mirrors another pair's reservations without ever becoming a party to
/// the link, so the local node avoids planning its own traffic over
/// slots that pair will actually use.
pub struct ThirdPartyLink {
    pub id_initiator: MacId,
    pub id_recipient: MacId,
    pub status: ThirdPartyStatus,
    pub num_slots_until_expected_link_reply: Option<u32>,
    pub link_expiry_offset: Option<u32>,
    /// Cells tagged with the slot they were locked/scheduled at: the
    /// tables shift under `ReservationManager::advance` every slot, so an
    /// offset recorded here is only meaningful relative to that creation
    /// slot and must be re-normalized against the current slot before
    /// it's used to touch a table again.
    locked_cells: Vec<(FrequencyChannel, usize, u64)>,
    scheduled_cells: Vec<(FrequencyChannel, usize, u64)>,
}

impl ThirdPartyLink {
    pub fn new(id_initiator: MacId, id_recipient: MacId) -> Self {
        ThirdPartyLink {
            id_initiator,
            id_recipient,
            status: ThirdPartyStatus::Uninitialized,
            num_slots_until_expected_link_reply: None,
            link_expiry_offset: None,
            locked_cells: Vec::new(),
            scheduled_cells: Vec::new(),
        }
    }

    /// Lock every slot a proposal's bursts would occupy across `timeout`
    /// repetitions at stride `period_slots`, tolerating cells already
    /// locked/reserved by someone else (spec.md section 4.5: "cells
    /// already locked/reserved to other IDs are silently skipped").
    fn lock_if_possible(&mut self, table: &mut ReservationTable, channel: &FrequencyChannel, proposal: &LinkProposal, timeout: u32, current_slot: u64) {
        let period = proposal.period_slots() as usize;
        let burst_len = (proposal.num_tx_initiator + proposal.num_tx_recipient).max(1) as usize;
        for k in 0..timeout as usize {
            let start = proposal.slot_offset as usize + k * period;
            for offset in start..start + burst_len {
                if table.can_lock(offset) && table.lock_either_id(offset, self.id_initiator, self.id_recipient).unwrap_or(false) {
                    self.locked_cells.push((channel.clone(), offset, current_slot));
                }
            }
        }
    }

    /// Translate a cell's offset, recorded relative to `created_at`, into
    /// one relative to `current_slot`. `None` if that slot has already
    /// rolled past (the cell is stale and there's nothing left to touch).
    fn normalize_cell(offset: usize, created_at: u64, current_slot: u64) -> Option<usize> {
        let elapsed = current_slot.saturating_sub(created_at) as usize;
        offset.checked_sub(elapsed)
    }

    /// An overheard `LinkRequest` from `id_initiator` to `id_recipient`:
    /// record the expected reply deadline and speculatively lock one
    /// proposal's resources. Tables are owned by the `ReservationManager`
    /// (spec.md section 3), so the caller passes in the table for
    /// `proposal`'s channel; call once per proposal in the request.
    pub fn on_request_overheard(&mut self, expected_reply_offset: Option<u32>) {
        self.status = ThirdPartyStatus::ReceivedRequestAwaitingReply;
        self.num_slots_until_expected_link_reply = expected_reply_offset;
    }

    pub fn lock_proposal_on(&mut self, table: &mut ReservationTable, channel: &FrequencyChannel, proposal: &LinkProposal, timeout: u32, current_slot: u64) {
        self.lock_if_possible(table, channel, proposal, timeout, current_slot);
    }

    fn unlock_all(&mut self, mut lookup: impl FnMut(&FrequencyChannel) -> Option<&mut ReservationTable>, current_slot: u64) {
        for (channel, offset, created_at) in self.locked_cells.drain(..) {
            let Some(offset) = Self::normalize_cell(offset, created_at, current_slot) else { continue };
            if let Some(table) = lookup(&channel) {
                let _ = table.unlock_either_id(offset, self.id_initiator, self.id_recipient);
            }
        }
    }

    /// An overheard `LinkReply` completing the pair's handshake: unlock
    /// the speculative locks and mark the real schedule as `Busy`,
    /// skipping any cell that is not currently `Idle`.
    pub fn on_reply_overheard(
        &mut self,
        lookup_unlock: impl FnMut(&FrequencyChannel) -> Option<&mut ReservationTable>,
        table: &mut ReservationTable,
        channel: &FrequencyChannel,
        chosen: ChosenResource,
        burst_length_tx: u32,
        burst_length_rx: u32,
        burst_offset: u32,
        timeout: u32,
        period_exp: u8,
        current_slot: u64,
    ) {
        self.unlock_all(lookup_unlock, current_slot);
        self.status = ThirdPartyStatus::ReceivedReplyLinkEstablished;
        for k in 0..timeout {
            let start = chosen.slot_offset + k * burst_offset;
            for i in 0..burst_length_tx {
                self.mark_busy(table, channel, (start + i) as usize, self.id_initiator, current_slot);
            }
            for i in burst_length_tx..burst_length_tx + burst_length_rx {
                self.mark_busy(table, channel, (start + i) as usize, self.id_recipient, current_slot);
            }
        }
        let period = 5u32 * (1u32 << period_exp);
        self.link_expiry_offset = Some(chosen.slot_offset + timeout * period - period);
    }

    fn mark_busy(&mut self, table: &mut ReservationTable, channel: &FrequencyChannel, offset: usize, whose_tx: MacId, current_slot: u64) {
        if matches!(table.get_reservation(offset), Ok(Reservation::Idle)) && table.mark(offset, Reservation::Busy(whose_tx)).is_ok() {
            self.scheduled_cells.push((channel.clone(), offset, current_slot));
        }
    }

    /// Decrement the reply-wait and expiry countdowns. Returns `true` if
    /// either hit zero and the link should be reset.
    pub fn on_slot_end(&mut self) -> bool {
        let mut expired = false;
        if let Some(n) = self.num_slots_until_expected_link_reply {
            if n == 0 {
                expired = true;
            } else {
                self.num_slots_until_expected_link_reply = Some(n - 1);
            }
        }
        if let Some(n) = self.link_expiry_offset {
            if n == 0 {
                expired = true;
            } else {
                self.link_expiry_offset = Some(n - 1);
            }
        }
        expired
    }

    /// Unlock and unschedule everything; idempotent.
    pub fn reset(&mut self, mut lookup: impl FnMut(&FrequencyChannel) -> Option<&mut ReservationTable>, current_slot: u64) {
        self.unlock_all(&mut lookup, current_slot);
        for (channel, offset, created_at) in self.scheduled_cells.drain(..) {
            let Some(offset) = Self::normalize_cell(offset, created_at, current_slot) else { continue };
            if let Some(table) = lookup(&channel) {
                if matches!(table.get_reservation(offset), Ok(Reservation::Busy(_))) {
                    let _ = table.mark(offset, Reservation::Idle);
                }
            }
        }
        self.status = ThirdPartyStatus::Uninitialized;
        self.num_slots_until_expected_link_reply = None;
        self.link_expiry_offset = None;
    }

    pub fn is_active(&self) -> bool {
        self.status != ThirdPartyStatus::Uninitialized
    }
}
