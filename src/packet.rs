//! Packet and header object model.
//
// Grounded on spec.md section 3 and the teacher's `packet.rs` (a typed
// header + payload object, `get_bits`/`get_payload` accessors). Wire
// encoding is explicitly out of scope (spec.md section 1): headers carry
// typed fields and an opaque bit-size estimate rather than a byte layout.

use crate::channel::FrequencyChannel;
use crate::mac_id::MacId;

/// A proposed (or agreed) resource for a point-to-point link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProposal {
    pub center_freq_khz: u64,
    pub slot_offset: u32,
    /// Period encoding: the exchange repeats every `5 * 2^period_exp` slots.
    pub period_exp: u8,
    pub num_tx_initiator: u32,
    pub num_tx_recipient: u32,
    pub slot_duration: u32,
}

impl LinkProposal {
    pub fn period_slots(&self) -> u32 {
        5u32 * (1u32 << self.period_exp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChosenResource {
    pub center_freq_khz: u64,
    pub slot_offset: u32,
}

/// Base header: every packet carries exactly one, first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseHeader {
    pub source: MacId,
    /// Absolute slot offset (relative to transmission time) of the sender's
    /// next scheduled transmission on this channel.
    pub next_slot_offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequestHeader {
    pub dest: MacId,
    pub proposals: Vec<LinkProposal>,
    pub reply_offset: u32,
    pub timeout: u32,
    pub burst_length_tx: u32,
    pub burst_length_rx: u32,
    pub burst_offset: u32,
    /// Extends an already-`Established` link instead of negotiating a
    /// fresh one; the responder applies it directly without a viability
    /// scan (spec.md supplement: link renewal).
    pub is_renewal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkReplyHeader {
    pub dest: MacId,
    pub chosen: ChosenResource,
    pub burst_length_tx: u32,
    pub burst_length_rx: u32,
    pub burst_offset: u32,
    pub timeout: u32,
    pub is_renewal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfoPayload {
    pub reservations_snapshot: Vec<(u32, MacId)>,
}

/// The kind-tagged header variants a [`Packet`] may carry, beyond the
/// mandatory leading [`BaseHeader`].
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Base(BaseHeader),
    Broadcast,
    Beacon,
    Unicast { dest: MacId },
    LinkRequest(LinkRequestHeader),
    LinkReply(LinkReplyHeader),
    LinkInfo(LinkInfoPayload),
}

impl Header {
    /// Opaque size estimate in bits, used by the SH packer to fit requests/
    /// replies/data into a slot's capacity (spec.md section 1: header
    /// bit-layout is out of scope, only sizes matter here).
    pub fn bits(&self) -> u32 {
        match self {
            Header::Base(_) => 48,
            Header::Broadcast => 8,
            Header::Beacon => 16,
            Header::Unicast { .. } => 24,
            Header::LinkRequest(r) => 96 + 64 * r.proposals.len() as u32,
            Header::LinkReply(_) => 96,
            Header::LinkInfo(p) => 32 + 40 * p.reservations_snapshot.len() as u32,
        }
    }
}

/// An ordered sequence of (header, payload) messages, as spec.md section 3
/// describes. The first message's header is always [`Header::Base`].
#[derive(Debug, Clone, Default)]
pub struct Packet {
    messages: Vec<(Header, Option<Vec<u8>>)>,
    pub snr: Option<f32>,
    pub has_channel_error: bool,
    pub is_dme: bool,
}

impl Packet {
    pub fn new(base: BaseHeader) -> Self {
        Packet { messages: vec![(Header::Base(base), None)], snr: None, has_channel_error: false, is_dme: false }
    }

    pub fn add_message(&mut self, header: Header, payload: Option<Vec<u8>>) {
        self.messages.push((header, payload));
    }

    pub fn headers(&self) -> impl Iterator<Item = &Header> {
        self.messages.iter().map(|(h, _)| h)
    }

    pub fn base_header(&self) -> &BaseHeader {
        match &self.messages[0].0 {
            Header::Base(b) => b,
            _ => unreachable!("first header is always Base"),
        }
    }

    pub fn base_header_mut(&mut self) -> &mut BaseHeader {
        match &mut self.messages[0].0 {
            Header::Base(b) => b,
            _ => unreachable!("first header is always Base"),
        }
    }

    pub fn find_link_request(&self) -> Option<&LinkRequestHeader> {
        self.headers().find_map(|h| match h {
            Header::LinkRequest(r) => Some(r),
            _ => None,
        })
    }

    pub fn find_link_reply(&self) -> Option<&LinkReplyHeader> {
        self.headers().find_map(|h| match h {
            Header::LinkReply(r) => Some(r),
            _ => None,
        })
    }

    pub fn is_unicast_to(&self, id: MacId) -> bool {
        self.headers().any(|h| matches!(h, Header::Unicast { dest } if *dest == id))
    }

    pub fn is_beacon(&self) -> bool {
        self.headers().any(|h| matches!(h, Header::Beacon))
    }

    /// Total size of this packet in bits.
    pub fn bits(&self) -> u32 {
        self.messages.iter().map(|(h, p)| h.bits() + p.as_ref().map(|p| p.len() as u32 * 8).unwrap_or(0)).sum()
    }
}

/// Whether `channel` carries `center_freq_khz`. Used by third-party
/// observers translating a `LinkProposal`/`ChosenResource` into a concrete
/// [`FrequencyChannel`] reference.
pub fn matches_channel(channel: &FrequencyChannel, center_freq_khz: u64) -> bool {
    channel.center_freq_khz == center_freq_khz
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_always_has_base_header_first() {
        let p = Packet::new(BaseHeader { source: MacId::new(4), next_slot_offset: 3 });
        assert_eq!(p.base_header().source, MacId::new(4));
    }

    #[test]
    fn bits_accounts_for_proposals() {
        let req = LinkRequestHeader {
            dest: MacId::new(5),
            proposals: vec![LinkProposal { center_freq_khz: 1, slot_offset: 2, period_exp: 0, num_tx_initiator: 1, num_tx_recipient: 1, slot_duration: 10 }],
            reply_offset: 3,
            timeout: 10,
            burst_length_tx: 1,
            burst_length_rx: 1,
            burst_offset: 20,
            is_renewal: false,
        };
        assert_eq!(Header::LinkRequest(req).bits(), 96 + 64);
    }

    #[test]
    fn find_link_request_locates_embedded_header() {
        let mut p = Packet::new(BaseHeader { source: MacId::new(4), next_slot_offset: 0 });
        let req = LinkRequestHeader {
            dest: MacId::new(5),
            proposals: vec![],
            reply_offset: 1,
            timeout: 1,
            burst_length_tx: 1,
            burst_length_rx: 1,
            burst_offset: 1,
            is_renewal: false,
        };
        p.add_message(Header::LinkRequest(req.clone()), None);
        assert_eq!(p.find_link_request(), Some(&req));
    }
}
