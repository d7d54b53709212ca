//! Convenience re-export of the types most call sites need.
//
// Grounded on the teacher's `prelude.rs` (a flat re-export of the
// commonly-used address/frame types).

pub use crate::channel::{ChannelRole, FrequencyChannel};
pub use crate::config::{Config, ContentionMethod};
pub use crate::error::{CoreError, Result};
pub use crate::link::{LinkStatus, PpLinkManager, ShLinkManager};
pub use crate::mac::Mac;
pub use crate::mac_id::MacId;
pub use crate::packet::{BaseHeader, ChosenResource, Header, LinkProposal, LinkReplyHeader, LinkRequestHeader, Packet};
pub use crate::phy::Phy;
pub use crate::reservation::{Reservation, ReservationTable};
pub use crate::reservation_manager::ReservationManager;
pub use crate::rng::DeterministicRng;
pub use crate::third_party::ThirdPartyLink;
pub use crate::upper::UpperLayer;
