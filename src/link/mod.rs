//! The two link manager kinds, SH (singular) and PP (one per peer).
//
// spec.md section 9 describes these as a tagged variant over a common
// interface; the MAC core holds the singular `ShLinkManager` and a
// `HashMap<MacId, PpLinkManager>` directly instead, so no wrapper enum is
// needed at the call sites that dispatch between them.

pub mod pp;
pub mod sh;

pub use pp::{LinkStatus, PpLinkManager};
pub use sh::ShLinkManager;
