//! Multi-Channel Self-Organized TDMA MAC core.
//
// Grounded on the teacher's `lib.rs` (flat `pub mod` list, a `prelude`
// re-export, no top-level `no_std` attribute gate needed here since the
// MAC's bookkeeping is table/collection-heavy rather than embedded-packet
// framing; spec.md section 9 resolves this openly in favour of `std`).

pub mod channel;
pub mod config;
pub mod error;
pub mod estimator;
pub mod link;
pub mod mac;
pub mod mac_id;
pub mod neighbor;
pub mod packet;
pub mod phy;
pub mod reservation;
pub mod reservation_manager;
pub mod rng;
pub mod third_party;
pub mod upper;

pub mod prelude;
