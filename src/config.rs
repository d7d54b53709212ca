//! Closed set of recognized configuration options.
//
// Shape grounded on the teacher's `mac/config.rs` (`CoreConfig` +
// `Default impl`) and `mac_802154/config.rs`. Option set and defaults
// grounded on spec.md section 6 and the original's BCLinkManager.hpp /
// P2PLinkManager.hpp member-initializer defaults.

/// Contention estimation method used by [`crate::link::sh::ShLinkManager`]
/// to size its SH slot-selection candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
pub enum ContentionMethod {
    BinomialEstimate,
    PoissonBinomialEstimate,
    AllActiveAgainAssumption,
    NaiveRandomAccess,
}

impl Default for ContentionMethod {
    fn default() -> Self {
        ContentionMethod::BinomialEstimate
    }
}

/// Closed set of configuration options recognized by the MAC core and its
/// link managers (spec.md section 6). Configuration loading (parsing from
/// file/CLI) is out of scope; this is the in-memory, already-validated
/// form.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // --- SH slot selection ---
    pub target_collision_prob: f64,
    pub contention_method: ContentionMethod,
    pub min_num_candidate_slots: u32,
    pub max_num_candidate_slots: u32,
    pub always_schedule_next_broadcast_slot: bool,
    pub advertise_next_slot_in_current_header: bool,

    // --- Beacon scheduling ---
    pub min_beacon_gap: u32,
    pub min_beacon_interval: u32,
    pub max_beacon_interval: u32,

    // --- PP link establishment ---
    pub default_pp_link_timeout: u32,
    pub default_burst_offset: u32,
    pub adaptive_burst_offset: bool,
    pub min_consecutive_tx_slots: u32,
    pub max_consecutive_tx_slots: u32,
    pub force_bidirectional_links: bool,
    pub max_pp_establishment_attempts: u32,
    pub max_no_of_tolerable_empty_bursts: u32,
    pub renewal_attempts: u32,

    // --- Hardware / duty cycle ---
    pub duty_cycle_period: u32,
    pub max_duty_cycle: f64,
    pub min_num_supported_pp_links: u32,
    pub num_receivers: u32,
    pub num_transmitters: u32,

    // --- Planning horizon ---
    pub planning_horizon: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_collision_prob: 0.05,
            contention_method: ContentionMethod::BinomialEstimate,
            min_num_candidate_slots: 3,
            max_num_candidate_slots: 100,
            always_schedule_next_broadcast_slot: false,
            advertise_next_slot_in_current_header: true,

            min_beacon_gap: 10,
            min_beacon_interval: 100,
            max_beacon_interval: 1000,

            default_pp_link_timeout: 10,
            default_burst_offset: 20,
            adaptive_burst_offset: false,
            min_consecutive_tx_slots: 1,
            max_consecutive_tx_slots: 5,
            force_bidirectional_links: true,
            max_pp_establishment_attempts: 5,
            max_no_of_tolerable_empty_bursts: 3,
            renewal_attempts: 3,

            duty_cycle_period: 1000,
            max_duty_cycle: 0.5,
            min_num_supported_pp_links: 1,
            num_receivers: 2,
            num_transmitters: 1,

            planning_horizon: 1024,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_documented_profile() {
        let c = Config::default();
        assert_eq!(c.target_collision_prob, 0.05);
        assert_eq!(c.planning_horizon, 1024);
        assert_eq!(c.max_pp_establishment_attempts, 5);
    }
}
