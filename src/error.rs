//! Error kinds.
//
// Shape grounded on the teacher's `error.rs` (`CoreError<E>`): a flat enum,
// no `std::error::Error` impl, consumed via `Result<_, CoreError>` and `?`.
// Variant set grounded on spec.md section 7 and the original's
// `id_mismatch`/`cannot_lock` exception types used in ThirdPartyLink.cpp /
// ReservationTable call sites.

use core::fmt;

/// Errors raised by the reservation / link-management engine.
///
/// [`CoreError::OutOfRange`] indicates a programming error (a slot offset
/// beyond the planning horizon was requested) and is never expected to be
/// recovered from. Every other variant is raised at a well-defined recovery
/// boundary and is handled by the caller (see spec.md section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// A table index fell outside `[0, H)`.
    OutOfRange,
    /// A transmitter-capacity conflict prevented marking a slot as `Tx`.
    NoTxAvailable,
    /// `lock`/`lock_either_id` was rejected because the cell was neither
    /// idle nor already locked by a permitted id.
    CannotLock,
    /// `lock_either_id` was rejected because the cell is locked by neither
    /// of the two permitted ids.
    IdMismatch,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CoreError::OutOfRange => "slot offset beyond planning horizon",
            CoreError::NoTxAvailable => "no transmitter capacity available for this slot",
            CoreError::CannotLock => "cell is not idle and not lockable by this id",
            CoreError::IdMismatch => "cell locked by neither requested id",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, CoreError>;
