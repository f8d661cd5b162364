// isotp-broker/src/id.rs
//
// Implements CANbus identifier words.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CANbus identifier words.
//!
//! SocketCAN passes an identifier around as a single 32-bit word: the low
//! 11 (standard) or 29 (extended) bits hold the ID, and the three high bits
//! flag an extended ID, a remote request and an error frame. Throughout
//! this crate an "id" is such a word, so an extended ID always carries
//! [`CAN_EFF_FLAG`].

use bitflags::bitflags;
use embedded_can::{ExtendedId, Id, StandardId};
use libc::canid_t;

pub use libc::{
    CANFD_BRS, CANFD_ESI, CANFD_MAX_DLEN, CAN_EFF_FLAG, CAN_EFF_MASK, CAN_ERR_FLAG, CAN_ERR_MASK,
    CAN_MAX_DLEN, CAN_RTR_FLAG, CAN_SFF_MASK,
};

/// An error mask that will cause SocketCAN to report all errors
pub const ERR_MASK_ALL: u32 = CAN_ERR_MASK;

/// An error mask that will cause SocketCAN to silently drop all errors
pub const ERR_MASK_NONE: u32 = 0;

bitflags! {
    /// Bit flags in the composite SocketCAN ID word.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct IdFlags: canid_t {
        /// Indicates frame uses a 29-bit extended ID
        const EFF = CAN_EFF_FLAG;
        /// Indicates a remote request frame.
        const RTR = CAN_RTR_FLAG;
        /// Indicates an error frame.
        const ERR = CAN_ERR_FLAG;
    }

    /// Bit flags for the Flexible Data (FD) frames.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
    pub struct FdFlags: u8 {
        /// Bit rate switch (second bit rate for payload data)
        const BRS = CANFD_BRS as u8;
        /// Error state indicator of the transmitting node
        const ESI = CANFD_ESI as u8;
    }
}

/// Gets the canid_t value from an Id
/// If it's an extended ID, the CAN_EFF_FLAG bit is also set.
pub fn id_to_canid_t(id: impl Into<Id>) -> canid_t {
    use Id::*;
    match id.into() {
        Standard(id) => id.as_raw() as canid_t,
        Extended(id) => id.as_raw() | CAN_EFF_FLAG,
    }
}

/// Determines if the ID word is flagged as a 29-bit extended ID.
#[inline]
pub fn is_extended(word: canid_t) -> bool {
    word & CAN_EFF_FLAG != 0
}

/// Gets the ID bits of the word, without any of the flags.
#[inline]
pub fn id_bits(word: canid_t) -> canid_t {
    if is_extended(word) {
        word & CAN_EFF_MASK
    } else {
        word & CAN_SFF_MASK
    }
}

/// Gets the embedded_can::Id for an ID word.
///
/// Returns `None` if a standard word carries bits above the 11-bit field.
pub fn id_from_word(word: canid_t) -> Option<Id> {
    if is_extended(word) {
        ExtendedId::new(word & CAN_EFF_MASK).map(Id::Extended)
    } else {
        let bits = word & !IdFlags::all().bits();
        u16::try_from(bits)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
}

/////////////////////////////////////////////////////////////////////////////
