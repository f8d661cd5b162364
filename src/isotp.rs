// isotp-broker/src/isotp.rs
//
// Implements ISO-TP addressing for CANbus on Linux.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! ISO 15765-2 (ISO-TP) address calculus.
//!
//! With 29-bit (EFF) identifiers, ISO-TP packs four bytes into the ID:
//! priority, addressing type, sender and receiver. Physical requests use
//! type `0xDA`, functional (broadcast) requests use type `0xDB` with
//! receiver `0x33`. An answer comes back with sender and receiver swapped.
//!
//! With 11-bit (SFF) identifiers, requests to ECU `n` go to `0x7E0 + n`
//! and the answers come from `0x7E8 + n`; the functional request ID is
//! `0x7DF`.
//!
//! All IDs here are SocketCAN ID words: extended IDs carry the EFF flag.

use crate::{
    filter::CanFilter,
    id::{is_extended, CAN_EFF_FLAG, CAN_EFF_MASK},
};

/// The relative destination address for ECU 1
pub const DESTINATION_ECU_1: u8 = 0x00;

/// The relative destination address for ECU 2
pub const DESTINATION_ECU_2: u8 = 0x01;

/// The relative destination address for ECU 3
pub const DESTINATION_ECU_3: u8 = 0x02;

/// The relative destination address for ECU 4
pub const DESTINATION_ECU_4: u8 = 0x03;

/// The relative destination address for ECU 5
pub const DESTINATION_ECU_5: u8 = 0x04;

/// The relative destination address for ECU 6
pub const DESTINATION_ECU_6: u8 = 0x05;

/// The relative destination address for ECU 7
pub const DESTINATION_ECU_7: u8 = 0x06;

/// The functional receiver address with EFF addressing.
pub const DESTINATION_EFF_FUNCTIONAL: u8 = 0x33;

/// The address of the test equipment with EFF addressing.
pub const DESTINATION_EFF_TEST_EQUIPMENT: u8 = 0xF1;

/// The physical addressing type with EFF addressing.
pub const EFF_TYPE_PHYSICAL_ADDRESSING: u8 = 0xDA;

/// The functional addressing type with EFF addressing.
pub const EFF_TYPE_FUNCTIONAL_ADDRESSING: u8 = 0xDB;

/// Filter mask matching every responder to an EFF functional request.
pub const EFF_MASK_FUNCTIONAL_RESPONSE: u32 = 0xFFFF00FF;

/// The base ID of ECU requests with SFF addressing.
pub const SFF_ECU_REQUEST_BASE: u32 = 0x7E0;

/// The base ID of ECU responses with SFF addressing.
pub const SFF_ECU_RESPONSE_BASE: u32 = 0x7E8;

/// The functional request ID with SFF addressing.
pub const SFF_FUNCTIONAL_ADDRESS: u32 = 0x7DF;

/// Filter mask matching every ECU response with SFF addressing.
pub const SFF_MASK_FUNCTIONAL_RESPONSE: u32 = 0b111_1111_1000;

/// Filter matching every ECU response to an SFF functional request.
pub const SFF_FUNCTIONAL_FILTER: CanFilter =
    CanFilter::new(SFF_ECU_RESPONSE_BASE, SFF_MASK_FUNCTIONAL_RESPONSE);

// ===== EffAddress =====

/// The four components of a 29-bit ISO-TP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffAddress {
    /// Message priority. Only the low 5 bits fit in the ID.
    pub priority: u8,
    /// Addressing type (physical `0xDA` or functional `0xDB`)
    pub kind: u8,
    /// Sender address
    pub sender: u8,
    /// Receiver address
    pub receiver: u8,
}

impl EffAddress {
    /// Composes the address into an extended ID word.
    pub fn compose(&self) -> u32 {
        compose_eff(self.priority, self.kind, self.sender, self.receiver)
    }

    /// The same address with sender and receiver swapped.
    pub fn reversed(&self) -> Self {
        Self {
            sender: self.receiver,
            receiver: self.sender,
            ..*self
        }
    }

    /// Determines if this addresses functionally.
    pub fn is_functional(&self) -> bool {
        self.kind == EFF_TYPE_FUNCTIONAL_ADDRESSING && self.receiver == DESTINATION_EFF_FUNCTIONAL
    }
}

impl From<u32> for EffAddress {
    fn from(id: u32) -> Self {
        decompose_eff(id)
    }
}

/// Constructs an EFF CAN ID word from the ISO-TP address components.
pub fn compose_eff(priority: u8, kind: u8, sender: u8, receiver: u8) -> u32 {
    let id = u32::from_be_bytes([priority, kind, sender, receiver]);
    (id & CAN_EFF_MASK) | CAN_EFF_FLAG
}

/// Decomposes an EFF ID word into its ISO-TP address components.
///
/// The ID flags are ignored.
pub fn decompose_eff(id: u32) -> EffAddress {
    let [priority, kind, sender, receiver] = (id & CAN_EFF_MASK).to_be_bytes();
    EffAddress {
        priority,
        kind,
        sender,
        receiver,
    }
}

/// Calculates the address the answer to the given address comes from.
///
/// For extended IDs, sender and receiver are swapped. For standard IDs,
/// bit 3 is toggled, pairing a request ID `0x7E0 + n` with its response
/// ID `0x7E8 + n`. Applying it twice gives back the original address.
pub fn return_address(id: u32) -> u32 {
    if is_extended(id) {
        decompose_eff(id).reversed().compose()
    } else {
        sff_return_address(id)
    }
}

fn sff_return_address(id: u32) -> u32 {
    if id & 0b1000 != 0 {
        id - 8
    } else {
        id + 8
    }
}

/// Checks if the given address is addressing functionally.
pub fn is_functional(id: u32) -> bool {
    if is_extended(id) {
        decompose_eff(id).is_functional()
    } else {
        id == SFF_FUNCTIONAL_ADDRESS
    }
}

/// Constructs the filter for the answers to a request sent to `id`.
///
/// A functional destination is answered by any number of ECUs, so the
/// filter matches all of them. Any other destination is answered on its
/// return address only.
pub fn filter_from_destination(id: u32) -> CanFilter {
    if is_extended(id) {
        let addr = decompose_eff(id);
        if addr.is_functional() {
            let id = compose_eff(addr.priority, EFF_TYPE_PHYSICAL_ADDRESSING, 0x00, addr.sender);
            CanFilter::new(id, EFF_MASK_FUNCTIONAL_RESPONSE)
        } else {
            CanFilter::exact(addr.reversed().compose())
        }
    } else if id == SFF_FUNCTIONAL_ADDRESS {
        SFF_FUNCTIONAL_FILTER
    } else {
        CanFilter::exact(sff_return_address(id))
    }
}

// ===== AddressPair =====

/// The pair of IDs identifying one ISO-TP conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    receive_id: u32,
    transmit_id: u32,
}

impl AddressPair {
    /// Creates a pair from the ID we receive on and the ID we send on.
    pub fn new(receive_id: u32, transmit_id: u32) -> Self {
        Self {
            receive_id,
            transmit_id,
        }
    }

    /// Creates a pair that sends to `destination` and receives its answers.
    ///
    /// The receive ID is the return address of the destination, or the
    /// response base for a functional destination.
    pub fn for_destination(destination: u32) -> Self {
        Self::new(filter_from_destination(destination).id(), destination)
    }

    /// The ID the remote ECU sends on.
    pub fn receive_id(&self) -> u32 {
        self.receive_id
    }

    /// The ID we send on.
    pub fn transmit_id(&self) -> u32 {
        self.transmit_id
    }

    /// Determines if the transmit ID addresses functionally.
    pub fn is_functional(&self) -> bool {
        is_functional(self.transmit_id)
    }

    /// The kernel filter that lets the answers for this pair through.
    ///
    /// For a functional pair, this matches every responder. Otherwise it
    /// matches the receive ID exactly.
    pub fn filter(&self) -> CanFilter {
        if self.is_functional() {
            filter_from_destination(self.transmit_id)
        } else {
            CanFilter::exact(self.receive_id)
        }
    }

    /// Determines if a frame with the given ID belongs to this pair.
    ///
    /// Functional responses must use the same ID format as the request.
    pub fn accepts(&self, id: u32) -> bool {
        id == self.receive_id
            || (self.is_functional()
                && is_extended(id) == is_extended(self.transmit_id)
                && self.filter().matches(id))
    }
}

impl From<(u32, u32)> for AddressPair {
    fn from((receive_id, transmit_id): (u32, u32)) -> Self {
        Self::new(receive_id, transmit_id)
    }
}

/////////////////////////////////////////////////////////////////////////////
