// isotp-broker/src/filter.rs
//
// Implements kernel receive filters for SocketCAN on Linux.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN receive filters.
//!
//! A raw CAN socket hands a frame to the application only if its ID word
//! matches at least one of the installed filters. An empty filter set
//! drops everything.

use crate::id::{CAN_EFF_FLAG, CAN_EFF_MASK, CAN_RTR_FLAG, CAN_SFF_MASK};
use libc::canid_t;
use std::mem::size_of;

/// The size of one filter in the kernel byte layout.
pub const FILTER_SIZE: usize = size_of::<libc::can_filter>();

/// The CAN filter defines which ID's can be accepted on a socket.
///
/// Each filter contains an internal id and mask. Packets are considered to
/// be matched by a filter if `received_id & mask == filter_id & mask` holds
/// true.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct CanFilter(libc::can_filter);

impl CanFilter {
    /// Construct a new CAN filter.
    pub const fn new(id: canid_t, mask: canid_t) -> Self {
        Self(libc::can_filter {
            can_id: id,
            can_mask: mask,
        })
    }

    /// Construct a filter that matches exactly one ID.
    ///
    /// The mask covers the ID bits of the word plus the EFF and RTR flags,
    /// so a standard ID never matches an extended one with the same bits.
    pub const fn exact(id: canid_t) -> Self {
        let bits = if id & CAN_EFF_FLAG != 0 {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        Self::new(id, bits | CAN_EFF_FLAG | CAN_RTR_FLAG)
    }

    /// The ID the filter compares against.
    pub fn id(&self) -> canid_t {
        self.0.can_id
    }

    /// The mask selecting the compared bits.
    pub fn mask(&self) -> canid_t {
        self.0.can_mask
    }

    /// Determines if a frame with the given ID word passes this filter.
    pub fn matches(&self, id: canid_t) -> bool {
        id & self.mask() == self.id() & self.mask()
    }

    /// Gets the filter in the kernel byte layout.
    pub fn to_bytes(&self) -> [u8; FILTER_SIZE] {
        let mut buf = [0; FILTER_SIZE];
        buf[..4].copy_from_slice(&self.id().to_ne_bytes());
        buf[4..].copy_from_slice(&self.mask().to_ne_bytes());
        buf
    }

    /// Packs a filter set into the byte buffer passed to the kernel.
    pub fn pack(filters: &[CanFilter]) -> Vec<u8> {
        filters.iter().flat_map(|f| f.to_bytes()).collect()
    }
}

impl From<libc::can_filter> for CanFilter {
    fn from(filt: libc::can_filter) -> Self {
        Self(filt)
    }
}

impl From<(u32, u32)> for CanFilter {
    fn from(filt: (u32, u32)) -> Self {
        CanFilter::new(filt.0, filt.1)
    }
}

impl AsRef<libc::can_filter> for CanFilter {
    fn as_ref(&self) -> &libc::can_filter {
        &self.0
    }
}

/////////////////////////////////////////////////////////////////////////////
