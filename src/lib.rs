// isotp-broker/src/lib.rs
//
// The main lib file for the Rust ISO-TP broker library.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! ISO-TP conversations over SocketCAN.
//!
//! The Linux kernel supports using CAN-devices through a network-like API
//! (see <https://www.kernel.org/doc/Documentation/networking/can.txt>). This
//! crate builds on a single raw CAN socket to run many logical ISO 15765-2
//! (ISO-TP) conversations with remote ECUs at once.
//!
//! # ISO-TP addressing
//!
//! An ISO-TP conversation is identified by a pair of CAN IDs: the one the
//! remote ECU sends on (our *receive* ID) and the one we send on (our
//! *transmit* ID). Diagnostic testers typically use `0x7E0 + n` to address
//! ECU `n` and receive its answers on `0x7E8 + n`, or broadcast a
//! *functional* request to `0x7DF` and listen to every response. The
//! [`isotp`] module has the arithmetic for these addresses, both for 11-bit
//! and 29-bit identifiers.
//!
//! # The broker
//!
//! An [`IsoTpBroker`] owns one raw CAN socket. Every [`IsoTpChannel`]
//! created on it adds a kernel filter for its receive ID, so the socket
//! only ever sees frames some channel is interested in. A single poller
//! thread waits on the socket, hands every incoming frame to the handlers
//! of all matching channels, and writes queued outbound messages.
//!
//! ```no_run
//! use isotp_broker::{AddressPair, BrokerConfig, IsoTpBroker};
//!
//! fn main() -> isotp_broker::Result<()> {
//!     let broker = IsoTpBroker::open(&BrokerConfig::new("vcan0"))?;
//!
//!     let channel = broker.create_channel(
//!         AddressPair::new(0x7E8, 0x7E0),
//!         |_ch: &isotp_broker::IsoTpChannel, sender: u32, payload: &[u8]| {
//!             println!("{:X} -> {}", sender, hex::encode(payload));
//!         },
//!     )?;
//!
//!     channel.send(vec![0x02, 0x10, 0x01])?.wait()?;
//!     broker.close()
//! }
//! ```
//!
//! The poller only starts with the first channel and stops again when the
//! last one is closed. Closing the broker closes all of its channels.
//!
//! # RawFd
//!
//! Raw access to the underlying file descriptor of the CAN socket is
//! available through the `AsRawFd` implementation.

#![warn(missing_docs, missing_debug_implementations)]

use std::{mem::size_of, slice};

pub use embedded_can::{self, ExtendedId, Id, StandardId};

pub mod isotp;
pub use isotp::{AddressPair, EffAddress};

pub mod errors;
pub use errors::{
    CanError, CanErrorDecodingFailure, ConstructionError, Error, ShouldRetry,
};

pub mod id;
pub use id::{FdFlags, IdFlags, ERR_MASK_ALL, ERR_MASK_NONE};

pub mod frame;
pub use frame::CanFrame;

pub mod filter;
pub use filter::CanFilter;

pub mod addr;
pub use addr::CanAddr;

pub mod socket;
pub use socket::{FrameEndpoint, RawCanSocket, SocketOption, SocketOptionKind};

pub mod config;
pub use config::BrokerConfig;

pub mod poller;
pub use poller::{PollOutcome, PollerState, PollingThread};

pub mod channel;
pub use channel::{IsoTpChannel, MessageHandler, SendFuture};

pub mod broker;
pub use broker::{ExceptionHandler, IsoTpBroker};

/// A result type for the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Standard I/O error, as used throughout the socket layer.
pub type IoError = std::io::Error;

/// Standard I/O error kind.
pub type IoErrorKind = std::io::ErrorKind;

/// Standard I/O result.
pub type IoResult<T> = std::io::Result<T>;

// ===== Private local helper functions =====

/// Gets a byte slice for any sized variable.
///
/// Note that this should normally be unsafe, but since we're only
/// using it internally for types sent to/from the OS, it's OK here.
pub(crate) fn as_bytes<T: Sized>(val: &T) -> &[u8] {
    let sz = size_of::<T>();
    unsafe { slice::from_raw_parts::<'_, u8>(val as *const _ as *const u8, sz) }
}

/// Gets a mutable byte slice for any sized variable.
pub(crate) fn as_bytes_mut<T: Sized>(val: &mut T) -> &mut [u8] {
    let sz = size_of::<T>();
    unsafe { slice::from_raw_parts_mut(val as *mut _ as *mut u8, sz) }
}
