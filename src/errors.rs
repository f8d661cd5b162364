// isotp-broker/src/errors.rs
//
// Implements errors for the Rust ISO-TP broker library on Linux.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Errors for the broker, the channels and the raw CAN endpoint.
//!
//! Everything that can go wrong in the library is reported through the
//! crate-wide [`Error`]. A few kinds are not really failures:
//! [`Error::WouldBlock`] is consumed by the poller and simply means "try
//! again on the next poll".
//!
//! Errors reported by the bus itself arrive as error frames. Their error
//! class is encoded in the ID word and can be decoded into a [`CanError`]
//! with [`CanError::from_frame`]. The error mask must be set on the socket
//! for the kernel to deliver them at all.
//!
//! ```text
//! Lost Arbitration   (0x02) => data[0]
//! Controller Problem (0x04) => data[1]
//! Protocol Violation (0x08) => data[2..3]
//! Transceiver Status (0x10) => data[4]
//! ```

use crate::{frame::CanFrame, IoError, IoErrorKind, IoResult};
use libc::EINPROGRESS;
use std::fmt;
use thiserror::Error as ThisError;

// ===== Error =====

/// The crate-wide error type.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Operation on an endpoint that has already been closed.
    #[error("CAN endpoint is closed")]
    Closed,
    /// The interface name could not be resolved to an interface index.
    #[error("unknown CAN interface: '{0}'")]
    UnknownInterface(String),
    /// An error reported by the operating system.
    #[error(transparent)]
    Io(IoError),
    /// The non-blocking operation could not complete right now.
    #[error("operation would block")]
    WouldBlock,
    /// A buffer did not hold a classic or FD frame.
    #[error("malformed CAN frame ({0} bytes)")]
    FrameMalformed(usize),
    /// The kernel accepted only part of a frame.
    #[error("frame written incompletely ({written} of {expected} bytes)")]
    ShortWrite {
        /// Bytes actually written
        written: usize,
        /// Size of the encoded frame
        expected: usize,
    },
    /// The channel was closed before, or while, the send was pending.
    #[error("ISO-TP channel is closed")]
    ChannelClosed,
    /// The broker has been shut down.
    #[error("ISO-TP broker has been shut down")]
    BrokerShutDown,
    /// A frame could not be constructed from the given parts.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    /// The payload does not fit into a single frame.
    #[error("payload of {len} bytes exceeds the frame capacity of {max} bytes")]
    PayloadTooLarge {
        /// Length of the rejected payload
        len: usize,
        /// Largest payload the broker can put in one frame
        max: usize,
    },
    /// A message handler panicked while processing an inbound frame.
    #[error("message handler panicked: {0}")]
    HandlerPanicked(String),
    /// The poller thread could not be spawned, or it panicked.
    #[error("poller thread failed: {0}")]
    Poller(String),
}

impl Error {
    /// Determines if the error is fatal to the broker that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ShortWrite { .. } | Error::BrokerShutDown)
    }

    /// Gets the OS error number, if this wraps an OS error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        match err.kind() {
            IoErrorKind::WouldBlock => Error::WouldBlock,
            _ => Error::Io(err),
        }
    }
}

impl embedded_can::Error for Error {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        IoError::from(err).into()
    }
}

// ===== ShouldRetry =====

/// Check an error return value for timeouts.
///
/// Due to the fact that timeouts are reported as errors, reading from a
/// non-blocking socket that has nothing to deliver results in an error.
/// This trait adds a `should_retry` method to errors and results to check
/// for this condition.
pub trait ShouldRetry {
    /// Check for timeout
    ///
    /// If `true`, the error is probably due to a timeout.
    fn should_retry(&self) -> bool;
}

impl ShouldRetry for IoError {
    fn should_retry(&self) -> bool {
        match self.kind() {
            // EAGAIN, EINPROGRESS and EWOULDBLOCK are the three possible codes
            // returned when a timeout occurs. the stdlib already maps EAGAIN
            // and EWOULDBLOCK os WouldBlock
            IoErrorKind::WouldBlock => true,
            // however, EINPROGRESS is also valid
            IoErrorKind::Other => {
                matches!(self.raw_os_error(), Some(errno) if errno == EINPROGRESS)
            }
            _ => false,
        }
    }
}

impl<E: fmt::Debug> ShouldRetry for IoResult<E> {
    fn should_retry(&self) -> bool {
        match *self {
            Err(ref e) => e.should_retry(),
            _ => false,
        }
    }
}

impl ShouldRetry for Error {
    fn should_retry(&self) -> bool {
        match self {
            Error::WouldBlock => true,
            Error::Io(err) => err.should_retry(),
            _ => false,
        }
    }
}

impl<E: fmt::Debug> ShouldRetry for crate::Result<E> {
    fn should_retry(&self) -> bool {
        match *self {
            Err(ref e) => e.should_retry(),
            _ => false,
        }
    }
}

// ===== ConstructionError =====

/// Error that occurs when creating CAN frames
#[derive(ThisError, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// Trying to create a specific frame type from an incompatible type
    #[error("incompatible frame type")]
    WrongFrameType,
    /// CAN ID was outside the range of valid IDs
    #[error("CAN ID too large")]
    IDTooLarge,
    /// Larger payload reported than can be held in the frame.
    #[error("payload is too large")]
    TooMuchData,
}

// ===== CanError =====

/// Error decoding a CanError from an error frame.
#[derive(ThisError, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanErrorDecodingFailure {
    /// The supplied frame did not have the error bit set.
    #[error("CAN frame is not an error")]
    NotAnError,
    /// The error type is not known and cannot be decoded.
    #[error("unknown error type: {0:#x}")]
    UnknownErrorType(u32),
    /// The error type needs a data byte that the frame does not carry.
    #[error("not enough data")]
    NotEnoughData(u8),
}

/// The CAN bus error derived from an error frame.
///
/// The detail bytes are passed through undecoded; their meaning is given
/// by `linux/can/error.h`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanError {
    /// TX timeout (by netdevice driver)
    TransmitTimeout,
    /// Arbitration was lost after the given bit (0 if unspecified).
    LostArbitration(u8),
    /// Controller problem, with the controller status byte.
    ControllerProblem(u8),
    /// Protocol violation of the given type at the given location.
    ProtocolViolation {
        /// The type of protocol violation
        vtype: u8,
        /// The location (field or bit) of the violation
        location: u8,
    },
    /// Transceiver error, with the transceiver status byte.
    TransceiverError(u8),
    /// No ACK received for current CAN frame.
    NoAck,
    /// Bus off (due to too many detected errors)
    BusOff,
    /// Bus error (due to too many detected errors)
    BusError,
    /// The bus has been restarted
    Restarted,
}

fn get_data(frame: &CanFrame, idx: u8) -> Result<u8, CanErrorDecodingFailure> {
    frame
        .data()
        .get(idx as usize)
        .copied()
        .ok_or(CanErrorDecodingFailure::NotEnoughData(idx))
}

impl CanError {
    /// Constructs a CAN error from an error frame.
    pub fn from_frame(frame: &CanFrame) -> Result<Self, CanErrorDecodingFailure> {
        if !frame.is_error_frame() {
            return Err(CanErrorDecodingFailure::NotAnError);
        }

        match frame.raw_id() {
            0x00000001 => Ok(CanError::TransmitTimeout),
            0x00000002 => Ok(CanError::LostArbitration(get_data(frame, 0)?)),
            0x00000004 => Ok(CanError::ControllerProblem(get_data(frame, 1)?)),
            0x00000008 => Ok(CanError::ProtocolViolation {
                vtype: get_data(frame, 2)?,
                location: get_data(frame, 3)?,
            }),
            0x00000010 => Ok(CanError::TransceiverError(get_data(frame, 4)?)),
            0x00000020 => Ok(CanError::NoAck),
            0x00000040 => Ok(CanError::BusOff),
            0x00000080 => Ok(CanError::BusError),
            0x00000100 => Ok(CanError::Restarted),
            e => Err(CanErrorDecodingFailure::UnknownErrorType(e)),
        }
    }
}

impl std::error::Error for CanError {}

impl fmt::Display for CanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CanError::*;
        match *self {
            TransmitTimeout => write!(f, "transmission timeout"),
            LostArbitration(n) => write!(f, "arbitration lost after {} bits", n),
            ControllerProblem(status) => write!(f, "controller problem ({:#04x})", status),
            ProtocolViolation { vtype, location } => write!(
                f,
                "protocol violation at {:#04x}: {:#04x}",
                location, vtype
            ),
            TransceiverError(status) => write!(f, "transceiver error ({:#04x})", status),
            NoAck => write!(f, "no ack"),
            BusOff => write!(f, "bus off"),
            BusError => write!(f, "bus error"),
            Restarted => write!(f, "restarted"),
        }
    }
}

impl embedded_can::Error for CanError {
    fn kind(&self) -> embedded_can::ErrorKind {
        match *self {
            CanError::NoAck => embedded_can::ErrorKind::Acknowledge,
            _ => embedded_can::ErrorKind::Other,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::CAN_ERR_FLAG;

    #[test]
    fn test_would_block_is_mapped() {
        let err = Error::from(IoError::from(IoErrorKind::WouldBlock));
        assert!(matches!(err, Error::WouldBlock));
        assert!(err.should_retry());

        let err = Error::from(IoError::from_raw_os_error(libc::ENODEV));
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
        assert!(!err.should_retry());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::ShortWrite {
            written: 4,
            expected: 16
        }
        .is_fatal());
        assert!(Error::BrokerShutDown.is_fatal());
        assert!(!Error::ChannelClosed.is_fatal());
        assert!(!Error::WouldBlock.is_fatal());
    }

    #[test]
    fn test_can_error_from_frame() {
        let frame = CanFrame::new(CAN_ERR_FLAG | 0x02, &[7, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(CanError::from_frame(&frame), Ok(CanError::LostArbitration(7)));

        let frame = CanFrame::new(CAN_ERR_FLAG | 0x40, &[0; 8]).unwrap();
        assert_eq!(CanError::from_frame(&frame), Ok(CanError::BusOff));

        let frame = CanFrame::new(0x123, &[1, 2]).unwrap();
        assert_eq!(
            CanError::from_frame(&frame),
            Err(CanErrorDecodingFailure::NotAnError)
        );
    }
}
