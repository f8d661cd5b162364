// isotp-broker/src/frame.rs
//
// Implements frames for CANbus 2.0 and FD for SocketCAN on Linux.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN bus frames and their kernel byte layout.
//!
//! At the lowest level, [libc](https://crates.io/crates/libc) defines the
//! CAN frames as low-level structs that are binary compatible with the C
//! data types sent to and from the kernel:
//! - [can_frame](https://docs.rs/libc/latest/libc/struct.can_frame.html)
//!   The Classic CAN 2.0 frame with up to 8 bytes of data (16 bytes on the
//!   wire: id, dlc, three pad bytes, data).
//! - [canfd_frame](https://docs.rs/libc/latest/libc/struct.canfd_frame.html)
//!   The CAN Flexible Data Rate frame with up to 64 bytes of data (72 bytes
//!   on the wire: id, length, flags, two pad bytes, data).
//!
//! A [`CanFrame`] is an immutable value that can hold either. It is turned
//! into those bytes with [`CanFrame::encode`] and back with [`decode`]. The
//! kernel tells the two apart purely by size, so the codec does too.

use crate::{
    as_bytes, as_bytes_mut,
    id::{
        id_bits, id_from_word, id_to_canid_t, is_extended, FdFlags, IdFlags, CANFD_MAX_DLEN,
        CAN_ERR_MASK, CAN_MAX_DLEN, CAN_RTR_FLAG, CAN_SFF_MASK,
    },
    ConstructionError, Error, Result,
};
use embedded_can::{Frame as EmbeddedFrame, Id, StandardId};
use itertools::Itertools;
use libc::{can_frame, canfd_frame, canid_t};
use std::{fmt, mem};

pub use libc::{CANFD_MTU, CAN_MTU};

/// The payload lengths a CAN FD frame can have beyond the classic 8 bytes.
const FD_LENGTHS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

/// Creates a default C `can_frame`.
/// This initializes the entire structure to zeros.
#[inline(always)]
pub fn can_frame_default() -> can_frame {
    unsafe { mem::zeroed() }
}

/// Creates a default C `canfd_frame`.
/// This initializes the entire structure to zeros.
#[inline(always)]
pub fn canfd_frame_default() -> canfd_frame {
    unsafe { mem::zeroed() }
}

/// Rounds a payload length up to the next length a CAN FD frame can carry.
///
/// Returns `None` if the length exceeds 64 bytes.
pub fn fd_padded_len(len: usize) -> Option<usize> {
    match len {
        n if n <= CAN_MAX_DLEN => Some(n),
        n => FD_LENGTHS.iter().copied().find(|&max| n <= max),
    }
}

/// Checks that the ID bits of a word fit its format.
fn check_id(id: canid_t) -> std::result::Result<(), ConstructionError> {
    let flags = IdFlags::from_bits_truncate(id);
    let bits = id & !IdFlags::all().bits();

    if flags.contains(IdFlags::ERR) || flags.contains(IdFlags::EFF) || bits <= CAN_SFF_MASK {
        Ok(())
    } else {
        Err(ConstructionError::IDTooLarge)
    }
}

// ===== CanFrame =====

/// A CAN frame, either a classic CAN 2.0 frame or a CAN FD frame.
///
/// The ID is the composite SocketCAN ID word, flags included. Once built,
/// a frame can't be changed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: canid_t,
    len: u8,
    flags: FdFlags,
    fd: bool,
    data: [u8; CANFD_MAX_DLEN],
}

impl CanFrame {
    /// Creates a classic data frame from an ID word and up to 8 bytes.
    pub fn new(id: canid_t, data: &[u8]) -> std::result::Result<Self, ConstructionError> {
        check_id(id)?;
        if data.len() > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }

        let mut frame = Self::empty(id, false);
        frame.len = data.len() as u8;
        frame.data[..data.len()].copy_from_slice(data);
        Ok(frame)
    }

    /// Creates a classic remote transmission request.
    ///
    /// This sets the RTR flag in the ID word. The frame carries no data.
    pub fn new_remote(id: canid_t, dlc: usize) -> std::result::Result<Self, ConstructionError> {
        check_id(id)?;
        if dlc > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }

        let mut frame = Self::empty(id | CAN_RTR_FLAG, false);
        frame.len = dlc as u8;
        Ok(frame)
    }

    /// Creates a CAN FD frame from an ID word and up to 64 bytes.
    ///
    /// The payload is zero-padded up to the next valid FD length.
    pub fn new_fd(
        id: canid_t,
        data: &[u8],
        flags: FdFlags,
    ) -> std::result::Result<Self, ConstructionError> {
        check_id(id)?;
        if id & CAN_RTR_FLAG != 0 {
            return Err(ConstructionError::WrongFrameType);
        }
        let len = fd_padded_len(data.len()).ok_or(ConstructionError::TooMuchData)?;

        let mut frame = Self::empty(id, true);
        frame.len = len as u8;
        frame.flags = flags;
        frame.data[..data.len()].copy_from_slice(data);
        Ok(frame)
    }

    fn empty(id: canid_t, fd: bool) -> Self {
        Self {
            id,
            len: 0,
            flags: FdFlags::empty(),
            fd,
            data: [0; CANFD_MAX_DLEN],
        }
    }

    /// Get the composite SocketCAN ID word, with EFF/RTR/ERR flags
    pub fn id_word(&self) -> canid_t {
        self.id
    }

    /// Return the actual raw CAN ID (without EFF/RTR/ERR flags)
    ///
    /// For an error frame, this is the error class bits.
    pub fn raw_id(&self) -> canid_t {
        if self.is_error_frame() {
            self.id & CAN_ERR_MASK
        } else {
            id_bits(self.id)
        }
    }

    /// Returns the EFF/RTR/ERR flags from the ID word
    pub fn id_flags(&self) -> IdFlags {
        IdFlags::from_bits_truncate(self.id)
    }

    /// Check if frame uses 29-bit extended ID format.
    pub fn is_extended(&self) -> bool {
        is_extended(self.id)
    }

    /// Check if frame is a remote transmission request.
    pub fn is_remote_frame(&self) -> bool {
        self.id_flags().contains(IdFlags::RTR)
    }

    /// Check if frame is an error message
    pub fn is_error_frame(&self) -> bool {
        self.id_flags().contains(IdFlags::ERR)
    }

    /// Check if frame is a CAN FD frame
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// Gets the FD flags. Always empty for classic frames.
    pub fn fd_flags(&self) -> FdFlags {
        self.flags
    }

    /// The data length code
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Determines if the frame carries no data.
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// A slice into the actual data.
    ///
    /// This is <= 8 bytes for classic frames, <= 64 for FD frames, and
    /// empty for remote frames.
    pub fn data(&self) -> &[u8] {
        if self.is_remote_frame() {
            &[]
        } else {
            &self.data[..self.len()]
        }
    }

    /// The size of the frame in the kernel byte layout.
    pub fn mtu(&self) -> usize {
        if self.fd {
            CANFD_MTU
        } else {
            CAN_MTU
        }
    }

    /// Encodes the frame into the kernel byte layout.
    ///
    /// The result is `CAN_MTU` bytes for a classic frame and `CANFD_MTU`
    /// bytes for an FD frame.
    pub fn encode(&self) -> Vec<u8> {
        if self.fd {
            let mut frame = canfd_frame_default();
            frame.can_id = self.id;
            frame.len = self.len;
            frame.flags = self.flags.bits();
            frame.data.copy_from_slice(&self.data);
            as_bytes(&frame).to_vec()
        } else {
            let mut frame = can_frame_default();
            frame.can_id = self.id;
            frame.can_dlc = self.len;
            frame.data.copy_from_slice(&self.data[..CAN_MAX_DLEN]);
            as_bytes(&frame).to_vec()
        }
    }

    /// Decodes a frame from the kernel byte layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        decode(buf)
    }
}

/// Decodes a frame from the kernel byte layout.
///
/// The buffer must be exactly `CAN_MTU` or `CANFD_MTU` bytes; anything else
/// is reported as [`Error::FrameMalformed`].
pub fn decode(buf: &[u8]) -> Result<CanFrame> {
    let (id, len, flags, fd, data) = match buf.len() {
        CAN_MTU => {
            let mut raw = can_frame_default();
            as_bytes_mut(&mut raw).copy_from_slice(buf);
            let mut data = [0; CANFD_MAX_DLEN];
            data[..CAN_MAX_DLEN].copy_from_slice(&raw.data);
            (raw.can_id, raw.can_dlc, FdFlags::empty(), false, data)
        }
        CANFD_MTU => {
            let mut raw = canfd_frame_default();
            as_bytes_mut(&mut raw).copy_from_slice(buf);
            let flags = FdFlags::from_bits_truncate(raw.flags);
            (raw.can_id, raw.len, flags, true, raw.data)
        }
        n => return Err(Error::FrameMalformed(n)),
    };

    let max = if fd { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
    if len as usize > max || check_id(id).is_err() {
        return Err(Error::FrameMalformed(buf.len()));
    }

    let mut frame = CanFrame::empty(id, fd);
    frame.len = len;
    frame.flags = flags;
    let n = frame.data().len();
    frame.data[..n].copy_from_slice(&data[..n]);
    Ok(frame)
}

impl EmbeddedFrame for CanFrame {
    /// Create a new CAN 2.0 data frame
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        CanFrame::new(id_to_canid_t(id), data).ok()
    }

    /// Create a new remote transmission request frame.
    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        CanFrame::new_remote(id_to_canid_t(id), dlc).ok()
    }

    fn is_extended(&self) -> bool {
        CanFrame::is_extended(self)
    }

    fn is_remote_frame(&self) -> bool {
        CanFrame::is_remote_frame(self)
    }

    /// Return the frame identifier.
    fn id(&self) -> Id {
        id_from_word(self.id).unwrap_or(Id::Standard(StandardId::ZERO))
    }

    fn dlc(&self) -> usize {
        self.len()
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

impl Default for CanFrame {
    /// The default frame is a classic data frame with all fields zero.
    fn default() -> Self {
        Self::empty(0, false)
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CanFrame {{ ")?;
        fmt::UpperHex::fmt(self, f)?;
        write!(f, " }}")
    }
}

impl fmt::UpperHex for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts = self.data().iter().map(|v| format!("{:02X}", v));
        if self.fd {
            write!(f, "{:X}##{} {}", self.raw_id(), self.flags.bits(), parts.join(" "))
        } else {
            write!(f, "{:X}#{}", self.raw_id(), parts.join(" "))
        }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(self, f)
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CAN_EFF_FLAG, CAN_ERR_FLAG};

    const DATA: &[u8] = &[0x33, 0x22, 0x11];

    #[test]
    fn test_new_classic() {
        let frame = CanFrame::new(0x7E0, DATA).unwrap();

        assert_eq!(frame.id_word(), 0x7E0);
        assert_eq!(frame.raw_id(), 0x7E0);
        assert!(!frame.is_extended());
        assert!(!frame.is_fd());
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.data(), DATA);
        assert_eq!(frame.mtu(), CAN_MTU);

        assert_eq!(
            CanFrame::new(0x800, DATA),
            Err(ConstructionError::IDTooLarge)
        );
        assert_eq!(
            CanFrame::new(0x7E0, &[0; 9]),
            Err(ConstructionError::TooMuchData)
        );
    }

    #[test]
    fn test_new_extended() {
        let frame = CanFrame::new(0x98DAF100, DATA).unwrap();
        assert!(frame.is_extended());
        assert_eq!(frame.raw_id(), 0x18DAF100);
        assert_eq!(EmbeddedFrame::id(&frame), id_from_word(0x98DAF100).unwrap());
    }

    #[test]
    fn test_new_remote() {
        let frame = CanFrame::new_remote(0x123, 4).unwrap();
        assert!(frame.is_remote_frame());
        assert_eq!(frame.len(), 4);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn test_fd_padding() {
        assert_eq!(fd_padded_len(0), Some(0));
        assert_eq!(fd_padded_len(8), Some(8));
        assert_eq!(fd_padded_len(9), Some(12));
        assert_eq!(fd_padded_len(33), Some(48));
        assert_eq!(fd_padded_len(64), Some(64));
        assert_eq!(fd_padded_len(65), None);

        let frame = CanFrame::new_fd(0x123, &[0xAA; 10], FdFlags::BRS).unwrap();
        assert!(frame.is_fd());
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame.data()[..10], &[0xAA; 10]);
        assert_eq!(&frame.data()[10..], &[0, 0]);
        assert_eq!(frame.mtu(), CANFD_MTU);
    }

    #[test]
    fn test_codec_classic() {
        let frame = CanFrame::new(0x7E0, DATA).unwrap();
        let buf = frame.encode();

        assert_eq!(buf.len(), CAN_MTU);
        assert_eq!(&buf[..4], &0x7E0u32.to_ne_bytes());
        assert_eq!(buf[4], 3);
        assert_eq!(&buf[8..11], DATA);
        assert_eq!(decode(&buf).unwrap(), frame);
    }

    #[test]
    fn test_codec_fd() {
        let data: Vec<u8> = (0..64).collect();
        let frame = CanFrame::new_fd(CAN_EFF_FLAG | 0x18DA00F1, &data, FdFlags::BRS).unwrap();
        let buf = frame.encode();

        assert_eq!(buf.len(), CANFD_MTU);
        assert_eq!(buf[4], 64);
        assert_eq!(buf[5], FdFlags::BRS.bits());
        assert_eq!(&buf[8..], &data[..]);
        assert_eq!(CanFrame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn test_codec_remote_and_error() {
        let frame = CanFrame::new_remote(0x7DF, 8).unwrap();
        assert_eq!(decode(&frame.encode()).unwrap(), frame);

        let frame = CanFrame::new(CAN_ERR_FLAG | 0x40, &[0; 8]).unwrap();
        let decoded = decode(&frame.encode()).unwrap();
        assert!(decoded.is_error_frame());
        assert_eq!(decoded.raw_id(), 0x40);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode(&[0; 15]), Err(Error::FrameMalformed(15))));
        assert!(matches!(decode(&[]), Err(Error::FrameMalformed(0))));

        // A classic frame claiming more than 8 bytes
        let mut buf = CanFrame::new(0x100, &[1]).unwrap().encode();
        buf[4] = 9;
        assert!(matches!(decode(&buf), Err(Error::FrameMalformed(CAN_MTU))));
    }

    #[test]
    fn test_hex_format() {
        let frame = CanFrame::new(0x7E0, DATA).unwrap();
        assert_eq!(format!("{:X}", frame), "7E0#33 22 11");
        assert_eq!(format!("{}", frame), "7E0#33 22 11");

        let frame = CanFrame::new_fd(0x7E0, &[1], FdFlags::empty()).unwrap();
        assert_eq!(format!("{:X}", frame), "7E0##0 01");
    }
}
