// isotp-broker/src/socket.rs
//
// Implements the raw CAN socket endpoint for SocketCAN on Linux.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The raw CAN endpoint the broker reads from and writes to.
//!
//! A [`RawCanSocket`] wraps one non-blocking `CAN_RAW` socket. It moves one
//! whole frame per call in the kernel byte layout, so reads and writes never
//! block: if nothing can be done right now, they fail with
//! [`Error::WouldBlock`] and the caller tries again once the socket is
//! ready.
//!
//! The broker only talks to its endpoint through the [`FrameEndpoint`]
//! trait, so anything that moves frames as datagrams can stand in for the
//! kernel socket.

use crate::{
    addr::CanAddr,
    filter::CanFilter,
    frame::{self, CanFrame, CANFD_MTU},
    Error, IoError, IoResult, Result,
};
use libc::{socklen_t, AF_CAN, EINVAL};
use mio::{event, unix::SourceFd, Interest, Registry, Token};
use std::{
    io::{Read, Write},
    mem,
    os::{
        raw::{c_int, c_void},
        unix::io::{AsRawFd, IntoRawFd, RawFd},
    },
    ptr,
    time::Duration,
};

pub use libc::{
    CAN_RAW, CAN_RAW_ERR_FILTER, CAN_RAW_FD_FRAMES, CAN_RAW_FILTER, CAN_RAW_JOIN_FILTERS,
    CAN_RAW_LOOPBACK, CAN_RAW_RECV_OWN_MSGS, SOL_CAN_BASE, SOL_CAN_RAW,
};

// ===== FrameEndpoint =====

/// Something the broker can move whole CAN frames through.
///
/// Implementations must be non-blocking: when no frame is available, or a
/// frame can't be written right now, they return [`Error::WouldBlock`].
/// The raw descriptor is registered with the broker's selector for read
/// readiness.
pub trait FrameEndpoint: AsRawFd + Send {
    /// Reads the next frame.
    fn read_frame(&mut self) -> Result<CanFrame>;

    /// Writes one frame, entirely or not at all.
    fn write_frame(&mut self, frame: &CanFrame) -> Result<()>;

    /// Replaces the set of accepted frames.
    ///
    /// An empty set accepts nothing.
    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()>;

    /// Releases the endpoint. Closing twice is not an error.
    fn close(&mut self) -> Result<()>;

    /// Determines if the endpoint has been closed.
    fn is_closed(&self) -> bool;
}

// ===== SocketOption =====

/// A kernel option of a raw CAN socket, along with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Whether sent frames are looped back to other sockets on the host.
    /// On by default.
    Loopback(bool),
    /// Whether the socket receives the frames it sent itself, when loopback
    /// is enabled. Off by default.
    RecvOwnMsgs(bool),
    /// Whether a frame has to match _all_ filters instead of any of them.
    JoinFilters(bool),
    /// Whether the socket can send and receive CAN FD frames.
    FdFrames(bool),
    /// The mask of bus error classes reported as error frames.
    ErrorFilter(u32),
    /// The read timeout, if any.
    ReadTimeout(Option<Duration>),
    /// The write timeout, if any.
    WriteTimeout(Option<Duration>),
}

/// The kind of a [`SocketOption`], to read the current value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOptionKind {
    /// See [`SocketOption::Loopback`]
    Loopback,
    /// See [`SocketOption::RecvOwnMsgs`]
    RecvOwnMsgs,
    /// See [`SocketOption::JoinFilters`]
    JoinFilters,
    /// See [`SocketOption::FdFrames`]
    FdFrames,
    /// See [`SocketOption::ErrorFilter`]
    ErrorFilter,
    /// See [`SocketOption::ReadTimeout`]
    ReadTimeout,
    /// See [`SocketOption::WriteTimeout`]
    WriteTimeout,
}

impl SocketOption {
    /// Gets the kind of the option.
    pub fn kind(&self) -> SocketOptionKind {
        use SocketOption::*;
        match self {
            Loopback(_) => SocketOptionKind::Loopback,
            RecvOwnMsgs(_) => SocketOptionKind::RecvOwnMsgs,
            JoinFilters(_) => SocketOptionKind::JoinFilters,
            FdFrames(_) => SocketOptionKind::FdFrames,
            ErrorFilter(_) => SocketOptionKind::ErrorFilter,
            ReadTimeout(_) => SocketOptionKind::ReadTimeout,
            WriteTimeout(_) => SocketOptionKind::WriteTimeout,
        }
    }
}

// ===== RawCanSocket =====

/// A non-blocking raw SocketCAN socket.
///
/// It is created unbound with [`open`](Self::open) and then bound to one
/// interface. Once [`close`](Self::close)d, every operation fails with
/// [`Error::Closed`].
#[derive(Debug)]
pub struct RawCanSocket {
    sock: Option<socket2::Socket>,
    bound: bool,
}

impl RawCanSocket {
    /// Opens a new, unbound, non-blocking `CAN_RAW` socket.
    pub fn open() -> Result<Self> {
        let af_can = socket2::Domain::from(AF_CAN);
        let can_raw = socket2::Protocol::from(CAN_RAW);

        let sock = socket2::Socket::new_raw(af_can, socket2::Type::RAW, Some(can_raw))?;
        sock.set_nonblocking(true)?;
        Ok(Self {
            sock: Some(sock),
            bound: false,
        })
    }

    /// Opens a socket and binds it to the named interface.
    ///
    /// The name is resolved first, so an unknown interface never costs a
    /// socket.
    pub fn open_iface(ifname: &str) -> Result<Self> {
        let addr = CanAddr::from_iface(ifname)?;
        let mut sock = Self::open()?;
        sock.bind_addr(addr)?;
        log::debug!("Bound CAN socket to '{}' ({:?})", ifname, addr);
        Ok(sock)
    }

    /// Binds the socket to the named interface, like "can0" or "vcan0".
    ///
    /// A socket can only be bound once.
    pub fn bind(&mut self, ifname: &str) -> Result<()> {
        self.socket()?;
        let addr = CanAddr::from_iface(ifname)?;
        self.bind_addr(addr)?;
        log::debug!("Bound CAN socket to '{}' ({:?})", ifname, addr);
        Ok(())
    }

    /// Binds the socket to an interface address.
    pub fn bind_addr(&mut self, addr: CanAddr) -> Result<()> {
        let sock = self.socket()?;
        if self.bound {
            return Err(IoError::from_raw_os_error(EINVAL).into());
        }
        sock.bind(&addr.into_sock_addr())?;
        self.bound = true;
        Ok(())
    }

    /// Determines if the socket has been bound to an interface.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Gets the underlying socket, unless the endpoint is closed.
    fn socket(&self) -> Result<&socket2::Socket> {
        self.sock.as_ref().ok_or(Error::Closed)
    }

    /// Sets a kernel option on the socket.
    pub fn set_option(&self, opt: SocketOption) -> Result<()> {
        use SocketOption::*;
        match opt {
            Loopback(on) => self.set_socket_option(CAN_RAW_LOOPBACK, &c_int::from(on)),
            RecvOwnMsgs(on) => self.set_socket_option(CAN_RAW_RECV_OWN_MSGS, &c_int::from(on)),
            JoinFilters(on) => self.set_socket_option(CAN_RAW_JOIN_FILTERS, &c_int::from(on)),
            FdFrames(on) => self.set_socket_option(CAN_RAW_FD_FRAMES, &c_int::from(on)),
            ErrorFilter(mask) => self.set_socket_option(CAN_RAW_ERR_FILTER, &mask),
            ReadTimeout(timeout) => Ok(self.socket()?.set_read_timeout(timeout)?),
            WriteTimeout(timeout) => Ok(self.socket()?.set_write_timeout(timeout)?),
        }
    }

    /// Reads the current value of a kernel option back from the socket.
    pub fn option(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        use SocketOptionKind::*;
        let opt = match kind {
            Loopback => SocketOption::Loopback(self.socket_flag(CAN_RAW_LOOPBACK)?),
            RecvOwnMsgs => SocketOption::RecvOwnMsgs(self.socket_flag(CAN_RAW_RECV_OWN_MSGS)?),
            JoinFilters => SocketOption::JoinFilters(self.socket_flag(CAN_RAW_JOIN_FILTERS)?),
            FdFrames => SocketOption::FdFrames(self.socket_flag(CAN_RAW_FD_FRAMES)?),
            ErrorFilter => SocketOption::ErrorFilter(self.socket_option(CAN_RAW_ERR_FILTER)?),
            ReadTimeout => SocketOption::ReadTimeout(self.socket()?.read_timeout()?),
            WriteTimeout => SocketOption::WriteTimeout(self.socket()?.write_timeout()?),
        };
        Ok(opt)
    }

    /// `setsockopt` wrapper for the `SOL_CAN_RAW` level.
    ///
    /// Note that the `val` parameter must be of the type the kernel expects;
    /// if an option expects an integer, pass in a `c_int`.
    fn set_socket_option<T>(&self, name: c_int, val: &T) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.socket()?.as_raw_fd(),
                SOL_CAN_RAW,
                name,
                val as *const _ as *const c_void,
                mem::size_of::<T>() as socklen_t,
            )
        };

        match ret {
            0 => Ok(()),
            _ => Err(IoError::last_os_error().into()),
        }
    }

    /// `getsockopt` wrapper for the `SOL_CAN_RAW` level.
    ///
    /// Only for plain integer options.
    fn socket_option<T: Copy>(&self, name: c_int) -> Result<T> {
        let mut val: T = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<T>() as socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                self.socket()?.as_raw_fd(),
                SOL_CAN_RAW,
                name,
                &mut val as *mut _ as *mut c_void,
                &mut len,
            )
        };

        match ret {
            0 => Ok(val),
            _ => Err(IoError::last_os_error().into()),
        }
    }

    fn socket_flag(&self, name: c_int) -> Result<bool> {
        Ok(self.socket_option::<c_int>(name)? != 0)
    }

    /// Sets CAN ID filters on the socket.
    ///
    /// Frames received by SocketCAN are matched against these filters, and
    /// only matching ones are returned by the socket. An empty set disables
    /// reception entirely.
    pub fn set_filters(&self, filters: &[CanFilter]) -> Result<()> {
        let fd = self.socket()?.as_raw_fd();
        let buf = CanFilter::pack(filters);

        let ret = if buf.is_empty() {
            // can't pass in a ptr to a 0-len slice, pass a null ptr instead
            unsafe { libc::setsockopt(fd, SOL_CAN_RAW, CAN_RAW_FILTER, ptr::null(), 0) }
        } else {
            unsafe {
                libc::setsockopt(
                    fd,
                    SOL_CAN_RAW,
                    CAN_RAW_FILTER,
                    buf.as_ptr().cast(),
                    buf.len() as socklen_t,
                )
            }
        };

        match ret {
            0 => Ok(()),
            _ => Err(IoError::last_os_error().into()),
        }
    }

    /// Disables reception of CAN frames.
    pub fn set_filter_drop_all(&self) -> Result<()> {
        self.set_filters(&[])
    }

    /// Reads a single frame, classic or FD.
    pub fn read_frame(&self) -> Result<CanFrame> {
        let mut buf = [0u8; CANFD_MTU];
        let mut sock = self.socket()?;
        let n = sock.read(&mut buf)?;
        frame::decode(&buf[..n])
    }

    /// Writes a single frame.
    ///
    /// CAN has no notion of a partial frame, so a write that the kernel only
    /// partly accepts is reported as [`Error::ShortWrite`].
    pub fn write_frame(&self, frame: &CanFrame) -> Result<()> {
        let buf = frame.encode();
        let mut sock = self.socket()?;
        let n = sock.write(&buf)?;

        if n != buf.len() {
            return Err(Error::ShortWrite {
                written: n,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    /// Closes the socket.
    ///
    /// The first call releases the descriptor; later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(sock) = self.sock.take() {
            let fd = sock.into_raw_fd();
            if unsafe { libc::close(fd) } != 0 {
                return Err(IoError::last_os_error().into());
            }
            log::debug!("Closed CAN socket (fd {})", fd);
        }
        Ok(())
    }

    /// Determines if the socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.sock.is_none()
    }
}

impl FrameEndpoint for RawCanSocket {
    fn read_frame(&mut self) -> Result<CanFrame> {
        RawCanSocket::read_frame(self)
    }

    fn write_frame(&mut self, frame: &CanFrame) -> Result<()> {
        RawCanSocket::write_frame(self, frame)
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()> {
        RawCanSocket::set_filters(self, filters)
    }

    fn close(&mut self) -> Result<()> {
        RawCanSocket::close(self)
    }

    fn is_closed(&self) -> bool {
        RawCanSocket::is_closed(self)
    }
}

/// A closed socket reports a descriptor of -1.
impl AsRawFd for RawCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_ref().map_or(-1, |sock| sock.as_raw_fd())
    }
}

impl event::Source for RawCanSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> IoResult<()> {
        SourceFd(&self.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> IoResult<()> {
        SourceFd(&self.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> IoResult<()> {
        SourceFd(&self.as_raw_fd()).deregister(registry)
    }
}

impl embedded_can::nb::Can for RawCanSocket {
    type Frame = CanFrame;
    type Error = Error;

    /// Transmits a frame, never replacing a pending one.
    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<Option<CanFrame>, Error> {
        match self.write_frame(frame) {
            Ok(_) => Ok(None),
            Err(Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Err(err) => Err(nb::Error::Other(err)),
        }
    }

    fn receive(&mut self) -> nb::Result<CanFrame, Error> {
        match self.read_frame() {
            Ok(frame) => Ok(frame),
            Err(Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Err(err) => Err(nb::Error::Other(err)),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
