// isotp-broker/src/config.rs
//
// Implements the configuration of an ISO-TP broker.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Broker configuration.

use crate::{
    frame::{CANFD_MTU, CAN_MTU},
    id::{CANFD_MAX_DLEN, CAN_MAX_DLEN},
    socket::SocketOption,
};
use std::{env, time::Duration};

/// The environment variable naming the default CAN interface.
pub const INTERFACE_ENV: &str = "CAN_INTERFACE";

/// The interface used when none is configured.
pub const DEFAULT_INTERFACE: &str = "vcan0";

/// How long the poller waits for the socket in one poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// The name of the poller thread.
pub const DEFAULT_THREAD_NAME: &str = "isotp-poller";

/// Gets the name of the default CAN interface.
///
/// This is the value of `CAN_INTERFACE`, if set, otherwise "vcan0".
pub fn default_interface() -> String {
    env::var(INTERFACE_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_INTERFACE.into())
}

/// Configuration for an ISO-TP broker.
///
/// Socket options left at `None` keep the kernel default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// The CAN interface to bind to, like "can0" or "vcan0".
    pub interface: String,
    /// How long the poller waits for the socket in one poll.
    pub poll_timeout: Duration,
    /// The name of the poller thread.
    pub thread_name: String,
    /// Whether sent frames are looped back to other sockets on the host.
    pub loopback: Option<bool>,
    /// Whether the broker receives the frames it sent itself.
    pub recv_own_msgs: Option<bool>,
    /// Whether to send and receive CAN FD frames.
    pub fd_frames: bool,
    /// The mask of bus errors to report as error frames.
    pub error_filter: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.into(),
            loopback: None,
            recv_own_msgs: None,
            fd_frames: false,
            error_filter: None,
        }
    }
}

impl BrokerConfig {
    /// Creates a default configuration for the named interface.
    pub fn new(ifname: &str) -> Self {
        Self {
            interface: ifname.into(),
            ..Self::default()
        }
    }

    /// Sets the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the name of the poller thread.
    pub fn with_thread_name(mut self, name: &str) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Enables or disables loopback.
    pub fn with_loopback(mut self, on: bool) -> Self {
        self.loopback = Some(on);
        self
    }

    /// Enables or disables receiving our own frames.
    pub fn with_recv_own_msgs(mut self, on: bool) -> Self {
        self.recv_own_msgs = Some(on);
        self
    }

    /// Enables or disables CAN FD frames.
    pub fn with_fd_frames(mut self, on: bool) -> Self {
        self.fd_frames = on;
        self
    }

    /// Sets the error filter mask.
    pub fn with_error_filter(mut self, mask: u32) -> Self {
        self.error_filter = Some(mask);
        self
    }

    /// The largest payload a single frame can carry with this configuration.
    pub fn max_payload(&self) -> usize {
        if self.fd_frames {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        }
    }

    /// The size of the largest frame in the kernel byte layout.
    pub fn mtu(&self) -> usize {
        if self.fd_frames {
            CANFD_MTU
        } else {
            CAN_MTU
        }
    }

    /// The socket options to apply when opening the broker's socket.
    pub fn socket_options(&self) -> Vec<SocketOption> {
        let mut opts = Vec::new();
        if let Some(on) = self.loopback {
            opts.push(SocketOption::Loopback(on));
        }
        if let Some(on) = self.recv_own_msgs {
            opts.push(SocketOption::RecvOwnMsgs(on));
        }
        if self.fd_frames {
            opts.push(SocketOption::FdFrames(true));
        }
        if let Some(mask) = self.error_filter {
            opts.push(SocketOption::ErrorFilter(mask));
        }
        opts
    }
}

/////////////////////////////////////////////////////////////////////////////
