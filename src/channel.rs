// isotp-broker/src/channel.rs
//
// Implements ISO-TP channels multiplexed over a broker.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! ISO-TP channels.
//!
//! A channel is one conversation on a broker, identified by its
//! [`AddressPair`]. It is only a handle: the broker keeps the registry
//! entry and the queue of outbound messages, and the channel refers back
//! to the broker without keeping it alive. Once the broker is gone, every
//! send fails with [`Error::ChannelClosed`].

use crate::{isotp::AddressPair, Error, Result};
use futures::channel::oneshot;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

// ===== MessageHandler =====

/// Receives the messages arriving on a channel.
///
/// Handlers run on the broker's poller thread. They must not block, or
/// every conversation on the broker stalls. They may send on, or close,
/// any channel.
pub trait MessageHandler: Send + Sync {
    /// Handles one message from `sender` to `channel`.
    fn handle(&self, channel: &IsoTpChannel, sender: u32, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(&IsoTpChannel, u32, &[u8]) + Send + Sync,
{
    fn handle(&self, channel: &IsoTpChannel, sender: u32, payload: &[u8]) {
        self(channel, sender, payload)
    }
}

// ===== SendFuture =====

/// The sending end of a [`SendFuture`].
pub(crate) type Completion = oneshot::Sender<Result<()>>;

/// The pending outcome of [`IsoTpChannel::send`].
///
/// It completes once the message was written, or with the error that kept
/// it from being written. A message dropped without an outcome reports
/// [`Error::ChannelClosed`].
#[derive(Debug)]
#[must_use = "a send can fail; check the outcome"]
pub struct SendFuture(oneshot::Receiver<Result<()>>);

impl SendFuture {
    /// Creates a future along with the handle to complete it.
    pub(crate) fn pending() -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// Creates a future that has already completed.
    pub(crate) fn completed(res: Result<()>) -> Self {
        let (tx, fut) = Self::pending();
        // The receiver is alive, so this can't fail
        let _ = tx.send(res);
        fut
    }

    /// Blocks the calling thread until the send completes.
    ///
    /// Do not call this from a message handler: the poller thread would
    /// be waiting on itself.
    pub fn wait(self) -> Result<()> {
        futures::executor::block_on(self)
    }

    /// Gets the outcome, if the send has completed.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.0.try_recv() {
            Ok(res) => res,
            Err(oneshot::Canceled) => Some(Err(Error::ChannelClosed)),
        }
    }
}

impl Future for SendFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ===== IsoTpChannel =====

/// What a channel needs from the broker it belongs to.
pub(crate) trait BrokerLink: Send + Sync {
    /// Queues a message on the channel with the given key.
    fn enqueue(&self, key: u64, payload: Vec<u8>) -> Result<SendFuture>;

    /// Removes the channel with the given key.
    fn unregister(&self, key: u64) -> Result<()>;

    /// Determines if the channel with the given key is still registered.
    fn is_registered(&self, key: u64) -> bool;
}

/// The shared part of a channel.
pub(crate) struct ChannelCore {
    pub(crate) key: u64,
    pub(crate) address: AddressPair,
    pub(crate) handler: Box<dyn MessageHandler>,
    pub(crate) broker: Weak<dyn BrokerLink>,
}

/// One ISO-TP conversation on a broker.
///
/// Channels are cheap to clone; all clones refer to the same conversation.
/// Two channels are equal only if they are the same conversation, even if
/// they share an address pair.
#[derive(Clone)]
pub struct IsoTpChannel {
    inner: Arc<ChannelCore>,
}

impl IsoTpChannel {
    pub(crate) fn from_core(inner: Arc<ChannelCore>) -> Self {
        Self { inner }
    }

    pub(crate) fn key(&self) -> u64 {
        self.inner.key
    }

    /// Queues a message to be sent on the transmit ID.
    ///
    /// An empty payload completes right away without sending anything.
    /// Fails with [`Error::ChannelClosed`] if the channel is closed, and
    /// with [`Error::PayloadTooLarge`] if the payload does not fit into a
    /// single frame.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<SendFuture> {
        let broker = self.inner.broker.upgrade().ok_or(Error::ChannelClosed)?;
        broker.enqueue(self.inner.key, payload.into())
    }

    /// Closes the channel.
    ///
    /// Sends still pending complete with [`Error::ChannelClosed`]. Closing a
    /// closed channel does nothing.
    pub fn close(&self) -> Result<()> {
        match self.inner.broker.upgrade() {
            Some(broker) => broker.unregister(self.inner.key),
            None => Ok(()),
        }
    }

    /// Determines if the channel is still registered with a live broker.
    pub fn is_open(&self) -> bool {
        self.inner
            .broker
            .upgrade()
            .map_or(false, |broker| broker.is_registered(self.inner.key))
    }

    /// The address pair of the conversation.
    pub fn address(&self) -> AddressPair {
        self.inner.address
    }

    /// The ID the remote ECU sends on.
    pub fn receive_id(&self) -> u32 {
        self.inner.address.receive_id()
    }

    /// The ID this channel sends on.
    pub fn transmit_id(&self) -> u32 {
        self.inner.address.transmit_id()
    }

    /// Hands an inbound message to the channel's handler.
    pub(crate) fn deliver(&self, sender: u32, payload: &[u8]) {
        self.inner.handler.handle(self, sender, payload)
    }
}

impl PartialEq for IsoTpChannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IsoTpChannel {}

impl fmt::Debug for IsoTpChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IsoTpChannel {{ rx: {:X}, tx: {:X} }}",
            self.receive_id(),
            self.transmit_id()
        )
    }
}

/////////////////////////////////////////////////////////////////////////////
