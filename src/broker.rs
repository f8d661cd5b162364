// isotp-broker/src/broker.rs
//
// Implements the ISO-TP broker multiplexing channels over one CAN socket.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The ISO-TP broker.
//!
//! A broker owns one CAN endpoint and any number of [`IsoTpChannel`]s. The
//! kernel filters on the endpoint always equal the union of the channels'
//! filters, so the broker only ever reads frames some channel wants.
//!
//! All I/O happens on one poller thread. Each poll it:
//!
//! 1. waits for the endpoint, or a wake-up, at most for the poll timeout,
//! 2. reads frames until the endpoint would block, handing each one to
//!    every matching channel in registration order,
//! 3. writes queued messages, channel by channel in registration order,
//!    until the queues are empty or the endpoint would block.
//!
//! The poller only runs while there are channels. Handlers are called
//! without any broker lock held, so they can send, and open or close
//! channels.

use crate::{
    channel::{BrokerLink, ChannelCore, Completion, IsoTpChannel, MessageHandler, SendFuture},
    config::BrokerConfig,
    filter::CanFilter,
    frame::CanFrame,
    id::{FdFlags, CANFD_MAX_DLEN, CAN_MAX_DLEN},
    isotp::AddressPair,
    poller::{panic_message, PollOutcome, PollerState, PollingThread},
    socket::{FrameEndpoint, RawCanSocket, SocketOption, SocketOptionKind},
    CanError, Error, IoErrorKind, Result,
};
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use std::{
    collections::{HashMap, VecDeque},
    fmt, mem,
    os::unix::io::AsRawFd,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
    thread::{self, Thread},
    time::Duration,
};

/// Decides what happens after the poller hits an error.
///
/// It is called with the poller thread, the error, and whether the error
/// came out of a poll (`true`) or out of a message handler (`false`). For
/// errors out of a poll, returning `true` shuts the broker down.
pub type ExceptionHandler = Arc<dyn Fn(&Thread, &Error, bool) -> bool + Send + Sync>;

const WAKE_TOKEN: Token = Token(0);
const ENDPOINT_TOKEN: Token = Token(1);

/// Logs the error, and gives up on fatal ones.
fn default_exception_handler(thread: &Thread, err: &Error, terminal: bool) -> bool {
    log::error!(
        "Poller '{}' failed{}: {}",
        thread.name().unwrap_or("<unnamed>"),
        if terminal { "" } else { " in a message handler" },
        err
    );
    err.is_fatal()
}

/// Builds the single frame that carries a message.
fn message_frame(transmit_id: u32, payload: &[u8]) -> Result<CanFrame> {
    let frame = if payload.len() <= CAN_MAX_DLEN {
        CanFrame::new(transmit_id, payload)?
    } else {
        CanFrame::new_fd(transmit_id, payload, FdFlags::empty())?
    };
    Ok(frame)
}

// ===== Registry =====

/// A message waiting to be written.
struct Outbound {
    payload: Vec<u8>,
    done: Completion,
}

/// A registered channel with its outbound queue.
struct Entry {
    core: Arc<ChannelCore>,
    filter: CanFilter,
    queue: VecDeque<Outbound>,
}

impl Entry {
    fn key(&self) -> u64 {
        self.core.key
    }

    /// Completes every pending send with an error.
    fn cancel(self, err: fn() -> Error) {
        for msg in self.queue {
            let _ = msg.done.send(Err(err()));
        }
    }
}

/// Everything guarded by the broker lock.
struct State<E> {
    endpoint: E,
    /// Channels in registration order.
    channels: Vec<Entry>,
    /// Receive ID to channel keys, in registration order.
    by_receive_id: HashMap<u32, Vec<u64>>,
    /// Keys of the channels with a functional filter.
    functional: Vec<u64>,
    /// The filters installed on the endpoint.
    filters: Vec<CanFilter>,
    poller: Option<PollingThread>,
    shut_down: bool,
    next_key: u64,
}

impl<E> State<E> {
    fn entry_mut(&mut self, key: u64) -> Option<&mut Entry> {
        self.channels.iter_mut().find(|entry| entry.key() == key)
    }

    fn is_registered(&self, key: u64) -> bool {
        self.channels.iter().any(|entry| entry.key() == key)
    }

    /// Determines if the calling thread is the poller this broker runs on.
    ///
    /// A poller that was asked to stop, or replaced, is no longer active.
    fn is_active_poller(&self) -> bool {
        self.poller.as_ref().map_or(false, |poller| {
            poller.is_current() && poller.state() == PollerState::Running
        })
    }

    /// The de-duplicated union of the channel filters.
    fn wanted_filters(&self) -> Vec<CanFilter> {
        let mut filters = Vec::with_capacity(self.channels.len());
        for entry in &self.channels {
            if !filters.contains(&entry.filter) {
                filters.push(entry.filter);
            }
        }
        filters
    }

    /// Finds the channels a frame with the given ID goes to, in
    /// registration order.
    fn targets(&self, id: u32) -> Vec<Arc<ChannelCore>> {
        let mut keys: Vec<u64> = self.by_receive_id.get(&id).cloned().unwrap_or_default();
        for &key in &self.functional {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        // Keys are handed out in registration order
        keys.sort_unstable();

        self.channels
            .iter()
            .filter(|entry| keys.binary_search(&entry.key()).is_ok())
            .filter(|entry| entry.core.address.accepts(id))
            .map(|entry| Arc::clone(&entry.core))
            .collect()
    }

    fn index(&mut self, key: u64, address: &AddressPair) {
        self.by_receive_id
            .entry(address.receive_id())
            .or_default()
            .push(key);
        if address.is_functional() {
            self.functional.push(key);
        }
    }

    fn unindex(&mut self, key: u64, address: &AddressPair) {
        if let Some(keys) = self.by_receive_id.get_mut(&address.receive_id()) {
            keys.retain(|&k| k != key);
            if keys.is_empty() {
                self.by_receive_id.remove(&address.receive_id());
            }
        }
        self.functional.retain(|&k| k != key);
    }
}

// ===== Shared =====

/// The part of the broker shared with its channels and its poller.
struct Shared<E> {
    state: Mutex<State<E>>,
    selector: Mutex<Poll>,
    waker: Waker,
    timeout: Duration,
    thread_name: String,
    max_payload: AtomicUsize,
    exception_handler: RwLock<ExceptionHandler>,
}

impl<E: FrameEndpoint + 'static> Shared<E> {
    fn lock_state(&self) -> MutexGuard<'_, State<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exception_handler(&self) -> ExceptionHandler {
        Arc::clone(
            &self
                .exception_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            log::warn!("Failed to wake the poller: {}", err);
        }
    }

    /// Starts a poller, unless one is running already.
    fn ensure_poller(self: &Arc<Self>, state: &mut State<E>) -> Result<()> {
        if let Some(poller) = &state.poller {
            // A handler may reopen the broker it just left idle
            if poller.state() == PollerState::Running || poller.resume() {
                return Ok(());
            }
        }

        let weak = Arc::downgrade(self);
        let mut events = Events::with_capacity(16);
        let poll = move |timeout| match weak.upgrade() {
            Some(shared) => shared.poll_once(&mut events, timeout),
            None => Ok(PollOutcome::Stop),
        };

        let weak = Arc::downgrade(self);
        let handler = move |thread: &Thread, err: &Error, terminal: bool| {
            let Some(shared) = weak.upgrade() else {
                return true;
            };
            let stop = (shared.exception_handler())(thread, err, terminal);
            if stop {
                log::warn!("Shutting the broker down after: {}", err);
                if let Err(err) = shared.shutdown(|| Error::BrokerShutDown) {
                    log::warn!("Failed to shut the broker down: {}", err);
                }
            }
            stop
        };

        let mut poller = PollingThread::create(&self.thread_name, self.timeout, poll, handler);
        poller.start()?;
        log::debug!("Started poller '{}'", self.thread_name);
        state.poller = Some(poller);
        Ok(())
    }

    /// Stops the poller and waits for it, without holding the lock.
    ///
    /// The lock is released while waiting, as the poller needs it to end
    /// its current poll. From the poller thread itself, this only asks it
    /// to stop.
    fn stop_poller(&self, mut state: MutexGuard<'_, State<E>>) {
        let Some(mut poller) = state.poller.take() else {
            return;
        };
        poller.stop();
        drop(state);
        self.wake();

        if let Err(err) = poller.join() {
            log::warn!("Poller ended abnormally: {}", err);
        }
        log::debug!("Stopped poller '{}'", poller.name());

        let mut state = self.lock_state();
        if state.poller.is_none() {
            state.poller = Some(poller);
        }
    }

    /// One iteration of the poller.
    fn poll_once(&self, events: &mut Events, timeout: Duration) -> Result<PollOutcome> {
        {
            let state = self.lock_state();
            if state.shut_down || !state.is_active_poller() {
                return Ok(PollOutcome::Stop);
            }
        }

        {
            let mut selector = self.selector.lock().unwrap_or_else(PoisonError::into_inner);
            match selector.poll(events, Some(timeout)) {
                Ok(()) => (),
                Err(err) if err.kind() == IoErrorKind::Interrupted => (),
                Err(err) => return Err(err.into()),
            }
        }

        // Readiness is edge-triggered, so drain the endpoint every time.
        loop {
            let frame = {
                let mut state = self.lock_state();
                if state.shut_down || !state.is_active_poller() {
                    return Ok(PollOutcome::Stop);
                }
                state.endpoint.read_frame()
            };

            match frame {
                Ok(frame) => self.dispatch(&frame),
                Err(Error::WouldBlock) => break,
                Err(Error::FrameMalformed(n)) => {
                    log::warn!("Dropped a malformed frame of {} bytes", n);
                }
                Err(err) => return Err(err),
            }
        }

        self.flush()
    }

    /// Hands a frame to every channel it is meant for.
    fn dispatch(&self, frame: &CanFrame) {
        log::trace!("Read frame: {}", frame);

        if frame.is_error_frame() {
            match CanError::from_frame(frame) {
                Ok(err) => log::warn!("CAN bus error: {}", err),
                Err(err) => log::warn!("Undecodable error frame {}: {}", frame, err),
            }
            return;
        }
        if frame.is_remote_frame() {
            return;
        }

        let sender = frame.id_word();
        let targets = self.lock_state().targets(sender);
        if targets.is_empty() {
            log::warn!("No channel for frame {}", frame);
            return;
        }

        for core in targets {
            let channel = IsoTpChannel::from_core(core);
            {
                let state = self.lock_state();
                if !state.is_active_poller() {
                    return;
                }
                // An earlier handler may have closed it
                if !state.is_registered(channel.key()) {
                    continue;
                }
            }

            let res = panic::catch_unwind(AssertUnwindSafe(|| {
                channel.deliver(sender, frame.data())
            }));
            if let Err(payload) = res {
                let err = Error::HandlerPanicked(panic_message(&*payload));
                (self.exception_handler())(&thread::current(), &err, false);
            }
        }
    }

    /// Writes queued messages until the queues are empty or the endpoint
    /// would block.
    fn flush(&self) -> Result<PollOutcome> {
        let mut state = self.lock_state();
        if state.shut_down || !state.is_active_poller() {
            return Ok(PollOutcome::Stop);
        }

        let State {
            endpoint, channels, ..
        } = &mut *state;

        for entry in channels.iter_mut() {
            let transmit_id = entry.core.address.transmit_id();

            while let Some(msg) = entry.queue.front() {
                let res = message_frame(transmit_id, &msg.payload)
                    .and_then(|frame| endpoint.write_frame(&frame).map(|_| frame));

                match res {
                    Ok(frame) => {
                        log::trace!("Wrote frame: {}", frame);
                        if let Some(msg) = entry.queue.pop_front() {
                            let _ = msg.done.send(Ok(()));
                        }
                    }
                    Err(Error::WouldBlock) => return Ok(PollOutcome::Continue),
                    Err(Error::ShortWrite { written, expected }) => {
                        if let Some(msg) = entry.queue.pop_front() {
                            let _ = msg.done.send(Err(Error::ShortWrite { written, expected }));
                        }
                        return Err(Error::ShortWrite { written, expected });
                    }
                    Err(err) => {
                        log::warn!("Failed to send on {:X}: {}", transmit_id, err);
                        if let Some(msg) = entry.queue.pop_front() {
                            let _ = msg.done.send(Err(err));
                        }
                    }
                }
            }
        }
        Ok(PollOutcome::Continue)
    }

    /// Shuts the broker down for good.
    ///
    /// Pending sends complete with the given error.
    fn shutdown(&self, cancel: fn() -> Error) -> Result<()> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Ok(());
        }
        state.shut_down = true;
        self.stop_poller(state);

        let mut state = self.lock_state();
        let channels = mem::take(&mut state.channels);
        state.by_receive_id.clear();
        state.functional.clear();
        state.filters.clear();
        let fd = state.endpoint.as_raw_fd();
        drop(state);

        log::debug!("Closing {} channel(s)", channels.len());
        for entry in channels {
            entry.cancel(cancel);
        }

        {
            let selector = self.selector.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = selector.registry().deregister(&mut SourceFd(&fd)) {
                log::debug!("Failed to deregister the endpoint: {}", err);
            }
        }
        self.lock_state().endpoint.close()
    }
}

impl<E: FrameEndpoint + 'static> BrokerLink for Shared<E> {
    fn enqueue(&self, key: u64, payload: Vec<u8>) -> Result<SendFuture> {
        let max = self.max_payload.load(Ordering::Relaxed);
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(Error::ChannelClosed);
        }
        let entry = state.entry_mut(key).ok_or(Error::ChannelClosed)?;

        if payload.is_empty() {
            return Ok(SendFuture::completed(Ok(())));
        }
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        log::trace!(
            "Queued on {:X}: {}",
            entry.core.address.transmit_id(),
            hex::encode_upper(&payload)
        );
        let (done, fut) = SendFuture::pending();
        entry.queue.push_back(Outbound { payload, done });
        drop(state);

        self.wake();
        Ok(fut)
    }

    fn unregister(&self, key: u64) -> Result<()> {
        let mut state = self.lock_state();
        let Some(pos) = state.channels.iter().position(|entry| entry.key() == key) else {
            return Ok(());
        };

        let entry = state.channels.remove(pos);
        let address = entry.core.address;
        state.unindex(key, &address);

        let filters = state.wanted_filters();
        let installed = state.endpoint.set_filters(&filters);
        if installed.is_ok() {
            log::debug!("Installed {} filter(s): {:?}", filters.len(), filters);
            state.filters = filters;
        }
        log::debug!(
            "Closed channel {:X} -> {:X}",
            address.transmit_id(),
            address.receive_id()
        );

        let idle = state.channels.is_empty();
        if idle {
            self.stop_poller(state);
        } else {
            drop(state);
        }

        entry.cancel(|| Error::ChannelClosed);
        installed
    }

    fn is_registered(&self, key: u64) -> bool {
        self.lock_state().is_registered(key)
    }
}

// ===== IsoTpBroker =====

/// Multiplexes ISO-TP channels over one CAN endpoint.
///
/// Dropping the broker closes it.
pub struct IsoTpBroker<E: FrameEndpoint + 'static = RawCanSocket> {
    shared: Arc<Shared<E>>,
}

impl IsoTpBroker<RawCanSocket> {
    /// Opens a broker on a raw CAN socket bound to the configured
    /// interface, with the configured socket options.
    pub fn open(config: &BrokerConfig) -> Result<Self> {
        let sock = RawCanSocket::open_iface(&config.interface)?;
        for opt in config.socket_options() {
            sock.set_option(opt)?;
        }
        Self::with_endpoint(sock, config)
    }

    /// Sets a kernel option on the socket.
    pub fn set_option(&self, opt: SocketOption) -> Result<()> {
        self.shared.lock_state().endpoint.set_option(opt)?;
        if let SocketOption::FdFrames(on) = opt {
            let max = if on { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
            self.shared.max_payload.store(max, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads the current value of a kernel option back from the socket.
    pub fn option(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        self.shared.lock_state().endpoint.option(kind)
    }
}

impl<E: FrameEndpoint + 'static> IsoTpBroker<E> {
    /// Creates a broker around an open endpoint.
    ///
    /// The endpoint starts out accepting nothing. Of the configuration, only
    /// the poller settings and the payload limit apply; socket options are
    /// the caller's business.
    pub fn with_endpoint(mut endpoint: E, config: &BrokerConfig) -> Result<Self> {
        endpoint.set_filters(&[])?;

        let selector = Poll::new()?;
        selector.registry().register(
            &mut SourceFd(&endpoint.as_raw_fd()),
            ENDPOINT_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Waker::new(selector.registry(), WAKE_TOKEN)?;

        let handler: ExceptionHandler = Arc::new(default_exception_handler);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                endpoint,
                channels: Vec::new(),
                by_receive_id: HashMap::new(),
                functional: Vec::new(),
                filters: Vec::new(),
                poller: None,
                shut_down: false,
                next_key: 0,
            }),
            selector: Mutex::new(selector),
            waker,
            timeout: config.poll_timeout,
            thread_name: config.thread_name.clone(),
            max_payload: AtomicUsize::new(config.max_payload()),
            exception_handler: RwLock::new(handler),
        });
        Ok(Self { shared })
    }

    /// Replaces the handler deciding what happens after the poller hits
    /// an error.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Thread, &Error, bool) -> bool + Send + Sync + 'static,
    {
        *self
            .shared
            .exception_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Creates a channel for the given address pair.
    ///
    /// The channel's filter is installed on the endpoint before the channel
    /// can receive anything, and the poller is started if it isn't running.
    pub fn create_channel<H>(&self, address: AddressPair, handler: H) -> Result<IsoTpChannel>
    where
        H: MessageHandler + 'static,
    {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        if state.shut_down {
            return Err(Error::BrokerShutDown);
        }

        let filter = address.filter();
        if !state.filters.contains(&filter) {
            let mut filters = state.filters.clone();
            filters.push(filter);
            state.endpoint.set_filters(&filters)?;
            log::debug!("Installed {} filter(s): {:?}", filters.len(), filters);
            state.filters = filters;
        }

        let key = state.next_key;
        state.next_key += 1;

        let weak: Weak<Shared<E>> = Arc::downgrade(shared);
        let core = Arc::new(ChannelCore {
            key,
            address,
            handler: Box::new(handler),
            broker: weak,
        });
        state.index(key, &address);
        state.channels.push(Entry {
            core: Arc::clone(&core),
            filter,
            queue: VecDeque::new(),
        });
        log::debug!(
            "Created channel {:X} -> {:X}",
            address.transmit_id(),
            address.receive_id()
        );

        if let Err(err) = shared.ensure_poller(&mut state) {
            drop(state);
            if let Err(rollback) = shared.unregister(key) {
                log::warn!(
                    "Failed to roll back channel {:X}: {}",
                    address.receive_id(),
                    rollback
                );
            }
            return Err(err);
        }
        Ok(IsoTpChannel::from_core(core))
    }

    /// Creates a channel sending to `destination` and receiving its answers.
    ///
    /// See [`AddressPair::for_destination`].
    pub fn create_channel_for_destination<H>(
        &self,
        destination: u32,
        handler: H,
    ) -> Result<IsoTpChannel>
    where
        H: MessageHandler + 'static,
    {
        self.create_channel(AddressPair::for_destination(destination), handler)
    }

    /// Closes the broker.
    ///
    /// Stops and waits for the poller, closes every channel, completing
    /// their pending sends with [`Error::ChannelClosed`], and closes the
    /// endpoint. Closing a closed broker does nothing.
    pub fn close(&self) -> Result<()> {
        self.shared.shutdown(|| Error::ChannelClosed)
    }

    /// Determines if the poller is running.
    pub fn is_running(&self) -> bool {
        self.poller_state() == PollerState::Running
    }

    /// Determines if the broker has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_state().shut_down
    }

    /// The number of open channels.
    pub fn channel_count(&self) -> usize {
        self.shared.lock_state().channels.len()
    }

    /// The filters currently installed on the endpoint.
    pub fn installed_filters(&self) -> Vec<CanFilter> {
        self.shared.lock_state().filters.clone()
    }

    /// The state of the most recent poller.
    pub fn poller_state(&self) -> PollerState {
        self.shared
            .lock_state()
            .poller
            .as_ref()
            .map_or(PollerState::NotStarted, |poller| poller.state())
    }
}

impl<E: FrameEndpoint + 'static> Drop for IsoTpBroker<E> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("Failed to close the broker: {}", err);
        }
    }
}

impl<E: FrameEndpoint + 'static> fmt::Debug for IsoTpBroker<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("IsoTpBroker")
            .field("channels", &state.channels.len())
            .field("filters", &state.filters)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
