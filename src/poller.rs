// isotp-broker/src/poller.rs
//
// Implements the polling thread that drives a broker.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! A named OS thread calling a poll function in a loop.
//!
//! The loop runs until a stop is requested, the poll function asks to stop,
//! or the error handler decides an error was the last straw:
//!
//! ```text
//! while !stop_requested {
//!     match poll(timeout) {
//!         Ok(Continue) => (),
//!         Ok(Stop) => break,
//!         Err(e) => if handler(thread, e, true) { break },
//!     }
//! }
//! ```

use crate::{Error, Result};
use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle, Thread, ThreadId},
    time::Duration,
};

/// The lifecycle of a polling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerState {
    /// Created, but not started yet.
    NotStarted,
    /// The loop is running.
    Running,
    /// A stop was requested, but the loop has not ended yet.
    Stopping,
    /// The loop has ended.
    Stopped,
}

/// What the loop should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollOutcome {
    /// Poll again.
    Continue,
    /// End the loop.
    Stop,
}

type PollFn = Box<dyn FnMut(Duration) -> Result<PollOutcome> + Send>;
type ErrorHandler = Box<dyn Fn(&Thread, &Error, bool) -> bool + Send>;

/// State shared between the handle and the running thread.
#[derive(Debug)]
struct Control {
    stop: AtomicBool,
    state: Mutex<PollerState>,
}

impl Control {
    fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PollerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Marks the loop as stopped when the thread ends, even by panic.
struct StoppedOnExit<'a>(&'a Control);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_state(PollerState::Stopped);
    }
}

/// A polling loop on its own named thread.
pub struct PollingThread {
    name: String,
    timeout: Duration,
    control: Arc<Control>,
    task: Option<(PollFn, ErrorHandler)>,
    handle: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl PollingThread {
    /// Creates a polling thread, without starting it.
    ///
    /// The `poll` function is called with `timeout` on every iteration.
    /// Errors it returns are passed to `handler` along with the thread and
    /// `terminal = true`; the loop ends if the handler returns `true`.
    pub fn create<P, H>(name: &str, timeout: Duration, poll: P, handler: H) -> Self
    where
        P: FnMut(Duration) -> Result<PollOutcome> + Send + 'static,
        H: Fn(&Thread, &Error, bool) -> bool + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout,
            control: Arc::new(Control {
                stop: AtomicBool::new(false),
                state: Mutex::new(PollerState::NotStarted),
            }),
            task: Some((Box::new(poll), Box::new(handler))),
            handle: None,
            thread_id: None,
        }
    }

    /// Spawns the thread and starts the loop.
    ///
    /// A polling thread can only be started once; later calls do nothing.
    pub fn start(&mut self) -> Result<()> {
        if self.name.contains('\0') {
            return Err(Error::Poller(format!("invalid thread name {:?}", self.name)));
        }
        let Some((mut poll, handler)) = self.task.take() else {
            return Ok(());
        };

        let control = Arc::clone(&self.control);
        let timeout = self.timeout;
        control.set_state(PollerState::Running);

        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _exit = StoppedOnExit(&control);
                let thread = thread::current();
                log::debug!("Poller '{}' started", thread.name().unwrap_or_default());

                while !control.stop.load(Ordering::Acquire) {
                    match poll(timeout) {
                        Ok(PollOutcome::Continue) => (),
                        Ok(PollOutcome::Stop) => break,
                        Err(err) => {
                            if handler(&thread, &err, true) {
                                break;
                            }
                        }
                    }
                }
                log::debug!("Poller '{}' stopped", thread.name().unwrap_or_default());
            });

        match spawned {
            Ok(handle) => {
                self.thread_id = Some(handle.thread().id());
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.control.set_state(PollerState::Stopped);
                Err(Error::Poller(err.to_string()))
            }
        }
    }

    /// Requests the loop to stop.
    ///
    /// The loop checks for this before every poll, so it ends at the latest
    /// after the poll in progress returns.
    pub fn stop(&self) {
        self.control.stop.store(true, Ordering::Release);
        let mut state = self
            .control
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state == PollerState::Running {
            *state = PollerState::Stopping;
        }
    }

    /// Takes back a stop request made from the polling thread itself.
    ///
    /// The loop only checks for a stop between polls, so a request made
    /// during a poll can still be withdrawn before the loop sees it.
    /// Returns `true` if the loop keeps running.
    pub fn resume(&self) -> bool {
        if !self.is_current() {
            return false;
        }
        let mut state = self
            .control
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            PollerState::Running => true,
            PollerState::Stopping => {
                self.control.stop.store(false, Ordering::Release);
                *state = PollerState::Running;
                true
            }
            _ => false,
        }
    }

    /// Waits for the thread to end.
    ///
    /// Does not wait when called from the polling thread itself. Fails
    /// with [`Error::Poller`] if the thread panicked.
    pub fn join(&mut self) -> Result<()> {
        if self.is_current() {
            return Ok(());
        }
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|payload| Error::Poller(panic_message(&*payload))),
            None => Ok(()),
        }
    }

    /// Gets the current lifecycle state.
    pub fn state(&self) -> PollerState {
        self.control.state()
    }

    /// Determines if the caller is running on the polling thread.
    pub fn is_current(&self) -> bool {
        self.thread_id == Some(thread::current().id())
    }

    /// The name of the thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The timeout passed to every poll.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for PollingThread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PollingThread")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

/// Gets a readable message out of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).into()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".into()
    }
}

/////////////////////////////////////////////////////////////////////////////
