// isotp-broker/tests/broker.rs
//
// Integration tests for the ISO-TP broker.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The broker is driven through one end of a datagram socket pair, which
//! moves frames in the kernel byte layout just like a raw CAN socket. The
//! test holds the other end, playing the bus.

use isotp_broker::{
    frame::CANFD_MTU,
    id::CAN_EFF_FLAG,
    isotp::{
        compose_eff, EFF_MASK_FUNCTIONAL_RESPONSE, SFF_ECU_RESPONSE_BASE, SFF_FUNCTIONAL_ADDRESS,
    },
    AddressPair, BrokerConfig, CanFilter, CanFrame, Error, FrameEndpoint, IsoTpBroker,
    IsoTpChannel, PollerState, Result,
};
use std::{
    collections::HashSet,
    io,
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixDatagram,
    },
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

const POLL_TIMEOUT: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(2);

/// Switches to flip on the endpoint while the broker owns it.
#[derive(Default)]
struct Knobs {
    block_writes: AtomicBool,
    short_writes: AtomicBool,
    /// Number of reads to fail with ENETDOWN
    fail_reads: AtomicUsize,
    /// Number of writes to fail with ENOBUFS
    fail_writes: AtomicUsize,
    closed: AtomicBool,
}

impl Knobs {
    fn take(count: &AtomicUsize) -> bool {
        count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A frame endpoint over a datagram socket, filtering like the kernel.
struct PairEndpoint {
    sock: Option<UnixDatagram>,
    filters: Vec<CanFilter>,
    knobs: Arc<Knobs>,
}

impl FrameEndpoint for PairEndpoint {
    fn read_frame(&mut self) -> Result<CanFrame> {
        let sock = self.sock.as_ref().ok_or(Error::Closed)?;
        if Knobs::take(&self.knobs.fail_reads) {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::ENETDOWN)));
        }
        let mut buf = [0u8; CANFD_MTU];
        loop {
            let n = sock.recv(&mut buf)?;
            let frame = CanFrame::decode(&buf[..n])?;
            if self.filters.iter().any(|f| f.matches(frame.id_word())) {
                return Ok(frame);
            }
        }
    }

    fn write_frame(&mut self, frame: &CanFrame) -> Result<()> {
        let sock = self.sock.as_ref().ok_or(Error::Closed)?;
        if self.knobs.block_writes.load(Ordering::SeqCst) {
            return Err(Error::WouldBlock);
        }
        if Knobs::take(&self.knobs.fail_writes) {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::ENOBUFS)));
        }
        let buf = frame.encode();
        if self.knobs.short_writes.load(Ordering::SeqCst) {
            return Err(Error::ShortWrite {
                written: 4,
                expected: buf.len(),
            });
        }
        sock.send(&buf)?;
        Ok(())
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()> {
        self.filters = filters.to_vec();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.sock = None;
        self.knobs.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.sock.is_none()
    }
}

impl AsRawFd for PairEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_ref().map_or(-1, |sock| sock.as_raw_fd())
    }
}

/// The test's end of the bus.
struct Bus(UnixDatagram);

impl Bus {
    fn inject(&self, id: u32, data: &[u8]) {
        let frame = CanFrame::new(id, data).unwrap();
        self.0.send(&frame.encode()).unwrap();
    }

    fn next_frame(&self) -> Option<CanFrame> {
        let mut buf = [0u8; CANFD_MTU];
        match self.0.recv(&mut buf) {
            Ok(n) => Some(CanFrame::decode(&buf[..n]).unwrap()),
            Err(_) => None,
        }
    }
}

fn broker_with(config: &BrokerConfig) -> (IsoTpBroker<PairEndpoint>, Bus, Arc<Knobs>) {
    let (ours, theirs) = UnixDatagram::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    let knobs = Arc::new(Knobs::default());
    let endpoint = PairEndpoint {
        sock: Some(ours),
        filters: vec![CanFilter::new(0, 0)],
        knobs: Arc::clone(&knobs),
    };
    let broker = IsoTpBroker::with_endpoint(endpoint, config).unwrap();
    (broker, Bus(theirs), knobs)
}

fn broker() -> (IsoTpBroker<PairEndpoint>, Bus, Arc<Knobs>) {
    broker_with(&BrokerConfig::new("pair").with_poll_timeout(POLL_TIMEOUT))
}

fn ignore(_: &IsoTpChannel, _: u32, _: &[u8]) {}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

type Inbox = Arc<Mutex<Vec<(usize, u32, Vec<u8>)>>>;

/// A handler recording everything it gets under the given tag.
fn recorder(inbox: &Inbox, tag: usize) -> impl Fn(&IsoTpChannel, u32, &[u8]) + Send + Sync {
    let inbox = Arc::clone(inbox);
    move |_: &IsoTpChannel, sender: u32, payload: &[u8]| {
        inbox.lock().unwrap().push((tag, sender, payload.to_vec()));
    }
}

#[test]
fn test_idle_broker() {
    let (broker, _bus, _knobs) = broker();

    assert!(!broker.is_running());
    assert!(!broker.is_shut_down());
    assert_eq!(broker.channel_count(), 0);
    assert!(broker.installed_filters().is_empty());
    assert_eq!(broker.poller_state(), PollerState::NotStarted);
}

#[test]
fn test_send_writes_one_frame() {
    let (broker, bus, _knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    assert!(broker.is_running());
    assert_eq!(broker.installed_filters(), vec![CanFilter::exact(0x7E8)]);

    ch.send(vec![0x33, 0x22, 0x11]).unwrap().wait().unwrap();

    let frame = bus.next_frame().unwrap();
    assert_eq!(frame.id_word(), 0x7E0);
    assert!(!frame.is_fd());
    assert_eq!(frame.data(), &[0x33, 0x22, 0x11]);

    broker.close().unwrap();
}

#[test]
fn test_functional_eff_channel() {
    let (broker, bus, _knobs) = broker();
    let inbox = Inbox::default();

    assert_eq!(compose_eff(0x18, 0xDB, 0xF1, 0x00), 0x98DB_F100);

    let dest = compose_eff(0x18, 0xDB, 0xF1, 0x33);
    let ch = broker
        .create_channel_for_destination(dest, recorder(&inbox, 0))
        .unwrap();

    assert_eq!(ch.transmit_id(), 0x98DB_F133);
    assert_eq!(
        broker.installed_filters(),
        vec![CanFilter::new(0x98DA_00F1, EFF_MASK_FUNCTIONAL_RESPONSE)]
    );

    // Two ECUs answer, someone else's answer is filtered out
    bus.inject(0x98DA_10F1, &[0x01]);
    bus.inject(0x98DA_10F2, &[0x02]);
    bus.inject(0x98DA_7FF1, &[0x03]);

    assert!(wait_until(|| inbox.lock().unwrap().len() == 2));
    assert_eq!(
        *inbox.lock().unwrap(),
        vec![(0, 0x98DA_10F1, vec![0x01]), (0, 0x98DA_7FF1, vec![0x03])]
    );
}

#[test]
fn test_fan_out_in_registration_order() {
    let (broker, bus, _knobs) = broker();
    let inbox = Inbox::default();

    let _a = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), recorder(&inbox, 1))
        .unwrap();
    let _b = broker
        .create_channel(AddressPair::new(0x7E9, 0x7E1), recorder(&inbox, 9))
        .unwrap();
    let _c = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), recorder(&inbox, 2))
        .unwrap();

    // Shared filters are only installed once
    assert_eq!(
        broker.installed_filters(),
        vec![CanFilter::exact(0x7E8), CanFilter::exact(0x7E9)]
    );

    bus.inject(0x7E8, &[0xAA]);
    assert!(wait_until(|| inbox.lock().unwrap().len() >= 2));
    thread::sleep(POLL_TIMEOUT * 3);

    assert_eq!(
        *inbox.lock().unwrap(),
        vec![(1, 0x7E8, vec![0xAA]), (2, 0x7E8, vec![0xAA])]
    );
}

#[test]
fn test_send_ordering() {
    let (broker, bus, _knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    let sends: Vec<_> = (0..5u8).map(|i| ch.send(vec![i]).unwrap()).collect();
    for fut in sends {
        fut.wait().unwrap();
    }

    for i in 0..5u8 {
        let frame = bus.next_frame().unwrap();
        assert_eq!(frame.data(), &[i]);
    }
}

#[test]
fn test_empty_send_is_noop() {
    let (broker, bus, _knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    ch.send(Vec::new()).unwrap().wait().unwrap();

    bus.0
        .set_read_timeout(Some(POLL_TIMEOUT * 5))
        .unwrap();
    assert!(bus.next_frame().is_none());
}

#[test]
fn test_payload_limits() {
    let (broker, _bus, _knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    assert!(matches!(
        ch.send(vec![0; 9]),
        Err(Error::PayloadTooLarge { len: 9, max: 8 })
    ));

    let config = BrokerConfig::new("pair")
        .with_poll_timeout(POLL_TIMEOUT)
        .with_fd_frames(true);
    let (broker, bus, _knobs) = broker_with(&config);
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    ch.send(vec![0x55; 20]).unwrap().wait().unwrap();
    let frame = bus.next_frame().unwrap();
    assert!(frame.is_fd());
    assert_eq!(frame.len(), 20);
    assert_eq!(frame.data(), &[0x55; 20][..]);

    assert!(matches!(
        ch.send(vec![0; 65]),
        Err(Error::PayloadTooLarge { len: 65, max: 64 })
    ));
}

#[test]
fn test_send_on_closed_channel() {
    let (broker, _bus, _knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    ch.close().unwrap();
    assert!(!ch.is_open());
    assert!(matches!(ch.send(vec![1, 2, 3]), Err(Error::ChannelClosed)));

    // Closing twice is fine
    ch.close().unwrap();
}

#[test]
fn test_close_cancels_pending_sends() {
    let (broker, _bus, knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    knobs.block_writes.store(true, Ordering::SeqCst);
    let mut fut = ch.send(vec![0x01]).unwrap();
    thread::sleep(POLL_TIMEOUT * 2);
    assert!(fut.try_result().is_none());

    let start = Instant::now();
    broker.close().unwrap();
    assert!(start.elapsed() < POLL_TIMEOUT + Duration::from_millis(500));

    assert!(matches!(fut.wait(), Err(Error::ChannelClosed)));
    assert!(broker.is_shut_down());
    assert_eq!(broker.poller_state(), PollerState::Stopped);
    assert_eq!(broker.channel_count(), 0);
    assert!(!ch.is_open());
    assert!(knobs.closed.load(Ordering::SeqCst));

    // Closing twice is fine
    broker.close().unwrap();
}

#[test]
fn test_closing_channel_cancels_its_sends() {
    let (broker, _bus, knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();
    let other = broker
        .create_channel(AddressPair::new(0x7E9, 0x7E1), ignore)
        .unwrap();

    knobs.block_writes.store(true, Ordering::SeqCst);
    let fut = ch.send(vec![0x01]).unwrap();
    ch.close().unwrap();

    assert!(matches!(fut.wait(), Err(Error::ChannelClosed)));
    assert!(other.is_open());
    assert!(broker.is_running());
    assert_eq!(broker.installed_filters(), vec![CanFilter::exact(0x7E9)]);
}

#[test]
fn test_last_channel_stops_poller() {
    let (broker, bus, knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();
    assert!(broker.is_running());

    ch.close().unwrap();
    assert_eq!(broker.poller_state(), PollerState::Stopped);
    assert!(!broker.is_running());
    assert!(broker.installed_filters().is_empty());
    assert!(!knobs.closed.load(Ordering::SeqCst));
    assert!(!broker.is_shut_down());

    // The endpoint is still good for new channels
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();
    assert!(broker.is_running());
    ch.send(vec![0x42]).unwrap().wait().unwrap();
    assert_eq!(bus.next_frame().unwrap().data(), &[0x42]);
}

#[test]
fn test_create_after_shutdown() {
    let (broker, _bus, _knobs) = broker();
    broker.close().unwrap();

    assert!(matches!(
        broker.create_channel(AddressPair::new(0x7E8, 0x7E0), ignore),
        Err(Error::BrokerShutDown)
    ));
}

#[test]
fn test_handler_replies() {
    let (broker, bus, _knobs) = broker();

    // An ECU answering every request with a positive response
    let _ecu = broker
        .create_channel(
            AddressPair::new(0x7E0, 0x7E8),
            |ch: &IsoTpChannel, _: u32, payload: &[u8]| {
                let mut reply = payload.to_vec();
                reply[0] += 0x40;
                // Waiting here would block the poller
                let _ = ch.send(reply);
            },
        )
        .unwrap();

    bus.inject(0x7E0, &[0x10, 0x01]);

    let frame = bus.next_frame().unwrap();
    assert_eq!(frame.id_word(), 0x7E8);
    assert_eq!(frame.data(), &[0x50, 0x01]);
}

#[test]
fn test_handler_panic_is_reported() {
    let (broker, bus, _knobs) = broker();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(AtomicUsize::new(0));

    let errors = Arc::clone(&reported);
    broker.set_exception_handler(move |_, err, terminal| {
        errors.lock().unwrap().push((err.to_string(), terminal));
        false
    });

    let count = Arc::clone(&delivered);
    let _ch = broker
        .create_channel(
            AddressPair::new(0x7E8, 0x7E0),
            move |_: &IsoTpChannel, _: u32, payload: &[u8]| {
                count.fetch_add(1, Ordering::SeqCst);
                if payload == [0xFF] {
                    panic!("bad payload");
                }
            },
        )
        .unwrap();

    bus.inject(0x7E8, &[0xFF]);
    bus.inject(0x7E8, &[0x01]);

    assert!(wait_until(|| delivered.load(Ordering::SeqCst) == 2));
    assert!(broker.is_running());

    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].0.contains("bad payload"));
    assert!(!reported[0].1);
}

#[test]
fn test_short_write_shuts_broker_down() {
    let (broker, _bus, knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    knobs.short_writes.store(true, Ordering::SeqCst);
    let res = ch.send(vec![0x01]).unwrap().wait();
    assert!(matches!(res, Err(Error::ShortWrite { written: 4, .. })));

    assert!(wait_until(|| broker.is_shut_down()));
    assert!(wait_until(|| broker.poller_state() == PollerState::Stopped));
    assert!(knobs.closed.load(Ordering::SeqCst));
    assert!(matches!(ch.send(vec![0x02]), Err(Error::ChannelClosed)));
}

#[test]
fn test_write_error_fails_only_that_send() {
    let (broker, bus, knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    // Queue both before the poller gets to write either
    knobs.block_writes.store(true, Ordering::SeqCst);
    let first = ch.send(vec![0x01]).unwrap();
    let second = ch.send(vec![0x02]).unwrap();
    knobs.fail_writes.store(1, Ordering::SeqCst);
    knobs.block_writes.store(false, Ordering::SeqCst);

    let err = first.wait().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOBUFS));
    second.wait().unwrap();

    assert_eq!(bus.next_frame().unwrap().data(), &[0x02]);
    assert!(broker.is_running());
    assert!(!broker.is_shut_down());
}

#[test]
fn test_read_error_is_reported() {
    let (broker, bus, knobs) = broker();
    let inbox = Inbox::default();
    let reported = Arc::new(Mutex::new(Vec::new()));

    let errors = Arc::clone(&reported);
    broker.set_exception_handler(move |_, err, terminal| {
        errors.lock().unwrap().push((err.raw_os_error(), terminal));
        false
    });

    let _ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), recorder(&inbox, 0))
        .unwrap();
    knobs.fail_reads.store(1, Ordering::SeqCst);

    assert!(wait_until(|| !reported.lock().unwrap().is_empty()));
    assert_eq!(*reported.lock().unwrap(), vec![(Some(libc::ENETDOWN), true)]);
    assert!(broker.is_running());

    // The poller carries on reading
    bus.inject(0x7E8, &[0x01]);
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1));
    assert_eq!(*inbox.lock().unwrap(), vec![(0, 0x7E8, vec![0x01])]);
}

#[test]
fn test_blocked_write_goes_out_later() {
    let (broker, bus, knobs) = broker();
    let ch = broker
        .create_channel(AddressPair::new(0x7E8, 0x7E0), ignore)
        .unwrap();

    knobs.block_writes.store(true, Ordering::SeqCst);
    let mut fut = ch.send(vec![0x77]).unwrap();
    thread::sleep(POLL_TIMEOUT * 3);
    assert!(fut.try_result().is_none());

    knobs.block_writes.store(false, Ordering::SeqCst);
    fut.wait().unwrap();

    let frame = bus.next_frame().unwrap();
    assert_eq!(frame.id_word(), 0x7E0);
    assert_eq!(frame.data(), &[0x77]);
}

#[test]
fn test_functional_channel_ignores_other_id_format() {
    let (broker, bus, _knobs) = broker();
    let inbox = Inbox::default();
    let _ch = broker
        .create_channel(
            AddressPair::new(SFF_ECU_RESPONSE_BASE, SFF_FUNCTIONAL_ADDRESS),
            recorder(&inbox, 0),
        )
        .unwrap();

    // Passes the 11-bit response filter, but is an extended ID
    bus.inject(CAN_EFF_FLAG | 0x7E9, &[0x01]);
    bus.inject(0x7E9, &[0x02]);

    assert!(wait_until(|| !inbox.lock().unwrap().is_empty()));
    thread::sleep(POLL_TIMEOUT * 3);
    assert_eq!(*inbox.lock().unwrap(), vec![(0, 0x7E9, vec![0x02])]);
}

#[test]
fn test_failed_poller_start_rolls_back() {
    let config = BrokerConfig::new("pair")
        .with_poll_timeout(POLL_TIMEOUT)
        .with_thread_name("bad\0name");
    let (broker, _bus, _knobs) = broker_with(&config);

    assert!(matches!(
        broker.create_channel(AddressPair::new(0x7E8, 0x7E0), ignore),
        Err(Error::Poller(_))
    ));
    assert_eq!(broker.channel_count(), 0);
    assert!(broker.installed_filters().is_empty());
    assert!(!broker.is_running());
    assert!(!broker.is_shut_down());
}

#[test]
fn test_handler_reopens_idle_broker() {
    let (broker, bus, _knobs) = broker();
    let broker = Arc::new(broker);

    let threads = Arc::new(Mutex::new(HashSet::new()));
    let busy = Arc::new(AtomicUsize::new(0));
    let max_busy = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let reopened = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&broker);
    let (threads2, busy2, max_busy2, received2, reopened2) = (
        Arc::clone(&threads),
        Arc::clone(&busy),
        Arc::clone(&max_busy),
        Arc::clone(&received),
        Arc::clone(&reopened),
    );

    // Closes the last channel, leaving the broker idle, then opens another
    let _first = broker
        .create_channel(
            AddressPair::new(0x7E8, 0x7E0),
            move |ch: &IsoTpChannel, _: u32, _: &[u8]| {
                threads2.lock().unwrap().insert(thread::current().id());
                ch.close().unwrap();

                let Some(broker) = weak.upgrade() else {
                    return;
                };
                let (threads, busy, max_busy, received) = (
                    Arc::clone(&threads2),
                    Arc::clone(&busy2),
                    Arc::clone(&max_busy2),
                    Arc::clone(&received2),
                );
                let next = broker
                    .create_channel(
                        AddressPair::new(0x7E9, 0x7E1),
                        move |_: &IsoTpChannel, _: u32, payload: &[u8]| {
                            let n = busy.fetch_add(1, Ordering::SeqCst) + 1;
                            max_busy.fetch_max(n, Ordering::SeqCst);
                            threads.lock().unwrap().insert(thread::current().id());
                            thread::sleep(Duration::from_millis(1));
                            received.lock().unwrap().push(payload[0]);
                            busy.fetch_sub(1, Ordering::SeqCst);
                        },
                    )
                    .unwrap();
                reopened2.lock().unwrap().push(next);
            },
        )
        .unwrap();

    bus.inject(0x7E8, &[0x00]);
    assert!(wait_until(|| reopened.lock().unwrap().len() == 1));
    assert!(broker.is_running());

    for i in 0..100u8 {
        bus.inject(0x7E9, &[i]);
    }
    assert!(wait_until(|| received.lock().unwrap().len() == 100));

    assert_eq!(*received.lock().unwrap(), (0..100u8).collect::<Vec<_>>());
    assert_eq!(threads.lock().unwrap().len(), 1);
    assert_eq!(max_busy.load(Ordering::SeqCst), 1);
    assert_eq!(broker.channel_count(), 1);
    assert_eq!(broker.poller_state(), PollerState::Running);
}
