// isotp-broker/demos/isotp_ping.rs
//
// Example application that pings an emulated ECU over ISO-TP.
//
// This file is part of the Rust 'isotp-broker' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Runs a tester and an emulated ECU as two channels on one broker.
//!
//! The broker receives its own frames, so every request the tester sends
//! on 0x7E0 reaches the ECU channel, and every answer on 0x7E8 comes back
//! to the tester. Set `CAN_INTERFACE` to use something other than "vcan0".

use anyhow::Context;
use isotp_broker::{config, AddressPair, BrokerConfig, IsoTpBroker, IsoTpChannel};
use std::{
    sync::{mpsc, Mutex},
    time::{Duration, Instant},
};

// Tester present, as a diagnostic session would send it.
const REQUEST: [u8; 2] = [0x3E, 0x00];

fn main() -> anyhow::Result<()> {
    let iface = config::default_interface();

    let config = BrokerConfig::new(&iface)
        .with_loopback(true)
        .with_recv_own_msgs(true);

    let broker = IsoTpBroker::open(&config)
        .with_context(|| format!("Failed to open broker on interface {}", iface))?;

    // The ECU answers a request with the positive response SID
    let _ecu = broker.create_channel(
        AddressPair::new(0x7E0, 0x7E8),
        |ch: &IsoTpChannel, _: u32, payload: &[u8]| {
            if let Some(&sid) = payload.first() {
                let mut resp = payload.to_vec();
                resp[0] = sid.wrapping_add(0x40);
                if let Err(err) = ch.send(resp) {
                    eprintln!("ECU failed to answer: {}", err);
                }
            }
        },
    )?;

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let tester = broker.create_channel(
        AddressPair::new(0x7E8, 0x7E0),
        move |_: &IsoTpChannel, sender: u32, payload: &[u8]| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send((sender, payload.to_vec(), Instant::now()));
            }
        },
    )?;

    for i in 0..5 {
        let start = Instant::now();
        tester
            .send(REQUEST)?
            .wait()
            .context("Failed to send request")?;

        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok((sender, payload, at)) => println!(
                "{}: {:03X} -> {}  {:?}",
                i,
                sender,
                hex::encode_upper(&payload),
                at - start
            ),
            Err(_) => println!("{}: timeout", i),
        }
    }

    broker.close()?;
    Ok(())
}
