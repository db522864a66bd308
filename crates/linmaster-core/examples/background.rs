//! Background master request driven by the cooperative scheduler.
//!
//! The request call returns as soon as the break is on the wire; the send
//! and receive handlers then run as scheduled callbacks from the dispatch
//! loop below:
//!
//!   cargo run --example background

use std::rc::Rc;
use std::time::Duration;

use linmaster_core::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let scheduler = Rc::new(TaskScheduler::new());
    let mut master = LinMaster::with_scheduler(LoopbackTransport::new(), scheduler.clone());
    master
        .begin(MasterConfig {
            baud: 19200,
            version: LinVersion::V2,
            mode: OperatingMode::Background,
        })
        .expect("loopback begin cannot fail");

    let flags = master.send_master_request(0x3B, &[0xDE, 0xAD, 0xBE, 0xEF]);
    println!("request issued:  {:?} (state {:?})", flags, master.state());

    // cooperative dispatch loop: other work would interleave here
    while master.state() != EngineState::Idle || scheduler.has_pending() {
        std::thread::sleep(Duration::from_millis(1));
        scheduler.run_pending();
    }

    println!("transaction done (state {:?})", master.state());
    println!("latched errors:  {:?}", master.error());
}
