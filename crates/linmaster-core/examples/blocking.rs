//! Blocking master request over the in-memory loopback channel.
//!
//! The loopback stands in for the self-echoing LIN bus, so the full
//! break / echo / validation handshake runs without hardware:
//!
//!   cargo run --example blocking

use linmaster_core::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let mut master = LinMaster::new(LoopbackTransport::new());
    master
        .begin(MasterConfig {
            baud: 19200,
            version: LinVersion::V2,
            mode: OperatingMode::Blocking,
        })
        .expect("loopback begin cannot fail");

    let flags = master.send_master_request(0x3B, &[0x11, 0x22, 0x33]);
    println!("transaction flags: {:?}", flags);
    println!("engine state:      {:?}", master.state());
    println!("latched errors:    {:?}", master.error());
}
