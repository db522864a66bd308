//! LIN bus master diagnostic tool
//!
//! Issues single blocking transactions against a real serial port and
//! reports the latched error flags.
//!
//! Usage:
//!   linmaster list
//!   linmaster send <PORT> <ID> [BYTE...]
//!   linmaster poll <PORT> <ID> <NUM_DATA>
//!
//! Options:
//!   --baud RATE   Baud rate (default: 19200)
//!   --lin1        Use LIN 1.x classical checksum

use anyhow::{bail, Context, Result};
use tracing::debug;

use linmaster_core::prelude::*;

struct Options {
    baud: u32,
    version: LinVersion,
    args: Vec<String>,
}

fn parse_options() -> Result<Options> {
    let mut baud = 19200u32;
    let mut version = LinVersion::V2;
    let mut args = Vec::new();

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--baud" | "-b" => {
                let value = iter.next().context("--baud requires a value")?;
                baud = value
                    .parse()
                    .with_context(|| format!("invalid baud rate: {}", value))?;
            }
            "--lin1" => {
                version = LinVersion::V1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => args.push(arg),
        }
    }

    Ok(Options {
        baud,
        version,
        args,
    })
}

fn print_help() {
    println!("LIN bus master diagnostic tool");
    println!();
    println!("Usage:");
    println!("  linmaster list                          List available serial ports");
    println!("  linmaster send <PORT> <ID> [BYTE...]    Send a master request frame");
    println!("  linmaster poll <PORT> <ID> <NUM_DATA>   Solicit a slave response");
    println!();
    println!("Options:");
    println!("  --baud, -b RATE   Baud rate (default: 19200)");
    println!("  --lin1            Use LIN 1.x classical checksum");
}

/// Parse a numeric argument, accepting 0x-prefixed hex or decimal
fn parse_number(s: &str) -> Result<u8> {
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    value.with_context(|| format!("invalid byte value: {}", s))
}

fn open_master(port: &str, opts: &Options) -> Result<LinMaster<SerialTransport>> {
    let transport = SerialTransport::open(port, opts.baud)
        .with_context(|| format!("failed to open {}", port))?;
    let mut master = LinMaster::new(transport);
    master.begin(MasterConfig {
        baud: opts.baud,
        version: opts.version,
        mode: OperatingMode::Blocking,
    })?;
    debug!(port, baud = opts.baud, "LIN master ready");
    Ok(master)
}

fn cmd_list() -> Result<()> {
    let ports = list_ports();
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for port in ports {
        match (port.vid, port.pid, &port.product) {
            (Some(vid), Some(pid), Some(product)) => {
                println!("{}  [{:04x}:{:04x}] {}", port.name, vid, pid, product)
            }
            (Some(vid), Some(pid), None) => {
                println!("{}  [{:04x}:{:04x}]", port.name, vid, pid)
            }
            _ => println!("{}", port.name),
        }
    }
    Ok(())
}

fn cmd_send(opts: &Options) -> Result<()> {
    let [port, id, data @ ..] = &opts.args[1..] else {
        bail!("usage: linmaster send <PORT> <ID> [BYTE...]");
    };
    let id = parse_number(id)?;
    let bytes: Vec<u8> = data.iter().map(|s| parse_number(s)).collect::<Result<_>>()?;
    if bytes.len() > 8 {
        bail!("a LIN frame carries at most 8 data bytes, got {}", bytes.len());
    }

    let mut master = open_master(port, opts)?;
    let flags = master.send_master_request(id, &bytes);
    if flags.is_ok() {
        println!("ok: id {:#04x}, {} data bytes", id, bytes.len());
        Ok(())
    } else {
        bail!("transaction failed: {:?}", flags);
    }
}

fn cmd_poll(opts: &Options) -> Result<()> {
    let [port, id, num_data] = &opts.args[1..] else {
        bail!("usage: linmaster poll <PORT> <ID> <NUM_DATA>");
    };
    let id = parse_number(id)?;
    let num_data = parse_number(num_data)? as usize;
    if num_data > 8 {
        bail!("a LIN frame carries at most 8 data bytes, got {}", num_data);
    }

    let mut master = open_master(port, opts)?;
    let dest = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let flags = master.receive_slave_response_into(id, num_data, dest.clone());
    if flags.is_ok() {
        println!("ok: id {:#04x} answered {:02x?}", id, dest.borrow());
        Ok(())
    } else {
        bail!("transaction failed: {:?}", flags);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let opts = parse_options()?;
    match opts.args.first().map(String::as_str) {
        Some("list") => cmd_list(),
        Some("send") => cmd_send(&opts),
        Some("poll") => cmd_poll(&opts),
        Some(other) => {
            print_help();
            bail!("unknown command: {}", other);
        }
        None => {
            print_help();
            Ok(())
        }
    }
}
