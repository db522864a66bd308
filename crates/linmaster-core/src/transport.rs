//! Transport port abstraction
//!
//! The engine owns no hardware; it drives a byte-oriented, half-duplex
//! serial channel through the [`Transport`] trait. The channel is assumed
//! to be self-echoing: every written byte eventually appears as a readable
//! byte.
//!
//! [`SerialTransport`] is the production implementation over a real serial
//! port; [`LoopbackTransport`] is a pure in-memory echo channel for demos
//! and tests.

use std::collections::{HashMap, VecDeque};
#[cfg(target_os = "linux")]
use std::fs;
use std::io::Read;
use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::trace;

use crate::error::LinError;

/// Byte-oriented, half-duplex serial channel consumed by the engine
pub trait Transport {
    /// Reconfigure the channel baud rate. The engine switches between the
    /// nominal rate and half rate around the break symbol.
    fn set_baud(&mut self, baud: u32) -> Result<(), LinError>;

    /// Queue bytes for transmission
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinError>;

    /// Number of received bytes readable right now, without blocking
    fn bytes_available(&mut self) -> Result<usize, LinError>;

    /// Read one received byte. Only called after `bytes_available`
    /// reported data.
    fn read_byte(&mut self) -> Result<u8, LinError>;

    /// Block until the transmit buffer has drained. Used in blocking mode
    /// only.
    fn flush_until_sent(&mut self) -> Result<(), LinError>;
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid), usb.product),
            _ => (None, None, None),
        };
        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key so ttyACM* ports come first (numerically), then ttyUSB*, then
/// everything else by name.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports with deterministic ordering.
///
/// On Linux, /dev/ttyACM* and /dev/ttyUSB* entries missed by the serialport
/// enumeration are added from a /dev scan.
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Production transport over a real serial port.
///
/// `flush_until_sent` estimates the on-wire transmission time of the bytes
/// written since the last drain (10 bits per byte at the current baud rate)
/// and sleeps it out, instead of a tcdrain-style flush which can block
/// indefinitely on some platforms.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baud: u32,
    /// Bytes written since the last drain, for the transmit-time estimate
    in_flight: usize,
}

impl SerialTransport {
    /// Open `name` at `baud` with LIN-suitable settings: 8N1, no flow
    /// control, short read timeout, cleared buffers.
    pub fn open(name: &str, baud: u32) -> Result<Self, LinError> {
        let mut port = serialport::new(name, baud)
            .timeout(Duration::from_millis(2))
            .open()
            .map_err(|e| LinError::Serial(e.to_string()))?;

        port.set_data_bits(serialport::DataBits::Eight)
            .map_err(|e| LinError::Serial(e.to_string()))?;
        port.set_parity(serialport::Parity::None)
            .map_err(|e| LinError::Serial(e.to_string()))?;
        port.set_stop_bits(serialport::StopBits::One)
            .map_err(|e| LinError::Serial(e.to_string()))?;
        port.set_flow_control(serialport::FlowControl::None)
            .map_err(|e| LinError::Serial(e.to_string()))?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| LinError::Serial(e.to_string()))?;

        Ok(Self {
            port,
            baud,
            in_flight: 0,
        })
    }

    /// Wrap an already-open serial port
    pub fn from_port(port: Box<dyn SerialPort>, baud: u32) -> Self {
        Self {
            port,
            baud,
            in_flight: 0,
        }
    }
}

impl Transport for SerialTransport {
    fn set_baud(&mut self, baud: u32) -> Result<(), LinError> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| LinError::Serial(e.to_string()))?;
        self.baud = baud;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), LinError> {
        trace!(count = bytes.len(), data = ?bytes, "serial write");
        self.port.write_all(bytes)?;
        self.in_flight += bytes.len();
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, LinError> {
        let n = self
            .port
            .bytes_to_read()
            .map_err(|e| LinError::Serial(e.to_string()))?;
        Ok(n as usize)
    }

    fn read_byte(&mut self) -> Result<u8, LinError> {
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn flush_until_sent(&mut self) -> Result<(), LinError> {
        if self.in_flight == 0 {
            return Ok(());
        }
        // 1 start + 8 data + 1 stop bits per byte, plus a fixed margin for
        // kernel buffering and USB latency
        let baud = self.baud.max(1) as u64;
        let bits = (self.in_flight * 10) as u64;
        let transmit_us = bits * 1_000_000 / baud;
        trace!(
            bytes = self.in_flight,
            baud = self.baud,
            wait_us = transmit_us,
            "waiting for transmit drain"
        );
        std::thread::sleep(Duration::from_micros(transmit_us + 500));
        self.in_flight = 0;
        Ok(())
    }
}

/// In-memory self-echoing channel: every written byte is immediately
/// readable back. Extra bytes can be injected to fake a remote node.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    baud: u32,
    rx: VecDeque<u8>,
    written: Vec<u8>,
}

impl LoopbackTransport {
    /// New empty loopback channel
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes written so far, in transmission order
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Inject bytes into the receive side, as if a remote node had
    /// transmitted them
    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Currently configured baud rate
    pub fn baud(&self) -> u32 {
        self.baud
    }
}

impl Transport for LoopbackTransport {
    fn set_baud(&mut self, baud: u32) -> Result<(), LinError> {
        self.baud = baud;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), LinError> {
        self.written.extend_from_slice(bytes);
        self.rx.extend(bytes);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, LinError> {
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> Result<u8, LinError> {
        self.rx.pop_front().ok_or_else(|| {
            LinError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "loopback receive queue empty",
            ))
        })
    }

    fn flush_until_sent(&mut self) -> Result<(), LinError> {
        Ok(())
    }
}
