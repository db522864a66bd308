//! # LIN Master Core Library
//!
//! Master node emulation for a LIN (Local Interconnect Network) bus over a
//! byte-oriented, half-duplex serial channel that echoes back everything
//! the transmitter sends.
//!
//! This library provides:
//! - Frame codec: protected-identifier parity and version-aware checksum
//! - A [`transport::Transport`] contract with a serialport-backed
//!   implementation
//! - A cooperative [`scheduler::Scheduler`] for background dispatch
//! - The [`master::LinMaster`] protocol engine with blocking and
//!   background calling conventions
//!
//! ## Example
//!
//! ```rust,ignore
//! use linmaster_core::prelude::*;
//!
//! let port = SerialTransport::open("/dev/ttyUSB0", 19200)?;
//! let mut master = LinMaster::new(port);
//! master.begin(MasterConfig {
//!     baud: 19200,
//!     version: LinVersion::V2,
//!     mode: OperatingMode::Blocking,
//! })?;
//!
//! let flags = master.send_master_request(0x3B, &[0x11, 0x22]);
//! assert!(flags.is_ok());
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod master;
pub mod scheduler;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ErrorFlags, LinError};
    pub use crate::frame::{protect_id, Frame, FrameKind, LinVersion};
    pub use crate::master::{EngineState, LinMaster, MasterConfig, OperatingMode};
    pub use crate::scheduler::{Scheduler, TaskScheduler};
    pub use crate::transport::{
        list_ports, LoopbackTransport, PortInfo, SerialTransport, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
