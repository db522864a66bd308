//! Frame encoding
//!
//! Implements the LIN frame byte layout: protected-identifier parity,
//! version-aware checksum, and assembly of the transmit image.
//!
//! Frame layout on the wire:
//! - 1 byte:  break (0x00, transmitted at half baud rate)
//! - 1 byte:  sync (0x55)
//! - 1 byte:  protected identifier (6-bit id + 2 parity bits)
//! - 0-8 bytes: data payload
//! - 1 byte:  checksum

use serde::{Deserialize, Serialize};

/// Break symbol, transmitted at half the nominal baud rate
pub const BREAK_BYTE: u8 = 0x00;

/// Sync field, transmitted at the nominal baud rate
pub const SYNC_BYTE: u8 = 0x55;

/// Maximum number of data bytes per frame
pub const MAX_DATA: usize = 8;

/// Maximum encoded frame size: BREAK + SYNC + ID + 8 data + checksum
pub const MAX_FRAME: usize = MAX_DATA + 4;

/// LIN protocol version, selects the checksum scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinVersion {
    /// LIN 1.x: classical checksum over data bytes only
    V1,
    /// LIN 2.x: enhanced checksum seeded with the protected identifier
    V2,
}

/// LIN frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Master transmits header and data
    MasterRequest,
    /// Master transmits header only; slave appends data and checksum
    SlaveResponse,
}

/// Calculate the protected LIN identifier (LIN 2.0 spec 2.3.1.3).
///
/// Bits 6..7 of the input are cleared, then parity bits are placed on top:
/// P0 = id0^id1^id2^id4 at bit 6, P1 = !(id1^id3^id4^id5) at bit 7.
pub fn protect_id(id: u8) -> u8 {
    let mut pid = id & 0x3F;
    let p0 = (pid ^ (pid >> 1) ^ (pid >> 2) ^ (pid >> 4)) & 0x01;
    pid |= p0 << 6;
    let p1 = !((pid >> 1) ^ (pid >> 3) ^ (pid >> 4) ^ (pid >> 5)) & 0x01;
    pid |= p1 << 7;
    pid
}

/// Calculate the LIN frame checksum (LIN 2.0 spec 2.3.1.5).
///
/// Accepts a protected or unprotected identifier; protection is applied
/// internally and is idempotent on the low 6 bits.
///
/// LIN 2.x uses the enhanced checksum seeded with the protected id; LIN 1.x
/// uses the classical checksum over data bytes only. Diagnostic frames
/// (id 0x3C and 0x3D, protected 0x3C and 0x7D) always use the classical
/// checksum regardless of version.
///
/// The sum is 8-bit with end-around carry (subtract 255 whenever the running
/// sum exceeds 255), bitwise inverted at the end.
pub fn checksum(id: u8, version: LinVersion, data: &[u8]) -> u8 {
    let pid = protect_id(id);

    let mut chk: u16 = if version == LinVersion::V1 || pid == 0x3C || pid == 0x7D {
        0
    } else {
        pid as u16
    };

    for &byte in data {
        chk += byte as u16;
        if chk > 255 {
            chk -= 255;
        }
    }

    !(chk as u8)
}

/// A single LIN transaction frame, built fresh per transaction
#[derive(Debug, Clone)]
pub struct Frame {
    kind: FrameKind,
    pid: u8,
    data: [u8; MAX_DATA],
    num_data: usize,
}

impl Frame {
    /// Build a master request frame: the master supplies the data payload.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_DATA`] bytes.
    pub fn master_request(id: u8, data: &[u8]) -> Self {
        assert!(
            data.len() <= MAX_DATA,
            "LIN frame data limited to {} bytes, got {}",
            MAX_DATA,
            data.len()
        );
        let mut buf = [0u8; MAX_DATA];
        buf[..data.len()].copy_from_slice(data);
        Self {
            kind: FrameKind::MasterRequest,
            pid: protect_id(id),
            data: buf,
            num_data: data.len(),
        }
    }

    /// Build a slave response frame: the master supplies only the header and
    /// expects `num_data` payload bytes plus a checksum from the slave.
    ///
    /// # Panics
    ///
    /// Panics if `num_data` exceeds [`MAX_DATA`].
    pub fn slave_response(id: u8, num_data: usize) -> Self {
        assert!(
            num_data <= MAX_DATA,
            "LIN frame data limited to {} bytes, got {}",
            MAX_DATA,
            num_data
        );
        Self {
            kind: FrameKind::SlaveResponse,
            pid: protect_id(id),
            data: [0u8; MAX_DATA],
            num_data,
        }
    }

    /// Frame type
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Protected identifier
    pub fn pid(&self) -> u8 {
        self.pid
    }

    /// Payload bytes (empty for a slave response header)
    pub fn data(&self) -> &[u8] {
        match self.kind {
            FrameKind::MasterRequest => &self.data[..self.num_data],
            FrameKind::SlaveResponse => &[],
        }
    }

    /// Number of data bytes carried (request) or solicited (response)
    pub fn num_data(&self) -> usize {
        self.num_data
    }

    /// Encode the transmit image into a fixed buffer, returning the buffer
    /// and the number of valid bytes.
    ///
    /// A master request encodes BREAK + SYNC + PID + data + checksum
    /// (4 + num_data bytes). A slave response encodes only the header
    /// BREAK + SYNC + PID (3 bytes).
    pub fn encode(&self, version: LinVersion) -> ([u8; MAX_FRAME], usize) {
        let mut buf = [0u8; MAX_FRAME];
        buf[0] = BREAK_BYTE;
        buf[1] = SYNC_BYTE;
        buf[2] = self.pid;

        match self.kind {
            FrameKind::MasterRequest => {
                buf[3..3 + self.num_data].copy_from_slice(&self.data[..self.num_data]);
                buf[3 + self.num_data] = checksum(self.pid, version, &self.data[..self.num_data]);
                (buf, 4 + self.num_data)
            }
            FrameKind::SlaveResponse => (buf, 3),
        }
    }

    /// Total byte count expected back on the bus, echo included:
    /// BREAK + SYNC + PID + data + checksum for both frame kinds.
    pub fn expected_rx_len(&self) -> usize {
        4 + self.num_data
    }
}
