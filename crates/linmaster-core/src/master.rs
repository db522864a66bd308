//! LIN master protocol engine
//!
//! Drives one transaction at a time over a [`Transport`]: break symbol at
//! half baud, frame body at full baud, echo readback and checksum
//! validation. The same state machine serves a blocking calling convention
//! and a cooperative background convention where the remaining transitions
//! run as scheduled callbacks.
//!
//! Errors are latched into an [`ErrorFlags`] accumulator that the caller
//! reads and clears explicitly; every failure path forces the engine back
//! to idle so it never sticks mid-transaction.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{ErrorFlags, LinError};
use crate::frame::{checksum, Frame, FrameKind, LinVersion, BREAK_BYTE, MAX_DATA, MAX_FRAME};
use crate::scheduler::Scheduler;
use crate::transport::Transport;

/// Grace period for the break echo to appear before declaring a timeout
const BREAK_ECHO_GRACE: Duration = Duration::from_micros(500);

/// How transaction completion is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Calls return only once the transaction has fully resolved
    Blocking,
    /// Calls return after the break is written; scheduled callbacks finish
    /// the transaction
    Background,
}

/// State of the protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Inactive, before `begin` or after `end`
    Off,
    /// Ready to start a transaction
    Idle,
    /// Break symbol written, awaiting its echo
    Break,
    /// Frame remainder written, awaiting echo/response bytes
    FrameBody,
}

/// Channel configuration, fixed from `begin` until `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Communication baud rate
    pub baud: u32,
    /// LIN version for checksum calculation
    pub version: LinVersion,
    /// Blocking or background operation
    pub mode: OperatingMode,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            baud: 19200,
            version: LinVersion::V2,
            mode: OperatingMode::Background,
        }
    }
}

/// Timing constants derived from the baud rate
#[derive(Debug, Clone, Copy)]
struct FrameTiming {
    /// Duration of the sync break
    break_duration: Duration,
    /// Budget for the frame remainder after the break
    frame_budget: Duration,
}

impl FrameTiming {
    fn for_baud(baud: u32) -> Self {
        if baud < 12000 {
            Self {
                break_duration: Duration::from_millis(2),
                frame_budget: Duration::from_millis(13),
            }
        } else {
            Self {
                break_duration: Duration::from_millis(1),
                frame_budget: Duration::from_millis(7),
            }
        }
    }
}

/// Callback handed the validated data bytes of a slave response
pub type Consumer = Box<dyn FnMut(&[u8]) + 'static>;

/// Engine internals, shared with scheduled callbacks in background mode
struct Engine<T: Transport> {
    transport: T,
    config: MasterConfig,
    timing: FrameTiming,
    state: EngineState,
    frame_kind: FrameKind,
    buf_tx: [u8; MAX_FRAME],
    len_tx: usize,
    buf_rx: [u8; MAX_FRAME],
    len_rx: usize,
    error: ErrorFlags,
    /// Pending slave-response consumer; at most one outstanding
    consumer: Option<Consumer>,
}

impl<T: Transport> Engine<T> {
    fn new(transport: T) -> Self {
        let config = MasterConfig::default();
        Self {
            transport,
            config,
            timing: FrameTiming::for_baud(config.baud),
            state: EngineState::Off,
            frame_kind: FrameKind::MasterRequest,
            buf_tx: [0; MAX_FRAME],
            len_tx: 0,
            buf_rx: [0; MAX_FRAME],
            len_rx: 0,
            error: ErrorFlags::NONE,
            consumer: None,
        }
    }

    /// Latch `flag`, force the engine back to idle and discard the
    /// in-flight receive buffer and pending consumer
    fn fail(&mut self, flag: ErrorFlags) -> ErrorFlags {
        self.error |= flag;
        self.state = EngineState::Idle;
        self.buf_rx = [0; MAX_FRAME];
        self.consumer = None;
        flag
    }

    /// Transport failure mid-transaction: latch MISC and recover to idle
    fn transport_fail(&mut self, err: LinError) -> ErrorFlags {
        warn!(error = %err, "transport failure during transaction");
        self.fail(ErrorFlags::MISC)
    }

    /// Validate state, encode the frame and write the break symbol at half
    /// baud rate. Returns NONE with the engine in Break state on success.
    fn start(&mut self, frame: Frame, consumer: Option<Consumer>) -> ErrorFlags {
        if self.state != EngineState::Idle {
            warn!(state = ?self.state, "transaction start rejected: engine not idle");
            self.error |= ErrorFlags::STATE;
            // an unconfigured engine stays off; anything else is a stuck
            // or contended engine and recovers to idle
            if self.state != EngineState::Off {
                self.state = EngineState::Idle;
            }
            self.buf_rx = [0; MAX_FRAME];
            self.consumer = None;
            return ErrorFlags::STATE;
        }

        self.frame_kind = frame.kind();
        let (buf, len) = frame.encode(self.config.version);
        self.buf_tx = buf;
        self.len_tx = len;
        self.len_rx = frame.expected_rx_len();
        self.buf_rx = [0; MAX_FRAME];
        self.consumer = consumer;

        trace!(
            kind = ?self.frame_kind,
            tx = ?&self.buf_tx[..self.len_tx],
            expect_rx = self.len_rx,
            "starting transaction"
        );

        // drain stale echo bytes, required to recover from a prior error
        loop {
            match self.transport.bytes_available() {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = self.transport.read_byte() {
                        return self.transport_fail(e);
                    }
                }
                Err(e) => return self.transport_fail(e),
            }
        }

        // break symbol goes out at half baud rate
        if let Err(e) = self.transport.set_baud(self.config.baud / 2) {
            return self.transport_fail(e);
        }
        if let Err(e) = self.transport.write(&self.buf_tx[..1]) {
            return self.transport_fail(e);
        }

        self.state = EngineState::Break;
        ErrorFlags::NONE
    }

    /// Verify the break echo, restore full baud rate and write the frame
    /// remainder. Runs after the break duration (background) or after the
    /// transmit drain (blocking).
    fn handler_send(&mut self) -> ErrorFlags {
        if self.state != EngineState::Break {
            warn!(state = ?self.state, "send handler: engine not in break state");
            return self.fail(ErrorFlags::STATE);
        }

        // wait briefly for the break echo before touching the baud rate
        let start = Instant::now();
        let available = loop {
            match self.transport.bytes_available() {
                Ok(0) => {
                    if start.elapsed() >= BREAK_ECHO_GRACE {
                        break 0;
                    }
                }
                Ok(n) => break n,
                Err(e) => return self.transport_fail(e),
            }
        };
        if available == 0 {
            warn!("break echo timeout");
            return self.fail(ErrorFlags::TIMEOUT);
        }

        let echo = match self.transport.read_byte() {
            Ok(b) => b,
            Err(e) => return self.transport_fail(e),
        };
        self.buf_rx[0] = echo;
        if echo != BREAK_BYTE {
            warn!(echo = format_args!("{:#04x}", echo), "break echo mismatch");
            return self.fail(ErrorFlags::ECHO);
        }

        if let Err(e) = self.transport.set_baud(self.config.baud) {
            return self.transport_fail(e);
        }
        if let Err(e) = self.transport.write(&self.buf_tx[1..self.len_tx]) {
            return self.transport_fail(e);
        }

        self.state = EngineState::FrameBody;
        ErrorFlags::NONE
    }

    /// Blocking-mode wait for the expected byte count or the frame budget,
    /// whichever comes first
    fn await_response_window(&mut self) {
        let start = Instant::now();
        while start.elapsed() < self.timing.frame_budget {
            match self.transport.bytes_available() {
                Ok(n) if n == self.len_rx - 1 => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    /// Read back the echoed bytes (plus slave data for a response),
    /// validate echo and checksum, and return to idle.
    ///
    /// On a validated slave response the pending consumer is handed back to
    /// the caller together with the data bytes, to be invoked after the
    /// engine borrow is released.
    fn handler_receive(&mut self) -> (ErrorFlags, Option<(Consumer, [u8; MAX_DATA], usize)>) {
        if self.state != EngineState::FrameBody {
            warn!(state = ?self.state, "receive handler: engine not in frame state");
            return (self.fail(ErrorFlags::STATE), None);
        }

        // grant a short grace period for the last bytes to trickle in
        let start = Instant::now();
        let mut available = 0;
        loop {
            match self.transport.bytes_available() {
                Ok(n) => available = n,
                Err(e) => return (self.transport_fail(e), None),
            }
            if available == self.len_rx - 1 || start.elapsed() >= BREAK_ECHO_GRACE {
                break;
            }
        }

        // break echo was already consumed by the send handler
        if available != self.len_rx - 1 {
            warn!(
                got = available + 1,
                expected = self.len_rx,
                "frame receive timeout"
            );
            return (self.fail(ErrorFlags::TIMEOUT), None);
        }

        for i in 1..self.len_rx {
            match self.transport.read_byte() {
                Ok(b) => self.buf_rx[i] = b,
                Err(e) => return (self.transport_fail(e), None),
            }
        }
        trace!(rx = ?&self.buf_rx[..self.len_rx], "frame received");

        match self.frame_kind {
            // master request: the full echo must match what was sent
            FrameKind::MasterRequest => {
                if self.buf_rx[..self.len_tx] != self.buf_tx[..self.len_tx] {
                    warn!(
                        sent = ?&self.buf_tx[..self.len_tx],
                        received = ?&self.buf_rx[..self.len_tx],
                        "frame echo mismatch"
                    );
                    return (self.fail(ErrorFlags::ECHO), None);
                }
                self.state = EngineState::Idle;
                (ErrorFlags::NONE, None)
            }

            // slave response: header echo plus checksum over slave data
            FrameKind::SlaveResponse => {
                if self.buf_rx[..3] != self.buf_tx[..3] {
                    warn!(
                        sent = ?&self.buf_tx[..3],
                        received = ?&self.buf_rx[..3],
                        "header echo mismatch"
                    );
                    return (self.fail(ErrorFlags::ECHO), None);
                }

                let num_data = self.len_rx - 4;
                let received_chk = self.buf_rx[self.len_rx - 1];
                let calculated = checksum(
                    self.buf_rx[2],
                    self.config.version,
                    &self.buf_rx[3..3 + num_data],
                );
                if received_chk != calculated {
                    warn!(
                        received = format_args!("{:#04x}", received_chk),
                        calculated = format_args!("{:#04x}", calculated),
                        "checksum mismatch"
                    );
                    return (self.fail(ErrorFlags::CHECKSUM), None);
                }

                let mut data = [0u8; MAX_DATA];
                data[..num_data].copy_from_slice(&self.buf_rx[3..3 + num_data]);
                let consumer = self.consumer.take();
                self.state = EngineState::Idle;
                (ErrorFlags::NONE, consumer.map(|c| (c, data, num_data)))
            }
        }
    }
}

/// Runs the send handler from a scheduled callback and, on success, chains
/// the receive handler after the frame budget
fn dispatch_send<T: Transport + 'static>(engine: Rc<RefCell<Engine<T>>>, sched: Rc<dyn Scheduler>) {
    let (flags, budget) = {
        let mut e = engine.borrow_mut();
        let flags = e.handler_send();
        (flags, e.timing.frame_budget)
    };
    if flags.is_ok() {
        let engine = Rc::clone(&engine);
        sched.schedule_once(budget, Box::new(move || dispatch_receive(engine)));
    }
}

/// Runs the receive handler from a scheduled callback and invokes the
/// consumer once the engine borrow has been released
fn dispatch_receive<T: Transport + 'static>(engine: Rc<RefCell<Engine<T>>>) {
    let (_flags, callback) = engine.borrow_mut().handler_receive();
    if let Some((mut consumer, data, num_data)) = callback {
        consumer(&data[..num_data]);
    }
}

/// LIN bus master node bound to one transport channel.
///
/// Each instance exclusively owns its transport, buffers, state and latched
/// error flags; independent instances on independent ports are fully
/// decoupled. One transaction may be outstanding at a time; a second
/// request before the first resolves is rejected with
/// [`ErrorFlags::STATE`], not queued.
pub struct LinMaster<T: Transport + 'static> {
    engine: Rc<RefCell<Engine<T>>>,
    scheduler: Option<Rc<dyn Scheduler>>,
}

impl<T: Transport + 'static> LinMaster<T> {
    /// New engine for blocking operation
    pub fn new(transport: T) -> Self {
        Self {
            engine: Rc::new(RefCell::new(Engine::new(transport))),
            scheduler: None,
        }
    }

    /// New engine wired to a cooperative scheduler, required for
    /// background operation
    pub fn with_scheduler(transport: T, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            engine: Rc::new(RefCell::new(Engine::new(transport))),
            scheduler: Some(scheduler),
        }
    }

    /// Configure the channel and make the engine ready for transactions.
    ///
    /// Derives the timing constants from the baud rate, clears the latched
    /// error flags and configures the transport. Rejects background mode on
    /// an engine built without a scheduler.
    pub fn begin(&mut self, config: MasterConfig) -> Result<(), LinError> {
        if config.mode == OperatingMode::Background && self.scheduler.is_none() {
            return Err(LinError::NoScheduler);
        }

        let mut e = self.engine.borrow_mut();
        e.timing = FrameTiming::for_baud(config.baud);
        e.error = ErrorFlags::NONE;
        e.consumer = None;
        e.transport.set_baud(config.baud)?;
        e.config = config;
        e.state = EngineState::Idle;
        debug!(
            baud = config.baud,
            version = ?config.version,
            mode = ?config.mode,
            "LIN master ready"
        );
        Ok(())
    }

    /// Deactivate the engine. Clears the latched error flags and moves to
    /// Off; no transactions may be started until the next `begin`.
    pub fn end(&mut self) {
        let mut e = self.engine.borrow_mut();
        e.error = ErrorFlags::NONE;
        e.state = EngineState::Off;
        e.consumer = None;
        debug!("LIN master stopped");
    }

    /// Send a master request frame: break + sync + protected id + data +
    /// checksum, echo-verified byte for byte.
    ///
    /// Blocking mode returns the flags raised by this transaction once it
    /// has fully resolved. Background mode returns NONE right after the
    /// break is written (start rejections still return directly); poll
    /// [`LinMaster::error`] and [`LinMaster::state`] for the outcome.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 8 bytes.
    pub fn send_master_request(&mut self, id: u8, data: &[u8]) -> ErrorFlags {
        self.transact(Frame::master_request(id, data), None)
    }

    /// Solicit a slave response: the master sends break + sync + protected
    /// id, the slave appends `num_data` bytes plus a checksum. On a
    /// validated response `consumer` is invoked exactly once with the data
    /// bytes; it is never invoked when any validation step fails.
    ///
    /// # Panics
    ///
    /// Panics if `num_data` exceeds 8.
    pub fn receive_slave_response(
        &mut self,
        id: u8,
        num_data: usize,
        consumer: impl FnMut(&[u8]) + 'static,
    ) -> ErrorFlags {
        self.transact(Frame::slave_response(id, num_data), Some(Box::new(consumer)))
    }

    /// Convenience form of [`LinMaster::receive_slave_response`] that copies
    /// the validated data bytes into `dest`.
    ///
    /// The engine holds one pending destination at a time, so only one
    /// response transaction may be outstanding per instance.
    pub fn receive_slave_response_into(
        &mut self,
        id: u8,
        num_data: usize,
        dest: Rc<RefCell<Vec<u8>>>,
    ) -> ErrorFlags {
        let consumer = move |data: &[u8]| {
            let mut buf = dest.borrow_mut();
            buf.clear();
            buf.extend_from_slice(data);
        };
        self.transact(Frame::slave_response(id, num_data), Some(Box::new(consumer)))
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        self.engine.borrow().state
    }

    /// Latched error flags, accumulated across transactions until cleared
    pub fn error(&self) -> ErrorFlags {
        self.engine.borrow().error
    }

    /// Overwrite the latched error flags
    pub fn set_error(&mut self, flags: ErrorFlags) {
        self.engine.borrow_mut().error = flags;
    }

    /// Clear the latched error flags
    pub fn clear_error(&mut self) {
        self.engine.borrow_mut().error = ErrorFlags::NONE;
    }

    fn transact(&mut self, frame: Frame, consumer: Option<Consumer>) -> ErrorFlags {
        let kind = frame.kind();
        let mode = {
            let mut e = self.engine.borrow_mut();
            let flags = e.start(frame, consumer);
            if !flags.is_ok() {
                return flags;
            }
            e.config.mode
        };

        match mode {
            OperatingMode::Background => {
                let Some(sched) = self.scheduler.clone() else {
                    // begin() rejects this pairing; recover defensively
                    warn!("background transaction without scheduler");
                    return self.engine.borrow_mut().fail(ErrorFlags::STATE);
                };
                let delay = self.engine.borrow().timing.break_duration;
                let engine = Rc::clone(&self.engine);
                let chain = Rc::clone(&sched);
                sched.schedule_once(delay, Box::new(move || dispatch_send(engine, chain)));
                ErrorFlags::NONE
            }

            OperatingMode::Blocking => {
                {
                    let mut e = self.engine.borrow_mut();

                    // wait out the break, then run the send handler inline
                    if let Err(err) = e.transport.flush_until_sent() {
                        return e.transport_fail(err);
                    }
                    let flags = e.handler_send();
                    if !flags.is_ok() {
                        return flags;
                    }

                    match kind {
                        // echo arrives as the frame transmits
                        FrameKind::MasterRequest => {
                            if let Err(err) = e.transport.flush_until_sent() {
                                return e.transport_fail(err);
                            }
                        }
                        // wait for the slave within the frame budget
                        FrameKind::SlaveResponse => e.await_response_window(),
                    }
                }

                let (flags, callback) = self.engine.borrow_mut().handler_receive();
                if let Some((mut consumer, data, num_data)) = callback {
                    consumer(&data[..num_data]);
                }
                flags
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use pretty_assertions::assert_eq;

    fn blocking_config() -> MasterConfig {
        MasterConfig {
            baud: 19200,
            version: LinVersion::V2,
            mode: OperatingMode::Blocking,
        }
    }

    #[test]
    fn config_defaults_match_bus_conventions() {
        let config = MasterConfig::default();
        assert_eq!(config.baud, 19200);
        assert_eq!(config.version, LinVersion::V2);
        assert_eq!(config.mode, OperatingMode::Background);
    }

    #[test]
    fn config_survives_serde() {
        let config = blocking_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: MasterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn timing_threshold_at_12000_baud() {
        let slow = FrameTiming::for_baud(9600);
        assert_eq!(slow.break_duration, Duration::from_millis(2));
        assert_eq!(slow.frame_budget, Duration::from_millis(13));

        let fast = FrameTiming::for_baud(12000);
        assert_eq!(fast.break_duration, Duration::from_millis(1));
        assert_eq!(fast.frame_budget, Duration::from_millis(7));
    }

    #[test]
    fn engine_starts_off() {
        let master = LinMaster::new(LoopbackTransport::new());
        assert_eq!(master.state(), EngineState::Off);
        assert!(master.error().is_ok());
    }

    #[test]
    fn request_before_begin_is_a_state_error() {
        let mut master = LinMaster::new(LoopbackTransport::new());
        let flags = master.send_master_request(0x10, &[0x01]);
        assert_eq!(flags, ErrorFlags::STATE);
        // an unconfigured engine must not come up idle
        assert_eq!(master.state(), EngineState::Off);
        assert!(master.error().contains(ErrorFlags::STATE));
    }

    #[test]
    fn begin_background_without_scheduler_is_rejected() {
        let mut master = LinMaster::new(LoopbackTransport::new());
        let err = master.begin(MasterConfig::default()).unwrap_err();
        assert!(matches!(err, LinError::NoScheduler));
        assert_eq!(master.state(), EngineState::Off);
    }

    #[test]
    fn blocking_request_over_loopback_succeeds() {
        let mut master = LinMaster::new(LoopbackTransport::new());
        master.begin(blocking_config()).unwrap();
        assert_eq!(master.state(), EngineState::Idle);

        let flags = master.send_master_request(0x3B, &[0x11, 0x22]);
        assert_eq!(flags, ErrorFlags::NONE);
        assert_eq!(master.state(), EngineState::Idle);
        assert!(master.error().is_ok());
    }

    #[test]
    fn end_clears_errors_and_deactivates() {
        let mut master = LinMaster::new(LoopbackTransport::new());
        master.begin(blocking_config()).unwrap();
        master.set_error(ErrorFlags::ECHO | ErrorFlags::TIMEOUT);
        master.end();
        assert_eq!(master.state(), EngineState::Off);
        assert!(master.error().is_ok());
    }

    #[test]
    fn error_flags_stay_latched_until_cleared() {
        let mut master = LinMaster::new(LoopbackTransport::new());
        master.begin(blocking_config()).unwrap();

        master.set_error(ErrorFlags::CHECKSUM);
        let flags = master.send_master_request(0x00, &[]);
        assert_eq!(flags, ErrorFlags::NONE);
        // the old flag survives the successful transaction
        assert!(master.error().contains(ErrorFlags::CHECKSUM));

        master.clear_error();
        assert!(master.error().is_ok());
    }
}
