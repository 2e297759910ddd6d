//! Byte transport: the serial device, reduced to a one-byte-at-a-time
//! contract with a per-byte read timeout.
//!
//! This is the only layer that talks to the OS. Everything above it (the
//! stuffing codec, frame layer, session) is written against [`ByteTransport`]
//! and knows nothing about serial ports, so the session can be driven in
//! tests by [`LoopbackTransport`] or a scripted transport instead.

use std::io::{Read, Write};
use std::time::Duration;

/// Outcome of a single-byte read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A byte arrived before the deadline.
    Byte(u8),
    /// No byte arrived within the configured timeout.
    Timeout,
}

/// A byte-at-a-time transport with a soft read timeout.
///
/// Implementations may round the timeout up to their OS's minimum
/// granularity; the spec treats the timeout as a floor, not an exact value.
pub trait ByteTransport {
    /// Write one byte; blocks until it has been accepted by the device.
    fn send_byte(&mut self, byte: u8) -> std::io::Result<()>;

    /// Read one byte, or signal that none arrived within the timeout.
    fn recv_byte(&mut self) -> std::io::Result<RecvOutcome>;
}

/// Default per-byte read timeout, matching the module's expected line
/// turnaround (spec.md §6).
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// A real serial device, opened raw 8N1 at the OS's default baud for the
/// path, with a per-byte read timeout.
///
/// `serialport` already puts the port in non-canonical (raw) mode and its
/// blocking `read_exact` rounds short reads up to its own timeout
/// granularity, which is exactly the "soft floor" the spec calls for.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Open `device` with the given per-byte read timeout.
    pub fn open(device: &str, timeout_ms: u64) -> std::io::Result<Self> {
        let port = serialport::new(device, 115_200)
            .timeout(Duration::from_millis(timeout_ms))
            .open()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self { port })
    }
}

impl ByteTransport for SerialTransport {
    fn send_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.port.write_all(&[byte])
    }

    fn recv_byte(&mut self) -> std::io::Result<RecvOutcome> {
        let mut buf = [0u8; 1];
        match self.port.read_exact(&mut buf) {
            Ok(()) => Ok(RecvOutcome::Byte(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(RecvOutcome::Timeout),
            Err(e) => Err(e),
        }
    }
}

/// An in-memory loopback transport for tests: bytes written are fed back
/// as the next bytes to read. Reading past the end of what was written is
/// a timeout, never an error.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    pub written: Vec<u8>,
    pending: std::collections::VecDeque<u8>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by subsequent `recv_byte` calls, as if
    /// the peer had sent them.
    pub fn push_incoming(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }
}

impl ByteTransport for LoopbackTransport {
    fn send_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.written.push(byte);
        Ok(())
    }

    fn recv_byte(&mut self) -> std::io::Result<RecvOutcome> {
        match self.pending.pop_front() {
            Some(b) => Ok(RecvOutcome::Byte(b)),
            None => Ok(RecvOutcome::Timeout),
        }
    }
}

/// A scripted transport driven by a fixed sequence of inbound frames'
/// worth of bytes and an echo mode, used by session-layer tests that need
/// to simulate a responding module rather than a pure loopback.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub written: Vec<u8>,
    queue: std::collections::VecDeque<u8>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes (typically an already-stuffed frame) to the queue
    /// of bytes `recv_byte` will hand back.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.queue.extend(bytes.iter().copied());
    }
}

impl ByteTransport for ScriptedTransport {
    fn send_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.written.push(byte);
        Ok(())
    }

    fn recv_byte(&mut self) -> std::io::Result<RecvOutcome> {
        match self.queue.pop_front() {
            Some(b) => Ok(RecvOutcome::Byte(b)),
            None => Ok(RecvOutcome::Timeout),
        }
    }
}
