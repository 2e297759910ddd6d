//! Error types for the KBI session.
//!
//! The taxonomy mirrors the small, closed set of failure modes the wire
//! protocol actually distinguishes: transport I/O, stuffing-codec desync,
//! checksum mismatch, module error responses, firmware-update fatal errors
//! and socket-registry exhaustion. Nothing panics outside of tests.

use std::io;

use thiserror::Error;

use crate::frame::ResponseFunction;

/// Errors surfaced by the KBI session layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying serial device failed to open, read or write.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// No byte arrived within the configured per-byte read timeout.
    #[error("transport timeout")]
    Timeout,

    /// The stuffing decoder saw an illegal code byte or an oversized frame.
    #[error("stuffing codec error: {0}")]
    Codec(#[from] CodecError),

    /// The received frame's XOR checksum did not match the transmitted one.
    #[error("checksum mismatch")]
    Checksum,

    /// A request exhausted its retries without a matching response.
    #[error("request failed after retries")]
    RequestFailed,

    /// The module answered with an error-class response function code.
    #[error("module returned error response: {0:?}")]
    ModuleError(ResponseFunction),

    /// A firmware-update block was rejected with `fwu-err`; fatal.
    #[error("firmware update aborted by module")]
    FirmwareUpdate,

    /// The firmware file is too short to contain a 16-byte DFU suffix.
    #[error("firmware file shorter than the 16-byte DFU suffix")]
    FirmwareFileTooShort,

    /// The firmware update block loop timed out waiting for the new
    /// version to answer after reset.
    #[error("firmware update did not come back up after reset")]
    FirmwareUpdateNoReboot,

    /// All socket registry slots are in use.
    #[error("socket registry is full")]
    SocketRegistryFull,

    /// No socket is registered on the given local port.
    #[error("no socket bound to local port {0}")]
    SocketNotFound(u16),
}

/// Errors local to the stuffing codec.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// A `0xD1`/`0xD2`/`0xFF` code byte was received; these are never
    /// produced by a canonical encoder.
    #[error("illegal code byte {0:#04x}")]
    IllegalCode(u8),

    /// The header's declared length would make the frame larger than the
    /// receive buffer's capacity.
    #[error("frame length {len} exceeds buffer capacity {cap}")]
    FrameTooLarge { len: usize, cap: usize },
}
