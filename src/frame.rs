//! Command frame layer: header fields, XOR checksum, and the three-way
//! classification (command / response / notification) that sits on top
//! of the byte-stuffing codec.
//!
//! Wire layout (spec §3/§4):
//! ```text
//! +--------+--------+-----+-----+------------------+
//! | len hi | len lo | typ | cmd | cks | payload...  |
//! +--------+--------+-----+-----+------------------+
//!     0        1       2     3     4    5..5+len
//! ```
//! `typ`'s high nibble is the [`FrameClass`]; its low nibble is a
//! function code whose meaning depends on the class.

use crate::codec::{DecodeEvent, StuffDecoder, StuffEncoder};
use crate::error::{CodecError, Error};

/// Size of the fixed header: 2-byte length, `typ`, `cmd`, checksum.
pub const HEADER_LEN: usize = 5;
/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 1268;
/// Largest on-wire frame (header + payload) before stuffing.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

const CHECKSUM_POS: usize = 4;

/// High nibble of `typ`: what kind of frame this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Command,
    Response,
    Notification,
}

impl FrameClass {
    fn nibble(self) -> u8 {
        match self {
            FrameClass::Command => 0x1,
            FrameClass::Response => 0x2,
            FrameClass::Notification => 0x3,
        }
    }

    fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x1 => Some(FrameClass::Command),
            0x2 => Some(FrameClass::Response),
            0x3 => Some(FrameClass::Notification),
            _ => None,
        }
    }
}

/// Low nibble of `typ` on a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFunction {
    Write,
    Read,
    Delete,
}

impl CommandFunction {
    fn code(self) -> u8 {
        match self {
            CommandFunction::Write => 0,
            CommandFunction::Read => 1,
            CommandFunction::Delete => 2,
        }
    }
}

/// Low nibble of `typ` on a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFunction {
    Ok,
    Value,
    BadParam,
    BadCmd,
    NotAllowed,
    MemErr,
    CfgErr,
    FwuErr,
    Busy,
}

impl ResponseFunction {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ResponseFunction::Ok,
            1 => ResponseFunction::Value,
            2 => ResponseFunction::BadParam,
            3 => ResponseFunction::BadCmd,
            4 => ResponseFunction::NotAllowed,
            5 => ResponseFunction::MemErr,
            6 => ResponseFunction::CfgErr,
            7 => ResponseFunction::FwuErr,
            8 => ResponseFunction::Busy,
            _ => return None,
        })
    }

    /// Anything other than `ok`/`value` is a module-side error.
    pub fn is_error(self) -> bool {
        !matches!(self, ResponseFunction::Ok | ResponseFunction::Value)
    }
}

/// Low nibble of `typ` on a notification frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationFunction {
    PingReply,
    SockRecv,
    NamedPingReply,
    NamedSockRecv,
    DstUnreachable,
}

impl NotificationFunction {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => NotificationFunction::PingReply,
            1 => NotificationFunction::SockRecv,
            2 => NotificationFunction::NamedPingReply,
            3 => NotificationFunction::NamedSockRecv,
            4 => NotificationFunction::DstUnreachable,
            _ => return None,
        })
    }

    /// Whether this variant carries a leading 32-byte domain name field.
    pub fn is_named(self) -> bool {
        matches!(self, NotificationFunction::NamedPingReply | NotificationFunction::NamedSockRecv)
    }
}

/// A decoded frame: header fields plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub typ: u8,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn class(&self) -> Option<FrameClass> {
        FrameClass::from_nibble(self.typ >> 4)
    }

    pub fn function_code(&self) -> u8 {
        self.typ & 0x0F
    }

    pub fn response_function(&self) -> Option<ResponseFunction> {
        if self.class() != Some(FrameClass::Response) {
            return None;
        }
        ResponseFunction::from_code(self.function_code())
    }

    pub fn notification_function(&self) -> Option<NotificationFunction> {
        if self.class() != Some(FrameClass::Notification) {
            return None;
        }
        NotificationFunction::from_code(self.function_code())
    }

    /// Build the stuffed on-wire bytes for a command frame.
    pub fn encode_command(function: CommandFunction, cmd: u8, payload: &[u8]) -> Vec<u8> {
        let typ = (FrameClass::Command.nibble() << 4) | function.code();
        encode_raw(typ, cmd, payload)
    }

    /// Parse an already-unstuffed header+payload buffer, verifying the
    /// checksum.
    fn from_raw(raw: &[u8]) -> Result<Frame, Error> {
        if raw.len() < HEADER_LEN {
            return Err(Error::Codec(CodecError::FrameTooLarge { len: raw.len(), cap: HEADER_LEN }));
        }
        let cks = checksum(raw);
        if cks != raw[CHECKSUM_POS] {
            return Err(Error::Checksum);
        }
        Ok(Frame { typ: raw[2], cmd: raw[3], payload: raw[HEADER_LEN..].to_vec() })
    }
}

fn checksum(raw: &[u8]) -> u8 {
    raw.iter().enumerate().fold(0u8, |acc, (i, b)| if i == CHECKSUM_POS { acc } else { acc ^ b })
}

/// Build the stuffed on-wire bytes for an arbitrary `typ`/`cmd`/payload.
///
/// `encode_command` only ever builds command-class frames, since that's
/// all a real caller sends; this lower-level entry point also lets test
/// fixtures script response and notification frames a module would send
/// back.
pub fn encode_raw(typ: u8, cmd: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
    raw.extend_from_slice(&len.to_be_bytes());
    raw.push(typ);
    raw.push(cmd);
    raw.push(0);
    raw.extend_from_slice(payload);
    raw[CHECKSUM_POS] = checksum(&raw);
    StuffEncoder::encode_to_vec(&raw)
}

/// Outcome of waiting for one more frame on the wire: a reply to the
/// request we're waiting on, a notification that needs dispatching, or
/// an error (transport timeout, codec desync, or bad checksum).
///
/// Kept as a 3-way union rather than folding "not a response" and
/// "decode error" into a single error code, so the session layer can
/// dispatch notifications without treating them as request failures.
#[derive(Debug)]
pub enum RecvResult {
    Response(Frame),
    Notification(Frame),
    Err(Error),
}

/// Reads frames off `rx_decoder`/`rx_buf`, one received byte at a time,
/// until a complete frame has been classified.
pub struct FrameReader {
    decoder: StuffDecoder,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self { decoder: StuffDecoder::new() }
    }

    /// Feed one transport byte (`None` for a read timeout). Returns
    /// `Some(RecvResult)` once a frame has fully arrived (or failed to
    /// decode); `None` means keep feeding bytes.
    pub fn feed(&mut self, buf: &mut [u8; MAX_FRAME_LEN], byte: Option<u8>) -> Option<RecvResult> {
        match self.decoder.decode_byte(buf, byte) {
            DecodeEvent::None => None,
            DecodeEvent::Timeout => Some(RecvResult::Err(Error::Timeout)),
            DecodeEvent::Error(e) => Some(RecvResult::Err(Error::Codec(e))),
            DecodeEvent::FrameReady(len) => Some(match Frame::from_raw(&buf[..len]) {
                Ok(frame) if frame.class() == Some(FrameClass::Notification) => RecvResult::Notification(frame),
                Ok(frame) => RecvResult::Response(frame),
                Err(e) => RecvResult::Err(e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_header_fields() {
        let encoded = Frame::encode_command(CommandFunction::Read, 0x05, &[]);
        let mut reader = FrameReader::new();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let mut result = None;
        for &b in &encoded {
            if let Some(r) = reader.feed(&mut buf, Some(b)) {
                result = Some(r);
                break;
            }
        }
        match result.unwrap() {
            RecvResult::Response(frame) => {
                assert_eq!(frame.class(), Some(FrameClass::Command));
                assert_eq!(frame.cmd, 0x05);
                assert_eq!(frame.function_code(), CommandFunction::Read.code());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bit_flipped_checksum_is_rejected() {
        let mut encoded = Frame::encode_command(CommandFunction::Write, 0x09, &[0xAA, 0xBB]);
        // Flip a payload bit post-encode; since stuffing only touches
        // zero bytes this simple flip survives re-decoding as a single
        // corrupted byte within the same data run.
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;

        let mut reader = FrameReader::new();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let mut result = None;
        for &b in &encoded {
            if let Some(r) = reader.feed(&mut buf, Some(b)) {
                result = Some(r);
                break;
            }
        }
        assert!(matches!(result, Some(RecvResult::Err(Error::Checksum))));
    }

    #[test]
    fn matches_worked_checksum_example() {
        // spec.md §8 example 3: type 0x11, cmd 0x05, payload {0x05, 0x00}.
        let encoded = encode_raw(0x11, 0x05, &[0x05, 0x00]);
        assert_eq!(encoded, vec![0x00, 0x01, 0x06, 0x02, 0x11, 0x05, 0x13, 0x05]);
    }

    #[test]
    fn response_function_classifies_errors() {
        assert!(!ResponseFunction::Ok.is_error());
        assert!(!ResponseFunction::Value.is_error());
        assert!(ResponseFunction::FwuErr.is_error());
        assert!(ResponseFunction::Busy.is_error());
    }

    #[test]
    fn notification_function_named_flag() {
        assert!(NotificationFunction::NamedSockRecv.is_named());
        assert!(!NotificationFunction::SockRecv.is_named());
    }
}
