//! Byte-stuffing framing codec.
//!
//! Removes every zero byte from a frame so that a single `0x00` can serve
//! as a self-synchronising, delimiter-free frame start marker. A family of
//! *codes* sits between runs of non-zero data, each one saying how many
//! non-zero bytes follow and how many zero bytes to re-insert once they've
//! been consumed. See spec §4.2 for the code-byte table; the summary:
//!
//! - `0x01..=0xCF`: `n-1` data bytes, then one implied zero.
//! - `0xD0`: exactly `0xCF` (207) data bytes, no implied zero (run continues).
//! - `0xD1`/`0xD2`: illegal — the same runs are always reachable through the
//!   `0x01`/`0xE0` codes, so a canonical encoder never emits them.
//! - `0xD3..=0xDF`: a run of `n-0xD0` zero bytes, no preceding data.
//! - `0xE0..=0xFE`: `n-0xE0` data bytes, then two implied zeros.
//! - `0xFF`: reserved, always an error.
//!
//! [`StuffDecoder`] is the stateful, per-byte decoder the session layer
//! drives one received byte at a time; it is coupled to the frame header
//! (it treats the first two decoded bytes as the frame's big-endian
//! payload length, per spec §4.2) because that coupling is how the wire
//! format itself determines where a frame ends — there is no end-of-frame
//! delimiter, only a byte count known once the header is visible.
//!
//! [`decode_stream`] is a length-driven, buffer-to-buffer counterpart used
//! to state the stuffing scheme's round-trip property independently of
//! frame/header semantics (spec §8's generic `decode(encode(x)) == x`
//! claim, and the worked bare-codec examples in spec §8, are about the
//! stuffing transform in isolation, not a full command frame).

use crate::error::CodecError;

/// Maximum number of non-zero data bytes a single `0x01..=0xCF` or
/// `0xE0..=0xFE` code can introduce before a continuation code is needed.
const MAX_SHORT_RUN: usize = 206;
/// Data-byte count carried by the `0xD0` continuation code.
const CONTINUATION_RUN: usize = 0xCF;
/// Largest data-byte count the two-trailing-zero code range can express.
const MAX_TWO_ZERO_RUN: usize = 30;
/// Largest zero count a single `0xD3..=0xDF` code can express.
const MAX_ZERO_CODE_RUN: usize = 15;

/// Result of decoding one more byte of an encoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent {
    /// Still mid-frame (or not yet synchronised); nothing to report.
    None,
    /// The byte source reported a read timeout.
    Timeout,
    /// An illegal code byte was seen, or the frame would exceed capacity.
    Error(CodecError),
    /// The frame is complete; carries the total on-wire length (header +
    /// payload) now sitting in the caller's buffer.
    FrameReady(usize),
}

/// Decode a single stuffing code byte into `(data_bytes, trailing_zeroes)`.
fn interpret_code(code: u8) -> Result<(usize, usize), CodecError> {
    match code {
        0x01..=0xCF => Ok(((code - 1) as usize, 1)),
        0xD0 => Ok((CONTINUATION_RUN, 0)),
        0xD1 | 0xD2 => Err(CodecError::IllegalCode(code)),
        0xD3..=0xDF => Ok((0, (code - 0xD0) as usize)),
        0xE0..=0xFE => Ok(((code - 0xE0) as usize, 2)),
        _ => Err(CodecError::IllegalCode(code)),
    }
}

/// Encodes arbitrary byte slices into the stuffed wire representation.
pub struct StuffEncoder;

impl StuffEncoder {
    /// Encode `data`, handing every output byte (including the leading
    /// `0x00` delimiter) to `emit` exactly once, in order. Returns the
    /// number of bytes emitted.
    pub fn encode(data: &[u8], mut emit: impl FnMut(u8)) -> usize {
        let mut out = Vec::with_capacity(data.len() + data.len() / 200 + 4);
        out.push(0x00);
        Self::encode_into(data, &mut out);
        for &b in &out {
            emit(b);
        }
        out.len()
    }

    /// Same as [`Self::encode`] but returns the stuffed bytes (including
    /// the leading delimiter) as an owned buffer. Convenient for tests and
    /// for the frame layer, which already stages the frame in a `Vec`.
    pub fn encode_to_vec(data: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00];
        Self::encode_into(data, &mut out);
        out
    }

    fn encode_into(data: &[u8], out: &mut Vec<u8>) {
        let runs = split_runs(data);
        let mut idx = 0;
        while idx < runs.len() {
            match runs[idx] {
                Run::Zero(z) => {
                    emit_zero_run(out, z);
                    idx += 1;
                }
                Run::Data(bytes) => {
                    let next_zero = runs.get(idx + 1).and_then(|r| match r {
                        Run::Zero(z) => Some(*z),
                        Run::Data(_) => None,
                    });
                    let absorbed = emit_data_run(out, bytes, next_zero.unwrap_or(0));
                    idx += 1;
                    if let Some(z) = next_zero {
                        emit_zero_run(out, z - absorbed);
                        idx += 1;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Run<'a> {
    Data(&'a [u8]),
    Zero(usize),
}

fn split_runs(data: &[u8]) -> Vec<Run<'_>> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let start = i;
        if data[i] == 0 {
            while i < data.len() && data[i] == 0 {
                i += 1;
            }
            runs.push(Run::Zero(i - start));
        } else {
            while i < data.len() && data[i] != 0 {
                i += 1;
            }
            runs.push(Run::Data(&data[start..i]));
        }
    }
    runs
}

/// Emit the codes for a zero-only run of length `z` (no preceding
/// unabsorbed data). Canonical: never produces `0xD1`/`0xD2`.
fn emit_zero_run(out: &mut Vec<u8>, mut z: usize) {
    while z > 2 {
        let take = z.min(MAX_ZERO_CODE_RUN);
        out.push(0xD0 + take as u8);
        z -= take;
    }
    match z {
        1 => out.push(0x01),
        2 => out.push(0xE0),
        _ => {}
    }
}

/// Emit the codes for a non-zero data run, chunking runs longer than
/// [`MAX_SHORT_RUN`] with `0xD0` continuation codes, and absorbing up to
/// two of the `zeroes_after` trailing zeros into the final chunk's code
/// when that's more compact than a separate zero-run code. Returns how
/// many of `zeroes_after` were absorbed (0, 1 or 2) so the caller can emit
/// the remainder as a standalone zero run.
fn emit_data_run(out: &mut Vec<u8>, bytes: &[u8], zeroes_after: usize) -> usize {
    let mut rem = bytes;
    while rem.len() > MAX_SHORT_RUN {
        out.push(0xD0);
        out.extend_from_slice(&rem[..CONTINUATION_RUN]);
        rem = &rem[CONTINUATION_RUN..];
    }

    let absorbed = if zeroes_after >= 2 && rem.len() <= MAX_TWO_ZERO_RUN {
        2
    } else if zeroes_after >= 1 {
        1
    } else {
        0
    };

    if absorbed == 2 {
        out.push(0xE0 + rem.len() as u8);
    } else {
        // Even with no real trailing zero (end of input on a non-zero
        // byte) a code must still be emitted; it simply carries an
        // implied zero nothing downstream will ever read past the
        // frame's declared length.
        out.push((rem.len() + 1) as u8);
    }
    out.extend_from_slice(rem);
    absorbed
}

/// Decode a fully-buffered stuffed stream into exactly `expected_len`
/// bytes, given the stream is well-formed. Used to state the stuffing
/// transform's round-trip property independently of frame/header
/// semantics; the stateful, per-byte [`StuffDecoder`] is what the session
/// layer actually drives against the wire.
pub fn decode_stream(encoded: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = if encoded.first() == Some(&0) { 1 } else { 0 };
    while out.len() < expected_len {
        let code = encoded[i];
        i += 1;
        if code == 0 {
            out.clear();
            continue;
        }
        let (data_bytes, zeroes) = interpret_code(code)?;
        out.extend_from_slice(&encoded[i..i + data_bytes]);
        i += data_bytes;
        for _ in 0..zeroes {
            if out.len() >= expected_len {
                break;
            }
            out.push(0);
        }
    }
    out.truncate(expected_len);
    Ok(out)
}

/// Per-byte stuffing decoder, coupled to the frame header's length field
/// (spec §3's "Stuffing decoder state").
#[derive(Debug)]
pub struct StuffDecoder {
    tot_bytes: usize,
    pro_bytes: usize,
    start_msg: bool,
    payload: bool,
    data_bytes: usize,
    zeroes: usize,
}

impl Default for StuffDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StuffDecoder {
    pub fn new() -> Self {
        Self { tot_bytes: 0, pro_bytes: 0, start_msg: false, payload: false, data_bytes: 0, zeroes: 0 }
    }

    /// Feed one received byte (or a timeout signal) into the decoder,
    /// writing decoded payload into `buf`. `buf`'s length is the frame
    /// capacity; a declared length that would overflow it is an error.
    pub fn decode_byte(&mut self, buf: &mut [u8], byte: Option<u8>) -> DecodeEvent {
        let Some(in_byte) = byte else {
            return DecodeEvent::Timeout;
        };

        if in_byte == 0 {
            self.tot_bytes = 5;
            self.pro_bytes = 0;
            self.start_msg = true;
            self.payload = false;
            self.data_bytes = 0;
            self.zeroes = 0;
            for b in buf.iter_mut().take(5) {
                *b = 0;
            }
            return DecodeEvent::None;
        }

        if !self.start_msg {
            return DecodeEvent::None;
        }

        if self.pro_bytes >= 2 && !self.payload {
            let len = ((buf[0] as usize) << 8) | (buf[1] as usize);
            self.tot_bytes = 5 + len;
            if self.tot_bytes > buf.len() {
                return DecodeEvent::Error(CodecError::FrameTooLarge { len: self.tot_bytes, cap: buf.len() });
            }
            for b in buf[5..self.tot_bytes].iter_mut() {
                *b = 0;
            }
            self.payload = true;
        }

        if self.data_bytes == 0 {
            let (data_bytes, zeroes) = match interpret_code(in_byte) {
                Ok(v) => v,
                Err(e) => return DecodeEvent::Error(e),
            };
            self.data_bytes = data_bytes;
            self.zeroes = zeroes;
            if self.data_bytes == 0 {
                self.pro_bytes += self.zeroes;
                self.zeroes = 0;
            }
        } else {
            if self.pro_bytes < self.tot_bytes {
                buf[self.pro_bytes] = in_byte;
            }
            self.pro_bytes += 1;
            self.data_bytes -= 1;
            if self.data_bytes == 0 {
                self.pro_bytes += self.zeroes;
                self.zeroes = 0;
            }
        }

        if self.pro_bytes >= self.tot_bytes {
            self.start_msg = false;
            DecodeEvent::FrameReady(self.tot_bytes)
        } else {
            DecodeEvent::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(data: &[u8]) -> Vec<u8> {
        StuffEncoder::encode_to_vec(data)
    }

    #[test]
    fn echo_codec_worked_example() {
        // spec.md §8 example 1, corrected against original_source/src/cobs.c:
        // a 3-byte run with no trailing zero needs exactly one code byte
        // (0x04 = 3 data bytes + one implied zero), not two.
        let encoded = encode(&[0x01, 0x02, 0x03]);
        assert_eq!(encoded, vec![0x00, 0x04, 0x01, 0x02, 0x03]);
        let decoded = decode_stream(&encoded, 3).unwrap();
        assert_eq!(decoded, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn zero_run_worked_example() {
        // spec.md §8 example 2.
        let encoded = encode(&[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(encoded, vec![0x00, 0xD4]);
        let decoded = decode_stream(&encoded, 4).unwrap();
        assert_eq!(decoded, vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn framed_checksum_worked_example() {
        // spec.md §8 example 3: type=0x11, cmd=0x05, payload={0x05, 0x00}.
        let raw = [0x00, 0x02, 0x11, 0x05, 0x13, 0x05, 0x00];
        let encoded = encode(&raw);
        assert_eq!(encoded, vec![0x00, 0x01, 0x06, 0x02, 0x11, 0x05, 0x13, 0x05]);
        let decoded = decode_stream(&encoded, raw.len()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn round_trip_arbitrary_bytes() {
        for len in [0usize, 1, 2, 5, 64, 206, 207, 208, 500, 1268] {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 + 1) as u8).collect();
            let encoded = encode(&data);
            let decoded = decode_stream(&encoded, len).unwrap();
            assert_eq!(decoded, data, "round trip failed for len {len}");
        }
    }

    #[test]
    fn all_zero_input_round_trips() {
        let data = vec![0u8; 40];
        let encoded = encode(&data);
        let decoded = decode_stream(&encoded, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn stateful_decoder_matches_frame_header() {
        let raw = [0x00u8, 0x02, 0x11, 0x05, 0x13, 0x05, 0x00];
        let encoded = encode(&raw);
        let mut decoder = StuffDecoder::new();
        let mut buf = [0u8; 1273];
        let mut result = None;
        for &b in &encoded {
            match decoder.decode_byte(&mut buf, Some(b)) {
                DecodeEvent::FrameReady(len) => {
                    result = Some(len);
                    break;
                }
                DecodeEvent::None => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        let len = result.expect("frame should complete");
        assert_eq!(len, raw.len());
        assert_eq!(&buf[..len], &raw[..]);
    }

    #[test]
    fn illegal_zero_run_codes_rejected() {
        assert_eq!(interpret_code(0xD1), Err(CodecError::IllegalCode(0xD1)));
        assert_eq!(interpret_code(0xD2), Err(CodecError::IllegalCode(0xD2)));
        assert_eq!(interpret_code(0xFF), Err(CodecError::IllegalCode(0xFF)));
    }

    #[test]
    fn decoder_resyncs_on_mid_frame_delimiter() {
        let raw = [0x00u8, 0x02, 0x11, 0x05, 0x13, 0x05, 0x00];
        let mut encoded = encode(&raw);
        // Corrupt the stream by inserting a spurious delimiter mid-frame,
        // followed by a second, clean copy of the encoded frame.
        encoded.insert(3, 0x00);
        encoded.extend(encode(&raw));

        let mut decoder = StuffDecoder::new();
        let mut buf = [0u8; 1273];
        let mut frames = Vec::new();
        for &b in &encoded {
            if let DecodeEvent::FrameReady(len) = decoder.decode_byte(&mut buf, Some(b)) {
                frames.push(buf[..len].to_vec());
            }
        }
        assert_eq!(frames.last().unwrap(), &raw.to_vec());
    }

    #[test]
    fn long_run_uses_continuation_code() {
        let data = vec![0xAAu8; 500];
        let encoded = encode(&data);
        assert_eq!(encoded[1], 0xD0);
        let decoded = decode_stream(&encoded, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip_any_frame(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..=1268)
        ) {
            // Build a self-consistent on-wire frame: 2-byte BE length + 3
            // arbitrary header bytes + the payload, matching spec §3's
            // "maximum frame size 5 + 1268 = 1273 bytes" bound.
            let len = payload.len() as u16;
            let mut frame = Vec::with_capacity(5 + payload.len());
            frame.extend_from_slice(&len.to_be_bytes());
            frame.push(0x11);
            frame.push(0x05);
            frame.push(0x00); // checksum slot, irrelevant to the codec
            frame.extend_from_slice(&payload);

            let encoded = StuffEncoder::encode_to_vec(&frame);
            let decoded = decode_stream(&encoded, frame.len()).unwrap();
            proptest::prop_assert_eq!(decoded, frame);
        }
    }
}
