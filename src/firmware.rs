//! Firmware-update block protocol constants and payload shaping, grounded
//! on `examples/fwupdate.c`.
//!
//! The block loop itself lives on [`crate::session::Session`] since it
//! needs the transport and frame reader; this module only owns the
//! protocol's fixed parameters and the pure byte-shaping around them.

use crate::error::Error;

/// Bytes of firmware data carried per block.
pub const BLOCK_SIZE: usize = 64;
/// Trailing DFU suffix bytes that are never part of the flashed image.
pub const DFU_SUFFIX_SIZE: usize = 16;
/// Per-block retry budget before giving up.
pub const BLOCK_RETRIES: u8 = 5;
/// How long to wait for a block's response before retrying.
pub const BLOCK_TIMEOUT_SECS: u64 = 10;
/// Delay between block retries.
pub const RETRY_DELAY_SECS: u64 = 5;
/// How long to keep polling `software-version` after resetting into the
/// new firmware before giving up.
pub const REBOOT_POLL_SECS: u64 = 15;

/// Split `data` (already excluding the DFU suffix) into fixed-size blocks,
/// the last one possibly shorter.
pub fn blocks(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(BLOCK_SIZE)
}

/// Strip the trailing DFU suffix from a firmware file's raw bytes.
///
/// Rejects files too short to even contain the suffix — the reference
/// `fwupdate.c` computes `fsz = ftell(...) - DFU_SUFFIX_SIZE` unchecked,
/// which underflows silently on a short file; this is one of the edge
/// cases this implementation closes rather than carries forward.
pub fn flashable_image(file: &[u8]) -> Result<&[u8], Error> {
    if file.len() < DFU_SUFFIX_SIZE + 1 {
        return Err(Error::FirmwareFileTooShort);
    }
    Ok(&file[..file.len() - DFU_SUFFIX_SIZE])
}

/// Build a `firmware-update` command payload: big-endian block id
/// followed by the block bytes.
pub fn block_payload(id: u16, block: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + block.len());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(block);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flashable_image_strips_suffix() {
        let file = [0u8; 80];
        let image = flashable_image(&file).unwrap();
        assert_eq!(image.len(), 64);
    }

    #[test]
    fn flashable_image_rejects_short_file() {
        let file = [0u8; 16];
        assert!(matches!(flashable_image(&file), Err(Error::FirmwareFileTooShort)));
    }

    #[test]
    fn blocks_chunk_at_block_size() {
        let data = vec![0xAAu8; 150];
        let chunks: Vec<_> = blocks(&data).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 64);
        assert_eq!(chunks[1].len(), 64);
        assert_eq!(chunks[2].len(), 22);
    }

    #[test]
    fn block_payload_encodes_id_big_endian() {
        let payload = block_payload(0x0102, &[0xFF; 4]);
        assert_eq!(payload, vec![0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
