//! Slot framing: a 4-byte big-endian length and an 8-byte zero-extended CRC32 ahead of the
//! payload.
//!
//! ```text
//! 0        4                12                       slot length
//! +--------+----------------+-------------------------+
//! | length |  CRC32 (u64)   | payload (zero padded)   |
//! +--------+----------------+-------------------------+
//! ```
//!
//! The checksum covers the whole payload region, padding included, so bytes XORed in by a
//! second writer anywhere in the slot are caught.

use crate::constants::{LENGTH_BYTES, METADATA_BYTES};

/// What a decoded slot header says about its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMetadata {
    /// Payload length from the header.
    pub length: usize,
    /// For a non-empty slot, whether the checksum matches. For an empty slot, whether every
    /// byte of the slot is zero.
    pub valid: bool,
}

impl SlotMetadata {
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

fn checksum(buffer: &[u8]) -> u64 {
    u64::from(crc32fast::hash(&buffer[METADATA_BYTES..]))
}

/// Stamps the header of `buffer` for a payload of `length` bytes already copied in place.
///
/// # Panics
///
/// Panics if `buffer` is shorter than the slot header.
pub fn encode(buffer: &mut [u8], length: usize) {
    let crc = checksum(buffer);
    buffer[..LENGTH_BYTES].copy_from_slice(&(length as u32).to_be_bytes());
    buffer[LENGTH_BYTES..METADATA_BYTES].copy_from_slice(&crc.to_be_bytes());
}

/// Reads the header of `buffer` and validates it against the payload.
pub fn decode(buffer: &[u8]) -> SlotMetadata {
    if buffer.len() < METADATA_BYTES {
        return SlotMetadata { length: 0, valid: false };
    }

    let mut length_bytes = [0u8; LENGTH_BYTES];
    length_bytes.copy_from_slice(&buffer[..LENGTH_BYTES]);
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length == 0 {
        return SlotMetadata { length, valid: is_zeroed(buffer) };
    }

    let mut stored = [0u8; 8];
    stored.copy_from_slice(&buffer[LENGTH_BYTES..METADATA_BYTES]);
    let valid =
        length <= payload_capacity(buffer.len()) && u64::from_be_bytes(stored) == checksum(buffer);

    SlotMetadata { length, valid }
}

/// The payload bytes named by the header, clamped to the buffer.
pub fn payload(buffer: &[u8]) -> &[u8] {
    let meta = decode(buffer);
    let end = METADATA_BYTES + meta.length.min(payload_capacity(buffer.len()));
    &buffer[METADATA_BYTES.min(buffer.len())..end.min(buffer.len())]
}

/// Copies the payload out as an opaque byte string.
pub fn to_bytes(buffer: &[u8]) -> Vec<u8> {
    payload(buffer).to_vec()
}

pub fn payload_capacity(slot_length: usize) -> usize {
    slot_length.saturating_sub(METADATA_BYTES)
}

pub fn is_zeroed(buffer: &[u8]) -> bool {
    buffer.iter().all(|&b| b == 0)
}
