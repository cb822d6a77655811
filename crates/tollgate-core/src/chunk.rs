//! Binary chunk framing and blob chunking
//!
//! Each chunk travels as one frame: an 8-byte header (request id + chunk
//! index, both u32 big-endian) followed by up to CHUNK_SIZE bytes of
//! payload. No other metadata is attached to chunk payloads.

use crate::{error::Result, types::ContentHash, Error, CHUNK_HEADER_LEN, CHUNK_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Encode the 8-byte chunk frame header
pub fn encode_header(request_id: u32, chunk_index: u32) -> [u8; CHUNK_HEADER_LEN] {
    let mut header = [0u8; CHUNK_HEADER_LEN];
    header[..4].copy_from_slice(&request_id.to_be_bytes());
    header[4..].copy_from_slice(&chunk_index.to_be_bytes());
    header
}

/// Decode the 8-byte chunk frame header
pub fn decode_header(buf: &[u8]) -> Result<(u32, u32)> {
    if buf.len() < CHUNK_HEADER_LEN {
        return Err(Error::InvalidData(format!(
            "chunk header too short: {} bytes",
            buf.len()
        )));
    }
    let request_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let chunk_index = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((request_id, chunk_index))
}

/// Encode a full chunk frame: header + payload
pub fn encode_frame(request_id: u32, chunk_index: u32, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
    frame.put_slice(&encode_header(request_id, chunk_index));
    frame.put_slice(payload);
    frame.freeze()
}

/// Decode a chunk frame into (request id, chunk index, payload)
pub fn decode_frame(frame: &[u8]) -> Result<(u32, u32, &[u8])> {
    let (request_id, chunk_index) = decode_header(frame)?;
    Ok((request_id, chunk_index, &frame[CHUNK_HEADER_LEN..]))
}

/// Number of chunks needed for a blob of the given size
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Size of the chunk at `index` for a blob of `size` bytes
pub fn chunk_len(size: u64, index: u32) -> usize {
    let offset = index as u64 * CHUNK_SIZE as u64;
    size.saturating_sub(offset).min(CHUNK_SIZE as u64) as usize
}

/// Split a blob into CHUNK_SIZE slices (final slice may be shorter)
pub fn split_blob(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(CHUNK_SIZE)
}

/// Compute the content address of a blob
pub fn content_hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}

/// Verify a blob against its expected content address
pub fn verify_content(data: &[u8], expected: &ContentHash) -> bool {
    content_hash(data) == *expected
}
