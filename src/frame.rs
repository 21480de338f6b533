//! # Binary Frame Codec
//!
//! Encodes and incrementally parses the `CHNK` binary envelope that
//! carries request/response body bytes over the tunnel's single
//! WebSocket:
//!
//! ```text
//! offset  size  field
//! 0       4     magic = ASCII "CHNK"
//! 4       4     id_len   (u32, big-endian)
//! 8       4     body_len (u32, big-endian)
//! 12      id_len   id_bytes (UTF-8 request id)
//! 12+id_len body_len payload
//! ```
//!
//! [`FrameParser`] holds one growing buffer per session and peels
//! complete envelopes off the front as they arrive, with an explicit
//! ceiling on how large that buffer is allowed to grow before it gives
//! up on the stream.

use bytes::{Bytes, BytesMut};

pub const MAGIC: &[u8; 4] = b"CHNK";
const HEADER_LEN: usize = 12;

/// Serializes one envelope as a single binary transport message.
pub fn encode_chunk(id: &str, payload: &[u8]) -> Vec<u8> {
    let id_bytes = id.as_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + id_bytes.len() + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(id_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(payload);
    out
}

/// Outcome of one `FrameParser::push` call.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Zero or more complete envelopes were peeled off; more bytes
    /// may be needed before the next one completes.
    Frames(Vec<(String, Bytes)>),
    /// The magic didn't match — the byte stream is desynchronized and
    /// unrecoverable for this session.
    Desync,
    /// The buffer grew past its configured ceiling without a frame
    /// completing.
    BufferOverflow,
}

/// Incremental, message-boundary-agnostic parser for one session's
/// binary stream. Binary frames may arrive split across multiple
/// transport messages and multiple envelopes may arrive concatenated in
/// one message; callers simply `push` every binary message they receive.
pub struct FrameParser {
    buf: BytesMut,
    max_buffer_bytes: usize,
}

impl FrameParser {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_buffer_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseOutcome {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            if &self.buf[0..4] != &MAGIC[..] {
                self.buf.clear();
                return ParseOutcome::Desync;
            }
            let id_len = u32::from_be_bytes(self.buf[4..8].try_into().unwrap()) as usize;
            let body_len = u32::from_be_bytes(self.buf[8..12].try_into().unwrap()) as usize;
            let total_len = HEADER_LEN + id_len + body_len;

            if self.buf.len() < total_len {
                break;
            }

            let id_bytes = self.buf[HEADER_LEN..HEADER_LEN + id_len].to_vec();
            let id = match String::from_utf8(id_bytes) {
                Ok(id) => id,
                Err(_) => {
                    self.buf.clear();
                    return ParseOutcome::Desync;
                }
            };
            let payload = self.buf.split_to(total_len).split_off(HEADER_LEN + id_len);
            frames.push((id, payload.freeze()));
        }

        if self.buf.len() > self.max_buffer_bytes {
            self.buf.clear();
            return ParseOutcome::BufferOverflow;
        }

        ParseOutcome::Frames(frames)
    }
}
