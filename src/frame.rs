use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::TransportError;

/// Prologue bytes preceding the first frame of every connection.
pub const NOISE_WA_HEADER: [u8; 4] = [0x57, 0x41, 0x06, 0x02];

/// Largest payload expressible by the 24-bit length prefix.
pub const MAX_FRAME_PAYLOAD: usize = 0xFF_FF_FF;

/// Produces length-prefixed frames, emitting the intro header exactly once.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    intro: Vec<u8>,
    sent_intro: bool,
}

impl FrameEncoder {
    /// Creates an encoder; `routing_info` selects the extended intro prefix.
    pub fn new(routing_info: Option<&[u8]>) -> Self {
        Self {
            intro: build_intro_header(routing_info),
            sent_intro: false,
        }
    }

    /// Frames a payload with the 3-byte big-endian length prefix.
    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }

        let intro_len = if self.sent_intro { 0 } else { self.intro.len() };
        let len = payload.len();
        let mut out = Vec::with_capacity(intro_len + 3 + len);
        if !self.sent_intro {
            out.extend_from_slice(&self.intro);
            self.sent_intro = true;
        }

        out.push(((len >> 16) & 0xFF) as u8);
        out.push(((len >> 8) & 0xFF) as u8);
        out.push((len & 0xFF) as u8);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// Reassembles frames from arbitrarily chunked socket reads.
///
/// Completed frames queue internally so none is lost when a chunk carries
/// several; the receive task drains them in wire order.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    ready: VecDeque<Bytes>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a chunk and queues every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.buffer.extend_from_slice(chunk);
        }

        loop {
            if self.buffer.len() < 3 {
                break;
            }

            let declared = ((self.buffer[0] as usize) << 16)
                | ((self.buffer[1] as usize) << 8)
                | self.buffer[2] as usize;
            let full_len = 3 + declared;
            if self.buffer.len() < full_len {
                break;
            }

            self.ready
                .push_back(Bytes::copy_from_slice(&self.buffer[3..full_len]));
            self.buffer.drain(..full_len);
        }
    }

    /// Takes the oldest completed frame, if any.
    pub fn pop_frame(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }
}

fn build_intro_header(routing_info: Option<&[u8]>) -> Vec<u8> {
    if let Some(routing_info) = routing_info {
        let mut out = Vec::with_capacity(7 + routing_info.len() + NOISE_WA_HEADER.len());
        out.extend_from_slice(b"ED");
        out.push(0);
        out.push(1);
        out.push(((routing_info.len() >> 16) & 0xFF) as u8);
        out.push(((routing_info.len() >> 8) & 0xFF) as u8);
        out.push((routing_info.len() & 0xFF) as u8);
        out.extend_from_slice(routing_info);
        out.extend_from_slice(&NOISE_WA_HEADER);
        return out;
    }

    NOISE_WA_HEADER.to_vec()
}

#[cfg(test)]
mod tests {
    use super::{FrameDecoder, FrameEncoder, MAX_FRAME_PAYLOAD};

    #[test]
    fn intro_header_without_routing_uses_wa_prefix() {
        let mut encoder = FrameEncoder::new(None);
        let first = encoder.encode(b"abc").expect("encode");
        assert_eq!(&first[..4], &[0x57, 0x41, 0x06, 0x02]);
        assert_eq!(&first[4..7], &[0, 0, 3]);

        let second = encoder.encode(b"de").expect("encode");
        assert_eq!(&second[..3], &[0, 0, 2]);
    }

    #[test]
    fn intro_header_with_routing_uses_ed_prefix() {
        let mut encoder = FrameEncoder::new(Some(&[9, 8, 7, 6]));
        let first = encoder.encode(b"x").expect("encode");
        assert_eq!(&first[..2], b"ED");
        assert_eq!(&first[2..4], &[0, 1]);
        assert_eq!(&first[4..7], &[0, 0, 4]);
        assert_eq!(&first[7..11], &[9, 8, 7, 6]);
        assert_eq!(&first[11..15], &[0x57, 0x41, 0x06, 0x02]);
    }

    #[test]
    fn payload_at_the_24_bit_boundary_is_accepted() {
        let mut encoder = FrameEncoder::new(None);
        let payload = vec![0_u8; MAX_FRAME_PAYLOAD];
        let framed = encoder.encode(&payload).expect("max payload encodes");
        assert_eq!(&framed[4..7], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut encoder = FrameEncoder::new(None);
        let payload = vec![0_u8; MAX_FRAME_PAYLOAD + 1];
        assert!(encoder.encode(&payload).is_err());
    }

    #[test]
    fn decoder_splits_concatenated_frames() {
        let mut encoder = FrameEncoder::new(None);
        let mut wire = encoder.encode(b"first").expect("encode");
        wire.extend_from_slice(&encoder.encode(b"second").expect("encode"));

        // Skip the 4-byte intro before feeding the receive path.
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire[4..]);
        assert_eq!(decoder.pop_frame().expect("first").as_ref(), b"first");
        assert_eq!(decoder.pop_frame().expect("second").as_ref(), b"second");
        assert!(decoder.pop_frame().is_none());
    }

    #[test]
    fn decoder_waits_for_partial_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 0, 4, 1, 2]);
        assert!(decoder.pop_frame().is_none());
        decoder.push(&[3, 4]);
        assert_eq!(decoder.pop_frame().expect("frame").as_ref(), &[1, 2, 3, 4]);
    }
}
