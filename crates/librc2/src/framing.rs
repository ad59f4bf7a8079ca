//! Framing for the compute engine TCP stream.
//!
//! Every message is an 8 byte header followed by the payload:
//!
//! ```text
//! offset 0  u32 magic (0x21), big-endian
//! offset 4  u32 payload length, big-endian
//! offset 8  payload (UTF-8 JSON)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const FRAME_MAGIC: u32 = 0x21;
pub const HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },
}

/// One decoded unit from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeFrame {
    Payload(Bytes),
    /// A header with the wrong magic. Its declared payload is skipped.
    InvalidHeader { magic: u32, len: u32 },
}

#[derive(Debug, Clone)]
pub struct ComputeFrameCodec {
    max_frame_len: usize,
    /// Payload bytes still to discard after an invalid header.
    skip_remaining: usize,
}

impl Default for ComputeFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl ComputeFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            skip_remaining: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for ComputeFrameCodec {
    type Item = ComputeFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.skip_remaining > 0 {
            let n = self.skip_remaining.min(src.len());
            src.advance(n);
            self.skip_remaining -= n;
            if self.skip_remaining > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let payload_len = len as usize;
        if payload_len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: payload_len,
                max: self.max_frame_len,
            });
        }

        if magic != FRAME_MAGIC {
            src.advance(HEADER_LEN);
            self.skip_remaining = payload_len;
            return Ok(Some(ComputeFrame::InvalidHeader { magic, len }));
        }

        let frame_len = HEADER_LEN + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(ComputeFrame::Payload(src.split_to(payload_len).freeze())))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.skip_remaining == 0 => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for ComputeFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(FRAME_MAGIC);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(codec: &mut ComputeFrameCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn header_layout() {
        let mut codec = ComputeFrameCodec::default();
        let buf = encoded(&mut codec, b"{}");
        assert_eq!(&buf[..], &[0, 0, 0, 0x21, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn frame_integrity_across_sizes() {
        let max = 128 * 1024;
        let mut codec = ComputeFrameCodec::new(max);
        for len in [0usize, 1, 65536, max] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = encoded(&mut codec, &payload);
            assert_eq!(buf.len(), HEADER_LEN + len);
            match codec.decode(&mut buf).unwrap() {
                Some(ComputeFrame::Payload(bytes)) => assert_eq!(&bytes[..], &payload[..]),
                other => panic!("len {len}: unexpected {other:?}"),
            }
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = ComputeFrameCodec::default();
        let full = encoded(&mut codec, b"hello world");
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let frame = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(frame.is_none());
            } else {
                assert_eq!(
                    frame,
                    Some(ComputeFrame::Payload(Bytes::from_static(b"hello world")))
                );
            }
        }
    }

    #[test]
    fn wrong_magic_skips_declared_frame() {
        let mut codec = ComputeFrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(0xdead);
        buf.put_u32(3);
        buf.extend_from_slice(b"bad");
        buf.extend_from_slice(&encoded(&mut codec, b"{\"msg\":\"help\"}"));

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ComputeFrame::InvalidHeader {
                magic: 0xdead,
                len: 3
            })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ComputeFrame::Payload(Bytes::from_static(b"{\"msg\":\"help\"}")))
        );
    }

    #[test]
    fn skip_spans_reads() {
        let mut codec = ComputeFrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(7);
        buf.put_u32(10);
        buf.extend_from_slice(b"12345");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(ComputeFrame::InvalidHeader { .. })
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"67890");
        buf.extend_from_slice(&encoded(&mut codec, b"ok"));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ComputeFrame::Payload(Bytes::from_static(b"ok")))
        );
    }

    #[test]
    fn oversize_length_is_an_error() {
        let mut codec = ComputeFrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_MAGIC);
        buf.put_u32(17);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { len: 17, max: 16 })
        ));

        let mut out = BytesMut::new();
        assert!(codec.encode(Bytes::from(vec![0u8; 17]), &mut out).is_err());
    }

    #[test]
    fn truncated_frame_at_eof() {
        let mut codec = ComputeFrameCodec::default();
        let full = encoded(&mut codec, b"hello");
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::Truncated { buffered: 11 })
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }
}
