//! Decoding of container output streams
//!
//! Without a TTY the runtime multiplexes stdout and stderr into one stream of
//! frames: an 8-byte header `[kind:1][reserved:3][length:4 big-endian]`
//! followed by `length` payload bytes. With a TTY the stream is raw.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Largest payload accepted in one frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Stream a multiplexed frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    Other(u8),
}

impl From<u8> for StreamKind {
    fn from(value: u8) -> Self {
        match value {
            0 => StreamKind::Stdin,
            1 => StreamKind::Stdout,
            2 => StreamKind::Stderr,
            other => StreamKind::Other(other),
        }
    }
}

/// One demultiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),

    #[error("stream ended inside a frame with {0} bytes pending")]
    Truncated(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decoder for the 8-byte-header multiplexed format. Empty frames are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplexCodec;

impl Decoder for MultiplexCodec {
    type Item = StreamFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(FrameError::TooLarge(len));
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            let kind = StreamKind::from(src[0]);
            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();

            if payload.is_empty() {
                continue;
            }
            return Ok(Some(StreamFrame { kind, payload }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated(src.len())),
        }
    }
}

/// Console output decoder: raw passthrough for TTY containers, frame
/// payloads otherwise
#[derive(Debug, Clone, Copy)]
pub enum ConsoleDecoder {
    Raw,
    Multiplexed(MultiplexCodec),
}

impl ConsoleDecoder {
    pub fn for_tty(tty: bool) -> Self {
        if tty {
            ConsoleDecoder::Raw
        } else {
            ConsoleDecoder::Multiplexed(MultiplexCodec)
        }
    }
}

impl Decoder for ConsoleDecoder {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            ConsoleDecoder::Raw => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(src.split().freeze()))
                }
            }
            ConsoleDecoder::Multiplexed(codec) => Ok(codec.decode(src)?.map(|f| f.payload)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            ConsoleDecoder::Raw => self.decode(src),
            ConsoleDecoder::Multiplexed(codec) => Ok(codec.decode_eof(src)?.map(|f| f.payload)),
        }
    }
}
