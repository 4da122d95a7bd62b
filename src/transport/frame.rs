//! Stream framing (length + crc32c) and the multipart body codec.
//!
//! One wire frame carries one whole multipart message: the body is a
//! `u32` part count followed by `u32 len + bytes` per part.

use std::io::{Read, Write};

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

use crate::wire::Frames;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    FrameCrcMismatch { expected: u32, got: u32 },
    #[error("multipart body malformed: {reason}")]
    BodyMalformed { reason: &'static str },
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame body. `Ok(None)` means a clean EOF on a frame
    /// boundary.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                )
                .into());
            }
            read_body += n;
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(FrameError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        Ok(Some(body))
    }

    /// Read and decode one whole multipart message.
    pub fn read_message(&mut self) -> Result<Option<Frames>, FrameError> {
        match self.read_next()? {
            None => Ok(None),
            Some(body) => decode_body(&body).map(Some),
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }

    /// Encode and write one whole multipart message.
    pub fn write_message(&mut self, frames: &Frames) -> Result<usize, FrameError> {
        self.write_frame(&encode_body(frames))
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    let crc = crc32c(payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn encode_body(frames: &Frames) -> Vec<u8> {
    let total: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for part in frames.iter() {
        buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
        buf.extend_from_slice(part);
    }
    buf
}

pub fn decode_body(body: &[u8]) -> Result<Frames, FrameError> {
    let mut pos = 0usize;
    let count = read_u32(body, &mut pos)? as usize;
    let mut frames = Frames::new();
    for _ in 0..count {
        let len = read_u32(body, &mut pos)? as usize;
        if body.len() - pos < len {
            return Err(FrameError::BodyMalformed {
                reason: "part body truncated",
            });
        }
        frames.push(Bytes::copy_from_slice(&body[pos..pos + len]));
        pos += len;
    }
    if pos != body.len() {
        return Err(FrameError::BodyMalformed {
            reason: "trailing bytes after last part",
        });
    }
    Ok(frames)
}

fn read_u32(body: &[u8], pos: &mut usize) -> Result<u32, FrameError> {
    if body.len() - *pos < 4 {
        return Err(FrameError::BodyMalformed {
            reason: "truncated length header",
        });
    }
    let value = u32::from_le_bytes([body[*pos], body[*pos + 1], body[*pos + 2], body[*pos + 3]]);
    *pos += 4;
    Ok(value)
}
