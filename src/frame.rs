use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, FrameLengthError, FrameTypeError, Result};

/// HTTP/3 frame type (RFC 9114 Section 7.2). Unknown values are preserved so
/// they can be reported in errors and skipped when greased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameType(pub u64);

impl FrameType {
    pub const DATA: FrameType = FrameType(0x00);
    pub const HEADERS: FrameType = FrameType(0x01);
    pub const CANCEL_PUSH: FrameType = FrameType(0x03);
    pub const SETTINGS: FrameType = FrameType(0x04);
    pub const PUSH_PROMISE: FrameType = FrameType(0x05);
    pub const GOAWAY: FrameType = FrameType(0x07);
    pub const MAX_PUSH_ID: FrameType = FrameType(0x0d);
    // https://www.ietf.org/archive/id/draft-ietf-webtrans-http3-01.html
    pub const WEBTRANSPORT_STREAM: FrameType = FrameType(0x41);

    /// Reserved grease values of the form 0x1f * N + 0x21
    /// (RFC 9114 Section 7.2.8). These are skipped silently.
    pub fn is_grease(self) -> bool {
        self.0 >= 0x21 && (self.0 - 0x21) % 0x1f == 0
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FrameType::DATA => write!(f, "DATA"),
            FrameType::HEADERS => write!(f, "HEADERS"),
            FrameType::CANCEL_PUSH => write!(f, "CANCEL_PUSH"),
            FrameType::SETTINGS => write!(f, "SETTINGS"),
            FrameType::PUSH_PROMISE => write!(f, "PUSH_PROMISE"),
            FrameType::GOAWAY => write!(f, "GOAWAY"),
            FrameType::MAX_PUSH_ID => write!(f, "MAX_PUSH_ID"),
            FrameType::WEBTRANSPORT_STREAM => write!(f, "WEBTRANSPORT_STREAM"),
            FrameType(other) => write!(f, "frame type 0x{:x}", other),
        }
    }
}

// Variable-length integer encoding (RFC 9000 Section 16): a two-bit length
// prefix in the first byte selects 1, 2, 4 or 8 bytes.

pub fn encode_varint(buf: &mut BytesMut, value: u64) {
    if value < 0x40 {
        buf.put_u8(value as u8);
    } else if value < 0x4000 {
        buf.put_u16((value as u16) | 0x4000);
    } else if value < 0x4000_0000 {
        buf.put_u32((value as u32) | 0x8000_0000);
    } else {
        buf.put_u64(value | 0xC000_0000_0000_0000);
    }
}

pub fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first >> 6 {
        0 => Some((first as u64, 1)),
        1 => {
            if data.len() < 2 {
                return None;
            }
            let value = (((first & 0x3F) as u16) << 8) | (data[1] as u16);
            Some((value as u64, 2))
        }
        2 => {
            if data.len() < 4 {
                return None;
            }
            let value = (((first & 0x3F) as u32) << 24)
                | ((data[1] as u32) << 16)
                | ((data[2] as u32) << 8)
                | (data[3] as u32);
            Some((value as u64, 4))
        }
        _ => {
            if data.len() < 8 {
                return None;
            }
            let value = (((first & 0x3F) as u64) << 56)
                | ((data[1] as u64) << 48)
                | ((data[2] as u64) << 40)
                | ((data[3] as u64) << 32)
                | ((data[4] as u64) << 24)
                | ((data[5] as u64) << 16)
                | ((data[6] as u64) << 8)
                | (data[7] as u64);
            Some((value, 8))
        }
    }
}

pub fn varint_len(value: u64) -> usize {
    if value < 0x40 {
        1
    } else if value < 0x4000 {
        2
    } else if value < 0x4000_0000 {
        4
    } else {
        8
    }
}

fn unexpected_eof(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("stream ended while reading {}", what),
    ))
}

/// Read one varint from an async stream. Returns `None` on a clean end of
/// stream before the first byte; a stream that ends mid-varint is an error.
pub async fn read_varint<R>(reader: &mut R) -> Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }
    let extra = match first[0] >> 6 {
        0 => 0usize,
        1 => 1,
        2 => 3,
        _ => 7,
    };
    let mut buf = [0u8; 8];
    buf[0] = first[0];
    if extra > 0 {
        reader
            .read_exact(&mut buf[1..=extra])
            .await
            .map_err(|_| unexpected_eof("varint"))?;
    }
    let (value, _) = decode_varint(&buf[..=extra]).ok_or_else(|| unexpected_eof("varint"))?;
    Ok(Some(value))
}

/// Append a single contiguous `varint(type) varint(length) payload` frame.
pub fn write_frame(buf: &mut BytesMut, frame_type: FrameType, payload: &[u8]) {
    encode_varint(buf, frame_type.0);
    encode_varint(buf, payload.len() as u64);
    buf.put_slice(payload);
}

/// Append just a frame header; the payload follows separately.
pub fn write_frame_header(buf: &mut BytesMut, frame_type: FrameType, payload_len: u64) {
    encode_varint(buf, frame_type.0);
    encode_varint(buf, payload_len);
}

struct CurrentFrame {
    frame_type: FrameType,
    len: u64,
    consumed: u64,
}

/// Incremental HTTP/3 frame reader over any async byte stream.
///
/// `next` positions the reader on the header of the following frame; payload
/// bytes are then pulled with `read`, `read_payload` or `skip_payload`. A
/// frame whose header has been read but whose payload is untouched stays
/// "pending", which is how a request stream leaves a trailing HEADERS frame
/// in place for `read_headers` after the DATA sequence ends.
pub struct FrameReader<R> {
    reader: R,
    current: Option<CurrentFrame>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            current: None,
        }
    }

    /// Resume a stream whose frame header was already consumed by the
    /// connection engine (the server hands request streams over positioned
    /// on the initial HEADERS frame).
    pub fn resume(reader: R, frame_type: FrameType, len: u64) -> Self {
        Self {
            reader,
            current: Some(CurrentFrame {
                frame_type,
                len,
                consumed: 0,
            }),
        }
    }

    /// The frame the reader is currently positioned on, with its unread
    /// payload length. `None` before the first `next` or at end of stream.
    pub fn current(&self) -> Option<(FrameType, u64)> {
        self.current
            .as_ref()
            .map(|c| (c.frame_type, c.len - c.consumed))
    }

    /// Whether the current frame's payload is untouched.
    pub fn at_frame_start(&self) -> bool {
        matches!(&self.current, Some(c) if c.consumed == 0)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next frame header, discarding any unread payload of the
    /// current frame first. Returns `None` on a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<(FrameType, u64)>> {
        self.skip_payload().await?;
        let frame_type = match read_varint(&mut self.reader).await? {
            Some(value) => FrameType(value),
            None => {
                self.current = None;
                return Ok(None);
            }
        };
        let len = read_varint(&mut self.reader)
            .await?
            .ok_or_else(|| unexpected_eof("frame length"))?;
        self.current = Some(CurrentFrame {
            frame_type,
            len,
            consumed: 0,
        });
        Ok(Some((frame_type, len)))
    }

    /// Read the whole payload of the current frame, enforcing `max`.
    /// Violations carry the offending type and lengths so callers can map
    /// them onto the right reset code.
    pub async fn read_payload(&mut self, max: u64) -> Result<Bytes> {
        let (frame_type, len) = match &self.current {
            Some(c) if c.consumed == 0 => (c.frame_type, c.len),
            Some(_) => {
                return Err(Error::Internal(
                    "read_payload on a partially consumed frame".to_string(),
                ))
            }
            None => return Err(Error::Internal("read_payload with no frame".to_string())),
        };
        if len > max {
            return Err(Error::FrameLength(FrameLengthError {
                frame_type,
                len,
                max,
            }));
        }
        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|_| unexpected_eof("frame payload"))?;
        if let Some(c) = &mut self.current {
            c.consumed = c.len;
        }
        Ok(Bytes::from(payload))
    }

    /// Discard whatever remains of the current frame's payload.
    pub async fn skip_payload(&mut self) -> Result<()> {
        let remaining = match &self.current {
            Some(c) => c.len - c.consumed,
            None => return Ok(()),
        };
        let mut left = remaining;
        let mut scratch = [0u8; 4096];
        while left > 0 {
            let want = left.min(scratch.len() as u64) as usize;
            self.reader
                .read_exact(&mut scratch[..want])
                .await
                .map_err(|_| unexpected_eof("frame payload"))?;
            left -= want as u64;
        }
        if let Some(c) = &mut self.current {
            c.consumed = c.len;
        }
        Ok(())
    }

    /// Read payload bytes of the current frame into `buf`. Returns 0 once
    /// the payload is exhausted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = match &self.current {
            Some(c) => c.len - c.consumed,
            None => return Ok(0),
        };
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(unexpected_eof("frame payload"));
        }
        if let Some(c) = &mut self.current {
            c.consumed += n as u64;
        }
        Ok(n)
    }

    /// Require the current (or next) frame to be `want`, skipping grease
    /// frames. Leaves the reader positioned on the matching frame header.
    pub async fn expect(&mut self, want: FrameType) -> Result<u64> {
        loop {
            let (frame_type, len) = match self.current() {
                Some(current) if self.at_frame_start() => current,
                _ => match self.next().await? {
                    Some(header) => header,
                    None => return Err(unexpected_eof(&format!("{} frame", want))),
                },
            };
            if frame_type.is_grease() {
                self.skip_payload().await?;
                self.current = None;
                continue;
            }
            if frame_type != want {
                return Err(Error::FrameType(FrameTypeError {
                    want,
                    got: frame_type,
                }));
            }
            return Ok(len);
        }
    }
}
