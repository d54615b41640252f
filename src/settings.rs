use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::frame::{decode_varint, encode_varint, write_frame_header, FrameReader, FrameType};

// HTTP/3 SETTINGS identifiers (RFC 9114 Section 7.2.4.1).
pub const SETTING_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTING_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
pub const SETTING_QPACK_BLOCKED_STREAMS: u64 = 0x07;
// https://tools.ietf.org/html/draft-ietf-masque-h3-datagram-00
pub const SETTING_H3_DATAGRAM: u64 = 0x276;
// https://www.ietf.org/archive/id/draft-ietf-webtrans-http3-01.html
pub const SETTING_ENABLE_WEBTRANSPORT: u64 = 0x2b60_3742;

/// Default max field section size when the setting is absent or zero.
/// 16 MB, same as the HTTP/2 default MAX_HEADER_LIST_SIZE in net/http2.
pub const DEFAULT_MAX_FIELD_SECTION_SIZE: u64 = 16 << 20;

// An attacker-controlled SETTINGS length is bounded before buffering.
const MAX_SETTINGS_PAYLOAD: u64 = 8192;

/// SETTINGS as an identifier-to-value map. Unknown identifiers are stored
/// verbatim and survive a round-trip, but are never acted upon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<u64, u64>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: u64, value: u64) {
        self.values.insert(identifier, value);
    }

    pub fn get(&self, identifier: u64) -> Option<u64> {
        self.values.get(&identifier).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn enable_datagrams(&mut self) {
        self.insert(SETTING_H3_DATAGRAM, 1);
    }

    pub fn datagrams_enabled(&self) -> bool {
        self.get(SETTING_H3_DATAGRAM).unwrap_or(0) != 0
    }

    /// WebTransport requires HTTP/3 datagram support, so enabling it also
    /// advertises H3_DATAGRAM.
    pub fn enable_webtransport(&mut self) {
        self.insert(SETTING_ENABLE_WEBTRANSPORT, 1);
        self.enable_datagrams();
    }

    pub fn webtransport_enabled(&self) -> bool {
        self.get(SETTING_ENABLE_WEBTRANSPORT).unwrap_or(0) != 0
    }

    pub fn set_max_field_section_size(&mut self, max: u64) {
        self.insert(SETTING_MAX_FIELD_SECTION_SIZE, max);
    }

    /// The effective max field section size: the advertised value, or the
    /// 16 MB default when absent or zero.
    pub fn max_field_section_size(&self) -> u64 {
        match self.get(SETTING_MAX_FIELD_SECTION_SIZE) {
            Some(max) if max > 0 => max,
            _ => DEFAULT_MAX_FIELD_SECTION_SIZE,
        }
    }

    /// Encode the payload as a sequence of (identifier, value) varint pairs.
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        for (&id, &value) in &self.values {
            encode_varint(buf, id);
            encode_varint(buf, value);
        }
    }

    /// Append a complete SETTINGS frame.
    pub fn write_frame(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        write_frame_header(buf, FrameType::SETTINGS, payload.len() as u64);
        buf.extend_from_slice(&payload);
    }

    /// Decode a SETTINGS payload. Trailing or truncated bytes are an error;
    /// the frame boundary is authoritative.
    pub fn decode(mut payload: &[u8]) -> Result<Settings> {
        let mut settings = Settings::new();
        while !payload.is_empty() {
            let (id, n) = decode_varint(payload)
                .ok_or_else(|| Error::Settings("truncated setting identifier".to_string()))?;
            payload = &payload[n..];
            let (value, n) = decode_varint(payload)
                .ok_or_else(|| Error::Settings("truncated setting value".to_string()))?;
            payload = &payload[n..];
            settings.insert(id, value);
        }
        Ok(settings)
    }

    /// Read the first frame off a control stream. Anything other than a
    /// well-formed SETTINGS frame is a MISSING_SETTINGS violation.
    pub async fn read_control_frame<R>(fr: &mut FrameReader<R>) -> Result<Settings>
    where
        R: AsyncRead + Unpin,
    {
        let header = fr
            .next()
            .await
            .map_err(|e| Error::MissingSettings(e.to_string()))?;
        let (frame_type, _) = match header {
            Some(header) => header,
            None => {
                return Err(Error::MissingSettings(
                    "control stream closed before SETTINGS".to_string(),
                ))
            }
        };
        if frame_type != FrameType::SETTINGS {
            return Err(Error::MissingSettings(format!(
                "first frame on control stream is {}, expected SETTINGS",
                frame_type
            )));
        }
        let payload = fr.read_payload(MAX_SETTINGS_PAYLOAD).await.map_err(|e| {
            match e {
                Error::FrameLength(err) => Error::Settings(err.to_string()),
                other => other,
            }
        })?;
        Settings::decode(&payload)
    }
}
