//! Header codec adapter over the external QPACK implementation.
//!
//! Only the static table is used: the decoder is created with a zero-size
//! dynamic table and no blocked streams, and the encoder never emits
//! encoder-stream instructions, so field sections decode standalone.

use bytes::Bytes;
use ls_qpack_rs::decoder::{Decoder, DecoderOutput};
use ls_qpack_rs::encoder::Encoder;
use ls_qpack_rs::StreamId;

use crate::error::{Error, Result};
use crate::types::{Header, COOKIE_HEADER};

pub const PSEUDO_METHOD: &str = ":method";
pub const PSEUDO_SCHEME: &str = ":scheme";
pub const PSEUDO_AUTHORITY: &str = ":authority";
pub const PSEUDO_PATH: &str = ":path";
pub const PSEUDO_STATUS: &str = ":status";

// Wire order for request pseudo-headers. Map iteration order is not
// acceptable here; pseudo-headers must precede regular fields.
const REQUEST_PSEUDO_ORDER: [&str; 4] =
    [PSEUDO_METHOD, PSEUDO_SCHEME, PSEUDO_AUTHORITY, PSEUDO_PATH];

/// QPACK-encode a field section with the static table.
pub fn encode_field_section(fields: &[Header]) -> Result<Bytes> {
    let tuples: Vec<(String, String)> = fields
        .iter()
        .map(|h| (h.name.clone(), h.value.clone().unwrap_or_default()))
        .collect();

    let buffers = Encoder::new()
        .encode_all(
            StreamId::new(0),
            tuples
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
        .map_err(|e| Error::Qpack(format!("encode error: {:?}", e)))?;
    let (header_block, _encoder_stream) = buffers.into();

    Ok(Bytes::from(Vec::from(header_block)))
}

/// Decode a QPACK field section. A blocked result cannot happen with a
/// static-only decoder and is reported as an error.
pub fn decode_field_section(payload: &[u8]) -> Result<Vec<Header>> {
    let output = Decoder::new(0, 0)
        .decode(StreamId::new(0), payload.to_vec())
        .map_err(|e| Error::Qpack(format!("decode error: {:?}", e)))?;

    match output {
        DecoderOutput::Done(decoded) => Ok(decoded
            .headers()
            .iter()
            .map(|field| Header::new(field.name().to_string(), field.value().to_string()))
            .collect()),
        DecoderOutput::BlockedStream => Err(Error::Qpack(
            "field section blocked on dynamic table".to_string(),
        )),
    }
}

/// Assemble the on-wire field list for a request: pseudo-headers in fixed
/// order, then regular headers lowercased, with cookie values merged into a
/// single field separated by `"; "`.
pub fn request_fields(pseudo: &[Header], headers: &[Header]) -> Vec<Header> {
    let mut fields = Vec::with_capacity(pseudo.len() + headers.len());
    for name in REQUEST_PSEUDO_ORDER {
        if let Some(h) = pseudo.iter().find(|h| h.name == name) {
            fields.push(h.clone());
        }
    }
    // Unknown pseudo-headers the caller set explicitly keep their position
    // after the well-known ones.
    for h in pseudo {
        if !REQUEST_PSEUDO_ORDER.contains(&h.name.as_str()) {
            fields.push(h.clone());
        }
    }

    let mut cookies: Vec<&str> = Vec::new();
    for h in headers {
        if h.name.eq_ignore_ascii_case(COOKIE_HEADER) {
            cookies.push(h.value_str());
            continue;
        }
        let mut field = h.clone();
        field.normalize();
        fields.push(field);
    }
    if !cookies.is_empty() {
        fields.push(Header::new(COOKIE_HEADER, cookies.join("; ")));
    }
    fields
}

/// Field list for a response: `:status` first, then lowercased headers.
pub fn response_fields(status: u16, headers: &[Header]) -> Vec<Header> {
    let mut fields = Vec::with_capacity(headers.len() + 1);
    fields.push(Header::new(PSEUDO_STATUS, status.to_string()));
    for h in headers {
        if h.is_pseudo() {
            continue;
        }
        let mut field = h.clone();
        field.normalize();
        fields.push(field);
    }
    fields
}

/// Field list for trailers: lowercased, pseudo-headers dropped.
pub fn trailer_fields(trailers: &[Header]) -> Vec<Header> {
    trailers
        .iter()
        .filter(|h| !h.is_pseudo())
        .map(|h| {
            let mut field = h.clone();
            field.normalize();
            field
        })
        .collect()
}

/// Extract and validate `:status` from a decoded field section. Values
/// outside 100..=999 or non-numeric ones are malformed messages.
pub fn parse_status(fields: &[Header]) -> Result<u16> {
    let raw = fields
        .iter()
        .find(|h| h.name == PSEUDO_STATUS)
        .and_then(|h| h.value.as_deref())
        .ok_or_else(|| Error::Message("invalid or missing :status header".to_string()))?;
    match raw.parse::<u16>() {
        Ok(status) if (100..=999).contains(&status) => Ok(status),
        _ => Err(Error::Message(
            "invalid or missing :status header".to_string(),
        )),
    }
}
