use bytes::Bytes;
use serde_json::Value;

use super::{header_value, Header};
use crate::body::Body;
use crate::error::Result;

pub const HTTP_VERSION_3: &str = "HTTP/3.0";

/// An HTTP/3 response. Headers are available immediately; the body streams
/// and trailers become visible once the body has been read to its end.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub protocol: String,
    pub headers: Vec<Header>,
    /// Declared body length, or -1 when unknown (no Content-Length header,
    /// or the body is being transparently decompressed).
    pub content_length: i64,
    pub body: Body,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Trailers received after the body. `None` until the body hits EOF.
    pub fn trailers(&self) -> Option<&[Header]> {
        self.body.trailers()
    }

    /// Read the remaining body to completion.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        self.body.bytes().await
    }

    pub async fn text(&mut self) -> Result<String> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).to_string())
    }

    pub async fn json(&mut self) -> Result<Value> {
        let body = self.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| crate::error::Error::Message(format!("invalid json body: {}", e)))
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {}", self.protocol, self.status)?;
        for header in &self.headers {
            writeln!(f, "{}", header)?;
        }
        Ok(())
    }
}
