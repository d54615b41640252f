use bytes::Bytes;
use serde_json::Value;

use super::{has_header, Header, Target};
use crate::error::Result;

pub const USER_AGENT: &str = concat!("h3mux/", env!("CARGO_PKG_VERSION"));

pub const CONTENT_LENGTH_HEADER: &str = "content-length";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const COOKIE_HEADER: &str = "cookie";
pub const TRAILER_HEADER: &str = "trailer";
pub const USER_AGENT_HEADER: &str = "user-agent";
pub const APPLICATION_JSON: &str = "application/json";

/// An outgoing HTTP/3 request.
#[derive(Debug, Clone)]
pub struct Request {
    pub target: Target,
    pub method: String,
    pub headers: Vec<Header>,
    pub trailers: Vec<Header>,
    pub cookies: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(target: &str, method: impl Into<String>) -> Result<Self> {
        Ok(Self {
            target: Target::parse(target)?,
            method: method.into(),
            headers: Vec::new(),
            trailers: Vec::new(),
            cookies: Vec::new(),
            body: None,
        })
    }

    pub fn get(target: &str) -> Result<Self> {
        Self::new(target, "GET")
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn trailer(mut self, trailer: Header) -> Self {
        self.trailers.push(trailer);
        self
    }

    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(mut self, value: &Value) -> Result<Self> {
        let serialized = serde_json::to_vec(value)
            .map_err(|e| crate::error::Error::Internal(format!("json body: {}", e)))?;
        self.body = Some(Bytes::from(serialized));
        if !has_header(&self.headers, CONTENT_TYPE_HEADER) {
            self.headers
                .push(Header::new(CONTENT_TYPE_HEADER, APPLICATION_JSON));
        }
        Ok(self)
    }

    pub fn cookies<I, K, V>(mut self, cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.cookies = cookies
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        self
    }

    /// The `:path` value: path plus query.
    pub fn path(&self) -> String {
        self.target.path_query()
    }

    /// Pseudo-headers for this request. CONNECT carries only `:method` and
    /// `:authority` (RFC 9114 Section 4.4); everything else gets the full
    /// method/scheme/authority/path set. Caller-provided pseudo-headers win.
    pub fn pseudo_headers(&self) -> Vec<Header> {
        let mut pseudo: Vec<Header> = self
            .headers
            .iter()
            .filter(|h| h.is_pseudo())
            .cloned()
            .collect();

        let mut push_missing = |name: &str, value: String| {
            if !pseudo.iter().any(|h| h.name == name) {
                pseudo.push(Header::new(name, value));
            }
        };

        push_missing(":method", self.method.clone());
        if self.method.eq_ignore_ascii_case("CONNECT") {
            if let Some(authority) = self.target.authority() {
                push_missing(":authority", authority);
            }
            pseudo.retain(|h| h.name != ":scheme" && h.name != ":path");
        } else {
            push_missing(":scheme", self.target.scheme().to_string());
            if let Some(authority) = self.target.authority() {
                push_missing(":authority", authority);
            }
            push_missing(":path", self.path());
        }
        pseudo
    }

    /// Regular headers as they should be sent: the caller's non-pseudo
    /// headers plus a cookie header assembled from the cookie jar and a
    /// default user-agent.
    pub fn effective_headers(&self) -> Vec<Header> {
        let mut headers: Vec<Header> = self
            .headers
            .iter()
            .filter(|h| !h.is_pseudo())
            .cloned()
            .collect();

        if let Some(cookie_value) = self.cookie_header_value() {
            if !has_header(&headers, COOKIE_HEADER) {
                headers.push(Header::new(COOKIE_HEADER, cookie_value));
            }
        }

        if !has_header(&headers, USER_AGENT_HEADER) {
            headers.push(Header::new(USER_AGENT_HEADER, USER_AGENT));
        }

        headers
    }

    fn cookie_header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let value = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        Some(value)
    }
}
