use url::Url;

use crate::error::{Error, Result};

/// A request target. Wraps a parsed URL and exposes the pieces the protocol
/// layers need: scheme, authority, and the path-with-query used for `:path`.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: Url,
}

impl Target {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(target: &str) -> Result<Self> {
        let url = Url::parse(target)
            .map_err(|e| Error::InvalidTarget(format!("{} ({})", target, e)))?;
        if url.host_str().is_none() {
            return Err(Error::InvalidTarget(format!(
                "target '{}' is missing a host",
                target
            )));
        }
        Ok(Self::new(url))
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    /// `host:port` as written in the URL; the port is omitted when it was.
    pub fn authority(&self) -> Option<String> {
        self.host().map(|host| match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// `host:port` with the scheme default filled in, used to compare
    /// request targets against a client's configured authority.
    pub fn authority_addr(&self) -> Option<String> {
        let host = self.host()?;
        let port = self.port().unwrap_or(443);
        Some(format!("{}:{}", host, port))
    }

    /// Path plus query, never empty (falls back to "/").
    pub fn path_query(&self) -> String {
        let mut value = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            value.push('?');
            value.push_str(query);
        }
        if value.is_empty() {
            value.push('/');
        }
        value
    }

    pub fn as_str(&self) -> &str {
        self.url.as_ref()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url.as_str())
    }
}
