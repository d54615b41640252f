/// A single header field. HTTP/3 field names travel lowercase on the wire;
/// the value is optional so valueless trailer declarations can be carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Option<String>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn new_valueless(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn normalize(&mut self) -> &mut Self {
        self.name.make_ascii_lowercase();
        self
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }

    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}: {}", self.name, value),
            None => write!(f, "{}", self.name),
        }
    }
}

/// First value for `name`, case-insensitive.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| h.value.as_deref())
}

pub fn has_header(headers: &[Header], name: &str) -> bool {
    headers.iter().any(|h| h.name.eq_ignore_ascii_case(name))
}

/// Remove every occurrence of `name`, case-insensitive.
pub fn remove_header(headers: &mut Vec<Header>, name: &str) {
    headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
}

/// Parse a `name: value` line; pseudo-headers keep their leading colon.
pub fn parse_header(line: &str) -> Option<Header> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (skip, body) = match line.strip_prefix(':') {
        Some(rest) => (1, rest),
        None => (0, line),
    };
    match body.split_once(':') {
        Some((name, value)) => Some(Header::new(&line[..skip + name.len()], value.trim_start())),
        None => Some(Header::new_valueless(line)),
    }
}
