use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::body::Body;
use crate::connection::{Connection, QuicVersion};
use crate::error::{Error, ErrorCode, Result};
use crate::qpack;
use crate::settings::Settings;
use crate::stream::RequestStream;
use crate::types::{header_value, Header};
use crate::webtransport::WebTransportSession;

// Responses buffered up to this size get an automatic Content-Length;
// anything larger streams with headers flushed early.
const RESPONSE_BUFFER_LIMIT: usize = 16 * 1024;

/// Alt-Svc advertisement for the given UDP port and QUIC versions, e.g.
/// `h3=":443"; ma=2592000,h3-29=":443"; ma=2592000`.
pub fn alt_svc_header(port: u16, versions: &[QuicVersion]) -> String {
    versions
        .iter()
        .map(|v| format!("{}=\":{}\"; ma=2592000", v.alpn_str(), port))
        .collect::<Vec<_>>()
        .join(",")
}

/// An incoming request as seen by a server handler.
pub struct Request {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Vec<Header>,
    /// Declared request body length, -1 when unknown.
    pub content_length: i64,
    /// Trailer names announced via the `Trailer` header.
    pub trailer_names: Vec<String>,
    pub body: Body,
    cancel: CancellationToken,
    stream: RequestStream,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Cancelled when the exchange is torn down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The request stream's id; doubles as the WebTransport session id.
    pub fn stream_id(&self) -> u64 {
        self.stream.id()
    }

    /// Take over the stream as a WebTransport session.
    pub fn web_transport(&self) -> Result<WebTransportSession> {
        self.stream.web_transport()
    }
}

/// Writes one HTTP/3 response. The status and headers are buffered until the
/// first flush so small bodies can be sent with an exact Content-Length.
pub struct ResponseWriter {
    stream: RequestStream,
    status: u16,
    headers: Vec<Header>,
    trailers: Vec<Header>,
    buffer: BytesMut,
    headers_sent: bool,
    closed: bool,
}

impl ResponseWriter {
    fn new(stream: RequestStream) -> Self {
        Self {
            stream,
            status: 200,
            headers: Vec::new(),
            trailers: Vec::new(),
            buffer: BytesMut::new(),
            headers_sent: false,
            closed: false,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        if self.headers_sent {
            warn!("set_status after headers were sent");
            return;
        }
        self.status = status;
    }

    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers_sent {
            warn!("header added after headers were sent");
            return;
        }
        self.headers.push(Header::new(name, value));
    }

    /// Record a trailer field, sent in a final HEADERS frame on close.
    /// Only names declared in a `Trailer` response header are emitted.
    pub fn trailer(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.trailers.push(Header::new(name, value));
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Write body bytes. Buffered until the first flush; once the buffer
    /// outgrows the small-body limit, headers go out and the response
    /// streams as DATA frames.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Internal("write after close".to_string()));
        }
        if !self.headers_sent {
            self.buffer.extend_from_slice(chunk);
            if self.buffer.len() > RESPONSE_BUFFER_LIMIT {
                self.flush().await?;
            }
            return Ok(());
        }
        self.stream.write_data(chunk).await
    }

    /// Emit the HEADERS frame now (without an automatic Content-Length) and
    /// any buffered body bytes.
    pub async fn flush(&mut self) -> Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        self.send_headers().await?;
        if !self.buffer.is_empty() {
            let buffered = self.buffer.split();
            self.stream.write_data(&buffered).await?;
        }
        Ok(())
    }

    async fn send_headers(&mut self) -> Result<()> {
        let fields = qpack::response_fields(self.status, &self.headers);
        self.stream.write_headers(&fields).await?;
        self.headers_sent = true;
        Ok(())
    }

    /// Finish the response: emit deferred headers (with an automatic
    /// Content-Length for the buffered body), declared trailers, and close
    /// the send side cleanly.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.headers_sent {
            if !crate::types::has_header(&self.headers, "content-length") {
                self.headers
                    .push(Header::new("content-length", self.buffer.len().to_string()));
            }
            self.send_headers().await?;
            if !self.buffer.is_empty() {
                let buffered = self.buffer.split();
                self.stream.write_data(&buffered).await?;
            }
        }

        let declared: Vec<String> = header_value(&self.headers, "trailer")
            .map(|v| {
                v.split(',')
                    .map(|name| name.trim().to_ascii_lowercase())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if !self.trailers.is_empty() {
            let fields: Vec<Header> = qpack::trailer_fields(&self.trailers)
                .into_iter()
                .filter(|h| declared.contains(&h.name))
                .collect();
            if fields.len() != self.trailers.len() {
                warn!("dropping trailers not declared in the Trailer header");
            }
            if !fields.is_empty() {
                self.stream.write_headers(&fields).await?;
            }
        }

        self.stream.close()?;
        self.closed = true;
        Ok(())
    }

    // Error paths for handler failure.

    async fn send_error_response(&mut self) {
        self.status = 500;
        self.headers.clear();
        self.trailers.clear();
        self.buffer.clear();
        if let Err(e) = self.close().await {
            debug!("error sending 500 response: {}", e);
        }
    }

    fn abort(&mut self, code: ErrorCode) {
        self.stream.cancel_write(code);
        self.closed = true;
    }
}

/// Application entry point, called once per request.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request, response: &mut ResponseWriter) -> Result<()>;
}

/// HTTP/3 server role: drives accepted QUIC connections, dispatching each
/// request stream to the handler on its own task.
pub struct Server {
    handler: Arc<dyn Handler>,
    settings: Option<Settings>,
}

impl Server {
    pub fn new(handler: impl Handler) -> Self {
        Self {
            handler: Arc::new(handler),
            settings: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Serve one established QUIC connection until it closes.
    pub async fn serve_connection(&self, quic: quinn::Connection) -> Result<()> {
        let conn = Connection::accept(quic, self.settings.clone()).await?;
        loop {
            let stream = match conn.accept_request_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("connection ended: {}", e);
                    return Ok(());
                }
            };
            let handler = self.handler.clone();
            let conn = conn.clone();
            tokio::spawn(async move { handle_request(conn, stream, handler).await });
        }
    }
}

async fn handle_request(conn: Connection, stream: RequestStream, handler: Arc<dyn Handler>) {
    let fields = match stream.read_headers().await {
        Ok(fields) => fields,
        Err(e) => {
            match &e {
                // Too-large HEADERS: reset the stream, never invoke the
                // handler.
                Error::FrameLength(_) => {
                    stream.cancel_write(ErrorCode::FrameError);
                    stream.cancel_read(ErrorCode::FrameError);
                }
                Error::FrameType(err) => {
                    conn.close_with_error(ErrorCode::FrameUnexpected, &err.to_string());
                }
                _ => {
                    debug!("failed to read request headers: {}", e);
                    stream.cancel_write(ErrorCode::GeneralProtocolError);
                    stream.cancel_read(ErrorCode::GeneralProtocolError);
                }
            }
            return;
        }
    };

    let request = match build_request(&stream, fields) {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed request: {}", e);
            stream.cancel_write(ErrorCode::MessageError);
            stream.cancel_read(ErrorCode::MessageError);
            return;
        }
    };

    let mut response = ResponseWriter::new(stream.clone());
    let outcome = AssertUnwindSafe(handler.handle(request, &mut response))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = response.close().await {
                debug!("error finishing response: {}", e);
            }
        }
        Ok(Err(e)) => {
            error!("handler error: {}", e);
            fail_response(&mut response).await;
        }
        Err(_) => {
            error!("handler panicked");
            fail_response(&mut response).await;
        }
    }

    // Signal the peer to stop sending body, unless the application took the
    // raw stream over (WebTransport). Benign if the stream already ended.
    if !stream.raw_taken() {
        stream.cancel_read(ErrorCode::NoError);
    }
}

async fn fail_response(response: &mut ResponseWriter) {
    if response.headers_sent() {
        response.abort(ErrorCode::InternalError);
    } else {
        response.send_error_response().await;
    }
}

fn build_request(stream: &RequestStream, fields: Vec<Header>) -> Result<Request> {
    let pseudo = |name: &str| {
        fields
            .iter()
            .find(|h| h.name == name)
            .and_then(|h| h.value.clone())
    };

    let method = pseudo(":method")
        .ok_or_else(|| Error::Message("request is missing :method".to_string()))?;
    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let path = match pseudo(":path") {
        Some(path) => path,
        None if is_connect => String::new(),
        None => return Err(Error::Message("request is missing :path".to_string())),
    };
    let scheme = pseudo(":scheme").unwrap_or_else(|| "https".to_string());
    let authority = pseudo(":authority").unwrap_or_default();

    let headers: Vec<Header> = fields.into_iter().filter(|h| !h.is_pseudo()).collect();

    let mut content_length: i64 = -1;
    let count = headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
        .count();
    if count == 1 {
        if let Some(parsed) =
            header_value(&headers, "content-length").and_then(|v| v.parse::<i64>().ok())
        {
            content_length = parsed;
        }
    }

    let trailer_names: Vec<String> = header_value(&headers, "trailer")
        .map(|v| {
            v.split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Request {
        method,
        scheme,
        authority,
        path,
        headers,
        content_length,
        trailer_names,
        body: Body::new(stream.clone(), None),
        cancel: stream.cancel_token(),
        stream: stream.clone(),
    })
}
