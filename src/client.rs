use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use quinn::crypto::rustls::QuicClientConfig;
use tokio::sync::{oneshot, watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::body::Body;
use crate::connection::{Connection, QuicVersion};
use crate::error::{Error, ErrorCode, Result};
use crate::qpack;
use crate::settings::Settings;
use crate::stream::RequestStream;
use crate::types::response::HTTP_VERSION_3;
use crate::types::{
    has_header, header_value, remove_header, Header, Request, Response, Target,
};

/// Sentinel method allowing a GET to be sent in 0-RTT data, before the QUIC
/// handshake completes. Rewritten to GET on the wire. Note that 0-RTT data
/// has no replay protection.
pub const METHOD_GET_0RTT: &str = "GET_0RTT";

const BODY_WRITE_CHUNK: usize = 16 * 1024;

#[derive(Debug, Default)]
pub struct ClientOptions {
    /// Local HTTP/3 settings; `None` picks defaults at connection setup.
    pub settings: Option<Settings>,
    /// TLS configuration. `None` builds one from the webpki root store.
    /// The ALPN list is replaced with the token for `version` either way.
    pub tls: Option<rustls::ClientConfig>,
    pub version: Option<QuicVersion>,
    /// Disable transparent gzip decompression of response bodies.
    pub disable_compression: bool,
}

#[derive(Clone)]
struct Dialed {
    // The endpoint must outlive its connections.
    _endpoint: quinn::Endpoint,
    conn: Connection,
    handshake: watch::Receiver<bool>,
}

struct ClientInner {
    target: Target,
    authority: String,
    server_name: String,
    settings: Option<Settings>,
    tls: Option<rustls::ClientConfig>,
    version: QuicVersion,
    disable_compression: bool,
    // Dial happens once; the outcome, including failure, is recorded so
    // every subsequent round trip surfaces the same result.
    dial: OnceCell<std::result::Result<Dialed, String>>,
}

/// An HTTP/3 client bound to a single authority. Dials lazily on the first
/// request.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(target: &str, options: ClientOptions) -> Result<Self> {
        let target = Target::parse(target)?;
        if target.scheme() != "https" {
            return Err(Error::InvalidTarget(format!(
                "HTTP/3 requires an https target, got {}",
                target.scheme()
            )));
        }
        let server_name = target
            .host()
            .ok_or_else(|| Error::InvalidTarget("target is missing a host".to_string()))?
            .to_string();
        let authority = target
            .authority_addr()
            .ok_or_else(|| Error::InvalidTarget("target is missing a host".to_string()))?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                target,
                authority,
                server_name,
                settings: options.settings,
                tls: options.tls,
                version: options.version.unwrap_or(QuicVersion::V1),
                disable_compression: options.disable_compression,
                dial: OnceCell::new(),
            }),
        })
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// Close the underlying connection with NO_ERROR. A client that never
    /// dialed has nothing to close.
    pub fn close(&self) {
        if let Some(Ok(dialed)) = self.inner.dial.get() {
            dialed.conn.close_with_error(ErrorCode::NoError, "");
        }
    }

    pub async fn round_trip(&self, request: Request) -> Result<Response> {
        self.round_trip_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Perform one request/response exchange. `cancel` is the request
    /// context: firing it resets both stream directions with
    /// REQUEST_CANCELED.
    pub async fn round_trip_with_cancel(
        &self,
        mut request: Request,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let request_authority = request
            .target
            .authority_addr()
            .ok_or_else(|| Error::InvalidTarget("request target has no authority".to_string()))?;
        if request_authority != self.inner.authority {
            // A client misuse bug, surfaced locally and never sent.
            return Err(Error::InvalidTarget(format!(
                "client BUG: round_trip called for the wrong client (expected {}, got {})",
                self.inner.authority, request_authority
            )));
        }

        let dialed = self.dialed().await?;

        if request.method == METHOD_GET_0RTT {
            // Send immediately in 0-RTT data.
            request.method = "GET".to_string();
        } else {
            let mut handshake = dialed.handshake.clone();
            tokio::select! {
                done = handshake.wait_for(|done| *done) => {
                    done.map_err(|_| Error::Connection("endpoint shut down".to_string()))?;
                }
                _ = cancel.cancelled() => return Err(Error::RequestCancelled),
            }
        }

        let stream = dialed.conn.open_request_stream(cancel.clone()).await?;

        // Cancellation observer: one task racing the request context against
        // request completion. It keeps running after round_trip returns,
        // until the application is done with the response body.
        let (done_tx, done_rx) = oneshot::channel::<()>();
        {
            let stream = stream.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stream.cancel_write(ErrorCode::RequestCancelled);
                        stream.cancel_read(ErrorCode::RequestCancelled);
                    }
                    _ = done_rx => {}
                }
            });
        }

        match self.do_request(&stream, request, done_tx).await {
            Ok(response) => Ok(response),
            Err(e) => {
                match &e {
                    // Responses must start with a HEADERS frame.
                    Error::FrameType(err) => dialed
                        .conn
                        .close_with_error(ErrorCode::FrameUnexpected, &err.to_string()),
                    Error::FrameLength(_) => stream.cancel_write(ErrorCode::FrameError),
                    Error::RequestCancelled | Error::Message(_) => {}
                    _ => stream.cancel_write(ErrorCode::GeneralProtocolError),
                }
                Err(e)
            }
        }
    }

    async fn do_request(
        &self,
        stream: &RequestStream,
        request: Request,
        done_tx: oneshot::Sender<()>,
    ) -> Result<Response> {
        let request_gzip = !self.inner.disable_compression
            && !request.method.eq_ignore_ascii_case("HEAD")
            && header_value(&request.headers, "accept-encoding").is_none()
            && header_value(&request.headers, "range").is_none();

        let pseudo = request.pseudo_headers();
        let mut headers = request.effective_headers();
        if request_gzip {
            headers.push(Header::new("accept-encoding", "gzip"));
        }
        stream
            .write_headers(&qpack::request_fields(&pseudo, &headers))
            .await?;

        let is_connect = request.method.eq_ignore_ascii_case("CONNECT");
        let body = request.body.clone().unwrap_or_else(Bytes::new);
        let trailers = qpack::trailer_fields(&request.trailers);
        if body.is_empty() && trailers.is_empty() {
            // CONNECT streams stay open for the tunnel.
            if !is_connect {
                stream.close()?;
            }
        } else {
            let stream = stream.clone();
            tokio::spawn(async move {
                if let Err(e) = write_request_body(&stream, body, trailers, is_connect).await {
                    debug!("error writing request body: {}", e);
                    stream.cancel_write(ErrorCode::RequestCancelled);
                }
            });
        }

        // Read HEADERS frames until a non-interim status arrives. Interim
        // responses are consumed; their regular fields accumulate.
        let mut response_headers: Vec<Header> = Vec::new();
        let status = loop {
            let fields = stream.read_headers().await?;
            let status = match qpack::parse_status(&fields) {
                Ok(status) => status,
                Err(e) => {
                    stream.cancel_write(ErrorCode::MessageError);
                    return Err(e);
                }
            };
            response_headers.extend(fields.into_iter().filter(|h| !h.is_pseudo()));
            if !(100..200).contains(&status) {
                break status;
            }
        };

        // Content-Length rules per RFC 7230 Section 3.3.2: absent for
        // 204, successful CONNECT, or in the presence of Transfer-Encoding;
        // otherwise a single Content-Length header is authoritative.
        let mut content_length: i64 = -1;
        let connect_ok = is_connect && (200..300).contains(&status);
        if !has_header(&response_headers, "transfer-encoding") && status != 204 && !connect_ok {
            let count = response_headers
                .iter()
                .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
                .count();
            if count == 1 {
                if let Some(parsed) = header_value(&response_headers, "content-length")
                    .and_then(|v| v.parse::<i64>().ok())
                {
                    content_length = parsed;
                }
            }
        }

        let mut body = Body::new(stream.clone(), Some(done_tx));
        let gzipped = header_value(&response_headers, "content-encoding")
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        if request_gzip && gzipped {
            remove_header(&mut response_headers, "content-encoding");
            remove_header(&mut response_headers, "content-length");
            content_length = -1;
            body.enable_gzip();
        }

        Ok(Response {
            status,
            protocol: HTTP_VERSION_3.to_string(),
            headers: response_headers,
            content_length,
            body,
        })
    }

    async fn dialed(&self) -> Result<Dialed> {
        let outcome = self
            .inner
            .dial
            .get_or_init(|| async { self.connect().await.map_err(|e| e.to_string()) })
            .await;
        match outcome {
            Ok(dialed) => Ok(dialed.clone()),
            Err(msg) => Err(Error::Connection(msg.clone())),
        }
    }

    async fn connect(&self) -> Result<Dialed> {
        // rustls >= 0.23 needs a process-level crypto provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let port = self.inner.target.port().unwrap_or(443);
        let addr = tokio::net::lookup_host((self.inner.server_name.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::Connection(format!("no addresses for {}", self.inner.server_name))
            })?;

        let mut tls = match &self.inner.tls {
            Some(tls) => tls.clone(),
            None => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        // Replace whatever ALPN list was configured with the single token
        // matching the QUIC version in use.
        tls.alpn_protocols = vec![self.inner.version.alpn().to_vec()];

        let quic_tls = QuicClientConfig::try_from(tls)
            .map_err(|e| Error::Connection(format!("tls config: {}", e)))?;
        let mut config = quinn::ClientConfig::new(Arc::new(quic_tls));
        config.version(self.inner.version.wire());

        let mut transport = quinn::TransportConfig::default();
        let webtransport = self
            .inner
            .settings
            .as_ref()
            .map(|s| s.webtransport_enabled())
            .unwrap_or(false);
        if !webtransport {
            // The server has no business opening bidirectional streams
            // towards us unless WebTransport is in play.
            transport.max_concurrent_bidi_streams(0u32.into());
        }
        if let Some(settings) = &self.inner.settings {
            if !settings.datagrams_enabled() {
                transport.datagram_receive_buffer_size(None);
            }
        }
        config.transport_config(Arc::new(transport));

        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let endpoint = quinn::Endpoint::client(bind)?;

        let connecting = endpoint
            .connect_with(config, addr, &self.inner.server_name)
            .map_err(|e| Error::Connection(e.to_string()))?;

        // 0-RTT when the session ticket allows it; the watch flips once the
        // handshake completes either way.
        let (handshake_tx, handshake_rx) = watch::channel(false);
        let quic = match connecting.into_0rtt() {
            Ok((quic, accepted)) => {
                tokio::spawn(async move {
                    let _ = accepted.await;
                    let _ = handshake_tx.send(true);
                });
                quic
            }
            Err(connecting) => {
                let quic = connecting.await.map_err(Error::from)?;
                let _ = handshake_tx.send(true);
                quic
            }
        };

        let conn = Connection::open(quic, self.inner.settings.clone()).await?;

        Ok(Dialed {
            _endpoint: endpoint,
            conn,
            handshake: handshake_rx,
        })
    }
}

async fn write_request_body(
    stream: &RequestStream,
    body: Bytes,
    trailers: Vec<Header>,
    is_connect: bool,
) -> Result<()> {
    for chunk in body.chunks(BODY_WRITE_CHUNK) {
        stream.write_data(chunk).await?;
    }
    if !trailers.is_empty() {
        stream.write_headers(&trailers).await?;
    }
    if !is_connect {
        stream.close()?;
    }
    Ok(())
}
