//! End-to-end tests over real QUIC connections on localhost.
//!
//! Protocol-violation scenarios are driven by raw quinn endpoints speaking
//! just enough HTTP/3 to provoke the behavior under test.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use h3mux::frame::{encode_varint, write_frame, write_frame_header, FrameType};
use h3mux::qpack::encode_field_section;
use h3mux::settings::DEFAULT_MAX_FIELD_SECTION_SIZE;
use h3mux::{
    Client, ClientOptions, Error, Handler, Header, Request, ResponseWriter, Result, Server,
    Settings, StreamType,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn generate_cert() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (CertificateDer::from(cert.cert), key.into())
}

fn server_endpoint() -> (quinn::Endpoint, SocketAddr, CertificateDer<'static>) {
    install_provider();
    let (cert, key) = generate_cert();
    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();
    crypto.alpn_protocols = vec![b"h3".to_vec()];
    let config =
        quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto).unwrap()));
    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr, cert)
}

fn client_tls(cert: &CertificateDer<'static>) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn spawn_server(endpoint: quinn::Endpoint, server: Server) {
    let server = Arc::new(server);
    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                if let Ok(conn) = incoming.await {
                    let _ = server.serve_connection(conn).await;
                }
            });
        }
    });
}

fn test_client(addr: SocketAddr, cert: &CertificateDer<'static>) -> Client {
    test_client_with(addr, cert, ClientOptions::default())
}

fn test_client_with(
    addr: SocketAddr,
    cert: &CertificateDer<'static>,
    mut options: ClientOptions,
) -> Client {
    options.tls = Some(client_tls(cert));
    Client::new(&format!("https://127.0.0.1:{}/", addr.port()), options).unwrap()
}

fn request(addr: SocketAddr, method: &str, path: &str) -> Request {
    Request::new(
        &format!("https://127.0.0.1:{}{}", addr.port(), path),
        method,
    )
    .unwrap()
}

/// A raw quinn client for protocol-violation scenarios. The endpoint is
/// returned so it outlives the connection.
async fn raw_client(
    addr: SocketAddr,
    cert: &CertificateDer<'static>,
    configure: impl FnOnce(&mut quinn::TransportConfig),
) -> (quinn::Endpoint, quinn::Connection) {
    install_provider();
    let mut tls = client_tls(cert);
    tls.alpn_protocols = vec![b"h3".to_vec()];
    let mut config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls).unwrap()));
    let mut transport = quinn::TransportConfig::default();
    configure(&mut transport);
    config.transport_config(Arc::new(transport));
    let endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    let conn = endpoint
        .connect_with(config, addr, "127.0.0.1")
        .unwrap()
        .await
        .unwrap();
    (endpoint, conn)
}

/// Open a control stream carrying `settings` on a raw connection.
async fn raw_control_stream(conn: &quinn::Connection, settings: &Settings) -> quinn::SendStream {
    let mut ctl = conn.open_uni().await.unwrap();
    let mut buf = BytesMut::new();
    encode_varint(&mut buf, StreamType::CONTROL.0);
    settings.write_frame(&mut buf);
    ctl.write_all(&buf).await.unwrap();
    ctl
}

fn app_close_code(err: &quinn::ConnectionError) -> Option<(u64, String)> {
    match err {
        quinn::ConnectionError::ApplicationClosed(close) => Some((
            close.error_code.into_inner(),
            String::from_utf8_lossy(&close.reason).to_string(),
        )),
        _ => None,
    }
}

// ---- handlers ----

struct HelloHandler;

#[async_trait]
impl Handler for HelloHandler {
    async fn handle(
        &self,
        _request: h3mux::server::Request,
        response: &mut ResponseWriter,
    ) -> Result<()> {
        // Flush first so no Content-Length is synthesized.
        response.flush().await?;
        response.write(b"hello").await
    }
}

struct BufferedHandler;

#[async_trait]
impl Handler for BufferedHandler {
    async fn handle(
        &self,
        _request: h3mux::server::Request,
        response: &mut ResponseWriter,
    ) -> Result<()> {
        response.write(b"hello").await
    }
}

struct TrailerEchoHandler;

#[async_trait]
impl Handler for TrailerEchoHandler {
    async fn handle(
        &self,
        mut request: h3mux::server::Request,
        response: &mut ResponseWriter,
    ) -> Result<()> {
        if request.trailer_names != vec!["foo".to_string()] {
            return Err(Error::Internal("trailer not declared".to_string()));
        }
        let body = request.body.bytes().await?;
        if &body[..] != b"body" {
            return Err(Error::Internal("unexpected body".to_string()));
        }
        let trailers = request
            .body
            .trailers()
            .ok_or_else(|| Error::Internal("no trailers".to_string()))?;
        if trailers.len() != 1 || trailers[0] != Header::new("foo", "1") {
            return Err(Error::Internal("unexpected trailers".to_string()));
        }
        response.write(b"ok").await
    }
}

struct GzipHandler;

#[async_trait]
impl Handler for GzipHandler {
    async fn handle(
        &self,
        request: h3mux::server::Request,
        response: &mut ResponseWriter,
    ) -> Result<()> {
        if request.header("accept-encoding") != Some("gzip") {
            return Err(Error::Internal("gzip not requested".to_string()));
        }
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"hello gzip")?;
        let compressed = encoder.finish()?;
        response.header("content-encoding", "gzip");
        response.flush().await?;
        response.write(&compressed).await
    }
}

struct SlowHandler;

#[async_trait]
impl Handler for SlowHandler {
    async fn handle(
        &self,
        _request: h3mux::server::Request,
        response: &mut ResponseWriter,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        response.write(b"too late").await
    }
}

struct WebTransportEchoHandler;

#[async_trait]
impl Handler for WebTransportEchoHandler {
    async fn handle(
        &self,
        request: h3mux::server::Request,
        response: &mut ResponseWriter,
    ) -> Result<()> {
        let session = request.web_transport()?;
        response.flush().await?;
        let mut incoming = session.accept_uni_stream().await?;
        let data = incoming
            .read_to_end(1024)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let mut outgoing = session.open_uni_stream().await?;
        outgoing
            .write_all(&data)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let _ = outgoing.finish();
        session.send_datagram(b"dg-pong")?;
        // Hand the peer time to drain before the session (and its
        // demultiplexer channels) is dropped with this handler.
        let _ = session.read_datagram().await;
        Ok(())
    }
}

// ---- scenarios ----

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_with_small_streamed_body() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(HelloHandler));

        let client = test_client(addr, &cert);
        let mut response = client
            .round_trip(request(addr, "GET", "/f"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        // No Content-Length header was sent.
        assert_eq!(response.content_length, -1);
        assert_eq!(response.text().await.unwrap(), "hello");
        assert!(response.trailers().is_none());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_response_gets_automatic_content_length() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(BufferedHandler));

        let client = test_client(addr, &cert);
        let mut response = client.round_trip(request(addr, "GET", "/")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-length"), Some("5"));
        assert_eq!(response.content_length, 5);
        assert_eq!(response.text().await.unwrap(), "hello");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_with_trailers() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(TrailerEchoHandler));

        let client = test_client(addr, &cert);
        let req = request(addr, "POST", "/upload")
            .header(Header::new("trailer", "foo"))
            .body("body")
            .trailer(Header::new("foo", "1"));
        let mut response = client.round_trip(req).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_body_is_gunzipped_transparently() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(GzipHandler));

        let client = test_client(addr, &cert);
        let mut response = client.round_trip(request(addr, "GET", "/z")).await.unwrap();
        assert_eq!(response.status, 200);
        // The decompression layer strips its own evidence.
        assert_eq!(response.header("content-encoding"), None);
        assert_eq!(response.header("content-length"), None);
        assert_eq!(response.content_length, -1);
        assert_eq!(response.text().await.unwrap(), "hello gzip");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_status_is_a_message_error() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        tokio::spawn(async move {
            let conn = endpoint.accept().await.unwrap().await.unwrap();
            let _ctl = raw_control_stream(&conn, &Settings::new()).await;
            let (mut send, mut recv) = conn.accept_bi().await.unwrap();
            let _ = recv.read(&mut [0u8; 1024]).await;
            let block = encode_field_section(&[Header::new(":status", "")]).unwrap();
            let mut out = BytesMut::new();
            write_frame(&mut out, FrameType::HEADERS, &block);
            send.write_all(&out).await.unwrap();
            let _ = send.finish();
            tokio::time::sleep(TEST_TIMEOUT).await;
        });

        let client = test_client(addr, &cert);
        match client.round_trip(request(addr, "GET", "/")).await {
            Err(Error::Message(msg)) => {
                assert_eq!(msg, "invalid or missing :status header");
            }
            other => panic!("expected Message error, got {:?}", other.map(|r| r.status)),
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_response_headers_are_a_frame_length_error() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        tokio::spawn(async move {
            let conn = endpoint.accept().await.unwrap().await.unwrap();
            let _ctl = raw_control_stream(&conn, &Settings::new()).await;
            let (mut send, mut recv) = conn.accept_bi().await.unwrap();
            let _ = recv.read(&mut [0u8; 1024]).await;
            // HEADERS header claiming one byte more than the default max.
            let mut out = BytesMut::new();
            write_frame_header(
                &mut out,
                FrameType::HEADERS,
                DEFAULT_MAX_FIELD_SECTION_SIZE + 1,
            );
            send.write_all(&out).await.unwrap();
            tokio::time::sleep(TEST_TIMEOUT).await;
        });

        let client = test_client(addr, &cert);
        match client.round_trip(request(addr, "GET", "/")).await {
            Err(Error::FrameLength(err)) => {
                assert_eq!(err.frame_type, FrameType::HEADERS);
                assert_eq!(err.len, DEFAULT_MAX_FIELD_SECTION_SIZE + 1);
                assert_eq!(err.max, DEFAULT_MAX_FIELD_SECTION_SIZE);
            }
            other => panic!("expected FrameLength error, got {:?}", other.map(|r| r.status)),
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_settings_closes_the_connection() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(HelloHandler));

        let (_ep, conn) = raw_client(addr, &cert, |_| {}).await;
        let mut uni = conn.open_uni().await.unwrap();
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, StreamType::CONTROL.0);
        write_frame(&mut buf, FrameType::DATA, b"");
        uni.write_all(&buf).await.unwrap();

        let err = conn.closed().await;
        let (code, _reason) = app_close_code(&err).expect("application close");
        assert_eq!(code, 0x10a);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_control_stream_is_a_stream_creation_error() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(HelloHandler));

        let (_ep, conn) = raw_client(addr, &cert, |_| {}).await;
        let _first = raw_control_stream(&conn, &Settings::new()).await;
        let _second = raw_control_stream(&conn, &Settings::new()).await;

        let err = conn.closed().await;
        let (code, reason) = app_close_code(&err).expect("application close");
        assert_eq!(code, 0x103);
        assert!(
            reason.contains("more than one control stream"),
            "reason: {}",
            reason
        );
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagram_negotiation_mismatch_is_a_settings_error() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        let mut settings = Settings::new();
        settings.enable_datagrams();
        spawn_server(endpoint, Server::new(HelloHandler).with_settings(settings));

        // QUIC session without datagram support on the client side.
        let (_ep, conn) = raw_client(addr, &cert, |transport| {
            transport.datagram_receive_buffer_size(None);
        })
        .await;
        let mut peer_settings = Settings::new();
        peer_settings.enable_datagrams();
        let _ctl = raw_control_stream(&conn, &peer_settings).await;

        let err = conn.closed().await;
        let (code, reason) = app_close_code(&err).expect("application close");
        assert_eq!(code, 0x109);
        assert_eq!(reason, "missing QUIC Datagram support");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_the_request_context_aborts_the_exchange() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        spawn_server(endpoint, Server::new(SlowHandler));

        let client = test_client(addr, &cert);
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            });
        }
        match client
            .round_trip_with_cancel(request(addr, "GET", "/slow"), cancel)
            .await
        {
            Err(Error::RequestCancelled) => {}
            other => panic!("expected RequestCancelled, got {:?}", other.map(|r| r.status)),
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webtransport_streams_and_datagrams_demultiplex_by_session() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        let mut server_settings = Settings::new();
        server_settings.enable_webtransport();
        spawn_server(
            endpoint,
            Server::new(WebTransportEchoHandler).with_settings(server_settings),
        );

        let mut client_settings = Settings::new();
        client_settings.enable_webtransport();
        let client = test_client_with(
            addr,
            &cert,
            ClientOptions {
                settings: Some(client_settings),
                ..Default::default()
            },
        );

        let response = client
            .round_trip(request(addr, "CONNECT", "/wt"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let session = response.body.web_transport().unwrap();
        let mut uni = session.open_uni_stream().await.unwrap();
        uni.write_all(b"wt-ping").await.unwrap();
        let _ = uni.finish();

        let mut echoed = session.accept_uni_stream().await.unwrap();
        let data = echoed.read_to_end(1024).await.unwrap();
        assert_eq!(&data[..], b"wt-ping");

        let datagram = session.read_datagram().await.unwrap();
        assert_eq!(&datagram[..], b"dg-pong");

        // Unblock the handler's final read.
        session.send_datagram(b"bye").unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interim_responses_are_consumed_before_the_final_status() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, addr, cert) = server_endpoint();
        tokio::spawn(async move {
            let conn = endpoint.accept().await.unwrap().await.unwrap();
            let _ctl = raw_control_stream(&conn, &Settings::new()).await;
            let (mut send, mut recv) = conn.accept_bi().await.unwrap();
            let _ = recv.read(&mut [0u8; 1024]).await;

            let mut out = BytesMut::new();
            let early = encode_field_section(&[
                Header::new(":status", "103"),
                Header::new("link", "</style.css>; rel=preload"),
            ])
            .unwrap();
            write_frame(&mut out, FrameType::HEADERS, &early);
            let fin = encode_field_section(&[Header::new(":status", "200")]).unwrap();
            write_frame(&mut out, FrameType::HEADERS, &fin);
            write_frame(&mut out, FrameType::DATA, b"ok");
            send.write_all(&out).await.unwrap();
            let _ = send.finish();
            tokio::time::sleep(TEST_TIMEOUT).await;
        });

        let client = test_client(addr, &cert);
        let mut response = client.round_trip(request(addr, "GET", "/")).await.unwrap();
        assert_eq!(response.status, 200);
        // Interim header fields accumulate into the response.
        assert_eq!(
            response.header("link"),
            Some("</style.css>; rel=preload")
        );
        assert_eq!(response.text().await.unwrap(), "ok");
    })
    .await
    .unwrap();
}
