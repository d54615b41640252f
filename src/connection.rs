use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use bytes::{Bytes, BytesMut};
use quinn::{RecvStream, SendStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, FrameTypeError, Result};
use crate::frame::{decode_varint, encode_varint, read_varint, FrameReader, FrameType};
use crate::settings::Settings;
use crate::stream::{is_client_bidi, RequestStream, StreamType};

// Buffered units per WebTransport session; excess streams are rejected with
// WEBTRANSPORT_BUFFERED_STREAM_REJECTED, excess datagrams are dropped.
const MAX_BUFFERED_STREAMS: usize = 10;
const MAX_BUFFERED_DATAGRAMS: usize = 10;

/// QUIC versions this library speaks HTTP/3 over. Each maps to exactly one
/// ALPN token; the TLS protocol list is replaced with that token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    /// QUIC v1 (RFC 9000), ALPN `h3`.
    V1,
    /// Draft-29 transport, ALPN `h3-29`.
    Draft29,
}

impl QuicVersion {
    pub fn alpn(self) -> &'static [u8] {
        match self {
            QuicVersion::V1 => b"h3",
            QuicVersion::Draft29 => b"h3-29",
        }
    }

    pub fn alpn_str(self) -> &'static str {
        match self {
            QuicVersion::V1 => "h3",
            QuicVersion::Draft29 => "h3-29",
        }
    }

    /// Wire version number for the QUIC handshake.
    pub fn wire(self) -> u32 {
        match self {
            QuicVersion::V1 => 0x0000_0001,
            QuicVersion::Draft29 => 0xff00_001d,
        }
    }
}

/// State of the peer-settings latch. Set exactly once by the control-stream
/// reader; every waiter observes the same resolution.
#[derive(Debug, Clone)]
pub enum PeerSettings {
    Pending,
    Ready(Settings),
    Failed(String),
}

pub(crate) type BidiStream = (SendStream, RecvStream);

/// Bounded per-session channel usable from both the producer (connection
/// engine) and a single consumer (the WebTransport session).
struct SessionQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

impl<T> SessionQueue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }
}

impl<T> Clone for SessionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

struct PeerUniSlots {
    // One slot per stream type tag below 4 (control, push, QPACK encoder,
    // QPACK decoder): at most one of each may be opened by the peer.
    taken: [bool; 4],
    // QPACK streams are kept open but never read (static table only).
    parked: Vec<RecvStream>,
}

struct IncomingRequest {
    send: SendStream,
    // Positioned on the initial HEADERS frame header.
    reader: FrameReader<RecvStream>,
}

struct ConnectionInner {
    quic: quinn::Connection,
    settings: Settings,
    peer_settings_tx: watch::Sender<PeerSettings>,
    peer_settings_rx: watch::Receiver<PeerSettings>,
    // Keeps the local control stream open for the connection's lifetime.
    control_send: Mutex<Option<SendStream>>,
    peer_uni: Mutex<PeerUniSlots>,
    request_streams_tx: mpsc::Sender<IncomingRequest>,
    request_streams_rx: AsyncMutex<mpsc::Receiver<IncomingRequest>>,
    bidi_accept_once: Once,
    datagram_once: Once,
    sessions_bidi: Mutex<HashMap<u64, SessionQueue<BidiStream>>>,
    sessions_uni: Mutex<HashMap<u64, SessionQueue<RecvStream>>>,
    sessions_datagram: Mutex<HashMap<u64, SessionQueue<Bytes>>>,
}

/// An HTTP/3 connection over an established QUIC session.
///
/// Construction opens the local control stream and sends SETTINGS before
/// anything else happens on the connection, then starts accepting peer
/// unidirectional streams. The bidirectional accept loop and the datagram
/// reader are started lazily on first use.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Establish a server-side HTTP/3 connection. `None` settings pick a
    /// default set, with datagram support mirrored from the QUIC session.
    pub async fn accept(quic: quinn::Connection, settings: Option<Settings>) -> Result<Self> {
        if quic.side() != quinn::Side::Server {
            return Err(Error::Connection(
                "accept called on a client session".to_string(),
            ));
        }
        Self::establish(quic, settings).await
    }

    /// Establish a client-side HTTP/3 connection.
    pub async fn open(quic: quinn::Connection, settings: Option<Settings>) -> Result<Self> {
        if quic.side() != quinn::Side::Client {
            return Err(Error::Connection(
                "open called on a server session".to_string(),
            ));
        }
        Self::establish(quic, settings).await
    }

    async fn establish(quic: quinn::Connection, settings: Option<Settings>) -> Result<Self> {
        let settings = match settings {
            Some(settings) => settings,
            None => {
                let mut settings = Settings::new();
                if quic.max_datagram_size().is_some() {
                    settings.enable_datagrams();
                }
                settings
            }
        };

        // The local SETTINGS frame goes out before any request stream can
        // be opened on this connection.
        let mut control = quic.open_uni().await?;
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, StreamType::CONTROL.0);
        settings.write_frame(&mut buf);
        control.write_all(&buf).await?;

        let (peer_settings_tx, peer_settings_rx) = watch::channel(PeerSettings::Pending);
        let (request_streams_tx, request_streams_rx) = mpsc::channel(MAX_BUFFERED_STREAMS);

        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                quic,
                settings,
                peer_settings_tx,
                peer_settings_rx,
                control_send: Mutex::new(Some(control)),
                peer_uni: Mutex::new(PeerUniSlots {
                    taken: [false; 4],
                    parked: Vec::new(),
                }),
                request_streams_tx,
                request_streams_rx: AsyncMutex::new(request_streams_rx),
                bidi_accept_once: Once::new(),
                datagram_once: Once::new(),
                sessions_bidi: Mutex::new(HashMap::new()),
                sessions_uni: Mutex::new(HashMap::new()),
                sessions_datagram: Mutex::new(HashMap::new()),
            }),
        };

        conn.spawn_uni_acceptor();
        Ok(conn)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn is_server(&self) -> bool {
        self.inner.quic.side() == quinn::Side::Server
    }

    /// Effective local max field section size, enforced on incoming HEADERS.
    pub fn max_header_bytes(&self) -> u64 {
        self.inner.settings.max_field_section_size()
    }

    /// Current latch state without waiting.
    pub fn peer_settings_now(&self) -> PeerSettings {
        self.inner.peer_settings_rx.borrow().clone()
    }

    /// Wait for the peer's SETTINGS. Resolves exactly once per connection;
    /// a connection that dies first surfaces the transport error instead.
    pub async fn peer_settings(&self) -> Result<Settings> {
        let mut rx = self.inner.peer_settings_rx.clone();
        let resolved = async move {
            loop {
                match rx.borrow_and_update().clone() {
                    PeerSettings::Ready(settings) => return Ok(settings),
                    PeerSettings::Failed(msg) => return Err(Error::MissingSettings(msg)),
                    PeerSettings::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Transport("connection closed".to_string()));
                }
            }
        };
        tokio::select! {
            result = resolved => result,
            err = self.inner.quic.closed() => Err(err.into()),
        }
    }

    /// Max field section size advertised by the peer. Awaits the latch:
    /// headers must not be sent before the peer's SETTINGS arrive.
    pub(crate) async fn peer_max_field_section_size(&self) -> Result<u64> {
        Ok(self.peer_settings().await?.max_field_section_size())
    }

    pub fn close_with_error(&self, code: ErrorCode, reason: &str) {
        self.inner.quic.close(code.to_var_int(), reason.as_bytes());
    }

    pub async fn closed(&self) -> quinn::ConnectionError {
        self.inner.quic.closed().await
    }

    /// Server side: the next incoming request stream, positioned on its
    /// initial HEADERS frame.
    pub async fn accept_request_stream(&self) -> Result<RequestStream> {
        if !self.is_server() {
            return Err(Error::Connection(
                "server method called on a client connection".to_string(),
            ));
        }
        self.ensure_bidi_accept();
        let mut rx = self.inner.request_streams_rx.lock().await;
        tokio::select! {
            incoming = rx.recv() => match incoming {
                Some(IncomingRequest { send, reader }) => Ok(RequestStream::new(
                    self.clone(),
                    send,
                    reader,
                    CancellationToken::new(),
                )),
                None => Err(Error::Transport("connection closed".to_string())),
            },
            err = self.inner.quic.closed() => Err(err.into()),
        }
    }

    /// Client side: open a new request stream. The bidirectional accept
    /// loop is started here too so WebTransport streams the server opens
    /// later find their way to the demultiplexer.
    pub async fn open_request_stream(&self, cancel: CancellationToken) -> Result<RequestStream> {
        if self.is_server() {
            return Err(Error::Connection(
                "client method called on a server connection".to_string(),
            ));
        }
        self.ensure_bidi_accept();
        let (send, recv) = tokio::select! {
            opened = self.inner.quic.open_bi() => opened?,
            _ = cancel.cancelled() => return Err(Error::RequestCancelled),
        };
        Ok(RequestStream::new(
            self.clone(),
            send,
            FrameReader::new(recv),
            cancel,
        ))
    }

    // ---- peer unidirectional streams ----

    fn spawn_uni_acceptor(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                match conn.inner.quic.accept_uni().await {
                    Ok(stream) => {
                        let conn = conn.clone();
                        tokio::spawn(async move { conn.handle_uni_stream(stream).await });
                    }
                    Err(e) => {
                        debug!("unidirectional accept loop ended: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn handle_uni_stream(&self, mut stream: RecvStream) {
        let tag = match read_varint(&mut stream).await {
            Ok(Some(value)) => StreamType(value),
            _ => {
                let _ = stream.stop(ErrorCode::GeneralProtocolError.to_var_int());
                return;
            }
        };

        if tag.0 < 4 {
            let duplicate = {
                let mut slots = self.inner.peer_uni.lock().unwrap();
                let index = tag.0 as usize;
                let duplicate = slots.taken[index];
                slots.taken[index] = true;
                duplicate
            };
            if duplicate {
                self.close_with_error(
                    ErrorCode::StreamCreationError,
                    &format!("more than one {} opened", tag),
                );
                return;
            }
        }

        match tag {
            StreamType::CONTROL => self.run_control_stream(stream).await,
            StreamType::PUSH => {
                if self.is_server() {
                    self.close_with_error(
                        ErrorCode::StreamCreationError,
                        &format!("spurious {} from client", tag),
                    );
                } else {
                    // Push capability is never advertised.
                    self.close_with_error(ErrorCode::IdError, "MAX_PUSH_ID = 0");
                }
            }
            StreamType::QPACK_ENCODER | StreamType::QPACK_DECODER => {
                // Static table only: keep the stream open, ignore its
                // contents.
                self.inner.peer_uni.lock().unwrap().parked.push(stream);
            }
            StreamType::WEBTRANSPORT_UNI => self.route_webtransport_uni(stream).await,
            _ => {
                // Unknown stream type: reset just this stream.
                let _ = stream.stop(ErrorCode::StreamCreationError.to_var_int());
            }
        }
    }

    async fn route_webtransport_uni(&self, mut stream: RecvStream) {
        if !self.inner.settings.webtransport_enabled() {
            let _ = stream.stop(ErrorCode::SettingsError.to_var_int());
            return;
        }
        let session_id = match read_varint(&mut stream).await {
            Ok(Some(id)) => id,
            _ => {
                let _ = stream.stop(ErrorCode::GeneralProtocolError.to_var_int());
                return;
            }
        };
        if !is_client_bidi(session_id) {
            let _ = stream.stop(ErrorCode::IdError.to_var_int());
            return;
        }
        let queue = self.uni_queue(session_id);
        if let Err(rejected) = queue.tx.try_send(stream) {
            warn!(session_id, "rejecting buffered WebTransport uni stream");
            let mut stream = rejected.into_inner();
            let _ = stream.stop(ErrorCode::WebTransportBufferedStreamRejected.to_var_int());
        }
    }

    async fn run_control_stream(&self, stream: RecvStream) {
        let mut fr = FrameReader::new(stream);
        let peer = match Settings::read_control_frame(&mut fr).await {
            Ok(peer) => peer,
            Err(e) => {
                let msg = e.to_string();
                let _ = self
                    .inner
                    .peer_settings_tx
                    .send(PeerSettings::Failed(msg.clone()));
                self.close_with_error(ErrorCode::MissingSettings, &msg);
                return;
            }
        };

        let datagram_mismatch = peer.datagrams_enabled()
            && self.inner.settings.datagrams_enabled()
            && self.inner.quic.max_datagram_size().is_none();

        let _ = self.inner.peer_settings_tx.send(PeerSettings::Ready(peer));

        if datagram_mismatch {
            self.close_with_error(ErrorCode::SettingsError, "missing QUIC Datagram support");
            return;
        }

        // Drain the rest of the control stream. GOAWAY is recognized but
        // graceful shutdown is not initiated from here.
        loop {
            match fr.next().await {
                Ok(Some((FrameType::GOAWAY, _))) => {
                    debug!("received GOAWAY on control stream");
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }

    // ---- peer bidirectional streams ----

    fn ensure_bidi_accept(&self) {
        let conn = self.clone();
        self.inner.bidi_accept_once.call_once(move || {
            tokio::spawn(async move {
                loop {
                    match conn.inner.quic.accept_bi().await {
                        Ok((send, recv)) => {
                            let conn = conn.clone();
                            tokio::spawn(
                                async move { conn.handle_bidi_stream(send, recv).await },
                            );
                        }
                        Err(e) => {
                            debug!("bidirectional accept loop ended: {}", e);
                            return;
                        }
                    }
                }
            });
        });
    }

    async fn handle_bidi_stream(&self, mut send: SendStream, recv: RecvStream) {
        let mut fr = FrameReader::new(recv);
        loop {
            let header = match fr.next().await {
                Ok(header) => header,
                Err(_) => {
                    let _ = send.reset(ErrorCode::RequestIncomplete.to_var_int());
                    return;
                }
            };
            let (frame_type, len) = match header {
                Some(header) => header,
                None => {
                    let _ = send.reset(ErrorCode::RequestIncomplete.to_var_int());
                    return;
                }
            };
            match frame_type {
                FrameType::HEADERS => {
                    // Blocks (and thereby exerts back-pressure) when more
                    // than MAX_BUFFERED_STREAMS requests are unclaimed.
                    let _ = self
                        .inner
                        .request_streams_tx
                        .send(IncomingRequest { send, reader: fr })
                        .await;
                    return;
                }
                FrameType::WEBTRANSPORT_STREAM => {
                    // The varint after this frame type is the session id.
                    let session_id = len;
                    if !self.inner.settings.webtransport_enabled() {
                        let _ = fr.get_mut().stop(ErrorCode::SettingsError.to_var_int());
                        let _ = send.reset(ErrorCode::SettingsError.to_var_int());
                        return;
                    }
                    if !is_client_bidi(session_id) {
                        let _ = fr.get_mut().stop(ErrorCode::IdError.to_var_int());
                        let _ = send.reset(ErrorCode::IdError.to_var_int());
                        return;
                    }
                    let queue = self.bidi_queue(session_id);
                    let recv = fr.into_inner();
                    if let Err(rejected) = queue.tx.try_send((send, recv)) {
                        warn!(session_id, "rejecting buffered WebTransport stream");
                        let (mut send, mut recv) = rejected.into_inner();
                        let code = ErrorCode::WebTransportBufferedStreamRejected.to_var_int();
                        let _ = recv.stop(code);
                        let _ = send.reset(code);
                    }
                    return;
                }
                FrameType::DATA
                | FrameType::SETTINGS
                | FrameType::PUSH_PROMISE
                | FrameType::GOAWAY
                | FrameType::CANCEL_PUSH
                | FrameType::MAX_PUSH_ID => {
                    let err = FrameTypeError {
                        want: FrameType::HEADERS,
                        got: frame_type,
                    };
                    self.close_with_error(ErrorCode::FrameUnexpected, &err.to_string());
                    return;
                }
                _ => {
                    // Grease and unknown frames before HEADERS are skipped.
                }
            }
        }
    }

    // ---- datagrams ----

    fn ensure_datagram_loop(&self) {
        let conn = self.clone();
        self.inner.datagram_once.call_once(move || {
            tokio::spawn(async move { conn.run_datagram_loop().await });
        });
    }

    async fn run_datagram_loop(&self) {
        loop {
            let datagram = match self.inner.quic.read_datagram().await {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!("datagram loop ended: {}", e);
                    return;
                }
            };
            let (session_id, prefix_len) = match decode_varint(&datagram) {
                Some(parsed) => parsed,
                None => {
                    debug!("discarding datagram with truncated session id");
                    continue;
                }
            };
            if !is_client_bidi(session_id) {
                debug!(session_id, "discarding datagram with invalid session id");
                continue;
            }
            let payload = datagram.slice(prefix_len..);
            // Datagrams are lossy by contract: drop on overflow.
            let _ = self.datagram_queue(session_id).tx.try_send(payload);
        }
    }

    // ---- WebTransport demultiplexer plumbing ----

    fn bidi_queue(&self, session_id: u64) -> SessionQueue<BidiStream> {
        self.inner
            .sessions_bidi
            .lock()
            .unwrap()
            .entry(session_id)
            .or_insert_with(|| SessionQueue::new(MAX_BUFFERED_STREAMS))
            .clone()
    }

    fn uni_queue(&self, session_id: u64) -> SessionQueue<RecvStream> {
        self.inner
            .sessions_uni
            .lock()
            .unwrap()
            .entry(session_id)
            .or_insert_with(|| SessionQueue::new(MAX_BUFFERED_STREAMS))
            .clone()
    }

    fn datagram_queue(&self, session_id: u64) -> SessionQueue<Bytes> {
        self.inner
            .sessions_datagram
            .lock()
            .unwrap()
            .entry(session_id)
            .or_insert_with(|| SessionQueue::new(MAX_BUFFERED_DATAGRAMS))
            .clone()
    }

    pub(crate) async fn accept_session_stream(&self, session_id: u64) -> Result<BidiStream> {
        let queue = self.bidi_queue(session_id);
        let mut rx = queue.rx.lock().await;
        tokio::select! {
            stream = rx.recv() => {
                stream.ok_or_else(|| Error::Transport("connection closed".to_string()))
            }
            err = self.inner.quic.closed() => Err(err.into()),
        }
    }

    pub(crate) async fn accept_session_uni_stream(&self, session_id: u64) -> Result<RecvStream> {
        let queue = self.uni_queue(session_id);
        let mut rx = queue.rx.lock().await;
        tokio::select! {
            stream = rx.recv() => {
                stream.ok_or_else(|| Error::Transport("connection closed".to_string()))
            }
            err = self.inner.quic.closed() => Err(err.into()),
        }
    }

    pub(crate) async fn read_session_datagram(&self, session_id: u64) -> Result<Bytes> {
        self.ensure_datagram_loop();
        let queue = self.datagram_queue(session_id);
        let mut rx = queue.rx.lock().await;
        tokio::select! {
            datagram = rx.recv() => {
                datagram.ok_or_else(|| Error::Transport("connection closed".to_string()))
            }
            err = self.inner.quic.closed() => Err(err.into()),
        }
    }

    pub(crate) fn send_session_datagram(&self, session_id: u64, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(payload.len() + 8);
        encode_varint(&mut buf, session_id);
        buf.extend_from_slice(payload);
        self.inner.quic.send_datagram(buf.freeze())?;
        Ok(())
    }

    pub(crate) async fn open_session_stream(&self, session_id: u64) -> Result<BidiStream> {
        let (mut send, recv) = self.inner.quic.open_bi().await?;
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, FrameType::WEBTRANSPORT_STREAM.0);
        encode_varint(&mut buf, session_id);
        send.write_all(&buf).await?;
        Ok((send, recv))
    }

    pub(crate) async fn open_session_uni_stream(&self, session_id: u64) -> Result<SendStream> {
        let mut send = self.inner.quic.open_uni().await?;
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, StreamType::WEBTRANSPORT_UNI.0);
        encode_varint(&mut buf, session_id);
        send.write_all(&buf).await?;
        Ok(send)
    }

    /// Drop all demultiplexer state for a WebTransport session.
    pub fn cleanup(&self, session_id: u64) {
        self.inner
            .sessions_bidi
            .lock()
            .unwrap()
            .remove(&session_id);
        self.inner.sessions_uni.lock().unwrap().remove(&session_id);
        self.inner
            .sessions_datagram
            .lock()
            .unwrap()
            .remove(&session_id);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Finish the control stream so the peer sees a clean end rather
        // than an implicit reset when the connection handle goes away.
        if let Some(mut control) = self.control_send.lock().unwrap().take() {
            let _ = control.finish();
        }
    }
}
