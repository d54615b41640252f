use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use quinn::{RecvStream, SendStream, VarInt};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{Error, ErrorCode, FrameLengthError, Result};
use crate::frame::{write_frame, write_frame_header, FrameReader, FrameType};
use crate::qpack;
use crate::types::Header;
use crate::webtransport::WebTransportSession;

/// Stream type tag: the first varint on every peer-initiated unidirectional
/// stream (RFC 9114 Section 6.2, WebTransport draft Section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamType(pub u64);

impl StreamType {
    pub const CONTROL: StreamType = StreamType(0x00);
    pub const PUSH: StreamType = StreamType(0x01);
    pub const QPACK_ENCODER: StreamType = StreamType(0x02);
    pub const QPACK_DECODER: StreamType = StreamType(0x03);
    pub const WEBTRANSPORT_UNI: StreamType = StreamType(0x54);
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            StreamType::CONTROL => write!(f, "control stream"),
            StreamType::PUSH => write!(f, "push stream"),
            StreamType::QPACK_ENCODER => write!(f, "QPACK encoder stream"),
            StreamType::QPACK_DECODER => write!(f, "QPACK decoder stream"),
            StreamType::WEBTRANSPORT_UNI => write!(f, "WebTransport stream"),
            StreamType(other) => write!(f, "stream type 0x{:x}", other),
        }
    }
}

/// WebTransport session ids must be client-initiated bidirectional stream
/// ids; the low two bits of those are zero (RFC 9000 Section 2.1).
pub fn is_client_bidi(id: u64) -> bool {
    id & 0x3 == 0
}

struct SendSeat {
    stream: Option<SendStream>,
    busy: bool,
    finished: bool,
    reset: Option<ErrorCode>,
    // Set while an operation holds the stream; applied when it returns it.
    pending_reset: Option<ErrorCode>,
}

struct RecvSeat {
    reader: Option<FrameReader<RecvStream>>,
    busy: bool,
    stopped: Option<ErrorCode>,
    pending_stop: Option<ErrorCode>,
}

struct StreamShared {
    conn: Connection,
    id: u64,
    cancel: CancellationToken,
    send: Mutex<SendSeat>,
    recv: Mutex<RecvSeat>,
    // The application took over the raw stream (WebTransport); the server
    // must not stop the read side on handler completion.
    raw_taken: AtomicBool,
}

/// One request/response exchange on a client-initiated bidirectional stream.
///
/// The handle is cheaply cloneable; the send and receive halves sit behind
/// separate seats so a body-writing task, the response reader and the
/// cancellation observer can all act on the stream without holding a lock
/// across I/O. `cancel_write`/`cancel_read` are synchronous: when a half is
/// parked they reset it immediately, otherwise the reset code is applied as
/// soon as the in-flight operation (which also watches the cancellation
/// token) returns the half.
#[derive(Clone)]
pub struct RequestStream {
    shared: Arc<StreamShared>,
}

impl RequestStream {
    pub(crate) fn new(
        conn: Connection,
        send: SendStream,
        reader: FrameReader<RecvStream>,
        cancel: CancellationToken,
    ) -> Self {
        let id = VarInt::from(send.id()).into_inner();
        Self {
            shared: Arc::new(StreamShared {
                conn,
                id,
                cancel,
                send: Mutex::new(SendSeat {
                    stream: Some(send),
                    busy: false,
                    finished: false,
                    reset: None,
                    pending_reset: None,
                }),
                recv: Mutex::new(RecvSeat {
                    reader: Some(reader),
                    busy: false,
                    stopped: None,
                    pending_stop: None,
                }),
                raw_taken: AtomicBool::new(false),
            }),
        }
    }

    /// The QUIC stream id, which doubles as the WebTransport session id for
    /// sessions established on this stream.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.shared.conn
    }

    // ---- send half ----

    fn take_send(&self) -> Result<SendStream> {
        let mut seat = self.shared.send.lock().unwrap();
        if seat.busy {
            return Err(Error::Internal(
                "concurrent writes on request stream".to_string(),
            ));
        }
        if let Some(code) = seat.reset {
            return Err(reset_error(code));
        }
        match seat.stream.take() {
            Some(stream) => {
                seat.busy = true;
                Ok(stream)
            }
            None => Err(Error::Transport("send side closed".to_string())),
        }
    }

    fn put_send(&self, mut stream: SendStream, reset: Option<ErrorCode>) {
        let mut seat = self.shared.send.lock().unwrap();
        seat.busy = false;
        if let Some(code) = reset {
            seat.reset = Some(code);
            return;
        }
        if let Some(code) = seat.pending_reset.take() {
            let _ = stream.reset(code.to_var_int());
            seat.reset = Some(code);
            return;
        }
        seat.stream = Some(stream);
    }

    async fn send_frames(&self, buf: &[u8]) -> Result<()> {
        let mut stream = self.take_send()?;
        let written = tokio::select! {
            written = stream.write_all(buf) => Some(written),
            _ = self.shared.cancel.cancelled() => None,
        };
        let (result, reset) = match written {
            Some(written) => (written.map_err(Error::from), None),
            None => {
                let _ = stream.reset(ErrorCode::RequestCancelled.to_var_int());
                (Err(Error::RequestCancelled), Some(ErrorCode::RequestCancelled))
            }
        };
        self.put_send(stream, reset);
        result
    }

    /// QPACK-encode and send one HEADERS frame. The encoded size is checked
    /// against the peer's max field section size before anything is written;
    /// oversized sections fail locally. Used for headers and trailers alike.
    pub async fn write_headers(&self, fields: &[Header]) -> Result<()> {
        let peer_max = self.shared.conn.peer_max_field_section_size().await?;
        let encoded = qpack::encode_field_section(fields)?;
        if encoded.len() as u64 > peer_max {
            return Err(Error::FrameLength(FrameLengthError {
                frame_type: FrameType::HEADERS,
                len: encoded.len() as u64,
                max: peer_max,
            }));
        }
        let mut buf = BytesMut::with_capacity(encoded.len() + 16);
        write_frame(&mut buf, FrameType::HEADERS, &encoded);
        self.send_frames(&buf).await
    }

    /// Send one chunk as a DATA frame.
    pub async fn write_data(&self, chunk: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(chunk.len() + 16);
        write_frame_header(&mut buf, FrameType::DATA, chunk.len() as u64);
        buf.extend_from_slice(chunk);
        self.send_frames(&buf).await
    }

    /// Cleanly close the send side (QUIC FIN). Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut seat = self.shared.send.lock().unwrap();
        if seat.finished || seat.reset.is_some() {
            return Ok(());
        }
        if let Some(stream) = seat.stream.as_mut() {
            stream.finish()?;
            seat.finished = true;
        }
        Ok(())
    }

    /// Reset the send side with the given HTTP/3 error code. A no-op once
    /// the stream is finished or already reset.
    pub fn cancel_write(&self, code: ErrorCode) {
        let mut seat = self.shared.send.lock().unwrap();
        if seat.reset.is_some() {
            return;
        }
        if seat.busy {
            seat.pending_reset = Some(code);
            return;
        }
        if let Some(stream) = seat.stream.as_mut() {
            let _ = stream.reset(code.to_var_int());
            seat.reset = Some(code);
        }
    }

    // ---- receive half ----

    fn take_recv(&self) -> Result<FrameReader<RecvStream>> {
        let mut seat = self.shared.recv.lock().unwrap();
        if seat.busy {
            return Err(Error::Internal(
                "concurrent reads on request stream".to_string(),
            ));
        }
        if let Some(code) = seat.stopped {
            return Err(reset_error(code));
        }
        match seat.reader.take() {
            Some(reader) => {
                seat.busy = true;
                Ok(reader)
            }
            None => Err(Error::Transport("receive side closed".to_string())),
        }
    }

    fn put_recv(&self, mut reader: FrameReader<RecvStream>, stopped: Option<ErrorCode>) {
        let mut seat = self.shared.recv.lock().unwrap();
        seat.busy = false;
        if let Some(code) = stopped {
            seat.stopped = Some(code);
        } else if let Some(code) = seat.pending_stop.take() {
            let _ = reader.get_mut().stop(code.to_var_int());
            seat.stopped = Some(code);
        }
        seat.reader = Some(reader);
    }

    /// Stop the receive side with the given HTTP/3 error code. A no-op once
    /// the stream has already been stopped (or fully read, in which case the
    /// transport ignores it).
    pub fn cancel_read(&self, code: ErrorCode) {
        let mut seat = self.shared.recv.lock().unwrap();
        if seat.stopped.is_some() {
            return;
        }
        if seat.busy {
            seat.pending_stop = Some(code);
            return;
        }
        if let Some(reader) = seat.reader.as_mut() {
            let _ = reader.get_mut().stop(code.to_var_int());
            seat.stopped = Some(code);
        }
    }

    // Completes a read operation: returns the half and, when the request
    // context fired mid-read, stops the stream and reports cancellation.
    fn finish_recv<T>(
        &self,
        mut reader: FrameReader<RecvStream>,
        outcome: Option<Result<T>>,
    ) -> Result<T> {
        match outcome {
            Some(result) => {
                self.put_recv(reader, None);
                result
            }
            None => {
                let _ = reader.get_mut().stop(ErrorCode::RequestCancelled.to_var_int());
                self.put_recv(reader, Some(ErrorCode::RequestCancelled));
                Err(Error::RequestCancelled)
            }
        }
    }

    /// Read a HEADERS frame (skipping grease), enforcing the local max field
    /// section size, and decode it.
    pub async fn read_headers(&self) -> Result<Vec<Header>> {
        let max = self.shared.conn.max_header_bytes();
        let mut reader = self.take_recv()?;
        let outcome = tokio::select! {
            result = read_headers_inner(&mut reader, max) => Some(result),
            _ = self.shared.cancel.cancelled() => None,
        };
        self.finish_recv(reader, outcome)
    }

    /// Read body bytes, transparently crossing DATA frame boundaries.
    /// Returns 0 at the end of the body: either the stream finished, or a
    /// non-DATA frame was encountered and left positioned for
    /// `read_trailers` (or for error classification by the caller).
    pub async fn read_data(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.take_recv()?;
        let outcome = tokio::select! {
            result = read_data_inner(&mut reader, buf) => Some(result),
            _ = self.shared.cancel.cancelled() => None,
        };
        self.finish_recv(reader, outcome)
    }

    /// After the body returned EOF: decode the pending HEADERS frame as
    /// trailers, if one is positioned.
    pub async fn read_trailers(&self) -> Result<Option<Vec<Header>>> {
        let max = self.shared.conn.max_header_bytes();
        let mut reader = self.take_recv()?;
        let positioned = reader.at_frame_start()
            && matches!(reader.current(), Some((FrameType::HEADERS, _)));
        if !positioned {
            self.put_recv(reader, None);
            return Ok(None);
        }
        let outcome = tokio::select! {
            result = read_headers_inner(&mut reader, max) => Some(result.map(Some)),
            _ = self.shared.cancel.cancelled() => None,
        };
        self.finish_recv(reader, outcome)
    }

    // ---- WebTransport upgrade ----

    /// Hand the stream over to a WebTransport session keyed by this stream's
    /// id. The server skips its end-of-request `cancel_read` for streams
    /// taken over this way.
    pub fn web_transport(&self) -> Result<WebTransportSession> {
        if !self.shared.conn.settings().webtransport_enabled() {
            return Err(Error::Settings(
                "WebTransport not enabled on this connection".to_string(),
            ));
        }
        self.shared.raw_taken.store(true, Ordering::Relaxed);
        WebTransportSession::new(self.shared.conn.clone(), self.shared.id)
    }

    pub(crate) fn raw_taken(&self) -> bool {
        self.shared.raw_taken.load(Ordering::Relaxed)
    }
}

fn reset_error(code: ErrorCode) -> Error {
    if code == ErrorCode::RequestCancelled {
        Error::RequestCancelled
    } else {
        Error::Transport(format!("stream reset locally with {}", code))
    }
}

async fn read_headers_inner(
    reader: &mut FrameReader<RecvStream>,
    max: u64,
) -> Result<Vec<Header>> {
    reader.expect(FrameType::HEADERS).await?;
    let payload = reader.read_payload(max).await?;
    qpack::decode_field_section(&payload)
}

async fn read_data_inner(reader: &mut FrameReader<RecvStream>, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.current() {
            Some((FrameType::DATA, remaining)) if remaining > 0 => {
                return reader.read(buf).await;
            }
            Some((FrameType::DATA, _)) => {}
            Some((frame_type, _)) if reader.at_frame_start() => {
                if frame_type.is_grease() {
                    reader.skip_payload().await?;
                } else {
                    // Non-DATA frame: end of body, leave it positioned.
                    return Ok(0);
                }
            }
            Some(_) | None => {}
        }
        match reader.next().await? {
            None => return Ok(0),
            Some((FrameType::DATA, _)) => {}
            Some((frame_type, _)) if frame_type.is_grease() => {
                reader.skip_payload().await?;
            }
            Some(_) => return Ok(0),
        }
    }
}
