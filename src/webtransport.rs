use bytes::Bytes;
use quinn::{RecvStream, SendStream};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::stream::is_client_bidi;

/// A WebTransport session multiplexed inside an HTTP/3 connection.
///
/// The session id is the id of the client-initiated bidirectional stream the
/// session was established on. Incoming streams and datagrams tagged with
/// that id are routed here by the connection engine; dropping the session
/// releases the demultiplexer channels.
pub struct WebTransportSession {
    conn: Connection,
    session_id: u64,
}

impl WebTransportSession {
    pub(crate) fn new(conn: Connection, session_id: u64) -> Result<Self> {
        if !is_client_bidi(session_id) {
            return Err(Error::Id(format!(
                "session id {} is not a client-initiated bidirectional stream",
                session_id
            )));
        }
        Ok(Self { conn, session_id })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The next bidirectional stream the peer opened for this session.
    pub async fn accept_stream(&self) -> Result<(SendStream, RecvStream)> {
        self.conn.accept_session_stream(self.session_id).await
    }

    /// The next unidirectional stream the peer opened for this session.
    pub async fn accept_uni_stream(&self) -> Result<RecvStream> {
        self.conn.accept_session_uni_stream(self.session_id).await
    }

    /// Open a bidirectional stream tied to this session. The
    /// WEBTRANSPORT_STREAM frame type and session id are already written.
    pub async fn open_stream(&self) -> Result<(SendStream, RecvStream)> {
        self.conn.open_session_stream(self.session_id).await
    }

    /// Open a unidirectional stream tied to this session, prefixed with the
    /// WebTransport stream type and session id.
    pub async fn open_uni_stream(&self) -> Result<SendStream> {
        self.conn.open_session_uni_stream(self.session_id).await
    }

    /// The payload of the next datagram addressed to this session.
    pub async fn read_datagram(&self) -> Result<Bytes> {
        self.conn.read_session_datagram(self.session_id).await
    }

    /// Send a datagram to the peer, prefixed with this session's id.
    pub fn send_datagram(&self, payload: &[u8]) -> Result<()> {
        self.conn.send_session_datagram(self.session_id, payload)
    }

    /// Tear the session down, releasing its demultiplexer channels.
    pub fn close(self) {}
}

impl Drop for WebTransportSession {
    fn drop(&mut self) {
        self.conn.cleanup(self.session_id);
    }
}
