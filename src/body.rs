use std::io::Write;

use bytes::{Bytes, BytesMut};
use flate2::write::GzDecoder;
use tokio::sync::oneshot;

use crate::error::{ErrorCode, Result};
use crate::stream::RequestStream;
use crate::types::Header;
use crate::webtransport::WebTransportSession;

const READ_CHUNK: usize = 8 * 1024;

// Streaming gzip state: compressed chunks are pushed into the decoder and
// decoded output drained into `pending` between reads.
struct Gunzip {
    decoder: GzDecoder<Vec<u8>>,
    pending: BytesMut,
    finished: bool,
}

/// The body of a request or response: a byte stream spanning DATA frames.
///
/// Reading past the final DATA frame picks up trailers, if the peer sent
/// any, and (for responses) signals the request-done channel that the
/// cancellation observer races against. Closing the body early stops the
/// read side with REQUEST_CANCELED, which is benign after a clean EOF.
pub struct Body {
    stream: RequestStream,
    trailers: Option<Vec<Header>>,
    eof: bool,
    done: Option<oneshot::Sender<()>>,
    gzip: Option<Gunzip>,
}

impl Body {
    pub(crate) fn new(stream: RequestStream, done: Option<oneshot::Sender<()>>) -> Self {
        Self {
            stream,
            trailers: None,
            eof: false,
            done,
            gzip: None,
        }
    }

    /// Wrap the remaining body bytes in a streaming gzip decoder.
    pub(crate) fn enable_gzip(&mut self) {
        self.gzip = Some(Gunzip {
            decoder: GzDecoder::new(Vec::new()),
            pending: BytesMut::new(),
            finished: false,
        });
    }

    /// Read body bytes. Returns 0 at the end of the body, after which
    /// `trailers` reflects any trailer fields the peer sent.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.gzip.is_some() {
            return self.read_gzip(buf).await;
        }
        if self.eof {
            return Ok(0);
        }
        let n = self.stream.read_data(buf).await?;
        if n == 0 {
            self.finish().await?;
        }
        Ok(n)
    }

    async fn read_gzip(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let Some(gz) = self.gzip.as_mut() else {
                return Ok(0);
            };
            if !gz.pending.is_empty() {
                let n = gz.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&gz.pending.split_to(n));
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }

            let n = self.stream.read_data(&mut scratch).await?;
            let Some(gz) = self.gzip.as_mut() else {
                return Ok(0);
            };
            if n == 0 {
                if !gz.finished {
                    gz.decoder.try_finish()?;
                    gz.finished = true;
                    let decoded = std::mem::take(gz.decoder.get_mut());
                    gz.pending.extend_from_slice(&decoded);
                }
                self.finish().await?;
                continue;
            }
            gz.decoder.write_all(&scratch[..n])?;
            let decoded = std::mem::take(gz.decoder.get_mut());
            gz.pending.extend_from_slice(&decoded);
        }
    }

    // End of body: pick up trailers and release the request-done signal.
    async fn finish(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        self.eof = true;
        self.trailers = self.stream.read_trailers().await?;
        self.request_done();
        Ok(())
    }

    fn request_done(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    /// Read the rest of the body into one buffer.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&scratch[..n]);
        }
    }

    /// Trailer fields, available once the body has been read to its end.
    pub fn trailers(&self) -> Option<&[Header]> {
        self.trailers.as_deref()
    }

    /// Abandon the body. Stops the read side with REQUEST_CANCELED (a no-op
    /// if the stream already ended) and releases the request-done signal.
    pub fn close(&mut self) {
        self.request_done();
        self.stream.cancel_read(ErrorCode::RequestCancelled);
    }

    /// Hand the underlying stream to a WebTransport session.
    pub fn web_transport(&self) -> Result<WebTransportSession> {
        self.stream.web_transport()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("eof", &self.eof)
            .field("gzip", &self.gzip.is_some())
            .finish()
    }
}
