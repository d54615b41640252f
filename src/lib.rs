//! HTTP/3 endpoint library with WebTransport session multiplexing.
//!
//! The core is the connection-level protocol engine: given an established
//! quinn connection it manages the control and QPACK stream typology,
//! exchanges SETTINGS, parses HTTP/3 frames, multiplexes request streams and
//! WebTransport auxiliary streams by session id, and maps failures onto the
//! RFC 9114 error codes.

pub mod body;
pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod qpack;
pub mod server;
pub mod settings;
pub mod stream;
pub mod types;
pub mod webtransport;

pub use body::Body;
pub use client::{Client, ClientOptions, METHOD_GET_0RTT};
pub use connection::{Connection, PeerSettings, QuicVersion};
pub use error::{Error, ErrorCode, FrameLengthError, FrameTypeError, Result};
pub use frame::{FrameReader, FrameType};
pub use server::{alt_svc_header, Handler, ResponseWriter, Server};
pub use settings::Settings;
pub use stream::{RequestStream, StreamType};
pub use types::*;
pub use webtransport::WebTransportSession;
