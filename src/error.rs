use crate::frame::FrameType;

/// HTTP/3 application error codes (RFC 9114 Section 8.1) plus the
/// WebTransport stream-rejection code from draft-ietf-webtrans-http3.
/// The values are carried verbatim in QUIC RESET_STREAM / STOP_SENDING /
/// CONNECTION_CLOSE frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    NoError = 0x100,
    GeneralProtocolError = 0x101,
    InternalError = 0x102,
    StreamCreationError = 0x103,
    ClosedCriticalStream = 0x104,
    FrameUnexpected = 0x105,
    FrameError = 0x106,
    ExcessiveLoad = 0x107,
    IdError = 0x108,
    SettingsError = 0x109,
    MissingSettings = 0x10a,
    RequestRejected = 0x10b,
    RequestCancelled = 0x10c,
    RequestIncomplete = 0x10d,
    MessageError = 0x10e,
    ConnectError = 0x10f,
    VersionFallback = 0x110,
    // https://www.ietf.org/archive/id/draft-ietf-webtrans-http3-01.html#section-7.5
    WebTransportBufferedStreamRejected = 0x3994bd84,
}

impl ErrorCode {
    pub fn value(self) -> u64 {
        self as u64
    }

    /// All defined codes fit in 32 bits, so this cannot fail.
    pub fn to_var_int(self) -> quinn::VarInt {
        quinn::VarInt::from_u32(self as u64 as u32)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NoError => "H3_NO_ERROR",
            ErrorCode::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            ErrorCode::InternalError => "H3_INTERNAL_ERROR",
            ErrorCode::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            ErrorCode::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            ErrorCode::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            ErrorCode::FrameError => "H3_FRAME_ERROR",
            ErrorCode::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            ErrorCode::IdError => "H3_ID_ERROR",
            ErrorCode::SettingsError => "H3_SETTINGS_ERROR",
            ErrorCode::MissingSettings => "H3_MISSING_SETTINGS",
            ErrorCode::RequestRejected => "H3_REQUEST_REJECTED",
            ErrorCode::RequestCancelled => "H3_REQUEST_CANCELLED",
            ErrorCode::RequestIncomplete => "H3_REQUEST_INCOMPLETE",
            ErrorCode::MessageError => "H3_MESSAGE_ERROR",
            ErrorCode::ConnectError => "H3_CONNECT_ERROR",
            ErrorCode::VersionFallback => "H3_VERSION_FALLBACK",
            ErrorCode::WebTransportBufferedStreamRejected => {
                "H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED"
            }
        };
        write!(f, "{}", name)
    }
}

/// An unexpected frame type was read. `want` is what the caller required,
/// `got` is what arrived on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTypeError {
    pub want: FrameType,
    pub got: FrameType,
}

impl std::fmt::Display for FrameTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unexpected frame type {}, expected {}",
            self.got, self.want
        )
    }
}

/// A frame payload exceeded the limit the caller imposed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLengthError {
    pub frame_type: FrameType,
    pub len: u64,
    pub max: u64,
}

impl std::fmt::Display for FrameLengthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frame too large: {} bytes (max: {})",
            self.frame_type, self.len, self.max
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Connection setup or session-level failure surfaced locally.
    Connection(String),
    /// QUIC transport error returned unchanged to the caller.
    Transport(String),
    FrameType(FrameTypeError),
    FrameLength(FrameLengthError),
    /// Malformed HTTP message (e.g. an invalid `:status` value).
    Message(String),
    StreamCreation(String),
    Settings(String),
    MissingSettings(String),
    Id(String),
    Qpack(String),
    InvalidTarget(String),
    RequestCancelled,
    Internal(String),
    Io(std::io::Error),
}

impl Error {
    /// The HTTP/3 error code to use when resetting a stream or closing the
    /// connection because of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::FrameType(_) => ErrorCode::FrameUnexpected,
            Error::FrameLength(_) => ErrorCode::FrameError,
            Error::Message(_) => ErrorCode::MessageError,
            Error::StreamCreation(_) => ErrorCode::StreamCreationError,
            Error::Settings(_) => ErrorCode::SettingsError,
            Error::MissingSettings(_) => ErrorCode::MissingSettings,
            Error::Id(_) => ErrorCode::IdError,
            Error::Qpack(_) => ErrorCode::GeneralProtocolError,
            Error::RequestCancelled => ErrorCode::RequestCancelled,
            Error::InvalidTarget(_) | Error::Internal(_) => ErrorCode::InternalError,
            Error::Connection(_) | Error::Transport(_) | Error::Io(_) => {
                ErrorCode::GeneralProtocolError
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "connection failed: {}", msg),
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
            Error::FrameType(err) => write!(f, "{}", err),
            Error::FrameLength(err) => write!(f, "{}", err),
            Error::Message(msg) => write!(f, "malformed message: {}", msg),
            Error::StreamCreation(msg) => write!(f, "stream creation error: {}", msg),
            Error::Settings(msg) => write!(f, "settings error: {}", msg),
            Error::MissingSettings(msg) => write!(f, "missing settings: {}", msg),
            Error::Id(msg) => write!(f, "id error: {}", msg),
            Error::Qpack(msg) => write!(f, "qpack error: {}", msg),
            Error::InvalidTarget(msg) => write!(f, "invalid target: {}", msg),
            Error::RequestCancelled => write!(f, "request cancelled"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FrameTypeError> for Error {
    fn from(err: FrameTypeError) -> Self {
        Error::FrameType(err)
    }
}

impl From<FrameLengthError> for Error {
    fn from(err: FrameLengthError) -> Self {
        Error::FrameLength(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<quinn::ConnectionError> for Error {
    fn from(err: quinn::ConnectionError) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<quinn::WriteError> for Error {
    fn from(err: quinn::WriteError) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<quinn::ReadError> for Error {
    fn from(err: quinn::ReadError) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<quinn::ClosedStream> for Error {
    fn from(err: quinn::ClosedStream) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<quinn::SendDatagramError> for Error {
    fn from(err: quinn::SendDatagramError) -> Self {
        Error::Transport(err.to_string())
    }
}
