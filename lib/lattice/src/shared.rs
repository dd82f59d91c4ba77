use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Identifies one request for the lifetime of a client process. Id 0 is
/// reserved for connection control frames and never allocated to a request.
pub type RequestId = u64;

pub const CONTROL_ID: RequestId = 0;

/// Payload ceiling a node advertises by default during the handshake.
pub const DEFAULT_MAX_PAYLOAD: u32 = 65536;
/// Minor protocol version advertised by nodes.
pub const PROTOCOL_MINOR_VERSION: u16 = 1;

pub type NetResult<T> = Result<T, NetError>;

/// Outcome of a non-blocking wire operation. `Wait` means the operation could
/// not make progress yet and must be retried once the underlying readiness
/// changes; `Fatal` tears the connection down.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(Violation),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Violation {
    PayloadTooLarge { len: usize, max: usize },
    MessageTooShort { missing: usize },
    MessageTooLong { extra: usize },
    UnalignedTail { len: usize, element: usize },
    UnexpectedControlFrame,
    UnauthenticatedFrame,
    AuthenticationFailed,
    HandshakeDesync,
    UnknownPrincipal,
    BadUtf8,
    Shutdown(String),
    Io(io::ErrorKind),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Violation::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds negotiated maximum {}", len, max)
            }
            Violation::MessageTooShort { missing } => {
                write!(f, "message too short: {} bytes missing", missing)
            }
            Violation::MessageTooLong { extra } => {
                write!(f, "message too long: {} extra bytes", extra)
            }
            Violation::UnalignedTail { len, element } => {
                write!(f, "tail of {} bytes is not a whole number of {}-byte elements", len, element)
            }
            Violation::UnexpectedControlFrame => write!(f, "unexpected control frame"),
            Violation::UnauthenticatedFrame => {
                write!(f, "request frame received before handshake completion")
            }
            Violation::AuthenticationFailed => write!(f, "authentication failed"),
            Violation::HandshakeDesync => write!(f, "handshake message out of sequence"),
            Violation::UnknownPrincipal => write!(f, "unknown principal name"),
            Violation::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            Violation::Shutdown(reason) => write!(f, "protocol error: {}", reason),
            Violation::Io(kind) => write!(f, "i/o error: {:?}", kind),
        }
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(Violation::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    /// True when the result is neither success nor a retryable wait.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

/// Error kinds surfaced to request notifiers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestError {
    NodeDisconnected,
    NodeError,
    Unsupported,
    ConnectionTimedOut,
    IoTimedOut,
    ProtocolError,
    AuthenticationFailed,
    RequestQueueFull,
    BadChannelName,
    EmptyValue,
    NoResponsibleNode,
    FatalError,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            RequestError::NodeDisconnected => "node disconnected",
            RequestError::NodeError => "node reported an internal error",
            RequestError::Unsupported => "request not supported by the node",
            RequestError::ConnectionTimedOut => "connection establishment timed out",
            RequestError::IoTimedOut => "request deadline exceeded",
            RequestError::ProtocolError => "protocol error",
            RequestError::AuthenticationFailed => "authentication failed",
            RequestError::RequestQueueFull => "request queue full",
            RequestError::BadChannelName => "bad channel name",
            RequestError::EmptyValue => "empty value",
            RequestError::NoResponsibleNode => "no responsible node",
            RequestError::FatalError => "fatal error",
        };
        f.write_str(text)
    }
}

/// Events delivered to a request's notifier callback. `Finished` is emitted
/// exactly once per request, after which no further notifications follow for
/// that id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Notification {
    /// A request-defined data message from one node.
    Record { node: SocketAddr, payload: Vec<u8> },
    /// One node accepted and completed its part of the request.
    Succeeded { node: SocketAddr },
    /// The connection to a node dropped while the request was in flight.
    NodeDisconnected { node: SocketAddr },
    Error {
        node: Option<SocketAddr>,
        kind: RequestError,
    },
    /// Terminal notification. `complete` is false when any participant
    /// failed or the request was aborted.
    Finished { complete: bool },
}

/// First byte of a status payload sent by a node in response to a new request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GlobalStatus {
    None = 0,
    RequestVersionNotSupported = 1,
    RequestNotSupported = 2,
}

impl GlobalStatus {
    #[inline]
    pub fn from_u8(value: u8) -> Option<GlobalStatus> {
        match value {
            0 => Some(GlobalStatus::None),
            1 => Some(GlobalStatus::RequestVersionNotSupported),
            2 => Some(GlobalStatus::RequestNotSupported),
            _ => None,
        }
    }
}
