use std::fmt;

use crate::codec::ResponseCode;

/// Error returned by any connection operation.
///
/// Transport and framing errors are fatal for the connection: every caller
/// parked on a reply receives the same variant and the connection transitions
/// to `closed`. Command-level errors (a non-OK response code) only fail the
/// single call that produced them; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The TCP socket was closed by the peer or by the OS.
    TcpClosed,
    /// A read or write on the socket failed; `reason` carries the OS message.
    Io(String),
    /// A frame could not be decoded (truncated input, bad length prefix).
    MalformedFrame,
    /// The frame's command key does not match any known command.
    UnknownCommand(u16),
    /// A frame exceeded the negotiated `frame_max`.
    FrameTooLarge,
    /// SASL handshake or authentication failed with the given response code.
    Sasl(ResponseCode),
    /// A command completed with a non-OK response code.
    Command(ResponseCode),
    /// A caller-supplied argument violates a wire constraint (e.g. a name
    /// longer than 255 bytes, or an id outside `u8`/`u32` range).
    InvalidArgument(String),
    /// The call was made while the connection was not open.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TcpClosed => write!(f, "connection closed by peer"),
            Error::Io(reason) => write!(f, "io error: {reason}"),
            Error::MalformedFrame => write!(f, "malformed frame"),
            Error::UnknownCommand(key) => write!(f, "unknown command key: 0x{key:04x}"),
            Error::FrameTooLarge => write!(f, "frame exceeds negotiated frame_max"),
            Error::Sasl(code) => write!(f, "sasl failure: {code:?}"),
            Error::Command(code) => write!(f, "command failed: {code:?}"),
            Error::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            Error::Closed => write!(f, "connection is closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Error::TcpClosed
            }
            _ => Error::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
