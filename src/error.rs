//! Error variants returned by the engine.

use std::{io, result};

use thiserror::Error;

use crate::protocol::frame::coding::Data;

/// A convenience alias for this crate's results.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Possible WebSocket failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An operation that requires an open connection was attempted after a
    /// close handshake started or finished.
    #[error("connection is already closing or closed")]
    AlreadyClosing,
    /// Input-output error. These are generally unrecoverable; the
    /// connection is torn down without a closing handshake.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// WebSocket protocol violation.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A configured or protocol-defined size cap was exceeded.
    #[error("space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// A text message carried a payload that is not valid UTF-8.
    #[error("UTF-8 encoding error")]
    Utf8,
    /// The fragment size passed to a send call was zero.
    #[error("fragment size must be positive")]
    BadFrameSize,
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::Protocol(ProtocolError::HttparseError(err))
    }
}

/// Indicates the specific type/cause of a protocol error.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Wrong method in the upgrade request.
    #[error("unsupported HTTP method, only GET is allowed")]
    WrongHttpMethod,
    /// Wrong HTTP version in the upgrade request.
    #[error("HTTP version must be 1.1 or higher")]
    WrongHttpVersion,
    /// The `Connection: upgrade` header is missing.
    #[error("no \"Connection: upgrade\" header")]
    MissingConnectionUpgradeHeader,
    /// The `Upgrade: websocket` header is missing.
    #[error("no \"Upgrade: websocket\" header")]
    MissingUpgradeWebSocketHeader,
    /// The `Sec-WebSocket-Version: 13` header is missing.
    #[error("no \"Sec-WebSocket-Version: 13\" header")]
    MissingSecWebSocketVersionHeader,
    /// The `Sec-WebSocket-Key` header is missing.
    #[error("no \"Sec-WebSocket-Key\" header")]
    MissingSecWebSocketKey,
    /// The peer stopped sending before completing the handshake.
    #[error("handshake was not completed by the peer")]
    HandshakeIncomplete,
    /// The upgrade request grew past any reasonable size.
    #[error("oversized handshake request")]
    OversizedHandshake,
    /// Garbled upgrade request.
    #[error("httparse error: {0}")]
    HttparseError(#[from] httparse::Error),
    /// One of the reserved frame header bits is set.
    #[error("reserved bits are non-zero")]
    NonZeroReservedBits,
    /// An unknown control frame opcode was received.
    #[error("unknown control frame type: {0}")]
    UnknownControlFrameType(u8),
    /// An unknown data frame opcode was received.
    #[error("unknown data frame type: {0}")]
    UnknownDataFrameType(u8),
    /// A control frame had its FIN bit cleared.
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,
    /// A control frame declared a body over the protocol limit.
    #[error("control frames must not be longer than 125 bytes")]
    ControlFrameTooBig,
    /// The most significant bit of a 64-bit payload length is set.
    #[error("payload length has the most significant bit set")]
    InvalidPayloadLength,
    /// A client frame arrived without a mask.
    #[error("received an unmasked frame from the client")]
    UnmaskedFrameFromClient,
    /// A continuation frame arrived with no message in progress.
    #[error("continue frame but nothing to continue")]
    UnexpectedContinueFrame,
    /// A new data frame arrived while a fragmented message was in progress.
    #[error("while waiting for more fragments received: {0}")]
    ExpectedFragment(Data),
    /// A close frame carried a one-byte body.
    #[error("invalid close sequence")]
    InvalidCloseSequence,
    /// The peer dropped the TCP connection without a closing handshake.
    #[error("connection reset without closing handshake")]
    ResetWithoutClosingHandshake,
}

/// Indicates the specific size cap that was exceeded.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum CapacityError {
    /// A reassembled message went over the configured cap.
    #[error("message too long: {size} > {max_size}")]
    MessageTooLong {
        /// The size of the message that exceeded the cap.
        size: usize,
        /// The configured cap.
        max_size: usize,
    },
    /// A single frame declared a wire size over the configured cap.
    #[error("frame too long: {size} > {max_size}")]
    FrameTooLong {
        /// The total wire size the frame header declared.
        size: u64,
        /// The configured cap.
        max_size: usize,
    },
    /// A control frame body over the 125-byte protocol limit was requested.
    #[error("control frame body too long: {0} > 125")]
    ControlPayloadTooLong(usize),
}
