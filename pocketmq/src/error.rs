//! Error types for pocketmq.

use std::io;

/// Result type alias for pocketmq.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pocketmq operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connection closed by peer between packets.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection closed by peer in the middle of a packet.
    #[error("connection closed mid-packet ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    /// More bytes are needed to decode a packet.
    #[error("incomplete packet: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Remaining length byte has the continuation bit set.
    ///
    /// Only single-byte lengths (0..=127) are accepted on the wire.
    #[error("remaining length byte {0:#04x} requires multi-byte encoding (limit is 127)")]
    RemainingLengthOutOfRange(u8),

    /// Packet body does not fit the single-byte remaining length.
    #[error("packet body of {size} bytes exceeds limit of {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// Packet body is too short or inconsistent.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Topic is not valid UTF-8.
    #[error("invalid utf-8 in topic")]
    InvalidUtf8,

    /// Connection refused by broker.
    #[error("connection refused: return code {0}")]
    ConnectionRefused(u8),

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,
}

impl Error {
    /// Returns true if the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::Truncated { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
