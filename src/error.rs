//! Error types for the conferencing core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ring, render and jitter buffer errors
///
/// A full buffer is not an error: it is reported as a drop event and the
/// call returns normally. These variants cover misuse only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer already initialized")]
    AlreadyInitialized,

    #[error("Buffer not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Frame format mismatch: {0}")]
    FormatMismatch(String),
}

/// Codec collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encoder configuration failed: {0}")]
    EncoderConfig(String),

    #[error("Decoder configuration failed: {0}")]
    DecoderConfig(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Codec is closed")]
    Closed,
}

/// Wire protocol errors (malformed or unexpected messages)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected end of buffer")]
    UnexpectedEnd,

    #[error("Varint out of range: {0}")]
    VarIntRange(u64),

    #[error("Unknown message type: {0:#x}")]
    UnknownMessage(u64),

    #[error("Unknown stream type: {0:#x}")]
    UnknownStreamType(u64),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("Invalid UTF-8 string")]
    InvalidString,

    #[error("Unexpected message: expected {expected}, received {received}")]
    UnexpectedMessage { expected: &'static str, received: String },

    #[error("Peer role not supported: {0}")]
    IncompatibleRole(String),

    #[error("Announce rejected for {namespace}: {reason} ({code})")]
    AnnounceRejected { namespace: String, code: u64, reason: String },

    #[error("Namespace mismatch: expected {expected}, received {received}")]
    NamespaceMismatch { expected: String, received: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEnd
        } else {
            ProtocolError::Io(err.to_string())
        }
    }
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Datagram too large: {0} bytes")]
    DatagramTooLarge(usize),

    #[error("Operation aborted")]
    Aborted,
}

/// Media transport session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session is not in a valid state for this call: {0}")]
    InvalidState(String),
}

/// Configuration errors, raised before any I/O happens
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No tracks configured")]
    NoTracks,

    #[error("Track malformed: {0}")]
    MalformedTrack(String),

    #[error("Duplicate media type in track table: {0}")]
    DuplicateTrack(String),

    #[error("First object for track alias {0} can not be a delta chunk")]
    FirstObjectDelta(u64),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
