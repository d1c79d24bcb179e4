//! Library error types, one enum per layer.
//!
//! Lower layers compose into higher layers via `#[from]` so a caller working
//! at the session layer can match on `SessionError` without losing the
//! original cause.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("header too short: need at least 6 bytes, got {0}")]
    HeaderTooShort(usize),

    #[error("declared data length {declared} exceeds the maximum permitted message length {available}")]
    DeclaredLengthExceedsBuffer { declared: usize, available: usize },

    #[error("unknown msg_type byte 0x{0:02X}")]
    UnknownMsgType(u8),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("id string length {0} exceeds maximum of 18")]
    IdTooLong(usize),

    #[error("ip string length {0} exceeds maximum of 15")]
    IpTooLong(usize),

    #[error("'{0}' is not a valid dotted-quad IPv4 address")]
    InvalidIp(String),

    #[error("settings payload too short: need at least {need} bytes after strings, got {got}")]
    TooShort { need: usize, got: usize },

    #[error("trailing bytes after the six u32 fields: expected exactly {expected}, got {got}")]
    TrailingBytes { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsoTpError {
    #[error("payload length {0} exceeds the protocol maximum of 4095 bytes")]
    PayloadTooLarge(usize),

    #[error("frame carried an empty payload")]
    ShortFrame,

    #[error("consecutive frame sequence counter mismatch: expected {expected}, got {actual}")]
    BadSequence { expected: u8, actual: u8 },

    #[error("arbitration id mismatch: message is bound to 0x{expected:X}, frame carries 0x{actual:X}")]
    ArbIdMismatch { expected: u32, actual: u32 },

    #[error("unexpected frame type nibble 0x{0:X}")]
    UnexpectedFrameType(u8),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("interface is not connected")]
    NotConnected,

    #[error("timed out waiting for a response")]
    NoResponse,

    #[error("ECU returned a negative response (0x7F)")]
    NegativeResponse,

    #[error("transfer size {0} exceeds the 4096 byte limit of transfer_data")]
    TransferTooLarge(usize),

    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log event is missing its 'type' field")]
    MissingType,

    #[error("unknown log event type {0}")]
    UnknownType(i64),

    #[error("malformed hex value '{0}'")]
    BadHex(String),

    #[error("log event is missing its '{0}' field")]
    MissingField(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("IntegerRangeParameter step can't be zero")]
    ZeroStep,

    #[error("IntegerRangeParameter start can't equal stop")]
    EmptyRange,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for the device to connect back")]
    ConnectTimeout,

    #[error("connection was reset by the remote device")]
    ConnectionReset,

    #[error("failed to write to the socket: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("failed to read from the socket: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}
