//! Error types for the wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Framing-level failures. Any of these (other than payload decode
/// problems, which are recoverable) poisons the stream: the bytes that
/// follow can no longer be trusted to start at a header boundary.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("header checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    BadChecksum { expected: u32, actual: u32 },

    #[error("payload length {0} exceeds the 16 MiB limit")]
    PayloadTooLarge(u32),

    #[error("unknown message type {0}")]
    UnknownType(u16),

    #[error("stream truncated mid-message")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer simply went away, as opposed to sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Truncated => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Payload decode failures. Unlike [`FrameError`], these leave the stream
/// intact (the full payload was consumed) and map to an `InvalidArgument`
/// error reply.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("invalid value {value} for field `{field}`")]
    BadValue { field: &'static str, value: u32 },
}

/// Numeric error codes carried in wire `Error` payloads.
///
/// The values are part of the protocol and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed payload, unknown message type, or validation failure.
    InvalidArgument,
    /// Wrong session state, cross-session access, or pre-handshake admin command.
    Permission,
    /// No such job or file.
    NotFound,
    /// File too large, too many active jobs, or a buffer limit hit.
    QuotaExceeded,
    /// Allocator failure.
    MemoryAllocation,
    /// Invariant violation; never expected.
    Internal,
    /// Compile or execute exceeded its wall-clock bound.
    Timeout,
    /// Toolchain exited non-zero in the compile phase.
    Compilation,
    /// Toolchain exited non-zero in the run phase.
    Execution,
    /// Transport I/O failure.
    Network,
    /// Local filesystem failure.
    FileIo,
    /// Requested language not detected at startup.
    UnsupportedLanguage,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::InvalidArgument => 1,
            ErrorCode::Permission => 2,
            ErrorCode::NotFound => 3,
            ErrorCode::QuotaExceeded => 4,
            ErrorCode::MemoryAllocation => 5,
            ErrorCode::Internal => 6,
            ErrorCode::Timeout => 7,
            ErrorCode::Compilation => 8,
            ErrorCode::Execution => 9,
            ErrorCode::Network => 10,
            ErrorCode::FileIo => 11,
            ErrorCode::UnsupportedLanguage => 12,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => ErrorCode::InvalidArgument,
            2 => ErrorCode::Permission,
            3 => ErrorCode::NotFound,
            4 => ErrorCode::QuotaExceeded,
            5 => ErrorCode::MemoryAllocation,
            6 => ErrorCode::Internal,
            7 => ErrorCode::Timeout,
            8 => ErrorCode::Compilation,
            9 => ErrorCode::Execution,
            10 => ErrorCode::Network,
            11 => ErrorCode::FileIo,
            12 => ErrorCode::UnsupportedLanguage,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Permission => "PERMISSION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::MemoryAllocation => "MEMORY_ALLOCATION",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Compilation => "COMPILATION",
            ErrorCode::Execution => "EXECUTION",
            ErrorCode::Network => "NETWORK",
            ErrorCode::FileIo => "FILE_IO",
            ErrorCode::UnsupportedLanguage => "UNSUPPORTED_LANGUAGE",
        };
        f.write_str(name)
    }
}
