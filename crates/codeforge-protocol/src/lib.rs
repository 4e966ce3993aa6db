//! Codeforge Protocol Types
//!
//! Defines the binary framed protocol spoken on both the client TCP
//! endpoint and the local admin endpoint: a fixed 28-byte big-endian
//! header (magic, type, flags, length, correlation id, timestamp,
//! CRC-32 checksum) followed by a typed payload of at most 16 MiB.

pub mod codec;
pub mod error;
pub mod header;
pub mod payload;

pub use codec::{read_message, read_message_deadline, write_message, Message};
pub use error::{ErrorCode, FrameError, PayloadError};
pub use header::{MessageHeader, MessageType, HEADER_LEN, PROTOCOL_MAGIC};
pub use payload::{
    AdminCommandPayload, CompileRequestPayload, CompileResponsePayload, ErrorPayload,
    ExecutionMode, FileChunkPayload, FileUploadStartPayload, HelloPayload, JobIdPayload,
    JobStatus, JobStatusPayload, Language, ServerStatsPayload,
};

/// Protocol version advertised in the Hello exchange.
pub const PROTOCOL_VERSION: (u16, u16, u16) = (1, 0, 0);

/// Hard cap on a single message payload.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum length of a filename carried on the wire (field width, including NUL).
pub const MAX_FILENAME: usize = 256;

/// Field width of compiler/execution argument strings.
pub const MAX_COMMAND: usize = 1024;

/// Field width of a wire error message.
pub const MAX_ERROR_MESSAGE: usize = 4096;

/// Message flag bits. All reserved in v1: ignored on receive, zero on send.
pub const FLAG_COMPRESSED: u16 = 0x0001;
pub const FLAG_ENCRYPTED: u16 = 0x0002;
pub const FLAG_URGENT: u16 = 0x0004;
pub const FLAG_PARTIAL: u16 = 0x0008;

/// Admin sub-command discriminators carried in `AdminCommandPayload::command_type`.
pub mod admin_cmd {
    pub const CONFIG_LIST: u16 = 7;
    pub const CONFIG_GET: u16 = 8;
    pub const CONFIG_SET: u16 = 9;
}
