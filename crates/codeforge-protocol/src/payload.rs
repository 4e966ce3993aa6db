//! Typed payloads.
//!
//! Each message type carries a fixed payload schema. Multi-byte integers
//! are big-endian; string fields are fixed-width and NUL-padded, with
//! decoding stopping at the first NUL. Layouts match the packed wire
//! structs byte for byte.

use crate::error::{ErrorCode, PayloadError};
use crate::{MAX_COMMAND, MAX_ERROR_MESSAGE, MAX_FILENAME};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the client/server name field in the Hello payload.
const NAME_WIDTH: usize = 64;
/// Width of the platform field in the Hello payload.
const PLATFORM_WIDTH: usize = 32;
/// Width of the status message in a JobStatus payload.
const STATUS_MESSAGE_WIDTH: usize = 256;
/// Width of the context string in an Error payload.
const CONTEXT_WIDTH: usize = 256;
/// Width of the admin command data field.
const COMMAND_DATA_WIDTH: usize = 512;

/// Supported source languages, by wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Java,
    Python,
    JavaScript,
    Go,
    Rust,
}

impl Language {
    pub fn as_u16(self) -> u16 {
        match self {
            Language::C => 1,
            Language::Cpp => 2,
            Language::Java => 3,
            Language::Python => 4,
            Language::JavaScript => 5,
            Language::Go => 6,
            Language::Rust => 7,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Language::C,
            2 => Language::Cpp,
            3 => Language::Java,
            4 => Language::Python,
            5 => Language::JavaScript,
            6 => Language::Go,
            7 => Language::Rust,
            _ => return None,
        })
    }

    pub const ALL: [Language; 7] = [
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Python,
        Language::JavaScript,
        Language::Go,
        Language::Rust,
    ];
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::C => "C",
            Language::Cpp => "C++",
            Language::Java => "Java",
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::Go => "Go",
            Language::Rust => "Rust",
        };
        f.write_str(name)
    }
}

/// What the server should do with a submitted source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    CompileOnly,
    CompileAndRun,
    InterpretOnly,
    SyntaxCheck,
}

impl ExecutionMode {
    pub fn as_u16(self) -> u16 {
        match self {
            ExecutionMode::CompileOnly => 0,
            ExecutionMode::CompileAndRun => 1,
            ExecutionMode::InterpretOnly => 2,
            ExecutionMode::SyntaxCheck => 3,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => ExecutionMode::CompileOnly,
            1 => ExecutionMode::CompileAndRun,
            2 => ExecutionMode::InterpretOnly,
            3 => ExecutionMode::SyntaxCheck,
            _ => return None,
        })
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::CompileOnly => "compile-only",
            ExecutionMode::CompileAndRun => "compile-and-run",
            ExecutionMode::InterpretOnly => "interpret-only",
            ExecutionMode::SyntaxCheck => "syntax-check",
        };
        f.write_str(name)
    }
}

/// Job status codes as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Compiling,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn as_u16(self) -> u16 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Compiling => 1,
            JobStatus::Running => 2,
            JobStatus::Completed => 3,
            JobStatus::Failed => 4,
            JobStatus::Cancelled => 5,
            JobStatus::Timeout => 6,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => JobStatus::Queued,
            1 => JobStatus::Compiling,
            2 => JobStatus::Running,
            3 => JobStatus::Completed,
            4 => JobStatus::Failed,
            5 => JobStatus::Cancelled,
            6 => JobStatus::Timeout,
            _ => return None,
        })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Compiling => "Compiling",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

// Fixed-width field helpers.

fn put_str(buf: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(width.saturating_sub(1));
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + (width - take), 0);
}

fn take_str(buf: &[u8], offset: usize, width: usize) -> String {
    let field = &buf[offset..offset + width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn need(buf: &[u8], expected: usize) -> Result<(), PayloadError> {
    if buf.len() < expected {
        return Err(PayloadError::TooShort {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn i32_at(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn i64_at(buf: &[u8], offset: usize) -> i64 {
    i64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Hello handshake, sent by the client and echoed (with server identity)
/// in the response. 104 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    pub version: (u16, u16, u16),
    pub capabilities: u16,
    pub name: String,
    pub platform: String,
}

impl HelloPayload {
    pub const WIRE_LEN: usize = 8 + NAME_WIDTH + PLATFORM_WIDTH;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.version.0.to_be_bytes());
        buf.extend_from_slice(&self.version.1.to_be_bytes());
        buf.extend_from_slice(&self.version.2.to_be_bytes());
        buf.extend_from_slice(&self.capabilities.to_be_bytes());
        put_str(&mut buf, &self.name, NAME_WIDTH);
        put_str(&mut buf, &self.platform, PLATFORM_WIDTH);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(Self {
            version: (u16_at(buf, 0), u16_at(buf, 2), u16_at(buf, 4)),
            capabilities: u16_at(buf, 6),
            name: take_str(buf, 8, NAME_WIDTH),
            platform: take_str(buf, 8 + NAME_WIDTH, PLATFORM_WIDTH),
        })
    }
}

/// Opens a chunked file upload. 276 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadStartPayload {
    pub file_size: u64,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub filename: String,
    pub file_checksum: u32,
}

impl FileUploadStartPayload {
    pub const WIRE_LEN: usize = 16 + MAX_FILENAME + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.chunk_count.to_be_bytes());
        buf.extend_from_slice(&self.chunk_size.to_be_bytes());
        put_str(&mut buf, &self.filename, MAX_FILENAME);
        buf.extend_from_slice(&self.file_checksum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(Self {
            file_size: u64_at(buf, 0),
            chunk_count: u32_at(buf, 8),
            chunk_size: u32_at(buf, 12),
            filename: take_str(buf, 16, MAX_FILENAME),
            file_checksum: u32_at(buf, 16 + MAX_FILENAME),
        })
    }
}

/// One upload chunk: a 12-byte prefix followed by the chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkPayload {
    pub chunk_id: u32,
    pub chunk_size: u32,
    pub chunk_checksum: u32,
    pub data: Vec<u8>,
}

impl FileChunkPayload {
    pub const PREFIX_LEN: usize = 12;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::PREFIX_LEN + self.data.len());
        buf.extend_from_slice(&self.chunk_id.to_be_bytes());
        buf.extend_from_slice(&self.chunk_size.to_be_bytes());
        buf.extend_from_slice(&self.chunk_checksum.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::PREFIX_LEN)?;
        Ok(Self {
            chunk_id: u32_at(buf, 0),
            chunk_size: u32_at(buf, 4),
            chunk_checksum: u32_at(buf, 8),
            data: buf[Self::PREFIX_LEN..].to_vec(),
        })
    }
}

/// Compile/run submission. 2312 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequestPayload {
    pub language: Language,
    pub mode: ExecutionMode,
    pub flags: u16,
    pub priority: u16,
    pub filename: String,
    pub compiler_args: String,
    pub execution_args: String,
}

impl CompileRequestPayload {
    pub const WIRE_LEN: usize = 8 + MAX_FILENAME + 2 * MAX_COMMAND;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.language.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.mode.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.priority.to_be_bytes());
        put_str(&mut buf, &self.filename, MAX_FILENAME);
        put_str(&mut buf, &self.compiler_args, MAX_COMMAND);
        put_str(&mut buf, &self.execution_args, MAX_COMMAND);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        let raw_language = u16_at(buf, 0);
        let language = Language::from_u16(raw_language).ok_or(PayloadError::BadValue {
            field: "language",
            value: raw_language as u32,
        })?;
        let raw_mode = u16_at(buf, 2);
        let mode = ExecutionMode::from_u16(raw_mode).ok_or(PayloadError::BadValue {
            field: "mode",
            value: raw_mode as u32,
        })?;
        Ok(Self {
            language,
            mode,
            flags: u16_at(buf, 4),
            priority: u16_at(buf, 6),
            filename: take_str(buf, 8, MAX_FILENAME),
            compiler_args: take_str(buf, 8 + MAX_FILENAME, MAX_COMMAND),
            execution_args: take_str(buf, 8 + MAX_FILENAME + MAX_COMMAND, MAX_COMMAND),
        })
    }
}

/// Job acknowledgement and final result. 24 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileResponsePayload {
    pub job_id: u32,
    pub status: JobStatus,
    pub exit_code: i32,
    pub output_size: u32,
    pub error_size: u32,
    pub execution_time_ms: u32,
}

impl CompileResponsePayload {
    pub const WIRE_LEN: usize = 24;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.job_id.to_be_bytes());
        buf.extend_from_slice(&self.status.as_u16().to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // reserved
        buf.extend_from_slice(&self.exit_code.to_be_bytes());
        buf.extend_from_slice(&self.output_size.to_be_bytes());
        buf.extend_from_slice(&self.error_size.to_be_bytes());
        buf.extend_from_slice(&self.execution_time_ms.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        let raw_status = u16_at(buf, 4);
        let status = JobStatus::from_u16(raw_status).ok_or(PayloadError::BadValue {
            field: "status",
            value: raw_status as u32,
        })?;
        Ok(Self {
            job_id: u32_at(buf, 0),
            status,
            exit_code: i32_at(buf, 8),
            output_size: u32_at(buf, 12),
            error_size: u32_at(buf, 16),
            execution_time_ms: u32_at(buf, 20),
        })
    }
}

/// Point-in-time job status. 284 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusPayload {
    pub job_id: u32,
    pub status: JobStatus,
    /// 0-100.
    pub progress: u16,
    /// Unix seconds, 0 when not yet reached.
    pub start_time: i64,
    pub end_time: i64,
    /// Child pid while running, 0 otherwise.
    pub pid: i32,
    pub status_message: String,
}

impl JobStatusPayload {
    pub const WIRE_LEN: usize = 28 + STATUS_MESSAGE_WIDTH;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.job_id.to_be_bytes());
        buf.extend_from_slice(&self.status.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.progress.to_be_bytes());
        buf.extend_from_slice(&self.start_time.to_be_bytes());
        buf.extend_from_slice(&self.end_time.to_be_bytes());
        buf.extend_from_slice(&self.pid.to_be_bytes());
        put_str(&mut buf, &self.status_message, STATUS_MESSAGE_WIDTH);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        let raw_status = u16_at(buf, 4);
        let status = JobStatus::from_u16(raw_status).ok_or(PayloadError::BadValue {
            field: "status",
            value: raw_status as u32,
        })?;
        Ok(Self {
            job_id: u32_at(buf, 0),
            status,
            progress: u16_at(buf, 6),
            start_time: i64_at(buf, 8),
            end_time: i64_at(buf, 16),
            pid: i32_at(buf, 24),
            status_message: take_str(buf, 28, STATUS_MESSAGE_WIDTH),
        })
    }
}

/// Status/result request bodies carry just the job id. 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIdPayload {
    pub job_id: u32,
}

impl JobIdPayload {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        self.job_id.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(Self {
            job_id: u32_at(buf, 0),
        })
    }
}

/// Error reply. 4360 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub line: u32,
    pub message: String,
    pub context: String,
}

impl ErrorPayload {
    pub const WIRE_LEN: usize = 8 + MAX_ERROR_MESSAGE + CONTEXT_WIDTH;

    pub fn new(code: ErrorCode, message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            code,
            line: 0,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.code.as_u32().to_be_bytes());
        buf.extend_from_slice(&self.line.to_be_bytes());
        put_str(&mut buf, &self.message, MAX_ERROR_MESSAGE);
        put_str(&mut buf, &self.context, CONTEXT_WIDTH);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        let raw_code = u32_at(buf, 0);
        let code = ErrorCode::from_u32(raw_code).ok_or(PayloadError::BadValue {
            field: "error_code",
            value: raw_code,
        })?;
        Ok(Self {
            code,
            line: u32_at(buf, 4),
            message: take_str(buf, 8, MAX_ERROR_MESSAGE),
            context: take_str(buf, 8 + MAX_ERROR_MESSAGE, CONTEXT_WIDTH),
        })
    }
}

/// Generic admin command body. 520 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommandPayload {
    pub command_type: u16,
    pub flags: u16,
    pub target_id: u32,
    pub data: String,
}

impl AdminCommandPayload {
    pub const WIRE_LEN: usize = 8 + COMMAND_DATA_WIDTH;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.command_type.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.target_id.to_be_bytes());
        put_str(&mut buf, &self.data, COMMAND_DATA_WIDTH);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(Self {
            command_type: u16_at(buf, 0),
            flags: u16_at(buf, 2),
            target_id: u32_at(buf, 4),
            data: take_str(buf, 8, COMMAND_DATA_WIDTH),
        })
    }
}

impl Default for AdminCommandPayload {
    fn default() -> Self {
        Self {
            command_type: 0,
            flags: 0,
            target_id: 0,
            data: String::new(),
        }
    }
}

/// Aggregate server statistics as returned to the admin. 68 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerStatsPayload {
    pub start_time: i64,
    pub current_time: i64,
    pub total_clients: u32,
    pub active_clients: u32,
    pub total_jobs: u32,
    pub active_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub memory_usage_kb: u32,
    pub cpu_usage_percent: f32,
    pub avg_response_time_ms: f32,
}

impl ServerStatsPayload {
    pub const WIRE_LEN: usize = 68;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.start_time.to_be_bytes());
        buf.extend_from_slice(&self.current_time.to_be_bytes());
        buf.extend_from_slice(&self.total_clients.to_be_bytes());
        buf.extend_from_slice(&self.active_clients.to_be_bytes());
        buf.extend_from_slice(&self.total_jobs.to_be_bytes());
        buf.extend_from_slice(&self.active_jobs.to_be_bytes());
        buf.extend_from_slice(&self.completed_jobs.to_be_bytes());
        buf.extend_from_slice(&self.failed_jobs.to_be_bytes());
        buf.extend_from_slice(&self.total_bytes_received.to_be_bytes());
        buf.extend_from_slice(&self.total_bytes_sent.to_be_bytes());
        buf.extend_from_slice(&self.memory_usage_kb.to_be_bytes());
        buf.extend_from_slice(&self.cpu_usage_percent.to_be_bytes());
        buf.extend_from_slice(&self.avg_response_time_ms.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(Self {
            start_time: i64_at(buf, 0),
            current_time: i64_at(buf, 8),
            total_clients: u32_at(buf, 16),
            active_clients: u32_at(buf, 20),
            total_jobs: u32_at(buf, 24),
            active_jobs: u32_at(buf, 28),
            completed_jobs: u32_at(buf, 32),
            failed_jobs: u32_at(buf, 36),
            total_bytes_received: u64_at(buf, 40),
            total_bytes_sent: u64_at(buf, 48),
            memory_usage_kb: u32_at(buf, 56),
            cpu_usage_percent: f32::from_be_bytes(buf[60..64].try_into().unwrap()),
            avg_response_time_ms: f32::from_be_bytes(buf[64..68].try_into().unwrap()),
        })
    }
}
