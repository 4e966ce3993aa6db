//! Per-message session handlers.
//!
//! Each handler validates the session-state precondition, performs the
//! operation, and returns exactly one reply carrying the request's
//! correlation id. Recoverable failures become `Error` replies and the
//! session stays usable; framing-level failures never reach this module.

use crate::files::{is_safe_filename, FileError};
use crate::queue::{JobState, NewJob, QueueError};
use crate::server::ServerContext;
use crate::sessions::{SealedUpload, SessionState, UploadBuffer};
use codeforge_protocol::{
    CompileRequestPayload, CompileResponsePayload, ErrorCode, ErrorPayload, FileChunkPayload,
    FileUploadStartPayload, HelloPayload, JobIdPayload, JobStatusPayload, Message, MessageType,
    PayloadError, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

/// Upper bound on chunks per upload.
const MAX_CHUNKS_PER_FILE: u32 = 1000;

/// The single reply produced for a request.
#[derive(Debug)]
pub struct Reply {
    pub msg_type: MessageType,
    pub correlation_id: u32,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(msg_type: MessageType, correlation_id: u32, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            correlation_id,
            payload,
        }
    }

    pub fn into_message(self) -> Message {
        Message::new(self.msg_type, self.correlation_id, self.payload)
    }
}

fn error_reply(code: ErrorCode, message: &str, session_id: u32, correlation_id: u32) -> Reply {
    let payload = ErrorPayload::new(code, message, format!("session {session_id}"));
    Reply::new(MessageType::Error, correlation_id, payload.encode())
}

fn ack(correlation_id: u32) -> Reply {
    Reply::new(MessageType::Ack, correlation_id, Vec::new())
}

fn decode_error(e: PayloadError, session_id: u32, correlation_id: u32) -> Reply {
    error_reply(
        ErrorCode::InvalidArgument,
        &e.to_string(),
        session_id,
        correlation_id,
    )
}

fn file_error_code(e: &FileError) -> ErrorCode {
    match e {
        FileError::InvalidFilename(_) => ErrorCode::InvalidArgument,
        FileError::TooLarge { .. } => ErrorCode::QuotaExceeded,
        FileError::OutsideRoot(_) => ErrorCode::Permission,
        FileError::NotFound(_) => ErrorCode::NotFound,
        FileError::Io { .. } => ErrorCode::FileIo,
    }
}

/// Dispatch one framed message for a session.
pub fn handle_message(ctx: &ServerContext, session_id: u32, msg: &Message) -> Reply {
    let corr = msg.header.correlation_id;
    match msg.header.msg_type {
        MessageType::Hello => hello(ctx, session_id, msg, corr),
        MessageType::FileUploadStart => upload_start(ctx, session_id, msg, corr),
        MessageType::FileUploadChunk => upload_chunk(ctx, session_id, msg, corr),
        MessageType::FileUploadEnd => upload_end(ctx, session_id, corr),
        MessageType::CompileRequest => compile_request(ctx, session_id, msg, corr),
        MessageType::StatusRequest => status_request(ctx, session_id, msg, corr),
        MessageType::ResultRequest => result_request(ctx, session_id, msg, corr),
        MessageType::Ping => Reply::new(MessageType::Pong, corr, Vec::new()),
        other => {
            warn!(session_id, msg_type = ?other, "unexpected message type on client session");
            error_reply(ErrorCode::InvalidArgument, "unexpected message type", session_id, corr)
        }
    }
}

fn hello(ctx: &ServerContext, session_id: u32, msg: &Message, corr: u32) -> Reply {
    let hello = match HelloPayload::decode(&msg.payload) {
        Ok(p) => p,
        Err(e) => return decode_error(e, session_id, corr),
    };

    let accepted = ctx.registry.with_session(session_id, |s| {
        if s.state != SessionState::Connecting {
            return false;
        }
        s.name = hello.name.clone();
        s.platform = hello.platform.clone();
        s.state = SessionState::Authenticated;
        true
    });

    match accepted {
        Some(true) => {
            info!(session_id, name = %hello.name, platform = %hello.platform, "session authenticated");
            let response = HelloPayload {
                version: PROTOCOL_VERSION,
                capabilities: 0,
                name: "codeforge-server".to_string(),
                platform: std::env::consts::OS.to_string(),
            };
            Reply::new(MessageType::Hello, corr, response.encode())
        }
        Some(false) => error_reply(ErrorCode::Permission, "handshake already completed", session_id, corr),
        None => error_reply(ErrorCode::Internal, "session record missing", session_id, corr),
    }
}

fn upload_start(ctx: &ServerContext, session_id: u32, msg: &Message, corr: u32) -> Reply {
    let start = match FileUploadStartPayload::decode(&msg.payload) {
        Ok(p) => p,
        Err(e) => return decode_error(e, session_id, corr),
    };

    let max_file_size = ctx.config_read().max_file_size;
    if start.file_size > max_file_size {
        return error_reply(ErrorCode::QuotaExceeded, "file too large", session_id, corr);
    }
    if start.chunk_count == 0 || start.chunk_count > MAX_CHUNKS_PER_FILE {
        return error_reply(ErrorCode::QuotaExceeded, "invalid chunk count", session_id, corr);
    }
    if !is_safe_filename(&start.filename) {
        return error_reply(ErrorCode::InvalidArgument, "unsafe filename", session_id, corr);
    }

    let accepted = ctx.registry.with_session(session_id, |s| {
        if !matches!(s.state, SessionState::Authenticated | SessionState::Idle) {
            return false;
        }
        s.upload = Some(UploadBuffer {
            filename: start.filename.clone(),
            expected_size: start.file_size,
            expected_chunks: start.chunk_count,
            received_chunks: 0,
            data: Vec::with_capacity(start.file_size.min(max_file_size) as usize),
        });
        s.state = SessionState::Uploading;
        true
    });

    match accepted {
        Some(true) => {
            debug!(session_id, filename = %start.filename, size = start.file_size, "upload started");
            ack(corr)
        }
        Some(false) => error_reply(ErrorCode::Permission, "not ready for upload", session_id, corr),
        None => error_reply(ErrorCode::Internal, "session record missing", session_id, corr),
    }
}

fn upload_chunk(ctx: &ServerContext, session_id: u32, msg: &Message, corr: u32) -> Reply {
    let chunk = match FileChunkPayload::decode(&msg.payload) {
        Ok(p) => p,
        Err(e) => return decode_error(e, session_id, corr),
    };

    enum ChunkResult {
        Ok,
        WrongState,
        SizeMismatch,
        Overflow,
        TooManyChunks,
    }

    let result = ctx
        .registry
        .with_session(session_id, |s| {
            if s.state != SessionState::Uploading {
                return ChunkResult::WrongState;
            }
            let Some(upload) = s.upload.as_mut() else {
                return ChunkResult::WrongState;
            };
            if chunk.chunk_size as usize != chunk.data.len() {
                return ChunkResult::SizeMismatch;
            }
            if upload.received_chunks >= upload.expected_chunks {
                return ChunkResult::TooManyChunks;
            }
            if upload.data.len() as u64 + chunk.data.len() as u64 > upload.expected_size {
                return ChunkResult::Overflow;
            }
            upload.data.extend_from_slice(&chunk.data);
            upload.received_chunks += 1;
            ChunkResult::Ok
        })
        .unwrap_or(ChunkResult::WrongState);

    match result {
        ChunkResult::Ok => ack(corr),
        ChunkResult::WrongState => {
            error_reply(ErrorCode::Permission, "no upload in progress", session_id, corr)
        }
        ChunkResult::SizeMismatch => {
            error_reply(ErrorCode::InvalidArgument, "chunk size mismatch", session_id, corr)
        }
        ChunkResult::Overflow => {
            error_reply(ErrorCode::QuotaExceeded, "upload exceeds declared size", session_id, corr)
        }
        ChunkResult::TooManyChunks => {
            error_reply(ErrorCode::InvalidArgument, "more chunks than declared", session_id, corr)
        }
    }
}

fn upload_end(ctx: &ServerContext, session_id: u32, corr: u32) -> Reply {
    enum EndResult {
        Sealed(String),
        WrongState,
        Incomplete { expected: u64, actual: u64 },
    }

    let result = ctx
        .registry
        .with_session(session_id, |s| {
            if s.state != SessionState::Uploading {
                return EndResult::WrongState;
            }
            let Some(upload) = s.upload.take() else {
                return EndResult::WrongState;
            };
            s.state = SessionState::Idle;
            if upload.data.len() as u64 != upload.expected_size {
                return EndResult::Incomplete {
                    expected: upload.expected_size,
                    actual: upload.data.len() as u64,
                };
            }
            let filename = upload.filename.clone();
            s.sealed_upload = Some(SealedUpload {
                filename: upload.filename,
                data: upload.data,
            });
            EndResult::Sealed(filename)
        })
        .unwrap_or(EndResult::WrongState);

    match result {
        EndResult::Sealed(filename) => {
            debug!(session_id, filename = %filename, "upload sealed");
            ack(corr)
        }
        EndResult::WrongState => {
            error_reply(ErrorCode::Permission, "no upload in progress", session_id, corr)
        }
        EndResult::Incomplete { expected, actual } => error_reply(
            ErrorCode::InvalidArgument,
            &format!("upload incomplete: declared {expected} bytes, received {actual}"),
            session_id,
            corr,
        ),
    }
}

fn compile_request(ctx: &ServerContext, session_id: u32, msg: &Message, corr: u32) -> Reply {
    let request = match CompileRequestPayload::decode(&msg.payload) {
        Ok(p) => p,
        Err(e) => return decode_error(e, session_id, corr),
    };

    if ctx.compilers.resolve(request.language).is_none() {
        return error_reply(
            ErrorCode::UnsupportedLanguage,
            &format!("no toolchain for {}", request.language),
            session_id,
            corr,
        );
    }

    // Claim the sealed upload under the session lock; everything that
    // touches the filesystem happens with the lock released.
    enum Claim {
        Upload(SealedUpload),
        WrongState,
        NoUpload,
        WrongFile(String),
    }
    let claim = ctx
        .registry
        .with_session(session_id, |s| {
            if s.state != SessionState::Idle {
                return Claim::WrongState;
            }
            match s.sealed_upload.take() {
                Some(upload) if upload.filename == request.filename => Claim::Upload(upload),
                Some(upload) => {
                    let name = upload.filename.clone();
                    s.sealed_upload = Some(upload);
                    Claim::WrongFile(name)
                }
                None => Claim::NoUpload,
            }
        })
        .unwrap_or(Claim::WrongState);

    let upload = match claim {
        Claim::Upload(upload) => upload,
        Claim::WrongState => {
            return error_reply(ErrorCode::Permission, "session not ready", session_id, corr)
        }
        Claim::NoUpload => {
            return error_reply(ErrorCode::NotFound, "no uploaded file to compile", session_id, corr)
        }
        Claim::WrongFile(have) => {
            return error_reply(
                ErrorCode::NotFound,
                &format!("uploaded file is `{have}`, not `{}`", request.filename),
                session_id,
                corr,
            )
        }
    };

    let max_file_size = ctx.config_read().max_file_size;
    let job_id = ctx.queue.reserve_job_id();
    let source_path = match ctx.files.save_uploaded(
        job_id,
        session_id,
        &request.filename,
        &upload.data,
        max_file_size,
    ) {
        Ok(path) => path,
        Err(e) => {
            warn!(session_id, job_id, error = %e, "failed to persist uploaded source");
            return error_reply(file_error_code(&e), &e.to_string(), session_id, corr);
        }
    };

    let submitted = ctx.queue.submit(
        job_id,
        NewJob {
            session_id,
            correlation_id: corr,
            language: request.language,
            mode: request.mode,
            priority: request.priority.min(u8::MAX as u16) as u8,
            source_file: request.filename.clone(),
            source_path,
            compiler_args: request.compiler_args.clone(),
            execution_args: request.execution_args.clone(),
        },
    );
    if let Err(e) = submitted {
        ctx.files.cleanup_job(job_id);
        let code = match e {
            QueueError::Full { .. } => ErrorCode::QuotaExceeded,
            _ => ErrorCode::Internal,
        };
        return error_reply(code, &e.to_string(), session_id, corr);
    }

    ctx.registry.with_session(session_id, |s| {
        s.state = SessionState::Processing;
        s.active_jobs += 1;
    });
    ctx.stats.job_submitted();

    info!(
        session_id,
        job_id,
        language = %request.language,
        mode = %request.mode,
        filename = %request.filename,
        "job submitted"
    );

    let response = CompileResponsePayload {
        job_id,
        status: JobState::Queued.to_wire(),
        exit_code: 0,
        output_size: 0,
        error_size: 0,
        execution_time_ms: 0,
    };
    Reply::new(MessageType::CompileResponse, corr, response.encode())
}

fn status_request(ctx: &ServerContext, session_id: u32, msg: &Message, corr: u32) -> Reply {
    let request = match JobIdPayload::decode(&msg.payload) {
        Ok(p) => p,
        Err(e) => return decode_error(e, session_id, corr),
    };

    let Some(job) = ctx.queue.find(request.job_id) else {
        return error_reply(ErrorCode::NotFound, "job not found", session_id, corr);
    };
    if job.session_id != session_id {
        return error_reply(ErrorCode::Permission, "access denied", session_id, corr);
    }

    let progress: u16 = match job.state {
        JobState::Completed => 100,
        JobState::Running => 50,
        _ => 0,
    };

    let mut status_message = format!("Job {}: {}", job.job_id, job.state);
    if job.state == JobState::Queued {
        if let Some(wait) = ctx
            .queue
            .estimated_wait(job.job_id, ctx.stats.mean_job_secs())
        {
            status_message.push_str(&format!(" (estimated wait {}s)", wait.as_secs()));
        }
    }

    let payload = JobStatusPayload {
        job_id: job.job_id,
        status: job.state.to_wire(),
        progress,
        start_time: job.started_at.map(|t| t.timestamp()).unwrap_or(0),
        end_time: job.ended_at.map(|t| t.timestamp()).unwrap_or(0),
        pid: job.pid.unwrap_or(0),
        status_message,
    };
    Reply::new(MessageType::StatusResponse, corr, payload.encode())
}

fn result_request(ctx: &ServerContext, session_id: u32, msg: &Message, corr: u32) -> Reply {
    let request = match JobIdPayload::decode(&msg.payload) {
        Ok(p) => p,
        Err(e) => return decode_error(e, session_id, corr),
    };

    let Some(job) = ctx.queue.find(request.job_id) else {
        return error_reply(ErrorCode::NotFound, "job not found", session_id, corr);
    };
    if job.session_id != session_id {
        return error_reply(ErrorCode::Permission, "access denied", session_id, corr);
    }
    if !job.state.is_terminal() {
        return error_reply(ErrorCode::Permission, "job not completed", session_id, corr);
    }

    // A delivered result ends the session's interest in the job.
    ctx.registry.with_session(session_id, |s| {
        s.active_jobs = s.active_jobs.saturating_sub(1);
        if s.active_jobs == 0 && s.state == SessionState::Processing {
            s.state = SessionState::Idle;
        }
    });

    let response = CompileResponsePayload {
        job_id: job.job_id,
        status: job.state.to_wire(),
        exit_code: job.exit_code.unwrap_or(-1),
        output_size: job.output_size.min(u32::MAX as u64) as u32,
        error_size: job.error_size.min(u32::MAX as u64) as u32,
        execution_time_ms: (job.wall_secs() * 1000.0) as u32,
    };
    Reply::new(MessageType::ResultResponse, corr, response.encode())
}
