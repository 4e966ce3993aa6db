//! Shared test fixtures: an in-process server context plus helpers for
//! driving the session protocol without sockets.

#![allow(dead_code)]

use codeforge::compilers::{fake_descriptor, CompilerRegistry};
use codeforge::sessions::handlers::{handle_message, Reply};
use codeforge::{ServerConfig, ServerContext};
use codeforge_protocol::{
    CompileRequestPayload, ExecutionMode, FileChunkPayload, FileUploadStartPayload, HelloPayload,
    Language, Message, MessageType,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Build a context with fabricated descriptors for the given languages,
/// so tests do not depend on which toolchains the host has installed.
pub fn context_with(languages: &[Language]) -> (TempDir, Arc<ServerContext>) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        processing_dir: dir.path().join("processing"),
        outgoing_dir: dir.path().join("outgoing"),
        compile_timeout: 20,
        execution_timeout: 5,
        ..Default::default()
    };
    let registry = CompilerRegistry::with_descriptors(
        languages.iter().copied().map(fake_descriptor).collect(),
    );
    let ctx = ServerContext::build(config, registry).unwrap();
    (dir, Arc::new(ctx))
}

/// Admit a detached session (no socket) straight into the registry.
pub fn admit(ctx: &ServerContext) -> u32 {
    ctx.registry.admit("127.0.0.1:40000".to_string(), None).unwrap()
}

pub fn hello_message(corr: u32) -> Message {
    let payload = HelloPayload {
        version: (1, 0, 0),
        capabilities: 0,
        name: "test-client".to_string(),
        platform: "linux".to_string(),
    };
    Message::new(MessageType::Hello, corr, payload.encode())
}

/// Drive the handshake for a freshly admitted session.
pub fn handshake(ctx: &ServerContext, session_id: u32) -> Reply {
    handle_message(ctx, session_id, &hello_message(1))
}

/// Drive a complete single-chunk upload.
pub fn upload(ctx: &ServerContext, session_id: u32, filename: &str, data: &[u8]) -> Vec<Reply> {
    let start = FileUploadStartPayload {
        file_size: data.len() as u64,
        chunk_count: 1,
        chunk_size: data.len() as u32,
        filename: filename.to_string(),
        file_checksum: 0,
    };
    let chunk = FileChunkPayload {
        chunk_id: 0,
        chunk_size: data.len() as u32,
        chunk_checksum: 0,
        data: data.to_vec(),
    };
    vec![
        handle_message(ctx, session_id, &Message::new(MessageType::FileUploadStart, 10, start.encode())),
        handle_message(ctx, session_id, &Message::new(MessageType::FileUploadChunk, 11, chunk.encode())),
        handle_message(ctx, session_id, &Message::new(MessageType::FileUploadEnd, 12, Vec::new())),
    ]
}

pub fn compile_message(
    corr: u32,
    language: Language,
    mode: ExecutionMode,
    filename: &str,
) -> Message {
    let payload = CompileRequestPayload {
        language,
        mode,
        flags: 0,
        priority: 5,
        filename: filename.to_string(),
        compiler_args: String::new(),
        execution_args: String::new(),
    };
    Message::new(MessageType::CompileRequest, corr, payload.encode())
}

/// Handshake + upload + compile, returning the job id from the response.
pub fn submit_job(
    ctx: &ServerContext,
    session_id: u32,
    language: Language,
    mode: ExecutionMode,
    filename: &str,
    source: &[u8],
) -> u32 {
    for reply in upload(ctx, session_id, filename, source) {
        assert_eq!(reply.msg_type, MessageType::Ack, "upload step failed");
    }
    let reply = handle_message(ctx, session_id, &compile_message(20, language, mode, filename));
    assert_eq!(reply.msg_type, MessageType::CompileResponse);
    codeforge_protocol::CompileResponsePayload::decode(&reply.payload)
        .unwrap()
        .job_id
}
