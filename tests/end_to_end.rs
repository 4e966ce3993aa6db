//! End-to-end scenarios against a live server on a loopback port: real
//! TCP clients, the real admin unix socket, and real toolchains.
//! Compiler-dependent cases probe for the toolchain and skip when the
//! host does not have it. Wall-clock scenarios run with scaled-down
//! configured timeouts; the machinery under test is the same.

use codeforge::{Server, ServerConfig, ServerContext};
use codeforge_protocol::{
    codec, AdminCommandPayload, CompileRequestPayload, CompileResponsePayload, ErrorCode,
    ErrorPayload, ExecutionMode, FileChunkPayload, FileUploadStartPayload, HelloPayload,
    JobIdPayload, JobStatus, JobStatusPayload, Language, Message, MessageType, ServerStatsPayload,
};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct LiveServer {
    _dir: TempDir,
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    admin_path: PathBuf,
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.ctx.request_shutdown();
    }
}

fn free_port() -> u16 {
    // Bind to an ephemeral port, note it, release it for the server.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server, or return None when a required toolchain is absent.
fn start_server(
    required: &[Language],
    tweak: impl FnOnce(&mut ServerConfig),
) -> Option<LiveServer> {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        port: free_port(),
        admin_socket: dir.path().join("admin.sock"),
        processing_dir: dir.path().join("processing"),
        outgoing_dir: dir.path().join("outgoing"),
        compile_timeout: 60,
        execution_timeout: 10,
        ..Default::default()
    };
    tweak(&mut config);

    let server = match Server::bootstrap(config) {
        Ok(server) => server,
        Err(codeforge::InitError::NoToolchains) => return None,
        Err(e) => panic!("bootstrap failed: {e}"),
    };
    let ctx = server.context();
    for language in required {
        if ctx.compilers.resolve(*language).is_none() {
            ctx.request_shutdown();
            return None;
        }
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()));
    let admin_path = ctx.config_read().admin_socket.clone();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Wait for the dispatcher to come up.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20))
            }
            Err(e) => panic!("server never came up: {e}"),
        }
    }

    Some(LiveServer {
        _dir: dir,
        ctx,
        addr,
        admin_path,
    })
}

struct Client {
    stream: TcpStream,
    next_corr: u32,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        Self {
            stream,
            next_corr: 1,
        }
    }

    fn roundtrip(&mut self, msg_type: MessageType, payload: Vec<u8>) -> Message {
        let corr = self.next_corr;
        self.next_corr += 1;
        let message = Message::new(msg_type, corr, payload);
        codec::write_message(&mut self.stream, &message).unwrap();
        let reply = codec::read_message(&mut self.stream).unwrap();
        assert_eq!(reply.header.correlation_id, corr, "reply paired to wrong request");
        reply
    }

    fn hello(&mut self) {
        let payload = HelloPayload {
            version: (1, 0, 0),
            capabilities: 0,
            name: "e2e".to_string(),
            platform: "linux".to_string(),
        };
        let reply = self.roundtrip(MessageType::Hello, payload.encode());
        assert_eq!(reply.header.msg_type, MessageType::Hello);
    }

    fn upload(&mut self, filename: &str, data: &[u8]) {
        let start = FileUploadStartPayload {
            file_size: data.len() as u64,
            chunk_count: 1,
            chunk_size: data.len() as u32,
            filename: filename.to_string(),
            file_checksum: 0,
        };
        let reply = self.roundtrip(MessageType::FileUploadStart, start.encode());
        assert_eq!(reply.header.msg_type, MessageType::Ack);

        let chunk = FileChunkPayload {
            chunk_id: 0,
            chunk_size: data.len() as u32,
            chunk_checksum: 0,
            data: data.to_vec(),
        };
        let reply = self.roundtrip(MessageType::FileUploadChunk, chunk.encode());
        assert_eq!(reply.header.msg_type, MessageType::Ack);

        let reply = self.roundtrip(MessageType::FileUploadEnd, Vec::new());
        assert_eq!(reply.header.msg_type, MessageType::Ack);
    }

    fn compile(&mut self, language: Language, mode: ExecutionMode, filename: &str) -> u32 {
        let payload = CompileRequestPayload {
            language,
            mode,
            flags: 0,
            priority: 5,
            filename: filename.to_string(),
            compiler_args: String::new(),
            execution_args: String::new(),
        };
        let reply = self.roundtrip(MessageType::CompileRequest, payload.encode());
        assert_eq!(reply.header.msg_type, MessageType::CompileResponse);
        let response = CompileResponsePayload::decode(&reply.payload).unwrap();
        assert_eq!(response.status, JobStatus::Queued);
        response.job_id
    }

    fn status(&mut self, job_id: u32) -> JobStatusPayload {
        let reply = self.roundtrip(MessageType::StatusRequest, JobIdPayload { job_id }.encode());
        assert_eq!(reply.header.msg_type, MessageType::StatusResponse);
        JobStatusPayload::decode(&reply.payload).unwrap()
    }

    fn wait_terminal(&mut self, job_id: u32, deadline: Duration) -> JobStatusPayload {
        let started = Instant::now();
        loop {
            let status = self.status(job_id);
            if !matches!(
                status.status,
                JobStatus::Queued | JobStatus::Compiling | JobStatus::Running
            ) {
                return status;
            }
            assert!(
                started.elapsed() < deadline,
                "job {job_id} stuck in {:?}",
                status.status
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn result(&mut self, job_id: u32) -> CompileResponsePayload {
        let reply = self.roundtrip(MessageType::ResultRequest, JobIdPayload { job_id }.encode());
        assert_eq!(reply.header.msg_type, MessageType::ResultResponse);
        CompileResponsePayload::decode(&reply.payload).unwrap()
    }
}

struct AdminClient {
    stream: UnixStream,
    next_corr: u32,
}

impl AdminClient {
    fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut client = Self {
            stream,
            next_corr: 1000,
        };
        let reply = client.roundtrip(MessageType::AdminConnect, Vec::new());
        assert_eq!(reply.header.msg_type, MessageType::Ack);
        client
    }

    fn roundtrip(&mut self, msg_type: MessageType, payload: Vec<u8>) -> Message {
        let corr = self.next_corr;
        self.next_corr += 1;
        let message = Message::new(msg_type, corr, payload);
        codec::write_message(&mut self.stream, &message).unwrap();
        let reply = codec::read_message(&mut self.stream).unwrap();
        assert_eq!(reply.header.correlation_id, corr);
        reply
    }
}

#[test]
fn e2e_c_hello_world() {
    let Some(server) = start_server(&[Language::C], |_| {}) else {
        return;
    };
    let mut client = Client::connect(server.addr);
    client.hello();
    client.upload("hello.c", b"#include <stdio.h>\nint main(){puts(\"hi\");return 0;}\n");
    let job_id = client.compile(Language::C, ExecutionMode::CompileAndRun, "hello.c");

    let status = client.wait_terminal(job_id, Duration::from_secs(60));
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.progress, 100);

    let result = client.result(job_id);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output_size, 3); // "hi\n"
    assert_eq!(result.error_size, 0);

    let output = server
        .ctx
        .files
        .load(&format!("job_{job_id}_output.txt"))
        .unwrap();
    assert_eq!(output, b"hi\n");
}

#[test]
fn e2e_c_compile_error() {
    let Some(server) = start_server(&[Language::C], |_| {}) else {
        return;
    };
    let mut client = Client::connect(server.addr);
    client.hello();
    client.upload("bad.c", b"int main(){ undeclared = 1; }\n");
    let job_id = client.compile(Language::C, ExecutionMode::CompileOnly, "bad.c");

    let status = client.wait_terminal(job_id, Duration::from_secs(60));
    assert_eq!(status.status, JobStatus::Failed);

    let result = client.result(job_id);
    assert_ne!(result.exit_code, 0);
    assert!(result.error_size > 0);

    let stderr = server
        .ctx
        .files
        .load(&format!("job_{job_id}_error.txt"))
        .unwrap();
    assert!(String::from_utf8_lossy(&stderr).contains("undeclared"));
}

#[test]
fn e2e_timeout_scaled() {
    let Some(server) = start_server(&[Language::Python], |config| {
        config.execution_timeout = 2;
    }) else {
        return;
    };
    let mut client = Client::connect(server.addr);
    client.hello();
    client.upload("spin.py", b"while True: pass\n");

    let started = Instant::now();
    let job_id = client.compile(Language::Python, ExecutionMode::InterpretOnly, "spin.py");
    let status = client.wait_terminal(job_id, Duration::from_secs(30));
    let elapsed = started.elapsed();

    assert_eq!(status.status, JobStatus::Timeout);
    assert!(elapsed >= Duration::from_secs(2), "finished early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(10), "finished late: {elapsed:?}");

    let result = client.result(job_id);
    assert_eq!(result.exit_code, 124);
}

#[test]
fn e2e_admin_cancel_mid_run() {
    let Some(server) = start_server(&[Language::Python], |config| {
        config.execution_timeout = 30;
    }) else {
        return;
    };
    let mut client = Client::connect(server.addr);
    client.hello();
    client.upload("spin.py", b"while True: pass\n");
    let job_id = client.compile(Language::Python, ExecutionMode::InterpretOnly, "spin.py");

    // Wait until the child is actually running.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = client.status(job_id);
        if status.status == JobStatus::Running && status.pid != 0 {
            break;
        }
        assert!(Instant::now() < deadline, "job never started running");
        std::thread::sleep(Duration::from_millis(50));
    }

    let mut admin = AdminClient::connect(&server.admin_path);
    let kill = AdminCommandPayload {
        target_id: job_id,
        ..Default::default()
    };
    let cancel_sent = Instant::now();
    let reply = admin.roundtrip(MessageType::AdminKillJob, kill.encode());
    assert_eq!(reply.header.msg_type, MessageType::Ack);

    let status = client.wait_terminal(job_id, Duration::from_secs(5));
    assert_eq!(status.status, JobStatus::Cancelled);
    assert!(cancel_sent.elapsed() < Duration::from_secs(5));

    // Cancellation flips the state immediately; wait for the supervisor
    // to reap the child and record the exit code before fetching.
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.ctx.queue.find(job_id).unwrap().exit_code.is_none() {
        assert!(Instant::now() < deadline, "exit code never recorded");
        std::thread::sleep(Duration::from_millis(50));
    }

    let result = client.result(job_id);
    assert_eq!(result.exit_code, 128 + 15); // SIGTERM
}

#[test]
fn e2e_session_isolation() {
    let Some(server) = start_server(&[Language::Python], |_| {}) else {
        return;
    };
    let mut alice = Client::connect(server.addr);
    alice.hello();
    alice.upload("ok.py", b"print('done')\n");
    let job_id = alice.compile(Language::Python, ExecutionMode::InterpretOnly, "ok.py");

    let mut bob = Client::connect(server.addr);
    bob.hello();
    let reply = bob.roundtrip(MessageType::ResultRequest, JobIdPayload { job_id }.encode());
    assert_eq!(reply.header.msg_type, MessageType::Error);
    let err = ErrorPayload::decode(&reply.payload).unwrap();
    assert_eq!(err.code, ErrorCode::Permission);

    // The owner gets the artefacts once the job completes.
    alice.wait_terminal(job_id, Duration::from_secs(30));
    let result = alice.result(job_id);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output_size, 5); // "done\n"
}

#[test]
fn e2e_admin_stats_after_mixed_jobs() {
    let Some(server) = start_server(&[Language::Python], |_| {}) else {
        return;
    };
    let mut client = Client::connect(server.addr);
    client.hello();

    client.upload("ok.py", b"print('x')\n");
    let good = client.compile(Language::Python, ExecutionMode::InterpretOnly, "ok.py");
    client.wait_terminal(good, Duration::from_secs(30));
    client.result(good);

    client.upload("bad.py", b"import sys; sys.exit(3)\n");
    let bad = client.compile(Language::Python, ExecutionMode::InterpretOnly, "bad.py");
    client.wait_terminal(bad, Duration::from_secs(30));

    let mut admin = AdminClient::connect(&server.admin_path);
    let reply = admin.roundtrip(MessageType::AdminServerStats, AdminCommandPayload::default().encode());
    let stats = ServerStatsPayload::decode(&reply.payload).unwrap();

    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.completed_jobs, 1);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.active_clients, 1);
}

#[test]
fn e2e_idle_session_is_reaped() {
    let Some(server) = start_server(&[], |config| {
        config.client_timeout = 1;
    }) else {
        return;
    };
    let mut client = Client::connect(server.addr);
    client.hello();

    // Stay silent past the idle timeout; within one tick the server
    // closes the socket without notice.
    std::thread::sleep(Duration::from_millis(2500));
    let mut buf = [0u8; 1];
    match client.stream.read(&mut buf) {
        Ok(0) => {}
        Ok(_) => panic!("expected the connection to be closed"),
        Err(_) => {} // reset also acceptable
    }
    assert_eq!(server.ctx.registry.count(), 0);
}

#[test]
fn e2e_admin_graceful_shutdown() {
    let Some(server) = start_server(&[], |_| {}) else {
        return;
    };
    let mut admin = AdminClient::connect(&server.admin_path);
    let cmd = AdminCommandPayload::default();
    let reply = admin.roundtrip(MessageType::AdminServerShutdown, cmd.encode());
    assert_eq!(reply.header.msg_type, MessageType::Ack);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.ctx.shutting_down() {
        assert!(Instant::now() < deadline, "shutdown event never set");
        std::thread::sleep(Duration::from_millis(20));
    }
    // New connections are no longer serviced once the dispatcher exits.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(server.ctx.registry.count(), 0);
}
