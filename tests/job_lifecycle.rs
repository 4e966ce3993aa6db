//! Job lifecycle invariants across the queue and supervisor: progress
//! out of Queued and Running, terminal immutability, cancellation
//! liveness, priority reordering, and retention GC.

mod fixtures;

use codeforge::queue::{supervisor, JobState};
use codeforge::sessions::handlers::handle_message;
use codeforge_protocol::{ExecutionMode, JobIdPayload, Language, Message, MessageType};
use fixtures::{admit, context_with, handshake, submit_job};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Spin the supervisor on its own thread until the closure is
/// satisfied or the deadline passes.
fn with_supervisor<F: Fn() -> bool>(ctx: &Arc<codeforge::ServerContext>, deadline: Duration, done: F) -> bool {
    let worker = {
        let ctx = Arc::clone(ctx);
        std::thread::spawn(move || supervisor::run(ctx))
    };
    let started = Instant::now();
    let ok = loop {
        if done() {
            break true;
        }
        if started.elapsed() > deadline {
            break false;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    ctx.request_shutdown();
    worker.join().unwrap();
    ok
}

#[test]
fn test_job_leaves_queued_then_running() {
    let (_dir, ctx) = context_with(&[Language::Rust]); // no rustc binary needed: the spawn fails fast
    let sid = admit(&ctx);
    handshake(&ctx, sid);
    let job_id = submit_job(
        &ctx,
        sid,
        Language::Rust,
        ExecutionMode::CompileOnly,
        "a.rs",
        b"fn main(){}",
    );
    assert_eq!(ctx.queue.find(job_id).unwrap().state, JobState::Queued);

    let reached_terminal = with_supervisor(&ctx, Duration::from_secs(30), || {
        ctx.queue.find(job_id).is_some_and(|j| j.state.is_terminal())
    });
    assert!(reached_terminal, "job never reached a terminal state");
}

#[test]
fn test_terminal_job_is_immutable_to_cancel() {
    let (_dir, ctx) = context_with(&[Language::C]);
    let sid = admit(&ctx);
    handshake(&ctx, sid);
    let job_id = submit_job(&ctx, sid, Language::C, ExecutionMode::CompileOnly, "a.c", b"x");

    ctx.queue.cancel(job_id, false).unwrap();
    let first_end = ctx.queue.find(job_id).unwrap().ended_at;

    assert!(ctx.queue.cancel(job_id, false).is_err());
    assert!(ctx.queue.cancel(job_id, true).is_err());
    let job = ctx.queue.find(job_id).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.ended_at, first_end);
}

#[test]
fn test_cancelled_queued_job_is_never_started() {
    let (_dir, ctx) = context_with(&[Language::C]);
    let sid = admit(&ctx);
    handshake(&ctx, sid);
    let job_id = submit_job(&ctx, sid, Language::C, ExecutionMode::CompileOnly, "a.c", b"x");
    ctx.queue.cancel(job_id, false).unwrap();

    // The supervisor must skip the cancelled entry and go idle.
    let stayed_cancelled = with_supervisor(&ctx, Duration::from_millis(500), || false);
    assert!(!stayed_cancelled); // deadline elapsed without other outcomes
    let job = ctx.queue.find(job_id).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.started_at.is_none());
}

#[test]
fn test_cancellation_liveness_for_running_job() {
    // Needs a real interpreter to have something long-running to kill.
    if codeforge::CompilerRegistry::detect()
        .resolve(Language::Python)
        .is_none()
    {
        return;
    }
    let (_dir, ctx) = context_with(&[Language::Python]);
    let sid = admit(&ctx);
    handshake(&ctx, sid);
    let job_id = submit_job(
        &ctx,
        sid,
        Language::Python,
        ExecutionMode::InterpretOnly,
        "spin.py",
        b"while True: pass",
    );

    let cancelled = with_supervisor(&ctx, Duration::from_secs(10), || {
        let job = ctx.queue.find(job_id).unwrap();
        if job.state == JobState::Running && job.pid.is_some() {
            // Cancel mid-run, once.
            let _ = ctx.queue.cancel(job_id, false);
        }
        job.state == JobState::Cancelled && job.exit_code.is_some()
    });
    assert!(cancelled, "running job did not reach Cancelled in time");

    let job = ctx.queue.find(job_id).unwrap();
    // SIGTERM death surfaces as 128 + 15 through the supervisor reap.
    assert_eq!(job.exit_code, Some(128 + 15));
}

#[test]
fn test_priority_reorder_prefers_high_priority_queued_jobs() {
    let (_dir, ctx) = context_with(&[Language::C]);
    let sid = admit(&ctx);
    handshake(&ctx, sid);

    let make = |priority: u8| {
        let id = ctx.queue.reserve_job_id();
        ctx.queue
            .submit(
                id,
                codeforge::NewJob {
                    session_id: sid,
                    correlation_id: 1,
                    language: Language::C,
                    mode: ExecutionMode::CompileOnly,
                    priority,
                    source_file: "a.c".into(),
                    source_path: "/tmp/a.c".into(),
                    compiler_args: String::new(),
                    execution_args: String::new(),
                },
            )
            .unwrap()
    };

    let low = make(2);
    let high = make(9);
    let normal = make(5);
    ctx.queue.reorder_by_priority();

    let order: Vec<u32> = ctx.queue.list_all().iter().map(|j| j.job_id).collect();
    assert_eq!(order, vec![high, normal, low]);

    // FIFO within equal priority: a second high submission lands after
    // the first.
    let high2 = make(9);
    ctx.queue.reorder_by_priority();
    let order: Vec<u32> = ctx.queue.list_all().iter().map(|j| j.job_id).collect();
    assert_eq!(order, vec![high, high2, normal, low]);
}

#[test]
fn test_retention_gc_frees_job_and_files() {
    let (_dir, ctx) = context_with(&[Language::C]);
    let sid = admit(&ctx);
    handshake(&ctx, sid);
    let job_id = submit_job(&ctx, sid, Language::C, ExecutionMode::CompileOnly, "a.c", b"x");
    ctx.queue.cancel(job_id, false).unwrap();
    assert!(!ctx.files.list_job(job_id).is_empty());

    let removed = ctx.queue.collect_garbage(Duration::ZERO);
    assert_eq!(removed, vec![job_id]);
    for id in removed {
        ctx.files.cleanup_job(id);
    }

    assert!(ctx.queue.find(job_id).is_none());
    assert!(ctx.files.list_job(job_id).is_empty());

    // A post-GC result request is a clean NotFound, not a stale hit.
    let request = Message::new(MessageType::ResultRequest, 9, JobIdPayload { job_id }.encode());
    let reply = handle_message(&ctx, sid, &request);
    assert_eq!(reply.msg_type, MessageType::Error);
}

#[test]
fn test_session_removal_cancels_its_jobs() {
    let (_dir, ctx) = context_with(&[Language::C]);
    let sid = admit(&ctx);
    handshake(&ctx, sid);
    let a = submit_job(&ctx, sid, Language::C, ExecutionMode::CompileOnly, "a.c", b"x");

    let cancelled = ctx.queue.cancel_all_for_session(sid, false);
    assert_eq!(cancelled, 1);
    assert_eq!(ctx.queue.find(a).unwrap().state, JobState::Cancelled);
}
