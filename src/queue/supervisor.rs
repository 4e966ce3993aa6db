//! Queue supervisor.
//!
//! The single worker that drains the job queue: materialise a sandbox,
//! run the phases the execution mode calls for, persist captured output
//! as artefacts, and drive the job to its terminal state. Cancellation
//! may land at any point; the supervisor observes it after reaping the
//! child and leaves the Cancelled state untouched.
//!
//! The idle tick doubles as the maintenance timer: once per
//! `cleanup_interval` it sweeps expired temporary files and
//! garbage-collects terminal jobs past the retention grace period.

use crate::compilers::executor::{create_sandbox, remove_sandbox, RunningChild, TIMEOUT_EXIT_CODE};
use crate::compilers::{CommandSpec, CompilerDescriptor};
use crate::queue::{Job, JobOutcome, JobState};
use crate::server::ServerContext;
use crate::stats::JobDisposition;
use chrono::Utc;
use codeforge_protocol::{ErrorCode, ExecutionMode};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const IDLE_TICK: Duration = Duration::from_secs(1);

/// Run the supervisor loop until shutdown. On shutdown the in-flight
/// job finishes (or times out); queued jobs are not started.
pub fn run(ctx: Arc<ServerContext>) {
    info!("queue supervisor started");
    let mut last_sweep = Instant::now();

    while !ctx.shutting_down() {
        maintain(&ctx, &mut last_sweep);
        match ctx.queue.take_next() {
            Some(job) => process_job(&ctx, job),
            None => ctx.queue.wait_for_work(IDLE_TICK),
        }
    }
    info!("queue supervisor stopped");
}

fn maintain(ctx: &ServerContext, last_sweep: &mut Instant) {
    let (interval, max_file_age, retention) = {
        let config = ctx.config_read();
        (
            config.cleanup_interval(),
            config.max_file_age(),
            config.job_retention(),
        )
    };
    if last_sweep.elapsed() < interval {
        return;
    }
    *last_sweep = Instant::now();

    let swept = ctx.files.sweep(max_file_age);
    let collected = ctx.queue.collect_garbage(retention);
    for job_id in &collected {
        ctx.files.cleanup_job(*job_id);
    }
    debug!(swept, collected = collected.len(), "maintenance pass complete");
}

/// Phases a mode expands into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Execute,
    SyntaxCheck,
}

fn phases_for(mode: ExecutionMode) -> &'static [Phase] {
    match mode {
        ExecutionMode::CompileOnly => &[Phase::Compile],
        ExecutionMode::CompileAndRun => &[Phase::Compile, Phase::Execute],
        ExecutionMode::InterpretOnly => &[Phase::Execute],
        ExecutionMode::SyntaxCheck => &[Phase::SyntaxCheck],
    }
}

fn process_job(ctx: &ServerContext, job: Job) {
    info!(job_id = job.job_id, language = %job.language, mode = %job.mode, "processing job");

    let Some(descriptor) = ctx.compilers.resolve(job.language) else {
        finish(
            ctx,
            &job,
            JobOutcome {
                state: JobState::Failed,
                exit_code: -1,
                output_path: None,
                error_path: None,
                output_size: 0,
                error_size: 0,
                failure: Some((
                    ErrorCode::UnsupportedLanguage,
                    format!("no toolchain for {}", job.language),
                )),
            },
        );
        return;
    };

    if job.mode == ExecutionMode::InterpretOnly && !descriptor.is_interpreted() {
        finish(
            ctx,
            &job,
            JobOutcome {
                state: JobState::Failed,
                exit_code: -1,
                output_path: None,
                error_path: None,
                output_size: 0,
                error_size: 0,
                failure: Some((
                    ErrorCode::InvalidArgument,
                    format!("{} sources cannot be interpreted directly", job.language),
                )),
            },
        );
        return;
    }

    let sandbox = match create_sandbox(ctx.files.processing_root(), job.job_id) {
        Ok(dir) => dir,
        Err(e) => {
            error!(job_id = job.job_id, error = %e, "failed to create sandbox");
            finish(
                ctx,
                &job,
                JobOutcome {
                    state: JobState::Failed,
                    exit_code: -1,
                    output_path: None,
                    error_path: None,
                    output_size: 0,
                    error_size: 0,
                    failure: Some((ErrorCode::FileIo, format!("sandbox creation failed: {e}"))),
                },
            );
            return;
        }
    };

    let outcome = run_phases(ctx, &job, descriptor, &sandbox);
    finish(ctx, &job, outcome);
    remove_sandbox(&sandbox);
}

fn run_phases(
    ctx: &ServerContext,
    job: &Job,
    descriptor: &CompilerDescriptor,
    sandbox: &Path,
) -> JobOutcome {
    if let Err(e) = std::fs::copy(&job.source_path, sandbox.join(&job.source_file)) {
        return JobOutcome {
            state: JobState::Failed,
            exit_code: -1,
            output_path: None,
            error_path: None,
            output_size: 0,
            error_size: 0,
            failure: Some((ErrorCode::FileIo, format!("failed to stage source: {e}"))),
        };
    }

    let stem = job
        .source_file
        .rsplit_once('.')
        .map_or(job.source_file.as_str(), |(stem, _)| stem);
    let executable = format!("{stem}_exe");
    let spec = CommandSpec {
        source: &job.source_file,
        executable: &executable,
        compiler_args: &job.compiler_args,
        execution_args: &job.execution_args,
    };

    let (compile_timeout, execution_timeout) = {
        let config = ctx.config_read();
        (config.compile_timeout(), config.execution_timeout())
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut state = JobState::Completed;
    let mut exit_code = 0;
    let mut failure = None;

    for phase in phases_for(job.mode) {
        let (command, timeout) = match phase {
            Phase::Compile => match descriptor.compile_command(&spec) {
                Some(cmd) => (cmd, compile_timeout),
                None => {
                    state = JobState::Failed;
                    exit_code = -1;
                    failure = Some((
                        ErrorCode::Compilation,
                        format!("{} has no compile step", job.language),
                    ));
                    break;
                }
            },
            Phase::Execute => match descriptor.execute_command(&spec, execution_timeout.as_secs()) {
                Some(cmd) => (cmd, execution_timeout),
                None => {
                    state = JobState::Failed;
                    exit_code = -1;
                    failure = Some((
                        ErrorCode::Execution,
                        format!("{} cannot be executed directly", job.language),
                    ));
                    break;
                }
            },
            Phase::SyntaxCheck => (descriptor.syntax_check_command(&spec), compile_timeout),
        };

        let child = match RunningChild::spawn(&command, sandbox) {
            Ok(child) => child,
            Err(e) => {
                state = JobState::Failed;
                exit_code = -1;
                failure = Some((ErrorCode::Internal, format!("spawn failed: {e}")));
                break;
            }
        };
        ctx.queue.set_pid(job.job_id, Some(child.pid()));
        let result = child.supervise(timeout);
        ctx.queue.set_pid(job.job_id, None);

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                state = JobState::Failed;
                exit_code = -1;
                failure = Some((ErrorCode::Internal, format!("supervision failed: {e}")));
                break;
            }
        };

        let phase_secs = result.duration.as_secs_f64();
        match phase {
            Phase::Compile | Phase::SyntaxCheck => {
                ctx.stats.record_compile(result.success(), phase_secs)
            }
            Phase::Execute => ctx.stats.record_execution(result.success(), phase_secs),
        }

        stdout.extend_from_slice(&result.stdout);
        stderr.extend_from_slice(&result.stderr);
        exit_code = result.exit_code;

        // The execute phase is double-bounded: host supervision and the
        // external `timeout` wrapper. Whichever fires, the child ran out
        // of wall clock, so 124 from the wrapper is a timeout too.
        let wrapper_timeout = *phase == Phase::Execute && result.exit_code == TIMEOUT_EXIT_CODE;
        if result.timed_out || wrapper_timeout {
            state = JobState::Timeout;
            exit_code = TIMEOUT_EXIT_CODE;
            failure = Some((ErrorCode::Timeout, "wall-clock limit exceeded".to_string()));
            break;
        }
        if result.exit_code != 0 {
            state = JobState::Failed;
            failure = Some(match phase {
                Phase::Compile | Phase::SyntaxCheck => (
                    ErrorCode::Compilation,
                    format!("compile phase exited with {}", result.exit_code),
                ),
                Phase::Execute => (
                    ErrorCode::Execution,
                    format!("execution exited with {}", result.exit_code),
                ),
            });
            break;
        }
    }

    let (output_path, output_size) = persist_artifact(ctx, job, "output", &stdout);
    let (error_path, error_size) = persist_artifact(ctx, job, "error", &stderr);

    JobOutcome {
        state,
        exit_code,
        output_path,
        error_path,
        output_size,
        error_size,
        failure,
    }
}

fn persist_artifact(
    ctx: &ServerContext,
    job: &Job,
    kind: &str,
    data: &[u8],
) -> (Option<std::path::PathBuf>, u64) {
    let basename = format!("job_{}_{kind}.txt", job.job_id);
    match ctx.files.save_artifact(job.job_id, job.session_id, &basename, data) {
        Ok(path) => (Some(path), data.len() as u64),
        Err(e) => {
            error!(job_id = job.job_id, kind, error = %e, "failed to persist artefact");
            (None, data.len() as u64)
        }
    }
}

/// Record the outcome and the statistics for a finished job.
fn finish(ctx: &ServerContext, job: &Job, outcome: JobOutcome) {
    let final_state = ctx.queue.record_outcome(job.job_id, outcome);
    let wall_secs = job
        .started_at
        .map(|start| ((Utc::now() - start).num_milliseconds().max(0)) as f64 / 1000.0)
        .unwrap_or(0.0);

    let disposition = match final_state {
        JobState::Completed => JobDisposition::Completed,
        JobState::Cancelled => JobDisposition::Cancelled,
        JobState::Timeout => JobDisposition::TimedOut,
        _ => JobDisposition::Failed,
    };
    ctx.stats.job_finished(disposition, wall_secs);

    info!(
        job_id = job.job_id,
        state = %final_state,
        wall_secs,
        "job finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilers::{fake_descriptor, CompilerRegistry};
    use crate::config::ServerConfig;
    use crate::queue::NewJob;
    use codeforge_protocol::Language;

    fn test_context(langs: Vec<Language>) -> (tempfile::TempDir, Arc<ServerContext>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            processing_dir: dir.path().join("processing"),
            outgoing_dir: dir.path().join("outgoing"),
            compile_timeout: 20,
            execution_timeout: 5,
            ..Default::default()
        };
        let registry = CompilerRegistry::with_descriptors(
            langs.into_iter().map(fake_descriptor).collect(),
        );
        let ctx = ServerContext::build(config, registry).unwrap();
        (dir, Arc::new(ctx))
    }

    fn submit_source(
        ctx: &ServerContext,
        language: Language,
        mode: ExecutionMode,
        filename: &str,
        source: &[u8],
    ) -> u32 {
        let job_id = ctx.queue.reserve_job_id();
        let path = ctx
            .files
            .save_uploaded(job_id, 1, filename, source, 1 << 20)
            .unwrap();
        ctx.queue
            .submit(
                job_id,
                NewJob {
                    session_id: 1,
                    correlation_id: 1,
                    language,
                    mode,
                    priority: 5,
                    source_file: filename.to_string(),
                    source_path: path,
                    compiler_args: String::new(),
                    execution_args: String::new(),
                },
            )
            .unwrap()
    }

    fn drain_one(ctx: &Arc<ServerContext>) {
        let job = ctx.queue.take_next().unwrap();
        process_job(ctx, job);
    }

    fn python_available() -> bool {
        CompilerRegistry::detect().resolve(Language::Python).is_some()
    }

    #[test]
    fn test_unsupported_language_fails_job() {
        let (_dir, ctx) = test_context(vec![]);
        let id = submit_source(&ctx, Language::Rust, ExecutionMode::CompileOnly, "a.rs", b"fn main(){}");
        drain_one(&ctx);

        let job = ctx.queue.find(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure.as_ref().unwrap().0, ErrorCode::UnsupportedLanguage);
    }

    #[test]
    fn test_interpret_only_rejected_for_compiled_language() {
        let (_dir, ctx) = test_context(vec![Language::C]);
        let id = submit_source(&ctx, Language::C, ExecutionMode::InterpretOnly, "a.c", b"int main(){}");
        drain_one(&ctx);

        let job = ctx.queue.find(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure.as_ref().unwrap().0, ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_compile_only_rejected_for_interpreted_language() {
        let (_dir, ctx) = test_context(vec![Language::Python]);
        let id = submit_source(&ctx, Language::Python, ExecutionMode::CompileOnly, "a.py", b"pass");
        drain_one(&ctx);

        let job = ctx.queue.find(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure.as_ref().unwrap().0, ErrorCode::Compilation);
    }

    #[test]
    fn test_interpreted_job_runs_and_captures_output() {
        if !python_available() {
            return; // toolchain not present on this host
        }
        let (_dir, ctx) = test_context(vec![Language::Python]);
        let id = submit_source(
            &ctx,
            Language::Python,
            ExecutionMode::InterpretOnly,
            "hi.py",
            b"print('hi')",
        );
        drain_one(&ctx);

        let job = ctx.queue.find(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.output_size, 3); // "hi\n"
        let output = ctx
            .files
            .load(&format!("job_{id}_output.txt"))
            .unwrap();
        assert_eq!(output, b"hi\n");
    }

    #[test]
    fn test_failing_script_marks_job_failed() {
        if !python_available() {
            return;
        }
        let (_dir, ctx) = test_context(vec![Language::Python]);
        let id = submit_source(
            &ctx,
            Language::Python,
            ExecutionMode::InterpretOnly,
            "die.py",
            b"import sys; sys.exit(9)",
        );
        drain_one(&ctx);

        let job = ctx.queue.find(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.exit_code, Some(9));
        assert_eq!(job.failure.as_ref().unwrap().0, ErrorCode::Execution);
    }

    #[test]
    fn test_maintenance_collects_terminal_jobs_and_files() {
        let (_dir, ctx) = test_context(vec![]);
        let id = submit_source(&ctx, Language::Rust, ExecutionMode::CompileOnly, "a.rs", b"");
        drain_one(&ctx);
        assert!(ctx.queue.find(id).is_some());
        assert!(!ctx.files.list_job(id).is_empty());

        // Shrink retention and the sweep interval to one second, wait
        // both out, then run the maintenance pass.
        {
            let mut config = ctx.config_write();
            config.job_retention = 1;
            config.cleanup_interval = 1;
        }
        let mut last_sweep = Instant::now();
        std::thread::sleep(Duration::from_millis(1100));
        maintain(&ctx, &mut last_sweep);

        assert!(ctx.queue.find(id).is_none());
        assert!(ctx.files.list_job(id).is_empty());
    }
}
