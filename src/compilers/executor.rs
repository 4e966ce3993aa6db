//! Child process supervision.
//!
//! Commands run as `/bin/sh -c {command}` with the job sandbox as the
//! working directory and both output streams piped. The parent drains
//! the pipes through a poll loop with a one-second tick into bounded
//! buffers; once a buffer is full further bytes are still read but
//! discarded so the child never blocks on a full pipe. Exceeding the
//! wall-clock bound kills the child with SIGKILL and reports exit code
//! 124. Normal exits translate to the exit code, signal deaths to
//! 128 + signo.

use crate::net::poll_readable;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Cap on each captured stream.
pub const OUTPUT_LIMIT: usize = 8 * 1024;

/// Exit code reported for a wall-clock timeout, matching `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_TICK_MS: u16 = 1000;

/// Result of supervising one child to completion.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// A spawned child awaiting supervision. The pid is available
/// immediately so cancellation can signal the process while it runs.
#[derive(Debug)]
pub struct RunningChild {
    child: Child,
    started: Instant,
}

impl RunningChild {
    /// Spawn `command` under `/bin/sh -c` in `cwd`.
    pub fn spawn(command: &str, cwd: &Path) -> io::Result<Self> {
        debug!(command, cwd = %cwd.display(), "spawning child");
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(Self {
            child,
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Drain both pipes until EOF or until `timeout` elapses, then reap.
    pub fn supervise(mut self, timeout: Duration) -> io::Result<ExecOutcome> {
        let mut stdout_pipe = self.child.stdout.take();
        let mut stderr_pipe = self.child.stderr.take();
        let mut stdout = CaptureBuffer::new(OUTPUT_LIMIT);
        let mut stderr = CaptureBuffer::new(OUTPUT_LIMIT);

        loop {
            if stdout_pipe.is_none() && stderr_pipe.is_none() {
                break;
            }
            if self.started.elapsed() >= timeout {
                warn!(pid = self.pid(), "wall-clock timeout, killing child");
                let _ = kill(Pid::from_raw(self.pid()), Signal::SIGKILL);
                let _ = self.child.wait();
                return Ok(ExecOutcome {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: stdout.into_bytes(),
                    stderr: stderr.into_bytes(),
                    timed_out: true,
                    duration: self.started.elapsed(),
                });
            }

            let remaining = timeout.saturating_sub(self.started.elapsed());
            let tick = (POLL_TICK_MS as u128).min(remaining.as_millis().max(1)) as u16;

            let mut fds = Vec::with_capacity(2);
            if let Some(pipe) = &stdout_pipe {
                fds.push(pipe.as_raw_fd());
            }
            if let Some(pipe) = &stderr_pipe {
                fds.push(pipe.as_raw_fd());
            }
            let ready = poll_readable(&fds, tick)?;

            for entry in ready {
                if !entry.actionable() {
                    continue;
                }
                if stdout_pipe.as_ref().is_some_and(|p| p.as_raw_fd() == entry.fd) {
                    if drain(stdout_pipe.as_mut().map(|p| p as &mut dyn Read), &mut stdout)? {
                        stdout_pipe = None;
                    }
                } else if stderr_pipe.as_ref().is_some_and(|p| p.as_raw_fd() == entry.fd) {
                    if drain(stderr_pipe.as_mut().map(|p| p as &mut dyn Read), &mut stderr)? {
                        stderr_pipe = None;
                    }
                }
            }
        }

        let status = self.child.wait()?;
        let exit_code = if let Some(code) = status.code() {
            code
        } else if let Some(signo) = status.signal() {
            128 + signo
        } else {
            -1
        };

        Ok(ExecOutcome {
            exit_code,
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            timed_out: false,
            duration: self.started.elapsed(),
        })
    }
}

/// Send a signal to a supervised child by pid.
pub fn signal_pid(pid: i32, force: bool) -> bool {
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    kill(Pid::from_raw(pid), signal).is_ok()
}

/// Bounded capture buffer. Bytes past the cap are read and dropped.
struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl CaptureBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Read whatever is available from a readable pipe. Returns true on EOF.
fn drain(pipe: Option<&mut dyn Read>, capture: &mut CaptureBuffer) -> io::Result<bool> {
    let Some(pipe) = pipe else { return Ok(true) };
    let mut chunk = [0u8; 4096];
    match pipe.read(&mut chunk) {
        Ok(0) => Ok(true),
        Ok(n) => {
            capture.push(&chunk[..n]);
            Ok(false)
        }
        Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Create the per-job sandbox directory `{processing}/job_{id}_{epoch}`.
pub fn create_sandbox(processing_root: &Path, job_id: u32) -> io::Result<PathBuf> {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let dir = processing_root.join(format!("job_{job_id}_{epoch}"));
    fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
    }
    Ok(dir)
}

/// Remove a sandbox directory and everything in it.
pub fn remove_sandbox(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "failed to remove sandbox");
        }
    }
}
