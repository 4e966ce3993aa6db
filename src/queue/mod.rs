//! Job queue.
//!
//! Jobs live in a generation-counted arena and are owned by the queue
//! from submission until garbage collection. A separate vector records
//! FIFO submission order; the supervisor takes the first `Queued` entry,
//! and terminal jobs stay in place (for result fetches) until the
//! retention grace period expires. Handles are index + generation so a
//! stale handle from a collected slot can never alias a newer job.
//!
//! Job state machine: `Queued → Running → {Completed | Failed |
//! Cancelled | Timeout}`, with `Cancelled` also reachable straight from
//! `Queued`. Terminal states are immutable. Only the supervisor writes,
//! except cancellation, which writes only `Cancelled`.

pub mod supervisor;

use crate::compilers::executor::signal_pid;
use chrono::{DateTime, Utc};
use codeforge_protocol::{ErrorCode, ExecutionMode, JobStatus, Language};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Internal job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    pub fn can_transition_to(self, target: JobState) -> bool {
        match (self, target) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Cancelled) => true,
            (JobState::Queued, JobState::Failed) => true,
            (JobState::Running, JobState::Completed) => true,
            (JobState::Running, JobState::Failed) => true,
            (JobState::Running, JobState::Cancelled) => true,
            (JobState::Running, JobState::Timeout) => true,
            _ => false,
        }
    }

    /// Wire projection.
    pub fn to_wire(self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed => JobStatus::Failed,
            JobState::Cancelled => JobStatus::Cancelled,
            JobState::Timeout => JobStatus::Timeout,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Defer to the wire status name so logs and admin tables agree.
        write!(f, "{}", self.to_wire())
    }
}

/// Priority bounds. Default is the midpoint.
pub const PRIORITY_LOW: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 5;
pub const PRIORITY_HIGH: u8 = 10;

/// One unit of compile/run work.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: u32,
    pub session_id: u32,
    pub correlation_id: u32,
    pub language: Language,
    pub mode: ExecutionMode,
    pub priority: u8,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Client-supplied source basename.
    pub source_file: String,
    /// Where the uploaded source was persisted.
    pub source_path: PathBuf,
    pub compiler_args: String,
    pub execution_args: String,
    /// Child pid while a phase is running.
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub output_path: Option<PathBuf>,
    pub error_path: Option<PathBuf>,
    pub output_size: u64,
    pub error_size: u64,
    /// Populated when the job fails before or outside the child process.
    pub failure: Option<(ErrorCode, String)>,
}

impl Job {
    /// Wall time from start to end, when both are known.
    pub fn wall_secs(&self) -> f64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

/// Submission parameters.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub session_id: u32,
    pub correlation_id: u32,
    pub language: Language,
    pub mode: ExecutionMode,
    pub priority: u8,
    pub source_file: String,
    pub source_path: PathBuf,
    pub compiler_args: String,
    pub execution_args: String,
}

/// Final disposition reported by the supervisor.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub exit_code: i32,
    pub output_path: Option<PathBuf>,
    pub error_path: Option<PathBuf>,
    pub output_size: u64,
    pub error_size: u64,
    pub failure: Option<(ErrorCode, String)>,
}

/// Queue operation errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({max} jobs)")]
    Full { max: usize },

    #[error("no job with id {0}")]
    NotFound(u32),

    #[error("job is already in terminal state {0}")]
    Terminal(JobState),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    job: Option<Job>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live handles in submission order; reordered only by the explicit
    /// priority pass.
    order: Vec<Handle>,
    next_job_id: u32,
}

impl Table {
    fn get(&self, handle: Handle) -> Option<&Job> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.job.as_ref()
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut Job> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.job.as_mut()
    }

    fn find_handle(&self, job_id: u32) -> Option<Handle> {
        self.order.iter().copied().find(|&h| {
            self.get(h).is_some_and(|job| job.job_id == job_id)
        })
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_job_id;
        self.next_job_id = self.next_job_id.checked_add(1).unwrap_or(1);
        id
    }
}

/// The shared queue: arena table behind a mutex, paired with a condvar
/// that wakes the supervisor on submission and on shutdown.
#[derive(Debug)]
pub struct JobQueue {
    table: Mutex<Table>,
    available: Condvar,
    max_size: usize,
}

impl JobQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                order: Vec::new(),
                next_job_id: 1,
            }),
            available: Condvar::new(),
            max_size,
        }
    }

    /// Reserve the next job id without enqueuing anything. The file
    /// manager needs the id to name the persisted source before the job
    /// record exists.
    pub fn reserve_job_id(&self) -> u32 {
        self.lock().allocate_id()
    }

    /// Append a job (with a previously reserved id) to the queue tail
    /// and wake the supervisor.
    pub fn submit(&self, job_id: u32, new: NewJob) -> Result<u32, QueueError> {
        let mut table = self.lock();
        if table.order.len() >= self.max_size {
            return Err(QueueError::Full { max: self.max_size });
        }

        let job = Job {
            job_id,
            session_id: new.session_id,
            correlation_id: new.correlation_id,
            language: new.language,
            mode: new.mode,
            priority: new.priority.clamp(PRIORITY_LOW, PRIORITY_HIGH),
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            source_file: new.source_file,
            source_path: new.source_path,
            compiler_args: new.compiler_args,
            execution_args: new.execution_args,
            pid: None,
            exit_code: None,
            output_path: None,
            error_path: None,
            output_size: 0,
            error_size: 0,
            failure: None,
        };

        let handle = if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index as usize];
            slot.job = Some(job);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = table.slots.len() as u32;
            table.slots.push(Slot {
                generation: 0,
                job: Some(job),
            });
            Handle {
                index,
                generation: 0,
            }
        };
        table.order.push(handle);
        let depth = table.order.len();
        drop(table);

        self.available.notify_one();
        debug!(job_id, depth, "job queued");
        Ok(job_id)
    }

    /// Take the first queued job: transition it to Running, stamp the
    /// start time, and return a snapshot for the supervisor to process.
    pub fn take_next(&self) -> Option<Job> {
        let mut table = self.lock();
        let handle = table
            .order
            .iter()
            .copied()
            .find(|&h| table.get(h).is_some_and(|j| j.state == JobState::Queued))?;
        let job = table.get_mut(handle)?;
        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Block until work may be available, the tick elapses, or a
    /// shutdown broadcast arrives.
    pub fn wait_for_work(&self, tick: Duration) {
        let table = self.lock();
        let has_queued = table
            .order
            .iter()
            .any(|&h| table.get(h).is_some_and(|j| j.state == JobState::Queued));
        if !has_queued {
            let _unused = self
                .available
                .wait_timeout(table, tick)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wake every waiter; used for shutdown fan-out.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }

    pub fn find(&self, job_id: u32) -> Option<Job> {
        let table = self.lock();
        table.find_handle(job_id).and_then(|h| table.get(h).cloned())
    }

    pub fn list_all(&self) -> Vec<Job> {
        let table = self.lock();
        table
            .order
            .iter()
            .filter_map(|&h| table.get(h).cloned())
            .collect()
    }

    pub fn list_for_session(&self, session_id: u32) -> Vec<Job> {
        self.list_all()
            .into_iter()
            .filter(|j| j.session_id == session_id)
            .collect()
    }

    /// Record the child pid for a running job (or clear it).
    pub fn set_pid(&self, job_id: u32, pid: Option<i32>) {
        let mut table = self.lock();
        if let Some(handle) = table.find_handle(job_id) {
            if let Some(job) = table.get_mut(handle) {
                job.pid = pid;
            }
        }
    }

    /// Cancel one job. Queued jobs flip to Cancelled in place; running
    /// jobs get their child signalled (SIGTERM, SIGKILL when `force`)
    /// and are marked Cancelled for the supervisor to observe.
    pub fn cancel(&self, job_id: u32, force: bool) -> Result<(), QueueError> {
        let mut table = self.lock();
        let handle = table.find_handle(job_id).ok_or(QueueError::NotFound(job_id))?;
        let job = table.get_mut(handle).ok_or(QueueError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(QueueError::Terminal(job.state));
        }

        if job.state == JobState::Running {
            if let Some(pid) = job.pid {
                signal_pid(pid, force);
            }
        }
        job.state = JobState::Cancelled;
        job.ended_at = Some(Utc::now());
        info!(job_id, force, "job cancelled");
        Ok(())
    }

    /// Cancel every non-terminal job owned by a session. Returns how
    /// many were cancelled.
    pub fn cancel_all_for_session(&self, session_id: u32, force: bool) -> usize {
        let ids: Vec<u32> = self
            .list_for_session(session_id)
            .into_iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.job_id)
            .collect();
        ids.into_iter()
            .filter(|&id| self.cancel(id, force).is_ok())
            .count()
    }

    /// Record the supervisor's final word on a job. If cancellation
    /// landed while the job ran, the Cancelled state stands and only the
    /// exit code and artefacts are filled in.
    pub fn record_outcome(&self, job_id: u32, outcome: JobOutcome) -> JobState {
        let mut table = self.lock();
        let Some(handle) = table.find_handle(job_id) else {
            return outcome.state;
        };
        let Some(job) = table.get_mut(handle) else {
            return outcome.state;
        };

        job.pid = None;
        job.exit_code = Some(outcome.exit_code);
        job.output_path = outcome.output_path;
        job.error_path = outcome.error_path;
        job.output_size = outcome.output_size;
        job.error_size = outcome.error_size;
        if outcome.failure.is_some() {
            job.failure = outcome.failure;
        }
        if job.ended_at.is_none() {
            job.ended_at = Some(Utc::now());
        }
        if !job.state.is_terminal() && job.state.can_transition_to(outcome.state) {
            job.state = outcome.state;
        }
        job.state
    }

    /// Bubble-sort contiguous runs of Queued entries so higher priority
    /// precedes lower. Running and terminal entries are fence posts that
    /// never move. Called rarely, from the admin path.
    pub fn reorder_by_priority(&self) {
        let mut table = self.lock();
        let len = table.order.len();
        if len < 2 {
            return;
        }
        let mut swapped = true;
        while swapped {
            swapped = false;
            for i in 0..len - 1 {
                let (a, b) = (table.order[i], table.order[i + 1]);
                let both_queued = table.get(a).is_some_and(|j| j.state == JobState::Queued)
                    && table.get(b).is_some_and(|j| j.state == JobState::Queued);
                if !both_queued {
                    continue;
                }
                let (pa, pb) = (
                    table.get(a).map(|j| j.priority).unwrap_or(0),
                    table.get(b).map(|j| j.priority).unwrap_or(0),
                );
                if pa < pb {
                    table.order.swap(i, i + 1);
                    swapped = true;
                }
            }
        }
        debug!("queue reordered by priority");
    }

    /// Drop terminal jobs whose end time is older than `retention`.
    /// Returns the ids removed so the caller can clean their files.
    pub fn collect_garbage(&self, retention: Duration) -> Vec<u32> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut table = self.lock();
        let mut removed = Vec::new();

        let order = std::mem::take(&mut table.order);
        for handle in order {
            let expired = table.get(handle).is_some_and(|job| {
                job.state.is_terminal() && job.ended_at.is_some_and(|end| end < cutoff)
            });
            if expired {
                let slot = &mut table.slots[handle.index as usize];
                if let Some(job) = slot.job.take() {
                    removed.push(job.job_id);
                }
                slot.generation = slot.generation.wrapping_add(1);
                table.free.push(handle.index);
            } else {
                table.order.push(handle);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "garbage-collected terminal jobs");
        }
        removed
    }

    /// Estimated wait for a queued job: entries ahead of it that still
    /// need the worker, times the mean job wall time.
    pub fn estimated_wait(&self, job_id: u32, mean_job_secs: f64) -> Option<Duration> {
        let table = self.lock();
        let target = table.find_handle(job_id)?;
        if table.get(target)?.state != JobState::Queued {
            return None;
        }
        let ahead = table
            .order
            .iter()
            .take_while(|&&h| h != target)
            .filter(|&&h| {
                table
                    .get(h)
                    .is_some_and(|j| matches!(j.state, JobState::Queued | JobState::Running))
            })
            .count();
        Some(Duration::from_secs_f64(ahead as f64 * mean_job_secs.max(0.0)))
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(session_id: u32) -> NewJob {
        NewJob {
            session_id,
            correlation_id: 1,
            language: Language::C,
            mode: ExecutionMode::CompileAndRun,
            priority: PRIORITY_NORMAL,
            source_file: "a.c".to_string(),
            source_path: PathBuf::from("/tmp/a.c"),
            compiler_args: String::new(),
            execution_args: String::new(),
        }
    }

    fn submit(queue: &JobQueue, session_id: u32) -> u32 {
        let id = queue.reserve_job_id();
        queue.submit(id, new_job(session_id)).unwrap()
    }

    fn submit_priority(queue: &JobQueue, priority: u8) -> u32 {
        let id = queue.reserve_job_id();
        queue
            .submit(
                id,
                NewJob {
                    priority,
                    ..new_job(1)
                },
            )
            .unwrap()
    }

    fn outcome(state: JobState, exit_code: i32) -> JobOutcome {
        JobOutcome {
            state,
            exit_code,
            output_path: None,
            error_path: None,
            output_size: 0,
            error_size: 0,
            failure: None,
        }
    }

    #[test]
    fn test_job_ids_start_at_one_and_are_unique() {
        let queue = JobQueue::new(100);
        let a = submit(&queue, 1);
        let b = submit(&queue, 1);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn test_fifo_order() {
        let queue = JobQueue::new(100);
        let first = submit(&queue, 1);
        let second = submit(&queue, 1);

        assert_eq!(queue.take_next().unwrap().job_id, first);
        assert_eq!(queue.take_next().unwrap().job_id, second);
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn test_take_transitions_to_running() {
        let queue = JobQueue::new(100);
        let id = submit(&queue, 1);
        let taken = queue.take_next().unwrap();
        assert_eq!(taken.state, JobState::Running);
        assert!(taken.started_at.is_some());
        assert_eq!(queue.find(id).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_queue_cap() {
        let queue = JobQueue::new(2);
        submit(&queue, 1);
        submit(&queue, 1);
        let id = queue.reserve_job_id();
        assert!(matches!(
            queue.submit(id, new_job(1)),
            Err(QueueError::Full { max: 2 })
        ));
    }

    #[test]
    fn test_state_machine_legality() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Timeout));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Failed));
        for terminal in [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobState::Running));
        }
    }

    #[test]
    fn test_cancel_queued_job_in_place() {
        let queue = JobQueue::new(100);
        let id = submit(&queue, 1);
        queue.cancel(id, false).unwrap();
        assert_eq!(queue.find(id).unwrap().state, JobState::Cancelled);
        // The supervisor skips it.
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn test_cancel_terminal_job_refused() {
        let queue = JobQueue::new(100);
        let id = submit(&queue, 1);
        queue.cancel(id, false).unwrap();
        assert!(matches!(
            queue.cancel(id, false),
            Err(QueueError::Terminal(JobState::Cancelled))
        ));
    }

    #[test]
    fn test_cancel_unknown_job() {
        let queue = JobQueue::new(100);
        assert!(matches!(queue.cancel(404, false), Err(QueueError::NotFound(404))));
    }

    #[test]
    fn test_outcome_respects_in_flight_cancellation() {
        let queue = JobQueue::new(100);
        let id = submit(&queue, 1);
        queue.take_next().unwrap();
        queue.cancel(id, false).unwrap();

        // Supervisor reaps afterwards: state stays Cancelled, exit code lands.
        let final_state = queue.record_outcome(id, outcome(JobState::Completed, 143));
        assert_eq!(final_state, JobState::Cancelled);
        let job = queue.find(id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.exit_code, Some(143));
    }

    #[test]
    fn test_record_outcome_normal_completion() {
        let queue = JobQueue::new(100);
        let id = submit(&queue, 1);
        queue.take_next().unwrap();
        let state = queue.record_outcome(id, outcome(JobState::Completed, 0));
        assert_eq!(state, JobState::Completed);
        let job = queue.find(id).unwrap();
        assert!(job.ended_at.is_some());
        assert_eq!(job.exit_code, Some(0));
    }

    #[test]
    fn test_cancel_all_for_session() {
        let queue = JobQueue::new(100);
        submit(&queue, 1);
        submit(&queue, 1);
        submit(&queue, 2);
        assert_eq!(queue.cancel_all_for_session(1, false), 2);
        assert_eq!(queue.list_for_session(2)[0].state, JobState::Queued);
    }

    #[test]
    fn test_priority_reorder_moves_only_queued() {
        let queue = JobQueue::new(100);
        let low = submit_priority(&queue, 1);
        let running = queue.take_next().unwrap().job_id; // `low` now Running
        assert_eq!(low, running);

        let mid = submit_priority(&queue, 5);
        let high = submit_priority(&queue, 9);
        queue.reorder_by_priority();

        let jobs = queue.list_all();
        assert_eq!(jobs[0].job_id, running); // running entry did not move
        assert_eq!(jobs[1].job_id, high);
        assert_eq!(jobs[2].job_id, mid);
    }

    #[test]
    fn test_gc_removes_expired_terminal_jobs_only() {
        let queue = JobQueue::new(100);
        let done = submit(&queue, 1);
        queue.take_next().unwrap();
        queue.record_outcome(done, outcome(JobState::Completed, 0));
        let pending = submit(&queue, 1);

        // Fresh terminal job survives a one-hour retention.
        assert!(queue.collect_garbage(Duration::from_secs(3600)).is_empty());
        // Zero retention collects it; the queued job stays.
        let removed = queue.collect_garbage(Duration::ZERO);
        assert_eq!(removed, vec![done]);
        assert!(queue.find(done).is_none());
        assert!(queue.find(pending).is_some());
    }

    #[test]
    fn test_handles_survive_slot_reuse() {
        let queue = JobQueue::new(100);
        let old = submit(&queue, 1);
        queue.take_next().unwrap();
        queue.record_outcome(old, outcome(JobState::Completed, 0));
        queue.collect_garbage(Duration::ZERO);

        // The freed slot is reused by a new job with a new generation;
        // the old id must not resolve to it.
        let fresh = submit(&queue, 2);
        assert_ne!(old, fresh);
        assert!(queue.find(old).is_none());
        assert_eq!(queue.find(fresh).unwrap().session_id, 2);
    }

    #[test]
    fn test_estimated_wait_counts_entries_ahead() {
        let queue = JobQueue::new(100);
        submit(&queue, 1);
        submit(&queue, 1);
        let tail = submit(&queue, 1);

        let wait = queue.estimated_wait(tail, 2.0).unwrap();
        assert_eq!(wait, Duration::from_secs(4));

        // Not queued -> no estimate.
        let head = queue.take_next().unwrap().job_id;
        assert!(queue.estimated_wait(head, 2.0).is_none());
    }

    #[test]
    fn test_wait_for_work_times_out_when_empty() {
        let queue = JobQueue::new(10);
        let start = std::time::Instant::now();
        queue.wait_for_work(Duration::from_millis(50));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
