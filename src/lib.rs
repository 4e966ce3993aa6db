//! Codeforge - networked code compilation and execution service
//!
//! This crate implements the server side of codeforge: a single process
//! that accepts framed binary messages from many concurrent clients,
//! queues compile/run jobs, executes them under wall-clock bounds in
//! per-job sandbox directories, and exposes a local-only admin endpoint
//! for observation and control.

pub mod admin;
pub mod compilers;
pub mod config;
pub mod files;
pub mod net;
pub mod queue;
pub mod server;
pub mod sessions;
pub mod stats;

pub use admin::{handle_admin_message, AdminAction, AdminState};
pub use compilers::{
    executor::{ExecOutcome, RunningChild, OUTPUT_LIMIT, TIMEOUT_EXIT_CODE},
    CommandSpec, CompilerDescriptor, CompilerRegistry,
};
pub use config::{ConfigError, ConfigKeyError, ServerConfig, ADMIN_KEYS};
pub use files::{is_safe_filename, FileEntry, FileError, FileManager};
pub use queue::{Job, JobOutcome, JobQueue, JobState, NewJob, QueueError};
pub use server::{InitError, Server, ServerContext};
pub use sessions::{
    handlers::{handle_message, Reply},
    BulkSelector, Session, SessionRegistry, SessionState,
};
pub use stats::{JobDisposition, ServerStats, StatsSnapshot};
