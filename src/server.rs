//! Runtime shell.
//!
//! Owns process-wide initialisation and teardown: bind both listeners,
//! create the working directories, detect toolchains, install the
//! signal handler, spawn the three long-lived workers (admin
//! dispatcher, session dispatcher, queue supervisor), wait on the
//! shutdown event, fan it out, join, and clean up.
//!
//! All shared state lives in [`ServerContext`], passed explicitly to
//! every component. Lock order across components is
//! `sessions → queue → files → stats`; no lock is held across an I/O
//! call into a peer component.

use crate::admin;
use crate::compilers::CompilerRegistry;
use crate::config::{ConfigError, ServerConfig};
use crate::files::{FileError, FileManager};
use crate::queue::{supervisor, JobQueue};
use crate::sessions::{dispatcher, SessionRegistry};
use crate::stats::ServerStats;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Shared state threaded through every component.
#[derive(Debug)]
pub struct ServerContext {
    config: RwLock<ServerConfig>,
    pub registry: SessionRegistry,
    pub queue: JobQueue,
    pub files: FileManager,
    pub compilers: CompilerRegistry,
    pub stats: ServerStats,
    shutdown: AtomicBool,
}

impl ServerContext {
    /// Assemble the context: the file manager creates the working
    /// directories as a side effect.
    pub fn build(config: ServerConfig, compilers: CompilerRegistry) -> Result<Self, FileError> {
        let files = FileManager::new(&config.processing_dir, &config.outgoing_dir)?;
        let registry = SessionRegistry::new(config.max_sessions);
        let queue = JobQueue::new(config.max_queue_size);
        Ok(Self {
            config: RwLock::new(config),
            registry,
            queue,
            files,
            compilers,
            stats: ServerStats::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn config_read(&self) -> RwLockReadGuard<'_, ServerConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config_write(&self) -> RwLockWriteGuard<'_, ServerConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Set the shutdown event and wake every waiter.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.notify_all();
    }
}

/// Initialisation failures. All fatal; the process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to prepare working directories: {0}")]
    Files(#[from] FileError),

    #[error("no compilers or interpreters detected on PATH")]
    NoToolchains,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind admin socket {path}: {source}")]
    AdminBind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The bootstrapped server, ready to run.
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    admin_listener: UnixListener,
    admin_path: PathBuf,
}

impl Server {
    /// Validate the config, detect toolchains, bind both listeners and
    /// build the shared context.
    pub fn bootstrap(config: ServerConfig) -> Result<Self, InitError> {
        config.validate()?;

        let compilers = CompilerRegistry::detect();
        if compilers.is_empty() {
            return Err(InitError::NoToolchains);
        }
        info!(toolchains = compilers.len(), "toolchain detection complete");

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let admin_path = config.admin_socket.clone();

        let listener =
            TcpListener::bind(addr).map_err(|source| InitError::Bind { addr, source })?;

        // A stale socket file from a previous run blocks the bind.
        let _ = fs::remove_file(&admin_path);
        let admin_listener = UnixListener::bind(&admin_path).map_err(|source| {
            InitError::AdminBind {
                path: admin_path.clone(),
                source,
            }
        })?;
        if let Err(e) = fs::set_permissions(&admin_path, fs::Permissions::from_mode(0o600)) {
            warn!(path = %admin_path.display(), error = %e, "failed to restrict admin socket permissions");
        }

        let ctx = Arc::new(ServerContext::build(config, compilers)?);
        {
            let config = ctx.config_read();
            info!(
                port = config.port,
                admin_socket = %config.admin_socket.display(),
                processing = %config.processing_dir.display(),
                outgoing = %config.outgoing_dir.display(),
                "server initialised"
            );
        }

        Ok(Self {
            ctx,
            listener,
            admin_listener,
            admin_path,
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// The bound client address (useful when the port was chosen by the
    /// OS).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Install signal handling, run the workers, and block until
    /// shutdown completes.
    pub fn run(self) -> io::Result<()> {
        let Server {
            ctx,
            listener,
            admin_listener,
            admin_path,
        } = self;

        // SIGINT/SIGTERM set the shutdown event; every worker loop
        // observes it within one tick.
        {
            let ctx = Arc::clone(&ctx);
            if let Err(e) = ctrlc::set_handler(move || {
                info!("shutdown signal received");
                ctx.request_shutdown();
            }) {
                warn!(error = %e, "failed to install signal handler");
            }
        }

        let workers = [
            spawn_worker("admin", Arc::clone(&ctx), {
                let ctx = Arc::clone(&ctx);
                move || admin::run(ctx, admin_listener)
            })?,
            spawn_worker("sessions", Arc::clone(&ctx), {
                let ctx = Arc::clone(&ctx);
                move || dispatcher::run(ctx, listener)
            })?,
            spawn_worker("supervisor", Arc::clone(&ctx), {
                let ctx = Arc::clone(&ctx);
                move || supervisor::run(ctx)
            })?,
        ];

        info!("server started");
        while !ctx.shutting_down() {
            thread::sleep(Duration::from_millis(200));
        }

        info!("shutting down");
        ctx.request_shutdown();
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!(worker = %name, "worker terminated abnormally");
            }
        }

        let _ = fs::remove_file(&admin_path);
        info!("server stopped");
        Ok(())
    }
}

/// Spawn a named worker thread. A panic inside the worker is caught,
/// logged, and converted into a shutdown request so the process never
/// limps along without one of its three loops.
fn spawn_worker(
    name: &'static str,
    ctx: Arc<ServerContext>,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(worker = name, "worker panicked, requesting shutdown");
            ctx.request_shutdown();
        }
    })
}
