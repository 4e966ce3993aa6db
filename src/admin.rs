//! Admin control plane.
//!
//! A local-only unix socket (0600) accepting at most one admin session
//! at a time. Before an `AdminConnect` handshake every command returns
//! `Error(Permission)` and has no side effects. Commands observe and
//! mutate the session registry, the job queue and the runtime config,
//! and can shut the whole server down.

use crate::queue::Job;
use crate::server::ServerContext;
use crate::sessions::BulkSelector;
use chrono::Utc;
use codeforge_protocol::codec::{read_message_deadline, write_message};
use codeforge_protocol::{
    admin_cmd, AdminCommandPayload, ErrorCode, ErrorPayload, Message, MessageType,
};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_TICK_MS: u16 = 1000;
const FRAME_DEADLINE: Duration = Duration::from_secs(5);

/// Handshake and accounting state for the one admin session.
#[derive(Debug, Default)]
pub struct AdminState {
    pub authenticated: bool,
    pub commands_executed: u32,
}

/// What the dispatcher should do after sending a reply.
#[derive(Debug, PartialEq, Eq)]
pub enum AdminAction {
    Continue,
    /// Close the admin session.
    Close,
    /// Set the shutdown event after an optional delay; `force` exits the
    /// process immediately once the reply is on the wire.
    Shutdown { force: bool, delay_secs: u32 },
}

struct AdminSession {
    stream: UnixStream,
    state: AdminState,
    connected_at: Instant,
    last_activity: Instant,
}

/// Run the admin dispatcher until shutdown.
pub fn run(ctx: Arc<ServerContext>, listener: UnixListener) {
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "failed to mark admin listener non-blocking");
    }
    let mut session: Option<AdminSession> = None;
    info!("admin dispatcher started");

    while !ctx.shutting_down() {
        let mut fds = vec![listener.as_raw_fd()];
        if let Some(s) = &session {
            fds.push(s.stream.as_raw_fd());
        }
        let ready = match crate::net::poll_readable(&fds, POLL_TICK_MS) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "admin poll failed");
                break;
            }
        };

        if ready.first().is_some_and(|r| r.readable) {
            accept_admin(&mut session, &listener);
        }

        if ready.get(1).is_some_and(|r| r.actionable()) {
            if let Some(current) = session.as_mut() {
                match service_admin(&ctx, current) {
                    AdminAction::Continue => {}
                    AdminAction::Close => close_session(&mut session),
                    AdminAction::Shutdown { force, delay_secs } => {
                        if delay_secs > 0 {
                            info!(delay_secs, "shutdown scheduled");
                            std::thread::sleep(Duration::from_secs(delay_secs as u64));
                        }
                        ctx.request_shutdown();
                        if force {
                            info!("forced shutdown, exiting immediately");
                            std::process::exit(0);
                        }
                        close_session(&mut session);
                    }
                }
            }
        }

        // Tick: expire an idle admin session.
        let admin_timeout = ctx.config_read().admin_timeout();
        if session
            .as_ref()
            .is_some_and(|s| s.last_activity.elapsed() > admin_timeout)
        {
            info!("admin session idle-expired");
            close_session(&mut session);
        }
    }

    close_session(&mut session);
    info!("admin dispatcher stopped");
}

fn accept_admin(session: &mut Option<AdminSession>, listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if session.is_some() {
                    // One admin at a time; surplus connectors are dropped.
                    warn!("rejecting concurrent admin connection");
                    continue;
                }
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                info!("admin connected");
                *session = Some(AdminSession {
                    stream,
                    state: AdminState::default(),
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "admin accept failed");
                break;
            }
        }
    }
}

fn close_session(session: &mut Option<AdminSession>) {
    if let Some(s) = session.take() {
        info!(
            duration_secs = s.connected_at.elapsed().as_secs(),
            commands = s.state.commands_executed,
            "admin session closed"
        );
    }
}

/// Read one admin message and reply to it.
fn service_admin(ctx: &ServerContext, session: &mut AdminSession) -> AdminAction {
    let msg = match read_message_deadline(&mut session.stream, FRAME_DEADLINE) {
        Ok(msg) => msg,
        Err(e) => {
            if !e.is_disconnect() {
                warn!(error = %e, "admin framing failure");
            }
            return AdminAction::Close;
        }
    };
    session.last_activity = Instant::now();

    let (reply, action) = handle_admin_message(ctx, &mut session.state, &msg);
    if let Err(e) = write_message(&mut session.stream, &reply) {
        warn!(error = %e, "failed to write admin reply");
        return AdminAction::Close;
    }
    action
}

fn error_reply(code: ErrorCode, message: &str, correlation_id: u32) -> Message {
    Message::new(
        MessageType::Error,
        correlation_id,
        ErrorPayload::new(code, message, "admin").encode(),
    )
}

fn ack(correlation_id: u32) -> Message {
    Message::new(MessageType::Ack, correlation_id, Vec::new())
}

/// Decode the admin command body; a missing body behaves as an empty
/// command, matching clients that send bare commands.
fn command_of(msg: &Message) -> AdminCommandPayload {
    AdminCommandPayload::decode(&msg.payload).unwrap_or_default()
}

/// Dispatch one admin message. Pure with respect to the socket, which
/// keeps every command testable without a connection.
pub fn handle_admin_message(
    ctx: &ServerContext,
    state: &mut AdminState,
    msg: &Message,
) -> (Message, AdminAction) {
    let corr = msg.header.correlation_id;

    match msg.header.msg_type {
        MessageType::AdminConnect => {
            state.authenticated = true;
            info!("admin session authenticated");
            return (ack(corr), AdminAction::Continue);
        }
        MessageType::AdminDisconnect => {
            return (ack(corr), AdminAction::Close);
        }
        _ => {}
    }

    if !state.authenticated {
        return (
            error_reply(ErrorCode::Permission, "not authenticated", corr),
            AdminAction::Continue,
        );
    }

    state.commands_executed += 1;
    let cmd = command_of(msg);

    let reply = match msg.header.msg_type {
        MessageType::AdminListClients => {
            let detailed = cmd.flags & 1 != 0;
            let table = ctx.registry.render_table(detailed);
            Message::new(MessageType::AdminListClients, corr, table.into_bytes())
        }

        MessageType::AdminListJobs => {
            let jobs = filtered_jobs(ctx, cmd.data.trim());
            let table = render_job_table(&jobs);
            Message::new(MessageType::AdminListJobs, corr, table.into_bytes())
        }

        MessageType::AdminServerStats => {
            let snapshot = ctx.stats.snapshot();
            let json = cmd.flags & 1 != 0;
            let payload = if json {
                serde_json::to_vec(&snapshot).unwrap_or_default()
            } else {
                snapshot.to_wire().encode()
            };
            Message::new(MessageType::AdminServerStats, corr, payload)
        }

        MessageType::AdminDisconnectClient => {
            let force = cmd.flags & 1 != 0;
            info!(session_id = cmd.target_id, force, "admin disconnect request");
            if ctx.registry.mark_disconnecting(cmd.target_id, force) {
                ack(corr)
            } else {
                error_reply(ErrorCode::NotFound, "client not found", corr)
            }
        }

        MessageType::AdminKillJob => {
            let force = cmd.flags & 1 != 0;
            info!(job_id = cmd.target_id, force, "admin kill request");
            match ctx.queue.cancel(cmd.target_id, force) {
                Ok(()) => ack(corr),
                Err(crate::queue::QueueError::NotFound(_)) => {
                    error_reply(ErrorCode::NotFound, "job not found", corr)
                }
                Err(e) => error_reply(ErrorCode::InvalidArgument, &e.to_string(), corr),
            }
        }

        MessageType::AdminServerShutdown => {
            let force = cmd.flags & 1 != 0;
            info!(force, delay = cmd.target_id, "admin shutdown request");
            return (
                ack(corr),
                AdminAction::Shutdown {
                    force,
                    delay_secs: cmd.target_id,
                },
            );
        }

        MessageType::AdminConfigGet => match cmd.command_type {
            admin_cmd::CONFIG_LIST => {
                let listing = ctx.config_read().admin_list();
                Message::new(MessageType::AdminConfigGet, corr, listing.into_bytes())
            }
            _ => {
                let key = cmd.data.trim();
                match ctx.config_read().admin_get(key) {
                    Ok(value) => Message::new(
                        MessageType::AdminConfigGet,
                        corr,
                        format!("{key}={value}").into_bytes(),
                    ),
                    Err(e) => error_reply(ErrorCode::InvalidArgument, &e.to_string(), corr),
                }
            }
        },

        MessageType::AdminConfigSet => match cmd.data.split_once('=') {
            Some((key, value)) => {
                let result = ctx.config_write().admin_set(key.trim(), value.trim());
                match result {
                    Ok(()) => {
                        info!(key = key.trim(), value = value.trim(), "config updated");
                        ack(corr)
                    }
                    Err(e) => error_reply(ErrorCode::InvalidArgument, &e.to_string(), corr),
                }
            }
            None => error_reply(ErrorCode::InvalidArgument, "expected key=value", corr),
        },

        MessageType::AdminReorderQueue => {
            ctx.queue.reorder_by_priority();
            info!("queue reordered by priority");
            ack(corr)
        }

        MessageType::AdminBulkDisconnect => match BulkSelector::parse(cmd.data.trim()) {
            Some(selector) => {
                let marked = ctx.registry.bulk_mark(&selector);
                info!(marked, "bulk disconnect");
                Message::new(
                    MessageType::AdminBulkDisconnect,
                    corr,
                    format!("disconnected {marked} sessions").into_bytes(),
                )
            }
            None => error_reply(ErrorCode::InvalidArgument, "bad bulk selector", corr),
        },

        other => {
            warn!(msg_type = ?other, "unexpected message type on admin endpoint");
            error_reply(ErrorCode::InvalidArgument, "unknown admin command", corr)
        }
    };

    (reply, AdminAction::Continue)
}

fn filtered_jobs(ctx: &ServerContext, filter: &str) -> Vec<Job> {
    let all = ctx.queue.list_all();
    match filter {
        "" | "all" => all,
        "active" => all.into_iter().filter(|j| !j.state.is_terminal()).collect(),
        "completed" => all.into_iter().filter(|j| j.state.is_terminal()).collect(),
        other => match other.strip_prefix("client=").and_then(|id| id.parse::<u32>().ok()) {
            Some(session_id) => all
                .into_iter()
                .filter(|j| j.session_id == session_id)
                .collect(),
            None => all,
        },
    }
}

fn render_job_table(jobs: &[Job]) -> String {
    let mut out = format!("Jobs: {}\n\n", jobs.len());
    for job in jobs {
        let age_secs = (Utc::now() - job.submitted_at).num_seconds();
        out.push_str(&format!(
            "Job: {} | Client: {} | Lang: {} | Mode: {} | State: {} | Prio: {} | Age: {}s | PID: {} | File: {}\n",
            job.job_id,
            job.session_id,
            job.language,
            job.mode,
            job.state,
            job.priority,
            age_secs,
            job.pid.unwrap_or(0),
            job.source_file,
        ));
    }
    out
}
