//! Session dispatcher.
//!
//! One thread multiplexes the listener and every session socket through
//! a poll loop with a one-second tick. Each readable wake drains exactly
//! one framed message and writes its reply before the next socket is
//! serviced, so replies on a session are totally ordered. The tick reaps
//! idle and marked-for-disconnect sessions; removal cancels the
//! session's jobs.

use crate::server::ServerContext;
use crate::sessions::handlers;
use codeforge_protocol::codec::{read_message_deadline, write_message};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_TICK_MS: u16 = 1000;

/// A session that stalls longer than this mid-frame is dropped; it
/// cannot be allowed to hold the dispatcher indefinitely.
const FRAME_DEADLINE: Duration = Duration::from_secs(5);

/// Run the session dispatcher until shutdown.
pub fn run(ctx: Arc<ServerContext>, listener: TcpListener) {
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "failed to mark listener non-blocking");
    }
    let mut streams: HashMap<u32, TcpStream> = HashMap::new();
    info!("session dispatcher started");

    while !ctx.shutting_down() {
        let ids: Vec<u32> = streams.keys().copied().collect();
        let mut fds = Vec::with_capacity(ids.len() + 1);
        fds.push(listener.as_raw_fd());
        for id in &ids {
            fds.push(streams[id].as_raw_fd());
        }

        let ready = match crate::net::poll_readable(&fds, POLL_TICK_MS) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "session poll failed");
                break;
            }
        };

        if ready.first().is_some_and(|r| r.readable) {
            accept_pending(&ctx, &listener, &mut streams);
        }

        for (slot, id) in ids.iter().enumerate() {
            let Some(readiness) = ready.get(slot + 1) else {
                continue;
            };
            if readiness.hangup {
                debug!(session_id = id, "peer hung up");
                remove_session(&ctx, &mut streams, *id);
            } else if readiness.readable && !service_session(&ctx, &mut streams, *id) {
                remove_session(&ctx, &mut streams, *id);
            }
        }

        // Tick work: idle-timeout reaping plus admin-marked disconnects.
        let idle_timeout = ctx.config_read().client_timeout();
        for id in ctx.registry.reapable(idle_timeout) {
            info!(session_id = id, "reaping session");
            remove_session(&ctx, &mut streams, id);
        }
    }

    for id in streams.keys().copied().collect::<Vec<_>>() {
        remove_session(&ctx, &mut streams, id);
    }
    info!("session dispatcher stopped");
}

fn accept_pending(
    ctx: &ServerContext,
    listener: &TcpListener,
    streams: &mut HashMap<u32, TcpStream>,
) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => admit(ctx, streams, stream, addr.to_string()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn admit(
    ctx: &ServerContext,
    streams: &mut HashMap<u32, TcpStream>,
    stream: TcpStream,
    peer: String,
) {
    let client_timeout = ctx.config_read().client_timeout();
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(client_timeout));
    let _ = stream.set_write_timeout(Some(client_timeout));
    if let Err(e) = stream.set_nonblocking(true) {
        warn!(peer = %peer, error = %e, "failed to mark session socket non-blocking");
        return;
    }

    let shutdown_handle = stream.try_clone().ok();
    match ctx.registry.admit(peer.clone(), shutdown_handle) {
        Ok(session_id) => {
            info!(session_id, peer = %peer, "client connected");
            streams.insert(session_id, stream);
            ctx.stats.session_connected();
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "refusing connection");
            // Dropping the stream closes the socket.
        }
    }
}

/// Drain one message and write its reply. Returns false when the
/// session must be removed.
fn service_session(
    ctx: &ServerContext,
    streams: &mut HashMap<u32, TcpStream>,
    session_id: u32,
) -> bool {
    let Some(stream) = streams.get_mut(&session_id) else {
        return false;
    };

    let msg = match read_message_deadline(stream, FRAME_DEADLINE) {
        Ok(msg) => msg,
        Err(e) if e.is_disconnect() => {
            debug!(session_id, "client disconnected");
            return false;
        }
        Err(e) => {
            warn!(session_id, error = %e, "framing failure, dropping session");
            return false;
        }
    };

    ctx.registry.touch(session_id);
    let received = msg.wire_len() as u64;

    let reply = handlers::handle_message(ctx, session_id, &msg).into_message();
    let sent = reply.wire_len() as u64;
    if let Err(e) = write_message(stream, &reply) {
        warn!(session_id, error = %e, "failed to write reply");
        return false;
    }

    ctx.registry.add_bytes(session_id, received, sent);
    ctx.stats.add_bytes(received, sent);
    true
}

/// Tear one session down: close the socket, cancel its jobs, drop the
/// record, update statistics.
fn remove_session(ctx: &ServerContext, streams: &mut HashMap<u32, TcpStream>, session_id: u32) {
    streams.remove(&session_id);

    let cancelled = ctx.queue.cancel_all_for_session(session_id, false);
    if cancelled > 0 {
        info!(session_id, cancelled, "cancelled jobs for departing session");
    }

    if let Some(session) = ctx.registry.remove(session_id) {
        info!(
            session_id,
            peer = %session.peer,
            bytes_in = session.bytes_in,
            bytes_out = session.bytes_out,
            "session closed"
        );
        ctx.stats.session_disconnected();
    }
}
