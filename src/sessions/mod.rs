//! Client sessions.
//!
//! The session manager owns every live client connection: a
//! generation-counted arena of session records plus, per session, the
//! protocol state machine `Connecting → Authenticated → Idle ↔
//! {Uploading, Processing} → Disconnecting`. The dispatcher thread owns
//! the sockets; the registry here holds the bookkeeping and a cloned
//! stream handle so the admin plane can force-close a connection.

pub mod dispatcher;
pub mod handlers;

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Idle,
    Uploading,
    Processing,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "Connecting",
            SessionState::Authenticated => "Authenticated",
            SessionState::Idle => "Idle",
            SessionState::Uploading => "Uploading",
            SessionState::Processing => "Processing",
            SessionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// An upload in progress.
#[derive(Debug)]
pub struct UploadBuffer {
    pub filename: String,
    pub expected_size: u64,
    pub expected_chunks: u32,
    pub received_chunks: u32,
    pub data: Vec<u8>,
}

/// A completed upload waiting to be claimed by a compile request.
#[derive(Debug)]
pub struct SealedUpload {
    pub filename: String,
    pub data: Vec<u8>,
}

/// One client session record.
#[derive(Debug)]
pub struct Session {
    pub session_id: u32,
    pub state: SessionState,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub name: String,
    pub platform: String,
    pub active_jobs: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub upload: Option<UploadBuffer>,
    pub sealed_upload: Option<SealedUpload>,
    /// Cloned stream handle used only to shut the socket down from the
    /// admin plane; the dispatcher owns the primary.
    pub shutdown_handle: Option<TcpStream>,
}

impl Session {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Force-close the underlying socket, if we hold a handle to it.
    pub fn shutdown_socket(&self) {
        if let Some(stream) = &self.shutdown_handle {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Selector for the admin bulk-disconnect command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkSelector {
    /// Sessions idle longer than the given duration.
    Idle(Duration),
    /// Sessions whose peer address starts with the prefix (a trailing
    /// `*` on the pattern is stripped).
    IpPrefix(String),
    /// Every session except the given id.
    AllExcept(u32),
}

impl BulkSelector {
    /// Parse the admin command form: `idle=SECS`, `ip=PATTERN`,
    /// `all-except=ID`.
    pub fn parse(data: &str) -> Option<Self> {
        let (key, value) = data.split_once('=')?;
        match key.trim() {
            "idle" => value.trim().parse().ok().map(Duration::from_secs).map(Self::Idle),
            "ip" => Some(Self::IpPrefix(value.trim().trim_end_matches('*').to_string())),
            "all-except" => value.trim().parse().ok().map(Self::AllExcept),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

#[derive(Debug, Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_session_id: u32,
}

impl Table {
    fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(|s| s.session.as_ref())
    }

    fn find_mut(&mut self, session_id: u32) -> Option<&mut Session> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.session.as_mut())
            .find(|s| s.session_id == session_id)
    }
}

/// Thread-safe registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    table: Mutex<Table>,
    max_sessions: usize,
}

/// Why an incoming connection was refused.
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("session limit ({0}) reached")]
    Full(usize),
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                next_session_id: 1,
            }),
            max_sessions,
        }
    }

    /// Admit a new connection in the `Connecting` state.
    pub fn admit(
        &self,
        peer: String,
        shutdown_handle: Option<TcpStream>,
    ) -> Result<u32, AdmitError> {
        let mut table = self.lock();
        let live = table.iter().count();
        if live >= self.max_sessions {
            return Err(AdmitError::Full(self.max_sessions));
        }

        let session_id = table.next_session_id;
        table.next_session_id = table.next_session_id.checked_add(1).unwrap_or(1);

        let session = Session {
            session_id,
            state: SessionState::Connecting,
            peer,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            name: String::new(),
            platform: String::new(),
            active_jobs: 0,
            bytes_in: 0,
            bytes_out: 0,
            upload: None,
            sealed_upload: None,
            shutdown_handle,
        };

        if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index as usize];
            slot.session = Some(session);
        } else {
            table.slots.push(Slot {
                generation: 0,
                session: Some(session),
            });
        }
        Ok(session_id)
    }

    /// Remove a session record, returning it for final accounting.
    pub fn remove(&self, session_id: u32) -> Option<Session> {
        let mut guard = self.lock();
        let table = &mut *guard;
        for (index, slot) in table.slots.iter_mut().enumerate() {
            if slot
                .session
                .as_ref()
                .is_some_and(|s| s.session_id == session_id)
            {
                let session = slot.session.take();
                slot.generation = slot.generation.wrapping_add(1);
                table.free.push(index as u32);
                return session;
            }
        }
        None
    }

    /// Run a closure against one session under the registry lock.
    pub fn with_session<T>(
        &self,
        session_id: u32,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Option<T> {
        let mut table = self.lock();
        table.find_mut(session_id).map(f)
    }

    pub fn touch(&self, session_id: u32) {
        self.with_session(session_id, |s| s.touch());
    }

    pub fn add_bytes(&self, session_id: u32, received: u64, sent: u64) {
        self.with_session(session_id, |s| {
            s.bytes_in += received;
            s.bytes_out += sent;
        });
    }

    /// Mark a session for removal; with `force`, also shut its socket
    /// down so the dispatcher notices immediately.
    pub fn mark_disconnecting(&self, session_id: u32, force: bool) -> bool {
        self.with_session(session_id, |s| {
            s.state = SessionState::Disconnecting;
            if force {
                s.shutdown_socket();
            }
        })
        .is_some()
    }

    /// Apply a bulk-disconnect selector. Returns how many sessions were
    /// marked.
    pub fn bulk_mark(&self, selector: &BulkSelector) -> usize {
        let ids: Vec<u32> = {
            let table = self.lock();
            table
                .iter()
                .filter(|s| match selector {
                    BulkSelector::Idle(min_idle) => s.last_activity.elapsed() >= *min_idle,
                    BulkSelector::IpPrefix(prefix) => s.peer.starts_with(prefix.as_str()),
                    BulkSelector::AllExcept(keep) => s.session_id != *keep,
                })
                .map(|s| s.session_id)
                .collect()
        };
        let count = ids.len();
        for id in ids {
            self.mark_disconnecting(id, false);
        }
        count
    }

    /// Sessions whose inactivity exceeds the timeout, plus any already
    /// marked `Disconnecting`. The dispatcher reaps these on its tick.
    pub fn reapable(&self, idle_timeout: Duration) -> Vec<u32> {
        let table = self.lock();
        table
            .iter()
            .filter(|s| {
                s.state == SessionState::Disconnecting || s.last_activity.elapsed() > idle_timeout
            })
            .map(|s| s.session_id)
            .collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.lock().iter().map(|s| s.session_id).collect()
    }

    pub fn count(&self) -> usize {
        self.lock().iter().count()
    }

    /// Render the admin client listing, one line per session.
    pub fn render_table(&self, detailed: bool) -> String {
        let table = self.lock();
        let mut out = format!("Active Clients: {}\n\n", table.iter().count());
        for s in table.iter() {
            let connected_secs = (Utc::now() - s.connected_at).num_seconds();
            out.push_str(&format!(
                "ID: {} | Peer: {} | State: {} | Connected: {}s | Jobs: {} | In: {} | Out: {}\n",
                s.session_id, s.peer, s.state, connected_secs, s.active_jobs, s.bytes_in, s.bytes_out
            ));
            if detailed {
                out.push_str(&format!(
                    "    Name: {} | Platform: {} | Idle: {}s\n",
                    if s.name.is_empty() { "-" } else { &s.name },
                    if s.platform.is_empty() { "-" } else { &s.platform },
                    s.last_activity.elapsed().as_secs()
                ));
            }
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_assigns_monotonic_ids() {
        let registry = SessionRegistry::new(10);
        let a = registry.admit("127.0.0.1:1000".into(), None).unwrap();
        let b = registry.admit("127.0.0.1:1001".into(), None).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_admit_enforces_limit() {
        let registry = SessionRegistry::new(1);
        registry.admit("a".into(), None).unwrap();
        assert!(matches!(
            registry.admit("b".into(), None),
            Err(AdmitError::Full(1))
        ));
    }

    #[test]
    fn test_remove_frees_capacity() {
        let registry = SessionRegistry::new(1);
        let id = registry.admit("a".into(), None).unwrap();
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.session_id, id);
        assert!(registry.admit("b".into(), None).is_ok());
    }

    #[test]
    fn test_new_sessions_start_connecting() {
        let registry = SessionRegistry::new(10);
        let id = registry.admit("a".into(), None).unwrap();
        let state = registry.with_session(id, |s| s.state).unwrap();
        assert_eq!(state, SessionState::Connecting);
    }

    #[test]
    fn test_reapable_includes_marked_sessions() {
        let registry = SessionRegistry::new(10);
        let fresh = registry.admit("a".into(), None).unwrap();
        let marked = registry.admit("b".into(), None).unwrap();
        registry.mark_disconnecting(marked, false);

        let reapable = registry.reapable(Duration::from_secs(3600));
        assert!(reapable.contains(&marked));
        assert!(!reapable.contains(&fresh));
    }

    #[test]
    fn test_reapable_after_idle_timeout() {
        let registry = SessionRegistry::new(10);
        let id = registry.admit("a".into(), None).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(registry.reapable(Duration::from_millis(10)).contains(&id));
        // Activity resets the clock.
        registry.touch(id);
        assert!(registry.reapable(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_bulk_selector_parsing() {
        assert_eq!(
            BulkSelector::parse("idle=300"),
            Some(BulkSelector::Idle(Duration::from_secs(300)))
        );
        assert_eq!(
            BulkSelector::parse("ip=10.0.*"),
            Some(BulkSelector::IpPrefix("10.0.".into()))
        );
        assert_eq!(
            BulkSelector::parse("all-except=7"),
            Some(BulkSelector::AllExcept(7))
        );
        assert_eq!(BulkSelector::parse("bogus=1"), None);
        assert_eq!(BulkSelector::parse("idle"), None);
    }

    #[test]
    fn test_bulk_mark_all_except() {
        let registry = SessionRegistry::new(10);
        let keep = registry.admit("a".into(), None).unwrap();
        registry.admit("b".into(), None).unwrap();
        registry.admit("c".into(), None).unwrap();

        let marked = registry.bulk_mark(&BulkSelector::AllExcept(keep));
        assert_eq!(marked, 2);
        let keep_state = registry.with_session(keep, |s| s.state).unwrap();
        assert_eq!(keep_state, SessionState::Connecting);
    }

    #[test]
    fn test_bulk_mark_by_ip_prefix() {
        let registry = SessionRegistry::new(10);
        registry.admit("10.0.0.5:100".into(), None).unwrap();
        registry.admit("192.168.1.2:100".into(), None).unwrap();

        let marked = registry.bulk_mark(&BulkSelector::IpPrefix("10.0.".into()));
        assert_eq!(marked, 1);
    }

    #[test]
    fn test_render_table_lists_sessions() {
        let registry = SessionRegistry::new(10);
        let id = registry.admit("127.0.0.1:9".into(), None).unwrap();
        registry.with_session(id, |s| {
            s.name = "tester".into();
            s.state = SessionState::Idle;
        });

        let plain = registry.render_table(false);
        assert!(plain.contains("Active Clients: 1"));
        assert!(plain.contains("State: Idle"));
        assert!(!plain.contains("tester"));

        let detailed = registry.render_table(true);
        assert!(detailed.contains("tester"));
    }
}
