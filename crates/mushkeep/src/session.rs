use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeroize::Zeroize;

use crate::pending::PendingQueue;

/// Stable integer id allocated at accept; never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of one backend TCP connection incarnation. A session may open, lose,
/// and reopen backend connections many times; each gets a fresh id, so a
/// late event from a dead connection can never alias a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendConnId(pub u64);

impl fmt::Display for BackendConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live TCP peer: a bounded byte channel drained by a writer task, plus
/// the reader task feeding engine events. Dropping the link aborts the
/// reader and lets the writer drain its queue and close the socket.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl Link {
    pub fn new(tx: mpsc::Sender<Bytes>, reader: JoinHandle<()>, writer: JoinHandle<()>) -> Self {
        Self {
            tx,
            reader,
            _writer: writer,
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug)]
pub struct BackendLink {
    pub conn: BackendConnId,
    pub link: Link,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub remote_host: IpAddr,
    pub client: Link,
    pub backend: Option<BackendLink>,

    pub user: Option<String>,
    pub password: Option<String>,

    pub created_at: Instant,
    /// Set the instant the backend socket dropped unexpectedly; cleared on
    /// reconnect, on confirmed-intentional disconnect, and by failover
    /// teardown.
    pub disconnect_at: Option<Instant>,
    /// Backend output is gagged until the reconnect sentinel is seen.
    pub reconnect_pending: bool,
    /// Consumed to suppress one spurious client-side EOF per reconnect
    /// cycle.
    pub was_offline: bool,
    /// The offline notice goes out once per outage episode; cleared when
    /// the session is restored.
    pub notified_offline: bool,

    /// Bumped per backend dial; a completed dial with a stale seq is
    /// superseded and its socket is dropped.
    pub dial_seq: u64,

    pub pending: PendingQueue,
}

impl Session {
    pub fn new(id: SessionId, remote_host: IpAddr, client: Link) -> Self {
        Self {
            id,
            remote_host,
            client,
            backend: None,
            user: None,
            password: None,
            created_at: Instant::now(),
            disconnect_at: None,
            reconnect_pending: false,
            was_offline: false,
            notified_offline: false,
            dial_seq: 0,
            pending: PendingQueue::default(),
        }
    }

    pub fn authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn store_credentials(&mut self, user: String, password: String) {
        self.wipe_credentials();
        self.user = Some(user);
        self.password = Some(password);
    }

    pub fn wipe_credentials(&mut self) {
        if let Some(p) = self.password.as_mut() {
            p.zeroize();
        }
        self.user = None;
        self.password = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(p) = self.password.as_mut() {
            p.zeroize();
        }
    }
}

/// The session table plus the reverse index from backend connection to
/// owning session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_backend: HashMap<BackendConnId, SessionId>,
    next_sid: u64,
    next_conn: u64,
}

impl SessionRegistry {
    pub fn next_session_id(&mut self) -> SessionId {
        self.next_sid += 1;
        SessionId(self.next_sid)
    }

    pub fn next_backend_id(&mut self) -> BackendConnId {
        self.next_conn += 1;
        BackendConnId(self.next_conn)
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, sid: SessionId) -> Option<&Session> {
        self.sessions.get(&sid)
    }

    pub fn get_mut(&mut self, sid: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    pub fn find_by_backend(&self, conn: BackendConnId) -> Option<SessionId> {
        self.by_backend.get(&conn).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Attach a freshly opened backend connection to a session. Returns
    /// false (dropping the link, which closes the socket) when the session
    /// no longer exists.
    pub fn attach_backend(&mut self, sid: SessionId, conn: BackendConnId, link: Link) -> bool {
        let Some(s) = self.sessions.get_mut(&sid) else {
            return false;
        };
        if let Some(old) = s.backend.take() {
            self.by_backend.remove(&old.conn);
        }
        s.backend = Some(BackendLink { conn, link });
        self.by_backend.insert(conn, sid);
        true
    }

    /// Drop a session's backend connection, if any. Closing happens as the
    /// link drops.
    pub fn detach_backend(&mut self, sid: SessionId) -> bool {
        let Some(s) = self.sessions.get_mut(&sid) else {
            return false;
        };
        match s.backend.take() {
            Some(b) => {
                self.by_backend.remove(&b.conn);
                true
            }
            None => false,
        }
    }

    /// Remove a session entirely: both sockets close as their links drop,
    /// credentials are wiped, queue state goes with the session.
    pub fn destroy(&mut self, sid: SessionId) -> bool {
        let Some(mut s) = self.sessions.remove(&sid) else {
            return false;
        };
        if let Some(b) = s.backend.take() {
            self.by_backend.remove(&b.conn);
        }
        s.wipe_credentials();
        true
    }

    /// Dual-index consistency check, reported by `#?`.
    pub fn integrity_errors(&self) -> Vec<String> {
        let mut errs = Vec::new();
        for (conn, sid) in &self.by_backend {
            match self.sessions.get(sid) {
                None => errs.push(format!("world #{conn} indexed to missing session #{sid}")),
                Some(s) => {
                    if s.backend.as_ref().map(|b| b.conn) != Some(*conn) {
                        errs.push(format!("world #{conn} index disagrees with session #{sid}"));
                    }
                }
            }
        }
        for s in self.sessions.values() {
            if let Some(b) = &s.backend {
                if self.by_backend.get(&b.conn) != Some(&s.id) {
                    errs.push(format!("session #{} world #{} missing from index", s.id, b.conn));
                }
            }
        }
        errs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_link() -> Link {
        let (tx, _rx) = mpsc::channel(4);
        let reader = tokio::spawn(async {});
        let writer = tokio::spawn(async {});
        Link::new(tx, reader, writer)
    }

    fn new_session(reg: &mut SessionRegistry) -> SessionId {
        let sid = reg.next_session_id();
        reg.insert(Session::new(sid, "127.0.0.1".parse().unwrap(), dummy_link()));
        sid
    }

    #[tokio::test]
    async fn attach_detach_keeps_dual_index_consistent() {
        let mut reg = SessionRegistry::default();
        let sid = new_session(&mut reg);

        let conn = reg.next_backend_id();
        assert!(reg.attach_backend(sid, conn, dummy_link()));
        assert_eq!(reg.find_by_backend(conn), Some(sid));
        assert!(reg.integrity_errors().is_empty());

        assert!(reg.detach_backend(sid));
        assert_eq!(reg.find_by_backend(conn), None);
        assert!(reg.get(sid).unwrap().backend.is_none());
        assert!(reg.integrity_errors().is_empty());
    }

    #[tokio::test]
    async fn reattach_replaces_old_index_entry() {
        let mut reg = SessionRegistry::default();
        let sid = new_session(&mut reg);

        let first = reg.next_backend_id();
        reg.attach_backend(sid, first, dummy_link());
        let second = reg.next_backend_id();
        reg.attach_backend(sid, second, dummy_link());

        assert_eq!(reg.find_by_backend(first), None);
        assert_eq!(reg.find_by_backend(second), Some(sid));
        assert!(reg.integrity_errors().is_empty());
    }

    #[tokio::test]
    async fn destroy_removes_both_indexes_and_wipes_credentials() {
        let mut reg = SessionRegistry::default();
        let sid = new_session(&mut reg);
        let conn = reg.next_backend_id();
        reg.attach_backend(sid, conn, dummy_link());
        reg.get_mut(sid)
            .unwrap()
            .store_credentials("alice".into(), "secret".into());

        assert!(reg.destroy(sid));
        assert!(reg.get(sid).is_none());
        assert_eq!(reg.find_by_backend(conn), None);
        assert!(!reg.destroy(sid));
    }

    #[tokio::test]
    async fn integrity_errors_surface_orphan_index_entries() {
        let mut reg = SessionRegistry::default();
        let sid = new_session(&mut reg);
        let conn = reg.next_backend_id();
        reg.attach_backend(sid, conn, dummy_link());

        // Corrupt the index deliberately.
        reg.by_backend.insert(BackendConnId(999), SessionId(777));
        let errs = reg.integrity_errors();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("999"));
    }
}
