//! The dispatcher and per-session state machine.
//!
//! One engine task owns every piece of mutable state: the session
//! registry, the per-session pending queues, and the heartbeat
//! controller. Socket reader tasks only frame lines and forward events
//! here; writer tasks only drain per-connection byte queues. All state
//! transitions happen between `select!` returns, so reading a heartbeat
//! line and walking the session table is one atomic step.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use keepio::LineReader;

use crate::config::{self, Config};
use crate::heartbeat::HeartbeatController;
use crate::introspect;
use crate::pending::{CmdKind, PendingCmd};
use crate::protocol::{self, Patterns};
use crate::session::{BackendConnId, Link, Session, SessionId, SessionRegistry};

const EVENT_QUEUE: usize = 1024;
const WRITE_QUEUE: usize = 256;

#[derive(Debug)]
pub enum Event {
    ClientLine { sid: SessionId, line: Bytes },
    ClientGone { sid: SessionId },

    BackendLine { conn: BackendConnId, line: Bytes },
    BackendGone { conn: BackendConnId },
    BackendUp { sid: SessionId, seq: u64, replay: bool, stream: TcpStream },
    BackendDialFailed { sid: SessionId, seq: u64, replay: bool, err: std::io::Error },

    HeartbeatUp { gen: u64, stream: TcpStream },
    HeartbeatDialFailed { gen: u64, err: std::io::Error },
    HeartbeatLine { gen: u64, line: Bytes },
    HeartbeatGone { gen: u64 },

    Reload,
}

pub struct Engine {
    cfg: Config,
    config_path: Option<PathBuf>,
    patterns: Patterns,
    registry: SessionRegistry,
    heartbeat: HeartbeatController,
    listener: TcpListener,
    bind: SocketAddr,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

impl Engine {
    pub fn new(
        cfg: Config,
        listener: TcpListener,
        config_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let patterns = Patterns::compile(&cfg)?;
        let bind = listener.local_addr().context("listener local addr")?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Ok(Self {
            cfg,
            config_path,
            patterns,
            registry: SessionRegistry::default(),
            heartbeat: HeartbeatController::new(),
            listener,
            bind,
            events_tx,
            events_rx,
        })
    }

    /// Sender for out-of-band events (the SIGHUP watcher uses this).
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bind
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        enum Step {
            Tick,
            Accept(std::io::Result<(TcpStream, SocketAddr)>),
            Event(Option<Event>),
        }

        let mut tick = tokio::time::interval(self.cfg.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = tick.tick() => Step::Tick,
                res = self.listener.accept() => Step::Accept(res),
                ev = self.events_rx.recv() => Step::Event(ev),
            };

            // Per-iteration fault boundary: nothing that happens to one
            // session may take the loop down.
            match step {
                Step::Tick => self.on_tick(Instant::now()),
                Step::Accept(Ok((stream, peer))) => self.on_accept(stream, peer),
                Step::Accept(Err(e)) => warn!(err = %e, "accept failed"),
                Step::Event(Some(ev)) => self.on_event(ev),
                Step::Event(None) => break,
            }
        }
        Ok(())
    }

    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::ClientLine { sid, line } => self.on_client_line(sid, line),
            Event::ClientGone { sid } => self.on_client_gone(sid),
            Event::BackendLine { conn, line } => self.on_backend_line(conn, line),
            Event::BackendGone { conn } => self.on_backend_gone(conn),
            Event::BackendUp {
                sid,
                seq,
                replay,
                stream,
            } => self.on_backend_up(sid, seq, replay, stream),
            Event::BackendDialFailed {
                sid,
                seq,
                replay,
                err,
            } => self.on_backend_dial_failed(sid, seq, replay, err),
            Event::HeartbeatUp { gen, stream } => self.on_heartbeat_up(gen, stream),
            Event::HeartbeatDialFailed { gen, err } => self.heartbeat.on_dial_failed(gen, &err),
            Event::HeartbeatLine { gen, .. } => self.on_heartbeat_line(gen),
            Event::HeartbeatGone { gen } => self.on_heartbeat_gone(gen),
            Event::Reload => self.on_reload(),
        }
    }

    // --- tick ---------------------------------------------------------

    fn on_tick(&mut self, now: Instant) {
        self.heartbeat.maybe_open(
            now,
            self.cfg.hb_interval(),
            self.cfg.mush_addr.clone(),
            self.events_tx.clone(),
        );
        self.cleanup_stale(now);
    }

    fn cleanup_stale(&mut self, now: Instant) {
        // Login confirmations that never arrived.
        for sid in self.registry.ids() {
            if let Some(s) = self.registry.get_mut(sid) {
                if s.pending.expire_head(now, self.cfg.auth_timeout()) {
                    debug!(sid = %sid, "login confirmation timed out");
                }
            }
        }

        // Sessions that never authenticated.
        let unauth_timeout = self.cfg.unauth_timeout();
        let stale: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| !s.authenticated() && now.duration_since(s.created_at) > unauth_timeout)
            .map(|s| s.id)
            .collect();
        for sid in stale {
            info!(sid = %sid, "closing unauthenticated session after timeout");
            self.registry.destroy(sid);
        }

        // A probe the backend never answered means the heartbeat itself is
        // dead, whatever its socket claims.
        let probe_timeout = self.cfg.probe_timeout();
        let probe_expired = self
            .registry
            .iter()
            .any(|s| s.disconnect_at.is_some_and(|t| now.duration_since(t) > probe_timeout));
        if probe_expired {
            warn!("backend silent past the probe window; assuming it is down");
            self.failover_teardown();
        }
    }

    // --- client side --------------------------------------------------

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let sid = self.registry.next_session_id();
        let link = self.spawn_client_link(sid, stream);
        self.registry.insert(Session::new(sid, peer.ip(), link));
        info!(sid = %sid, peer = %peer, "client connected");
        self.connect_backend(sid, false);
    }

    fn on_client_line(&mut self, sid: SessionId, line: Bytes) {
        if protocol::is_status_request(&line) {
            let report = introspect::report(
                &self.registry,
                self.bind,
                self.heartbeat.online(),
                &self.cfg.hb_user,
            );
            self.send_client(sid, Bytes::from(report));
            return;
        }

        if let Some(s) = self.registry.get_mut(sid) {
            if let Some((user, password)) = protocol::parse_login(&String::from_utf8_lossy(&line))
            {
                debug!(sid = %sid, user = %user, "login attempt queued");
                s.pending.push(PendingCmd {
                    kind: CmdKind::Connect,
                    user,
                    password,
                    created_at: Instant::now(),
                });
            }
        }

        self.send_backend(sid, terminated(&line));
    }

    fn on_client_gone(&mut self, sid: SessionId) {
        let suppress = match self.registry.get_mut(sid) {
            Some(s) if s.was_offline => {
                s.was_offline = false;
                true
            }
            Some(_) => false,
            None => return,
        };
        if suppress {
            // One spurious client-side close per reconnect cycle is the
            // proxy's own doing; the reader re-reports EOF next tick if
            // the client is really gone.
            debug!(sid = %sid, "suppressed one client EOF after failover");
            return;
        }
        info!(sid = %sid, "client disconnected");
        self.registry.destroy(sid);
    }

    // --- backend side -------------------------------------------------

    /// Open the world-side socket for a session. `replay` is set when the
    /// session is coming back from an outage and must re-authenticate.
    fn connect_backend(&mut self, sid: SessionId, replay: bool) {
        let missing_creds = {
            let Some(s) = self.registry.get(sid) else {
                return;
            };
            replay && (s.user.is_none() || s.password.is_none())
        };
        if missing_creds {
            info!(sid = %sid, "nothing to replay; closing session");
            self.registry.destroy(sid);
            return;
        }
        if !self.heartbeat.online() {
            return;
        }

        let seq = {
            let Some(s) = self.registry.get_mut(sid) else {
                return;
            };
            s.dial_seq += 1;
            s.dial_seq
        };
        let addr = self.cfg.mush_addr.clone();
        let dial_timeout = self.cfg.hb_interval();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let ev = match tokio::time::timeout(dial_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Event::BackendUp {
                    sid,
                    seq,
                    replay,
                    stream,
                },
                Ok(Err(err)) => Event::BackendDialFailed {
                    sid,
                    seq,
                    replay,
                    err,
                },
                Err(_) => Event::BackendDialFailed {
                    sid,
                    seq,
                    replay,
                    err: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                },
            };
            let _ = events.send(ev).await;
        });
    }

    fn on_backend_up(&mut self, sid: SessionId, seq: u64, replay: bool, stream: TcpStream) {
        let current = match self.registry.get(sid) {
            Some(s) => seq == s.dial_seq && s.backend.is_none(),
            None => false,
        };
        if !current {
            // The session died or redialed while this connect was in
            // flight; dropping the stream closes it.
            return;
        }

        let conn = self.registry.next_backend_id();
        let link = self.spawn_backend_link(conn, stream);
        self.registry.attach_backend(sid, conn, link);

        if !self.cfg.remotehostname_cmd.is_empty() {
            if let Some(host) = self.registry.get(sid).map(|s| s.remote_host) {
                let line = format!("{} {}", self.cfg.remotehostname_cmd, host);
                self.send_backend(sid, terminated(line.as_bytes()));
            }
        }

        if replay {
            let creds = self.registry.get_mut(sid).and_then(|s| {
                s.disconnect_at = None;
                match (&s.user, &s.password) {
                    (Some(u), Some(p)) => Some((u.clone(), p.clone())),
                    _ => None,
                }
            });
            if let Some((user, password)) = creds {
                info!(sid = %sid, user = %user, "replaying login after outage");
                self.send_backend(sid, terminated(protocol::login_line(&user, &password).as_bytes()));
                self.send_backend(sid, terminated(protocol::reconnect_line().as_bytes()));
            }
        } else {
            debug!(sid = %sid, conn = %conn, "backend session opened");
        }
    }

    fn on_backend_dial_failed(
        &mut self,
        sid: SessionId,
        seq: u64,
        replay: bool,
        err: std::io::Error,
    ) {
        let current = self.registry.get(sid).is_some_and(|s| s.dial_seq == seq);
        if !current {
            return;
        }
        // The session stays parked; the next heartbeat cycle retries.
        warn!(sid = %sid, err = %err, replay, "backend dial failed");
    }

    fn on_backend_line(&mut self, conn: BackendConnId, line: Bytes) {
        let Some(sid) = self.registry.find_by_backend(conn) else {
            return;
        };

        enum Act {
            Gag,
            Restored,
            Forward,
        }

        let act = {
            let Some(s) = self.registry.get_mut(sid) else {
                return;
            };
            if s.reconnect_pending {
                if protocol::is_reconnect_sentinel(&line) {
                    s.reconnect_pending = false;
                    s.disconnect_at = None;
                    s.notified_offline = false;
                    Act::Restored
                } else {
                    Act::Gag
                }
            } else {
                correlate_auth(&self.patterns, s, &line);
                Act::Forward
            }
        };

        match act {
            Act::Gag => {}
            Act::Restored => {
                info!(sid = %sid, "session restored");
                let notice = notice_bytes(&self.cfg.online_notice);
                self.send_client(sid, notice);
            }
            Act::Forward => self.send_client(sid, terminated(&line)),
        }
    }

    fn on_backend_gone(&mut self, conn: BackendConnId) {
        let Some(sid) = self.registry.find_by_backend(conn) else {
            return;
        };
        self.registry.detach_backend(sid);
        let online = self.heartbeat.online();
        if let Some(s) = self.registry.get_mut(sid) {
            s.disconnect_at = Some(Instant::now());
            s.reconnect_pending = true;
        }
        if online {
            // Ask the backend whether the close was deliberate: any
            // heartbeat output inside the probe window means it was.
            self.heartbeat
                .send(terminated(protocol::probe_line(sid).as_bytes()));
            debug!(sid = %sid, "backend socket closed; probing");
        } else {
            debug!(sid = %sid, "backend socket closed while offline");
        }
    }

    // --- heartbeat ----------------------------------------------------

    fn on_heartbeat_up(&mut self, gen: u64, stream: TcpStream) {
        if gen != self.heartbeat.current_gen() {
            return;
        }
        let link = self.spawn_heartbeat_link(gen, stream);
        if !self.heartbeat.attach(gen, link) {
            return;
        }
        self.heartbeat.send(terminated(
            protocol::login_line(&self.cfg.hb_user, &self.cfg.hb_pass).as_bytes(),
        ));

        // The backend is back: every parked session reconnects. Sessions
        // that never authenticated have nothing to replay and are closed.
        for sid in self.registry.ids() {
            if let Some(s) = self.registry.get_mut(sid) {
                s.was_offline = true;
            }
            self.connect_backend(sid, true);
        }
    }

    fn on_heartbeat_line(&mut self, gen: u64) {
        if gen != self.heartbeat.current_gen() {
            return;
        }
        // Any heartbeat output proves the backend is alive, so a session
        // whose own socket it closed was disconnected deliberately.
        let doomed: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| s.disconnect_at.is_some())
            .map(|s| s.id)
            .collect();
        for sid in doomed {
            info!(sid = %sid, "backend confirmed intentional disconnect; closing client");
            self.registry.destroy(sid);
        }
    }

    fn on_heartbeat_gone(&mut self, gen: u64) {
        if !self.heartbeat.on_gone(gen) {
            return;
        }
        warn!("heartbeat lost; backend presumed down");
        self.failover_teardown();
        self.heartbeat.maybe_open(
            Instant::now(),
            self.cfg.hb_interval(),
            self.cfg.mush_addr.clone(),
            self.events_tx.clone(),
        );
    }

    /// Close the heartbeat and park every session: world sockets drop,
    /// output gags, clients hear about the outage exactly once.
    fn failover_teardown(&mut self) {
        self.heartbeat.close();
        let offline = notice_bytes(&self.cfg.offline_notice);
        for sid in self.registry.ids() {
            self.registry.detach_backend(sid);
            let notify = match self.registry.get_mut(sid) {
                Some(s) => {
                    s.disconnect_at = None;
                    s.reconnect_pending = true;
                    // An in-flight dial must not attach a world socket
                    // while we are offline.
                    s.dial_seq += 1;
                    if s.notified_offline {
                        false
                    } else {
                        s.notified_offline = true;
                        true
                    }
                }
                None => false,
            };
            if notify {
                self.send_client(sid, offline.clone());
            }
        }
    }

    // --- reload -------------------------------------------------------

    fn on_reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            info!("reload requested but no config file; ignoring");
            return;
        };
        let new = match config::read_file(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, "config reload failed; keeping previous");
                return;
            }
        };
        match Patterns::compile(&new) {
            Ok(p) => self.patterns = p,
            Err(e) => warn!(err = %e, "bad patterns in reloaded config; keeping previous"),
        }
        if new.bind != self.cfg.bind {
            warn!(bind = %new.bind, "bind change requires a restart; keeping current listener");
        }
        let addr_changed = new.mush_addr != self.cfg.mush_addr;
        let bind = self.cfg.bind;
        self.cfg = new;
        self.cfg.bind = bind;
        info!("configuration reloaded");

        if addr_changed {
            warn!(addr = %self.cfg.mush_addr, "backend address changed; forcing failover");
            self.heartbeat.invalidate_dials();
            self.failover_teardown();
            self.heartbeat.maybe_open(
                Instant::now(),
                self.cfg.hb_interval(),
                self.cfg.mush_addr.clone(),
                self.events_tx.clone(),
            );
        }
    }

    // --- plumbing -----------------------------------------------------

    fn send_client(&self, sid: SessionId, bytes: Bytes) {
        let Some(s) = self.registry.get(sid) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = s.client.tx.try_send(bytes) {
            warn!(sid = %sid, "client write queue full; dropping");
        }
    }

    fn send_backend(&self, sid: SessionId, bytes: Bytes) {
        let Some(b) = self.registry.get(sid).and_then(|s| s.backend.as_ref()) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = b.link.tx.try_send(bytes) {
            warn!(sid = %sid, "backend write queue full; dropping");
        }
    }

    fn spawn_client_link(&self, sid: SessionId, stream: TcpStream) -> Link {
        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
        let writer = spawn_writer(wr, rx);
        let events = self.events_tx.clone();
        let repoll = self.cfg.tick();
        let reader = tokio::spawn(async move {
            let mut lr = LineReader::new(rd);
            loop {
                match lr.read_line().await {
                    Ok(Some(line)) => {
                        if events.send(Event::ClientLine { sid, line }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Report EOF once per tick until the engine tears the session
            // down; the first report may be eaten by the one-shot
            // was_offline suppression.
            loop {
                if events.send(Event::ClientGone { sid }).await.is_err() {
                    return;
                }
                tokio::time::sleep(repoll).await;
            }
        });
        Link::new(tx, reader, writer)
    }

    fn spawn_backend_link(&self, conn: BackendConnId, stream: TcpStream) -> Link {
        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
        let writer = spawn_writer(wr, rx);
        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lr = LineReader::new(rd);
            loop {
                match lr.read_line().await {
                    Ok(Some(line)) => {
                        if events.send(Event::BackendLine { conn, line }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = events.send(Event::BackendGone { conn }).await;
        });
        Link::new(tx, reader, writer)
    }

    fn spawn_heartbeat_link(&self, gen: u64, stream: TcpStream) -> Link {
        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
        let writer = spawn_writer(wr, rx);
        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lr = LineReader::new(rd);
            loop {
                match lr.read_line().await {
                    Ok(Some(line)) => {
                        if events
                            .send(Event::HeartbeatLine { gen, line })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = events.send(Event::HeartbeatGone { gen }).await;
        });
        Link::new(tx, reader, writer)
    }
}

fn spawn_writer(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(b) = rx.recv().await {
            if wr.write_all(&b).await.is_err() {
                break;
            }
        }
    })
}

fn correlate_auth(patterns: &Patterns, s: &mut Session, line: &[u8]) {
    if s.pending.head_kind() != Some(CmdKind::Connect) {
        return;
    }
    let text = String::from_utf8_lossy(line);
    if patterns.success.is_match(&text) {
        if let Some(mut cmd) = s.pending.pop() {
            let user = std::mem::take(&mut cmd.user);
            let password = std::mem::take(&mut cmd.password);
            info!(sid = %s.id, user = %user, host = %s.remote_host, "login confirmed");
            s.store_credentials(user, password);
        }
    } else if patterns.fail.is_match(&text) {
        s.pending.pop();
        debug!(sid = %s.id, "login rejected by backend");
    }
}

fn terminated(line: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(line.len() + 1);
    b.extend_from_slice(line);
    b.extend_from_slice(b"\n");
    b.freeze()
}

fn notice_bytes(notice: &str) -> Bytes {
    if notice.ends_with('\n') {
        Bytes::copy_from_slice(notice.as_bytes())
    } else {
        terminated(notice.as_bytes())
    }
}
