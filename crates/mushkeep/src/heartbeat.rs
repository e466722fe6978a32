//! The liveness oracle: one dedicated, permanently-logged-in backend
//! connection. Its presence defines `online()`; its death triggers
//! failover teardown; any line it produces proves the backend is up.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::Event;
use crate::session::Link;

#[derive(Debug, Default)]
pub struct HeartbeatController {
    link: Option<Link>,
    /// Incremented per dial attempt; events carrying an older generation
    /// are from a connection that no longer matters.
    gen: u64,
    dialing: bool,
    next_attempt: Option<Instant>,
    /// The offline warning is logged once per outage episode, not once per
    /// retry.
    announced_down: bool,
}

impl HeartbeatController {
    pub fn new() -> Self {
        Self::default()
    }

    /// World-side connects for client sessions are suppressed while this
    /// is false.
    pub fn online(&self) -> bool {
        self.link.is_some()
    }

    pub fn current_gen(&self) -> u64 {
        self.gen
    }

    /// Invoked at the top of each loop iteration: start a dial if the
    /// heartbeat is absent and the retry clock allows it.
    pub fn maybe_open(
        &mut self,
        now: Instant,
        interval: Duration,
        addr: String,
        events: mpsc::Sender<Event>,
    ) {
        if self.link.is_some() || self.dialing {
            return;
        }
        if let Some(t) = self.next_attempt {
            if now < t {
                return;
            }
        }
        self.next_attempt = Some(now + interval);
        self.dialing = true;
        self.gen += 1;
        let gen = self.gen;

        tokio::spawn(async move {
            let ev = match tokio::time::timeout(interval, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Event::HeartbeatUp { gen, stream },
                Ok(Err(err)) => Event::HeartbeatDialFailed { gen, err },
                Err(_) => Event::HeartbeatDialFailed {
                    gen,
                    err: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                },
            };
            let _ = events.send(ev).await;
        });
    }

    pub fn on_dial_failed(&mut self, gen: u64, err: &std::io::Error) {
        if gen != self.gen {
            return;
        }
        self.dialing = false;
        if !self.announced_down {
            self.announced_down = true;
            warn!(err = %err, "backend offline; retrying");
        }
    }

    /// Adopt the connection a dial task produced. Returns false for a
    /// stale dial; the caller drops the link, which closes the socket.
    pub fn attach(&mut self, gen: u64, link: Link) -> bool {
        if gen != self.gen {
            return false;
        }
        self.dialing = false;
        self.announced_down = false;
        self.link = Some(link);
        info!("backend heartbeat established");
        true
    }

    /// Heartbeat read-EOF. Returns true when it was the live connection
    /// (the caller then runs failover teardown).
    pub fn on_gone(&mut self, gen: u64) -> bool {
        if gen != self.gen || self.link.is_none() {
            return false;
        }
        self.link = None;
        true
    }

    pub fn close(&mut self) {
        self.link = None;
    }

    /// Forget any in-flight dial. Used when the backend address changes,
    /// so a dial to the old address cannot attach.
    pub fn invalidate_dials(&mut self) {
        self.gen += 1;
        self.dialing = false;
    }

    pub fn send(&self, line: Bytes) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = link.tx.try_send(line) {
            warn!("heartbeat write queue full; dropping");
        }
    }
}
