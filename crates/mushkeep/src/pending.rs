use std::collections::VecDeque;
use std::time::{Duration, Instant};

use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Connect,
}

/// One in-flight command awaiting backend confirmation.
#[derive(Debug)]
pub struct PendingCmd {
    pub kind: CmdKind,
    pub user: String,
    pub password: String,
    pub created_at: Instant,
}

impl Drop for PendingCmd {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Per-session FIFO of in-flight commands. Real-world depth is 0 or 1; the
/// head is the command whose backend echo is awaited next.
#[derive(Debug, Default)]
pub struct PendingQueue {
    q: VecDeque<PendingCmd>,
}

impl PendingQueue {
    pub fn push(&mut self, cmd: PendingCmd) {
        self.q.push_back(cmd);
    }

    pub fn head_kind(&self) -> Option<CmdKind> {
        self.q.front().map(|c| c.kind)
    }

    pub fn pop(&mut self) -> Option<PendingCmd> {
        self.q.pop_front()
    }

    pub fn head_age(&self, now: Instant) -> Option<Duration> {
        self.q.front().map(|c| now.duration_since(c.created_at))
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// Drop the head when no confirmation arrived within `timeout`.
    /// Returns true when an entry was expired.
    pub fn expire_head(&mut self, now: Instant, timeout: Duration) -> bool {
        match self.head_age(now) {
            Some(age) if age > timeout => {
                self.q.pop_front();
                true
            }
            _ => false,
        }
    }
}
