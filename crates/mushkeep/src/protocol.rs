//! Text-stream matching: the login command, the configured success/fail
//! patterns, and the in-band sentinels.
//!
//! The sentinels are a fragile pseudo-RPC carried inside the game text
//! stream; every place that builds or recognizes one lives here and
//! nowhere else.

use std::sync::OnceLock;

use memchr::memmem;
use regex::Regex;

use crate::config::Config;
use crate::session::SessionId;

/// Token echoed back by the backend on a freshly replayed connection,
/// ending the gag. Matched case-sensitively as a substring.
pub const RECONNECT_SENTINEL: &str = "### RECONNECT COMPLETE ###";

/// Probe sent on the heartbeat to provoke any backend output at all.
pub fn probe_line(sid: SessionId) -> String {
    format!("think ### PING: {sid}###")
}

/// Barrier sent right after the credential replay; the backend echoes it
/// back, which is the signal to stop gagging.
pub fn reconnect_line() -> String {
    format!("think {RECONNECT_SENTINEL}")
}

pub fn login_line(user: &str, pass: &str) -> String {
    format!("connect {user} {pass}")
}

pub fn is_reconnect_sentinel(line: &[u8]) -> bool {
    memmem::find(line, RECONNECT_SENTINEL.as_bytes()).is_some()
}

/// The `#?` introspection request: the literal command alone on a line.
pub fn is_status_request(line: &[u8]) -> bool {
    let mut s = line;
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s == b"#?"
}

/// Capture `connect <user> <pass>` as typed. The keyword is
/// case-insensitive; tokens may not contain `;`, `,`, `%`, or whitespace.
pub fn parse_login(line: &str) -> Option<(String, String)> {
    static LOGIN_RE: OnceLock<Regex> = OnceLock::new();
    let re = LOGIN_RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*connect\s+([^;,%\s]+)\s+([^;,%\s]+)\s*$").expect("login pattern")
    });
    let c = re.captures(line)?;
    Some((c[1].to_string(), c[2].to_string()))
}

/// Compiled forms of the configured backend-response patterns.
#[derive(Debug)]
pub struct Patterns {
    pub success: Regex,
    pub fail: Regex,
}

impl Patterns {
    pub fn compile(cfg: &Config) -> anyhow::Result<Self> {
        let success = Regex::new(&cfg.connect_success)
            .map_err(|e| anyhow::anyhow!("bad connect_success pattern: {e}"))?;
        let fail = Regex::new(&cfg.connect_fail)
            .map_err(|e| anyhow::anyhow!("bad connect_fail pattern: {e}"))?;
        Ok(Self { success, fail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_capture_basic() {
        assert_eq!(
            parse_login("connect alice secret"),
            Some(("alice".to_string(), "secret".to_string()))
        );
        assert_eq!(
            parse_login("  CONNECT Alice s3cr3t  "),
            Some(("Alice".to_string(), "s3cr3t".to_string()))
        );
    }

    #[test]
    fn login_capture_rejects_bad_tokens() {
        assert!(parse_login("connect al;ce secret").is_none());
        assert!(parse_login("connect alice se%ret").is_none());
        assert!(parse_login("connect alice").is_none());
        assert!(parse_login("connect alice two words").is_none());
        assert!(parse_login("say connect alice secret").is_none());
    }

    #[test]
    fn sentinel_matches_as_substring() {
        assert!(is_reconnect_sentinel(b"### RECONNECT COMPLETE ###"));
        assert!(is_reconnect_sentinel(
            b"You think: ### RECONNECT COMPLETE ###"
        ));
        assert!(!is_reconnect_sentinel(b"### reconnect complete ###"));
        assert!(!is_reconnect_sentinel(b"RECONNECT"));
    }

    #[test]
    fn probe_carries_session_id() {
        let line = probe_line(SessionId(42));
        assert_eq!(line, "think ### PING: 42###");
    }

    #[test]
    fn status_request_is_exact() {
        assert!(is_status_request(b"#?"));
        assert!(is_status_request(b"  #?  "));
        assert!(!is_status_request(b"#? now"));
        assert!(!is_status_request(b"##?"));
    }

    #[test]
    fn default_patterns_compile_and_match() {
        let p = Patterns::compile(&Config::default()).unwrap();
        assert!(p.success.is_match("Last connect was from 1.2.3.4"));
        assert!(p
            .fail
            .is_match("Either that player does not exist, or has a different password."));
        assert!(!p.success.is_match("You say, \"hello\""));
    }
}
