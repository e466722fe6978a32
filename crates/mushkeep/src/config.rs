use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address clients connect to.
    pub bind: SocketAddr,
    /// Backend game server, host:port.
    pub mush_addr: String,

    /// Credentials for the dedicated heartbeat connection.
    pub hb_user: String,
    pub hb_pass: String,

    pub hb_interval_ms: u64,
    pub auth_timeout_ms: u64,
    pub unauth_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// Multiplexer tick. Stale sweeps and the heartbeat retry clock run on
    /// this cadence.
    pub tick_ms: u64,

    /// Backend line confirming a successful `connect`.
    pub connect_success: String,
    /// Backend line rejecting a `connect`.
    pub connect_fail: String,
    /// Command telling the backend the client's true address. Empty
    /// disables.
    pub remotehostname_cmd: String,

    pub offline_notice: String,
    pub online_notice: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4000".parse().expect("default bind"),
            mush_addr: "127.0.0.1:4201".to_string(),
            hb_user: "mushkeep".to_string(),
            hb_pass: "mushkeep".to_string(),
            hb_interval_ms: 10_000,
            auth_timeout_ms: 4_000,
            unauth_timeout_ms: 300_000,
            probe_timeout_ms: 10_000,
            tick_ms: 1_000,
            connect_success: "Last connect was from.*".to_string(),
            connect_fail: "Either that player .*not exist.*".to_string(),
            remotehostname_cmd: "@REMOTEHOSTNAME".to_string(),
            offline_notice: "%%% mushkeep: lost the game server; holding your connection until it returns %%%".to_string(),
            online_notice: "%%% mushkeep: the game server is back; session restored %%%".to_string(),
        }
    }
}

impl Config {
    pub fn hb_interval(&self) -> Duration {
        Duration::from_millis(self.hb_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn unauth_timeout(&self) -> Duration {
        Duration::from_millis(self.unauth_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

fn usage_and_exit() -> ! {
    eprintln!(
        "mushkeep (session-keeping MUSH proxy)\n\n\
USAGE:\n  mushkeep [--bind HOST:PORT] [--mush-addr HOST:PORT] [--config FILE.json]\n\n\
ENV:\n  MUSHKEEP_BIND        default 0.0.0.0:4000\n  MUSHKEEP_MUSH_ADDR   default 127.0.0.1:4201\n  MUSHKEEP_HB_USER     heartbeat login name\n  MUSHKEEP_HB_PASS     heartbeat login password\n  MUSHKEEP_CONFIG      optional; JSON config file, re-read on SIGHUP\n"
    );
    std::process::exit(2);
}

pub fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: Config =
        serde_json::from_str(&s).with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

/// Build the effective config: defaults, then the config file (if any),
/// then env vars, then flags.
pub fn load() -> anyhow::Result<(Config, Option<PathBuf>)> {
    let mut config_path = std::env::var("MUSHKEEP_CONFIG").ok().map(PathBuf::from);

    // Flags are scanned first only to find --config; everything else
    // overrides after the file loads.
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                config_path = Some(PathBuf::from(v));
            }
            "--bind" | "--mush-addr" => {
                it.next().unwrap_or_else(|| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    let mut cfg = match &config_path {
        Some(p) => read_file(p)?,
        None => Config::default(),
    };

    if let Ok(v) = std::env::var("MUSHKEEP_BIND") {
        cfg.bind = v.parse().unwrap_or_else(|_| usage_and_exit());
    }
    if let Ok(v) = std::env::var("MUSHKEEP_MUSH_ADDR") {
        cfg.mush_addr = v;
    }
    if let Ok(v) = std::env::var("MUSHKEEP_HB_USER") {
        cfg.hb_user = v;
    }
    if let Ok(v) = std::env::var("MUSHKEEP_HB_PASS") {
        cfg.hb_pass = v;
    }

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                cfg.bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--mush-addr" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                cfg.mush_addr = v.clone();
            }
            "--config" => {
                it.next();
            }
            _ => {}
        }
    }

    Ok((cfg, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let c = Config::default();
        assert_eq!(c.bind.port(), 4000);
        assert_eq!(c.hb_interval(), Duration::from_secs(10));
        assert_eq!(c.auth_timeout(), Duration::from_secs(4));
        assert_eq!(c.unauth_timeout(), Duration::from_secs(300));
        assert_eq!(c.probe_timeout(), Duration::from_secs(10));
        assert_eq!(c.tick(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"mush_addr": "10.0.0.7:4201", "hb_user": "watcher"}"#)
                .unwrap();
        assert_eq!(cfg.mush_addr, "10.0.0.7:4201");
        assert_eq!(cfg.hb_user, "watcher");
        assert_eq!(cfg.bind.port(), 4000);
        assert_eq!(cfg.connect_success, Config::default().connect_success);
    }
}
