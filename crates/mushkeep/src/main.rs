use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};

use mushkeep::config;
use mushkeep::engine::{Engine, Event};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mushkeep=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let (cfg, config_path) = config::load()?;

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind))?;

    let config_display = config_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        bind = %cfg.bind,
        mush = %cfg.mush_addr,
        config = %config_display,
        "mushkeep listening"
    );

    let engine = Engine::new(cfg, listener, config_path)?;

    // SIGHUP re-reads the config file; a changed backend address forces a
    // failover so sessions migrate.
    let reload_tx = engine.event_sender();
    tokio::spawn(async move {
        let Ok(mut hup) = signal(SignalKind::hangup()) else {
            return;
        };
        while hup.recv().await.is_some() {
            if reload_tx.send(Event::Reload).await.is_err() {
                return;
            }
        }
    });

    tokio::select! {
        res = engine.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
