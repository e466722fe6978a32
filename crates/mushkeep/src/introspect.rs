use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::session::SessionRegistry;

/// Build the `#?` report: one row per tracked socket plus any registry
/// integrity errors. Written only to the requesting client.
pub fn report(
    registry: &SessionRegistry,
    bind: SocketAddr,
    hb_online: bool,
    hb_user: &str,
) -> String {
    let mut out = String::new();
    out.push_str("-- mushkeep sockets --\n");

    let _ = writeln!(out, "{:<10}{:<12}{:<15}-", "listener", bind, "listening");
    let _ = writeln!(
        out,
        "{:<10}{:<12}{:<15}{}",
        "hb",
        "-",
        if hb_online { "connected" } else { "not-connected" },
        if hb_online { hb_user } else { "-" },
    );

    for sid in registry.ids() {
        let Some(s) = registry.get(sid) else {
            continue;
        };
        let user = s.user.as_deref().unwrap_or("unconnected");
        let _ = writeln!(out, "{:<10}{:<12}{:<15}{}", "client", format!("#{sid}"), "connected", user);
        if let Some(b) = &s.backend {
            let marker = if s.reconnect_pending {
                "reconnecting"
            } else {
                "connected"
            };
            let _ = writeln!(
                out,
                "{:<10}{:<12}{:<15}{}",
                "world",
                format!("#{sid}/{}", b.conn),
                marker,
                user
            );
        }
    }

    for err in registry.integrity_errors() {
        let _ = writeln!(out, "! {err}");
    }

    let _ = writeln!(out, "-- {} sessions --", registry.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Link, Session, SessionRegistry};
    use tokio::sync::mpsc;

    fn dummy_link() -> Link {
        let (tx, _rx) = mpsc::channel(4);
        Link::new(tx, tokio::spawn(async {}), tokio::spawn(async {}))
    }

    #[tokio::test]
    async fn lists_users_and_unconnected_sessions() {
        let mut reg = SessionRegistry::default();

        let bob = reg.next_session_id();
        reg.insert(Session::new(bob, "10.0.0.5".parse().unwrap(), dummy_link()));
        let conn = reg.next_backend_id();
        reg.attach_backend(bob, conn, dummy_link());
        reg.get_mut(bob)
            .unwrap()
            .store_credentials("bob".into(), "pw".into());

        let charlie = reg.next_session_id();
        reg.insert(Session::new(
            charlie,
            "10.0.0.6".parse().unwrap(),
            dummy_link(),
        ));

        let text = report(&reg, "0.0.0.0:4000".parse().unwrap(), true, "keeper");
        assert!(text.contains("bob"));
        assert!(text.contains("unconnected"));
        assert!(text.contains("world"));
        assert!(text.contains("listener"));
        assert!(!text.contains('!'), "no integrity errors expected: {text}");
    }
}
