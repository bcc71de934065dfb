//! A server that accepts with multiple portals must drive the client to
//! dial every one of them before the session goes ONLINE. The lead
//! connection is closed once the portals are up, so the session ends with
//! exactly one connection per advertised portal.

use std::sync::Arc;
use std::time::Duration;

use portalrpc::{
    Client, CoreConfig, CoreRuntime, Message, NewSessionDecision, Server, SessionEvent,
    SessionOps, SessionState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct MultiPortalServerOps {
    portals: Vec<String>,
}

impl SessionOps for MultiPortalServerOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_new_session(
        &self,
        _session_id: u32,
        _uri: &str,
        _user_context: &[u8],
    ) -> NewSessionDecision {
        NewSessionDecision::Accept {
            portals: self.portals.clone(),
            user_context: Vec::new(),
        }
    }
}

struct AcceptingOps;

impl SessionOps for AcceptingOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}
}

struct RecordingClientOps {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionOps for RecordingClientOps {
    fn on_session_event(&self, _session_id: u32, event: &SessionEvent) {
        let _ = self.events.send(event.clone());
    }

    fn on_msg(&self, _session_id: u32, _msg: &Message) {}
}

#[tokio::test]
async fn multi_portal_accept_dials_every_portal_before_going_online() {
    let runtime = CoreRuntime::init(CoreConfig::default());

    let portals = vec![
        "loopback://mp-portal-1".to_string(),
        "loopback://mp-portal-2".to_string(),
    ];
    for portal in &portals {
        let _handle = Server::bind(runtime.clone(), portal, Arc::new(AcceptingOps));
    }
    let _lead_handle = Server::bind(
        runtime.clone(),
        "loopback://mp-lead",
        Arc::new(MultiPortalServerOps {
            portals: portals.clone(),
        }),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(RecordingClientOps { events: tx });
    let (session, _conn) =
        Client::open(runtime.clone(), "loopback://mp-lead", client_ops, Vec::new())
            .await
            .expect("client open");

    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("an event arrives before timeout")
            .expect("event channel open");
        if matches!(event, SessionEvent::Established) {
            break;
        }
    }

    assert_eq!(session.state(), SessionState::Online);

    // The lead connection's teardown (FIN_REQ/FIN_RSP) completes
    // asynchronously after `Established` fires, so poll for it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.connection_count() != portals.len() {
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "expected {} connections (lead closed) but found {}",
                portals.len(),
                session.connection_count()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for idx in 1..=portals.len() as u32 {
        assert!(
            session.find_connection_by_idx(idx).is_some(),
            "expected a worker connection at conn_idx {idx}"
        );
    }
}
