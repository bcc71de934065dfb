//! Graceful teardown: after an established exchange, the client-initiated
//! FIN handshake must drive both sides to CLOSED exactly once and drop
//! the session out of the process-wide registry.

use std::sync::Arc;
use std::time::Duration;

use portalrpc::{
    Client, ConnState, CoreConfig, CoreRuntime, Message, Server, SessionEvent, SessionOps,
    SessionState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct RecordingOps {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionOps for RecordingOps {
    fn on_session_event(&self, _session_id: u32, event: &SessionEvent) {
        let _ = self.events.send(event.clone());
    }

    fn on_msg(&self, _session_id: u32, _msg: &Message) {}
}

async fn wait_for_closed(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("an event arrives before timeout")
            .expect("event channel open");
        if matches!(event, SessionEvent::Closed) {
            return;
        }
    }
}

#[tokio::test]
async fn disconnect_tears_down_both_sides_exactly_once() {
    let runtime = CoreRuntime::init(CoreConfig::default());

    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let _handle = Server::bind(
        runtime.clone(),
        "loopback://disconnect-me",
        Arc::new(RecordingOps { events: server_tx }),
    );

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(RecordingOps { events: client_tx });
    let (session, conn) = Client::open(
        runtime.clone(),
        "loopback://disconnect-me",
        client_ops,
        Vec::new(),
    )
    .await
    .expect("client open");

    // Drain events up through Established so the session is fully online
    // before tearing it down.
    loop {
        let event = timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open");
        if matches!(event, SessionEvent::Established) {
            break;
        }
    }

    assert_eq!(conn.state(), ConnState::Online);
    conn.disconnect().await.expect("disconnect");

    wait_for_closed(&mut client_rx).await;
    wait_for_closed(&mut server_rx).await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.connection_count(), 0);
    assert!(runtime.sessions.lookup(session.id).is_none());
}
