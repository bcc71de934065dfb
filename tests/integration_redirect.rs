//! A server that redirects a new session must send the client to the
//! next listed service, which accepts it; the client observes exactly
//! one `Established` event and ends up ONLINE with a peer session id.

use std::sync::Arc;
use std::time::Duration;

use portalrpc::{
    Client, CoreConfig, CoreRuntime, Message, NewSessionDecision, Server, SessionEvent,
    SessionOps, SessionState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct RedirectingOps {
    target: String,
}

impl SessionOps for RedirectingOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_new_session(
        &self,
        _session_id: u32,
        _uri: &str,
        _user_context: &[u8],
    ) -> NewSessionDecision {
        NewSessionDecision::Redirect {
            services: vec![self.target.clone()],
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
async fn redirected_session_lands_online_at_the_new_service() {
    let runtime = CoreRuntime::init(CoreConfig::default());

    let _final_handle = Server::bind(
        runtime.clone(),
        "loopback://redirect-target",
        Arc::new(AcceptingOps),
    );
    let _front_handle = Server::bind(
        runtime.clone(),
        "loopback://redirect-front",
        Arc::new(RedirectingOps {
            target: "loopback://redirect-target".to_string(),
        }),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(RecordingClientOps { events: tx });
    let (session, _conn) = Client::open(
        runtime.clone(),
        "loopback://redirect-front",
        client_ops,
        Vec::new(),
    )
    .await
    .expect("client open");

    let mut established_count = 0;
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("an event arrives before timeout")
            .expect("event channel open");
        match event {
            SessionEvent::Established => {
                established_count += 1;
                break;
            }
            SessionEvent::Refused { reason } => {
                panic!("redirect should land on an accepting service, got refused: {reason:?}")
            }
            _ => continue,
        }
    }

    assert_eq!(established_count, 1);
    assert_eq!(session.state(), SessionState::Online);
    assert!(session.peer_session_id().is_some());
    assert_eq!(session.uri(), "loopback://redirect-target");
}
