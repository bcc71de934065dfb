//! A server that rejects every new session must surface the reason and
//! the peer's user context to the client before either side tears down,
//! without ever delivering an `Established` event.

use std::sync::Arc;
use std::time::Duration;

use portalrpc::{
    Client, CoreConfig, CoreRuntime, Message, NewSessionDecision, Reason, Server, SessionEvent,
    SessionOps, SessionState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct RejectingServerOps;

impl SessionOps for RejectingServerOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_new_session(
        &self,
        _session_id: u32,
        _uri: &str,
        _user_context: &[u8],
    ) -> NewSessionDecision {
        NewSessionDecision::Reject {
            reason: Reason::InvalidSession,
            user_context: b"bad auth".to_vec(),
        }
    }
}

struct RecordingClientOps {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionOps for RecordingClientOps {
    fn on_session_event(&self, _session_id: u32, event: &SessionEvent) {
        let _ = self.events.send(event.clone());
    }

    fn on_msg(&self, _session_id: u32, _msg: &Message) {
        panic!("a rejected session must never deliver a message");
    }
}

#[tokio::test]
async fn rejected_session_reports_refused_with_reason() {
    let runtime = CoreRuntime::init(CoreConfig::default());

    let _handle = Server::bind(
        runtime.clone(),
        "loopback://reject-me",
        Arc::new(RejectingServerOps),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(RecordingClientOps { events: tx });
    let (session, _conn) = Client::open(
        runtime.clone(),
        "loopback://reject-me",
        client_ops,
        Vec::new(),
    )
    .await
    .expect("lead connection opens even though setup will be rejected");

    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("an event arrives before timeout")
            .expect("event channel open");
        match event {
            SessionEvent::Refused { reason } => {
                assert_eq!(reason, Reason::InvalidSession);
                break;
            }
            SessionEvent::Established => panic!("rejected session must not establish"),
            _ => continue,
        }
    }

    assert_eq!(session.state(), SessionState::Rejected);
}
