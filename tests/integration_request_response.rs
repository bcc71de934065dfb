//! End-to-end one-shot request/response over the loopback transport:
//! a client dials a bound server, the server's default accept policy
//! admits it with no portals, and the first request is echoed back.

use std::sync::Arc;
use std::time::Duration;

use portalrpc::{Client, CoreConfig, CoreRuntime, Message, Server, SessionEvent, SessionOps};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Server-side callback set: echoes every request back verbatim.
struct EchoOps {
    runtime: Arc<CoreRuntime>,
}

impl SessionOps for EchoOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_msg(&self, session_id: u32, msg: &Message) {
        if let Some(session) = self.runtime.sessions.lookup(session_id) {
            session.reply(msg.serial_num, msg.header.clone(), msg.data.clone());
        }
    }
}

/// Client-side callback set: forwards delivered responses onto a channel.
struct RecordingOps {
    messages: mpsc::UnboundedSender<Message>,
}

impl SessionOps for RecordingOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_msg(&self, _session_id: u32, msg: &Message) {
        let _ = self.messages.send(msg.clone());
    }
}

#[tokio::test]
async fn one_shot_request_gets_echoed_response() {
    let runtime = CoreRuntime::init(CoreConfig::default());

    let server_ops = Arc::new(EchoOps {
        runtime: runtime.clone(),
    });
    let _handle = Server::bind(runtime.clone(), "loopback://req-rsp", server_ops);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(RecordingOps { messages: tx });
    let (_session, conn) = Client::open(runtime.clone(), "loopback://req-rsp", client_ops, Vec::new())
        .await
        .expect("client open");

    let request = Message::new_request(b"hello".to_vec(), b"world".to_vec());
    let serial = conn.send_request(request).await.expect("send_request");
    assert_eq!(serial, 0, "first serial number on a fresh session is 0");

    let rsp = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("response arrived before timeout")
        .expect("response channel open");

    assert_eq!(rsp.request_serial, Some(serial));
    assert_eq!(rsp.header, b"hello");
    assert_eq!(rsp.data, b"world");
}

#[tokio::test]
async fn serial_numbers_are_monotonic_across_requests() {
    let runtime = CoreRuntime::init(CoreConfig::default());
    let server_ops = Arc::new(EchoOps {
        runtime: runtime.clone(),
    });
    let _handle = Server::bind(runtime.clone(), "loopback://req-rsp-serials", server_ops);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(RecordingOps { messages: tx });
    let (_session, conn) = Client::open(
        runtime.clone(),
        "loopback://req-rsp-serials",
        client_ops,
        Vec::new(),
    )
    .await
    .expect("client open");

    let mut serials = Vec::new();
    for i in 0..5u8 {
        let request = Message::new_request(vec![i], Vec::new());
        serials.push(conn.send_request(request).await.expect("send_request"));
    }
    for w in serials.windows(2) {
        assert!(w[1] > w[0], "serials must be strictly increasing");
    }

    for _ in 0..5 {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("response arrived before timeout")
            .expect("response channel open");
    }
}
