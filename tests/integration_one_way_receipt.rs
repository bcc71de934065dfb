//! A one-way message flagged `REQUEST_READ_RECEIPT` must be delivered to
//! the peer's `on_msg` and, independently, report delivery back to the
//! sender via `on_msg_delivered` — with no response correlation in either
//! direction.

use std::sync::Arc;
use std::time::Duration;

use portalrpc::{Client, CoreConfig, CoreRuntime, Message, Server, SessionEvent, SessionOps};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct ServerOps {
    received: mpsc::UnboundedSender<Message>,
}

impl SessionOps for ServerOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_msg(&self, _session_id: u32, msg: &Message) {
        let _ = self.received.send(msg.clone());
    }
}

struct ClientOps {
    delivered: mpsc::UnboundedSender<Message>,
}

impl SessionOps for ClientOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}

    fn on_msg_delivered(&self, _session_id: u32, msg: &Message) {
        let _ = self.delivered.send(msg.clone());
    }
}

#[tokio::test]
async fn one_way_with_receipt_is_delivered_and_acknowledged() {
    let runtime = CoreRuntime::init(CoreConfig::default());

    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    let _handle = Server::bind(
        runtime.clone(),
        "loopback://one-way",
        Arc::new(ServerOps { received: recv_tx }),
    );

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let client_ops = Arc::new(ClientOps {
        delivered: delivered_tx,
    });
    let (_session, conn) = Client::open(runtime.clone(), "loopback://one-way", client_ops, Vec::new())
        .await
        .expect("client open");

    let msg = Message::new_one_way(b"note".to_vec(), b"payload".to_vec()).with_read_receipt();
    let serial = conn.send_one_way(msg).await.expect("send_one_way");

    let received = timeout(Duration::from_secs(5), recv_rx.recv())
        .await
        .expect("server receives the one-way before timeout")
        .expect("receive channel open");
    assert_eq!(received.header, b"note");
    assert_eq!(received.data, b"payload");
    assert_eq!(received.request_serial, None);

    let delivered = timeout(Duration::from_secs(5), delivered_rx.recv())
        .await
        .expect("delivery receipt arrives before timeout")
        .expect("delivery channel open");
    assert_eq!(delivered.serial_num, serial);
}
