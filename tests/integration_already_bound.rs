//! At most one connection may be bound per (session, context) pair: a
//! second `connect()` at the same `conn_idx` must fail `ALREADY_BOUND`
//! rather than silently attaching a duplicate connection.

use std::sync::Arc;

use portalrpc::{Client, CoreConfig, CoreError, CoreRuntime, Message, Server, SessionEvent, SessionOps};

struct AcceptingOps;

impl SessionOps for AcceptingOps {
    fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}
    fn on_msg(&self, _session_id: u32, _msg: &Message) {}
}

#[tokio::test]
async fn duplicate_connect_at_same_conn_idx_fails() {
    let runtime = CoreRuntime::init(CoreConfig::default());
    let _handle = Server::bind(
        runtime.clone(),
        "loopback://already-bound",
        Arc::new(AcceptingOps),
    );

    let (session, _conn) = Client::open(
        runtime.clone(),
        "loopback://already-bound",
        Arc::new(AcceptingOps),
        Vec::new(),
    )
    .await
    .expect("client open");

    let err = Client::connect(&session, 0)
        .await
        .expect_err("a second connect() at conn_idx 0 must fail");
    assert!(matches!(err, CoreError::AlreadyBound));
}
