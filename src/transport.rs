//! Transport abstraction and the in-process loopback implementation.
//!
//! The session/connection core never touches sockets or RDMA verbs
//! directly; it frames messages through [`Transport`], the same seam the
//! teacher codebase draws with its `IpcTransport` trait. [`LoopbackTransport`]
//! is the one concrete implementation carried in this crate: two endpoints
//! wired directly together with `tokio::sync::mpsc` channels, enough to
//! drive the whole session/connection state machine and the demo CLI
//! without depending on a real RDMA-class fabric.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};

/// A transport-level event delivered to the owning connection's context.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A framed byte buffer arrived (session header + payload, already
    /// concatenated the way [`crate::framer::MessageFramer`] expects).
    Data(Vec<u8>),
    /// The peer closed its side cleanly.
    PeerClosed,
    /// The transport failed; no further sends or receives will succeed.
    Failed(String),
}

/// What a connection sends and receives through its transport.
///
/// `send`/`recv` operate on whole framed buffers; the connection owns
/// splitting those into header + payload via the framer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, buf: Vec<u8>) -> Result<()>;
    async fn recv(&self) -> Option<TransportEvent>;
    fn local_uri(&self) -> &str;
    fn peer_uri(&self) -> &str;
}

/// One side of an in-process loopback pair.
pub struct LoopbackTransport {
    local_uri: String,
    peer_uri: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl LoopbackTransport {
    /// Build a connected pair: `(client_side, server_side)`, addressed by
    /// the given URIs for diagnostics and the portal-affinity index.
    pub fn pair(client_uri: &str, server_uri: &str) -> (LoopbackTransport, LoopbackTransport) {
        let (c_tx, s_rx) = mpsc::unbounded_channel();
        let (s_tx, c_rx) = mpsc::unbounded_channel();

        let client = LoopbackTransport {
            local_uri: client_uri.to_string(),
            peer_uri: server_uri.to_string(),
            tx: s_tx,
            rx: tokio::sync::Mutex::new(c_rx),
        };
        let server = LoopbackTransport {
            local_uri: server_uri.to_string(),
            peer_uri: client_uri.to_string(),
            tx: c_tx,
            rx: tokio::sync::Mutex::new(s_rx),
        };
        (client, server)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, buf: Vec<u8>) -> Result<()> {
        self.tx
            .send(TransportEvent::Data(buf))
            .map_err(|_| CoreError::TransportError("peer endpoint dropped".into()))
    }

    async fn recv(&self) -> Option<TransportEvent> {
        self.rx.lock().await.recv().await
    }

    fn local_uri(&self) -> &str {
        &self.local_uri
    }

    fn peer_uri(&self) -> &str {
        &self.peer_uri
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let _ = self.tx.send(TransportEvent::PeerClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_pair_delivers_data_both_ways() {
        let (client, server) = LoopbackTransport::pair("loopback://client", "loopback://server");

        client.send(vec![1, 2, 3]).await.unwrap();
        match server.recv().await {
            Some(TransportEvent::Data(buf)) => assert_eq!(buf, vec![1, 2, 3]),
            other => panic!("unexpected event: {other:?}"),
        }

        server.send(vec![9, 9]).await.unwrap();
        match client.recv().await {
            Some(TransportEvent::Data(buf)) => assert_eq!(buf, vec![9, 9]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_one_side_signals_peer_closed() {
        let (client, server) = LoopbackTransport::pair("loopback://a", "loopback://b");
        drop(client);
        match server.recv().await {
            Some(TransportEvent::PeerClosed) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
