//! Process-wide runtime state: registries, the observer bus, the shared
//! task pool, and the loopback transport's listener directory.
//!
//! Grounded on §9's "process-wide initialization" note: page size,
//! registries, and transport driver registration are one-shot and
//! reference-counted because multiple independent callers in the same
//! process may stand up the runtime concurrently. `Arc<CoreRuntime>`'s own
//! strong count *is* that reference count — cloning the handle is "init",
//! dropping the last clone is "teardown" — so no separate counter is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::config::CoreConfig;
use crate::observer::ObserverBus;
use crate::pool::TaskPool;
use crate::registry::{ConnectionRegistry, SessionRegistry};
use crate::transport::LoopbackTransport;

/// A client dial arriving at a bound listener.
pub struct DialRequest {
    pub client_uri: String,
    pub respond: oneshot::Sender<LoopbackTransport>,
}

/// Shared state every Session/Connection/Server/Client handle is built on.
pub struct CoreRuntime {
    pub config: CoreConfig,
    pub sessions: SessionRegistry,
    pub connections: ConnectionRegistry,
    pub observers: ObserverBus,
    pub pool: TaskPool,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<DialRequest>>>,
    next_context_id: AtomicU64,
}

impl CoreRuntime {
    pub fn init(config: CoreConfig) -> Arc<CoreRuntime> {
        let pool = TaskPool::new(&config);
        Arc::new(CoreRuntime {
            config,
            sessions: SessionRegistry::new(),
            connections: ConnectionRegistry::new(),
            observers: ObserverBus::new(),
            pool,
            listeners: Mutex::new(HashMap::new()),
            next_context_id: AtomicU64::new(1),
        })
    }

    /// Allocate a fresh context id, standing in for a dedicated
    /// single-threaded run loop (§5). Every `Session`/`Connection` created
    /// on the same logical worker should share one context id.
    pub fn new_context_id(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a listener for `uri`; returns the receiving end of its
    /// dial queue. Used by [`crate::server::Server::bind`].
    pub fn register_listener(&self, uri: &str) -> mpsc::UnboundedReceiver<DialRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(uri.to_string(), tx);
        rx
    }

    pub fn unregister_listener(&self, uri: &str) {
        self.listeners.lock().remove(uri);
    }

    /// Dial `uri`, returning the client-side transport once a bound
    /// listener accepts. Fails if nothing is bound at `uri`.
    pub async fn dial(&self, client_uri: &str, server_uri: &str) -> Option<LoopbackTransport> {
        let tx = self.listeners.lock().get(server_uri).cloned()?;
        let (respond, rx) = oneshot::channel();
        tx.send(DialRequest {
            client_uri: client_uri.to_string(),
            respond,
        })
        .ok()?;
        rx.await.ok()
    }
}
