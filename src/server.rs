//! Server binder (C7): listener lifecycle and accepted-connection
//! assignment, grounded on `xio_session_server.c`'s accept path — each
//! inbound dial gets a fresh acceptor [`Session`] bound to the binder's
//! callbacks, which is then promoted or redirected per §4.6 once its
//! `SETUP_REQ` arrives.

use std::sync::Arc;

use tracing::info;

use crate::connection::Connection;
use crate::runtime::CoreRuntime;
use crate::session::{Session, SessionKind, SessionOps};
use crate::transport::{LoopbackTransport, Transport};

/// A bound listener. Dropping this without calling [`ServerHandle::unbind`]
/// leaves the listener registered — call `unbind` explicitly, mirroring the
/// source's separate `xio_unbind`.
pub struct ServerHandle {
    uri: String,
    runtime: Arc<CoreRuntime>,
}

impl ServerHandle {
    /// Stop accepting new connections. Sessions already established
    /// continue until their own teardown.
    pub fn unbind(self) {
        self.runtime.unregister_listener(&self.uri);
        info!(uri = %self.uri, "listener unbound");
    }
}

pub struct Server;

impl Server {
    /// Bind a listener at `uri`. Every accepted dial gets its own acceptor
    /// session constructed with `ops` as its callback capability set.
    pub fn bind(runtime: Arc<CoreRuntime>, uri: &str, ops: Arc<dyn SessionOps>) -> ServerHandle {
        let mut dials = runtime.register_listener(uri);
        let accept_runtime = runtime.clone();
        let accept_uri = uri.to_string();

        tokio::spawn(async move {
            while let Some(request) = dials.recv().await {
                let (client_side, server_side) =
                    LoopbackTransport::pair(&request.client_uri, &accept_uri);
                if request.respond.send(client_side).is_err() {
                    // Dialer gave up before we could answer; drop our half too.
                    continue;
                }

                let context_id = accept_runtime.new_context_id();
                let session = Session::new(
                    accept_runtime.clone(),
                    SessionKind::Server,
                    accept_uri.clone(),
                    ops.clone(),
                    context_id,
                    Vec::new(),
                );
                let conn_id = accept_runtime.connections.next_id();
                let conn = Connection::spawn(
                    conn_id,
                    session.weak(),
                    session.id,
                    context_id,
                    0,
                    Arc::new(server_side) as Arc<dyn Transport>,
                    accept_runtime.pool.clone(),
                    accept_runtime.config.clone(),
                );
                session.register_connection(conn);
                info!(session_id = session.id, conn_id, "accepted connection");
            }
        });

        ServerHandle {
            uri: uri.to_string(),
            runtime,
        }
    }
}
