//! Client connector (C8): dial, lead-connection establishment, and the
//! additional-connection/redirect-aware `connect()` entry point from §4.8.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{CoreError, Result};
use crate::runtime::CoreRuntime;
use crate::session::{Session, SessionKind, SessionOps, SessionState};

pub struct Client;

impl Client {
    /// Convenience wrapper: create a client session against `uri` and open
    /// its lead connection in one call.
    pub async fn open(
        runtime: Arc<CoreRuntime>,
        uri: &str,
        ops: Arc<dyn SessionOps>,
        user_context: Vec<u8>,
    ) -> Result<(Arc<Session>, Arc<Connection>)> {
        let context_id = runtime.new_context_id();
        let session = Session::new(
            runtime,
            SessionKind::Client,
            uri.to_string(),
            ops,
            context_id,
            user_context,
        );
        let conn = Client::connect(&session, 0).await?;
        Ok((session, conn))
    }

    /// `connect(session, conn_idx)` per §4.8. `context` is implicit in the
    /// session's own `context_id` (every connection of a session shares the
    /// session's context in this single-threaded-per-context rendering).
    pub async fn connect(session: &Arc<Session>, conn_idx: u32) -> Result<Arc<Connection>> {
        if session.find_connection_by_idx(conn_idx).is_some() {
            return Err(CoreError::AlreadyBound);
        }

        match session.state() {
            SessionState::Init => {
                let uri = session.uri();
                session.open_lead(&uri).await
            }
            SessionState::Connect => Err(CoreError::InvalidState(
                "a second connection cannot attach while the lead is still negotiating setup",
            )),
            SessionState::Online | SessionState::Accepted => {
                let portal = session
                    .pick_portal(conn_idx)
                    .ok_or(CoreError::NoResources)?;
                session.dial_portal(&portal, conn_idx).await
            }
            _ => Err(CoreError::InvalidState(
                "connect() is not valid in the session's current state",
            )),
        }
    }
}
