//! Per-session state machine: setup handshake, portal/redirect policy,
//! and teardown notification.
//!
//! Grounded on `xio_session.c`'s client-side setup-response handling and
//! `xio_session_server.c`'s `on_new_session`/accept/redirect/reject path.
//! The state machine itself is the literal translation of the diagram in
//! the design document; the one behavioral nuance pulled in verbatim from
//! the original (`xio_on_conn_established`'s `ACCEPTED` arm) is that a
//! server holding multiple portals does not move to ONLINE until the first
//! non-setup message arrives on some worker connection, not merely when
//! every worker transport is established.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::Reason;
use crate::framer::{MessageFramer, SetupAction, SetupResponse};
use crate::message::Message;
use crate::observer::SessionEvent;
use crate::runtime::CoreRuntime;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connect,
    Redirected,
    Accepted,
    Online,
    Rejected,
    Closing,
    Closed,
}

/// What `on_new_session` decided to do with an inbound `SETUP_REQ`.
pub enum NewSessionDecision {
    Accept {
        portals: Vec<String>,
        user_context: Vec<u8>,
    },
    Redirect {
        services: Vec<String>,
    },
    Reject {
        reason: Reason,
        user_context: Vec<u8>,
    },
}

/// Whether a caller wants to supply its own inbound buffer for a message.
pub enum BufDecision {
    Ok,
    Defer,
}

/// The capability set a caller provides when opening or binding a session;
/// every method but `on_session_event` is optional and no-ops by default,
/// matching the source's tolerance for unset callback pointers.
pub trait SessionOps: Send + Sync {
    fn on_session_event(&self, session_id: u32, event: &SessionEvent);

    fn on_new_session(&self, _session_id: u32, _uri: &str, _user_context: &[u8]) -> NewSessionDecision {
        NewSessionDecision::Accept {
            portals: Vec::new(),
            user_context: Vec::new(),
        }
    }

    fn on_session_established(&self, _session_id: u32, _peer_session_id: u32) {}
    fn on_msg(&self, _session_id: u32, _msg: &Message) {}
    fn on_msg_send_complete(&self, _session_id: u32, _serial_num: u64) {}
    fn on_msg_delivered(&self, _session_id: u32, _msg: &Message) {}
    fn on_msg_error(&self, _session_id: u32, _serial_num: u64, _reason: Reason) {}
    /// Return `true` to grant the cancel.
    fn on_cancel_request(&self, _session_id: u32, _serial_num: u64) -> bool {
        false
    }
    fn on_cancel(&self, _session_id: u32, _serial_num: u64, _canceled: bool) {}
    fn assign_data_in_buf(&self, _serial_num: u64) -> BufDecision {
        BufDecision::Ok
    }
}

/// An application-level logical conversation over one or more connections.
pub struct Session {
    pub id: u32,
    pub kind: SessionKind,
    self_weak: Weak<Session>,
    runtime: Arc<CoreRuntime>,
    pub context_id: u64,
    uri: Mutex<String>,
    peer_session_id: AtomicU32,
    state: Mutex<SessionState>,
    ops: Arc<dyn SessionOps>,
    connections: Mutex<Vec<Arc<Connection>>>,
    portals: Mutex<Vec<String>>,
    services: Mutex<Vec<String>>,
    portal_cursor: AtomicUsize,
    service_cursor: AtomicUsize,
    serial_counter: AtomicU64,
    inhibit_teardown: AtomicBool,
    user_context: Mutex<Vec<u8>>,
}

const NO_PEER: u32 = 0;

impl Session {
    pub fn new(
        runtime: Arc<CoreRuntime>,
        kind: SessionKind,
        uri: String,
        ops: Arc<dyn SessionOps>,
        context_id: u64,
        user_context: Vec<u8>,
    ) -> Arc<Session> {
        runtime.clone().sessions.insert(move |id| {
            Arc::new_cyclic(|weak| Session {
                id,
                kind,
                self_weak: weak.clone(),
                runtime: runtime.clone(),
                context_id,
                uri: Mutex::new(uri),
                peer_session_id: AtomicU32::new(NO_PEER),
                state: Mutex::new(SessionState::Init),
                ops,
                connections: Mutex::new(Vec::new()),
                portals: Mutex::new(Vec::new()),
                services: Mutex::new(Vec::new()),
                portal_cursor: AtomicUsize::new(0),
                service_cursor: AtomicUsize::new(0),
                serial_counter: AtomicU64::new(0),
                inhibit_teardown: AtomicBool::new(false),
                user_context: Mutex::new(user_context),
            })
        })
    }

    pub fn weak(&self) -> Weak<Session> {
        self.self_weak.clone()
    }

    fn arc(&self) -> Arc<Session> {
        self.self_weak
            .upgrade()
            .expect("session always holds a strong ref to itself while live")
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, s: SessionState) {
        *self.state.lock() = s;
    }

    pub fn uri(&self) -> String {
        self.uri.lock().clone()
    }

    pub fn peer_session_id(&self) -> Option<u32> {
        match self.peer_session_id.load(Ordering::Acquire) {
            NO_PEER => None,
            v => Some(v),
        }
    }

    pub fn next_serial(&self) -> u64 {
        self.serial_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn runtime(&self) -> &Arc<CoreRuntime> {
        &self.runtime
    }

    /// Portal/service round-robin policy (§4.6): `conn_idx == 0` advances a
    /// shared cursor; `conn_idx != 0` picks a deterministic affinity slot.
    pub fn pick_portal(&self, conn_idx: u32) -> Option<String> {
        let portals = self.portals.lock();
        if portals.is_empty() {
            return None;
        }
        let idx = if conn_idx == 0 {
            let cursor = self.portal_cursor.fetch_add(1, Ordering::Relaxed) % portals.len();
            cursor
        } else {
            (conn_idx as usize) % portals.len()
        };
        Some(portals[idx].clone())
    }

    fn pick_service(&self) -> Option<String> {
        let services = self.services.lock();
        if services.is_empty() {
            return None;
        }
        let idx = self.service_cursor.fetch_add(1, Ordering::Relaxed) % services.len();
        Some(services[idx].clone())
    }

    /// Register a newly-created connection against this session and the
    /// process-wide connection registry.
    pub fn register_connection(&self, conn: Arc<Connection>) {
        let peer_uri = conn.peer_uri().to_string();
        self.runtime
            .connections
            .insert(conn.id, self.context_id, Some(&peer_uri), conn.clone());
        self.connections.lock().push(conn);
    }

    pub fn find_connection(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.id == conn_id)
            .cloned()
    }

    fn dispatch(&self, event: SessionEvent) {
        self.ops.on_session_event(self.id, &event);
        self.runtime.observers.dispatch(self.id, event);
    }

    // ---- inbound setup handling -----------------------------------------

    /// Dispatch an inbound `SETUP_REQ`/`SETUP_RSP` frame arriving on
    /// `conn_id`. Dialing further portal/service connections is inherently
    /// asynchronous, so this spawns that work rather than blocking the
    /// connection's intake loop.
    pub fn handle_setup_frame(&self, conn_id: ConnectionId, is_request: bool, payload: &[u8]) {
        let session = self.arc();
        let payload = payload.to_vec();
        tokio::spawn(async move {
            let result = if is_request {
                session.handle_setup_request(conn_id, &payload).await
            } else {
                session.handle_setup_response(conn_id, &payload).await
            };
            if let Err(e) = result {
                warn!(session_id = session.id, error = %e, "setup handling failed");
                session.dispatch(SessionEvent::Error { reason: Reason::Other(0) });
            }
        });
    }

    async fn handle_setup_request(&self, conn_id: ConnectionId, payload: &[u8]) -> crate::error::Result<()> {
        let req = MessageFramer::read_setup_request(payload)?;
        let decision = self.ops.on_new_session(self.id, &req.uri, &req.user_context);
        let conn = self
            .find_connection(conn_id)
            .ok_or(crate::error::CoreError::SessionDisconnected)?;

        match decision {
            NewSessionDecision::Accept { portals, user_context } => {
                *self.portals.lock() = portals.clone();
                let rsp = MessageFramer::write_setup_response(
                    self.id,
                    SetupAction::Accept,
                    &portals,
                    None,
                    &user_context,
                )?;
                conn.send_setup_response(rsp).await?;
                if portals.is_empty() {
                    self.set_state(SessionState::Online);
                    self.dispatch(SessionEvent::Established);
                } else {
                    self.set_state(SessionState::Accepted);
                    self.inhibit_teardown.store(true, Ordering::Release);
                }
            }
            NewSessionDecision::Redirect { services } => {
                let rsp = MessageFramer::write_setup_response(
                    self.id,
                    SetupAction::Redirect,
                    &services,
                    None,
                    &[],
                )?;
                conn.send_setup_response(rsp).await?;
                self.set_state(SessionState::Closing);
            }
            NewSessionDecision::Reject { reason, user_context } => {
                let rsp = MessageFramer::write_setup_response(
                    self.id,
                    SetupAction::Reject,
                    &[],
                    Some(reason),
                    &user_context,
                )?;
                conn.send_setup_response(rsp).await?;
                self.set_state(SessionState::Rejected);
                self.dispatch(SessionEvent::Refused { reason });
            }
        }
        Ok(())
    }

    async fn handle_setup_response(&self, conn_id: ConnectionId, payload: &[u8]) -> crate::error::Result<()> {
        match MessageFramer::read_setup_response(payload)? {
            SetupResponse::Accept {
                session_id,
                portals,
                ..
            } => {
                self.peer_session_id.store(session_id, Ordering::Release);
                if portals.is_empty() {
                    self.set_state(SessionState::Online);
                    self.ops.on_session_established(self.id, session_id);
                    self.dispatch(SessionEvent::Established);
                } else {
                    *self.portals.lock() = portals.clone();
                    self.set_state(SessionState::Accepted);
                    self.dial_all_portals(portals).await;
                    // Close the lead connection: once portal workers are up,
                    // it has no further role and the post-ACCEPT connection
                    // set must contain only the dialed portals.
                    if let Some(lead) = self.find_connection(conn_id) {
                        if let Err(e) = lead.disconnect().await {
                            warn!(session_id = self.id, error = %e, "failed to close lead connection");
                        }
                    }
                    self.set_state(SessionState::Online);
                    self.ops.on_session_established(self.id, session_id);
                    self.dispatch(SessionEvent::Established);
                }
            }
            SetupResponse::Redirect { services, .. } => {
                *self.services.lock() = services;
                self.set_state(SessionState::Redirected);
                let _ = conn_id;
                if let Some(next) = self.pick_service() {
                    *self.uri.lock() = next.clone();
                    self.set_state(SessionState::Connect);
                    self.open_lead(&next).await?;
                } else {
                    self.set_state(SessionState::Rejected);
                    self.dispatch(SessionEvent::Refused {
                        reason: Reason::SessionRedirected,
                    });
                }
            }
            SetupResponse::Reject {
                reason,
                user_context,
                ..
            } => {
                self.set_state(SessionState::Rejected);
                let _ = user_context;
                self.dispatch(SessionEvent::Refused { reason });
            }
        }
        Ok(())
    }

    /// Open the lead connection for this (client) session against `uri`
    /// and send the initial `SETUP_REQ` on it.
    pub async fn open_lead(&self, uri: &str) -> crate::error::Result<Arc<Connection>> {
        let transport = self
            .runtime
            .dial(&format!("loopback://client-session-{}", self.id), uri)
            .await
            .ok_or_else(|| {
                crate::error::CoreError::TransportError(format!("no listener bound at {uri}"))
            })?;
        let conn_id = self.runtime.connections.next_id();
        let conn = Connection::spawn(
            conn_id,
            self.self_weak.clone(),
            self.id,
            self.context_id,
            0,
            Arc::new(transport) as Arc<dyn Transport>,
            self.runtime.pool.clone(),
            self.runtime.config.clone(),
        );
        self.register_connection(conn.clone());
        self.set_state(SessionState::Connect);
        let req = MessageFramer::write_setup_request(self.id, uri, &self.user_context.lock())?;
        conn.send_setup_request(req).await?;
        Ok(conn)
    }

    async fn dial_all_portals(&self, portals: Vec<String>) {
        for (i, portal) in portals.iter().enumerate() {
            let conn_idx = (i + 1) as u32;
            if let Err(e) = self.dial_portal(portal, conn_idx).await {
                warn!(session_id = self.id, portal, error = %e, "failed to dial portal");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn find_connection_by_idx(&self, conn_idx: u32) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.conn_idx == conn_idx)
            .cloned()
    }

    pub async fn dial_portal(&self, uri: &str, conn_idx: u32) -> crate::error::Result<Arc<Connection>> {
        let transport = self
            .runtime
            .dial(&format!("loopback://client-session-{}-{conn_idx}", self.id), uri)
            .await
            .ok_or_else(|| {
                crate::error::CoreError::TransportError(format!("no listener bound at {uri}"))
            })?;
        let conn_id = self.runtime.connections.next_id();
        let conn = Connection::spawn(
            conn_id,
            self.self_weak.clone(),
            self.id,
            self.context_id,
            conn_idx,
            Arc::new(transport) as Arc<dyn Transport>,
            self.runtime.pool.clone(),
            self.runtime.config.clone(),
        );
        self.register_connection(conn.clone());
        debug!(session_id = self.id, conn_id, conn_idx, "worker connection established");
        Ok(conn)
    }

    // ---- message / cancel event dispatch (invoked by Connection) -------

    pub fn handle_msg(&self, conn_id: ConnectionId, msg: Message) {
        if self.kind == SessionKind::Server
            && self.state() == SessionState::Accepted
            && self.inhibit_teardown.load(Ordering::Acquire)
        {
            self.inhibit_teardown.store(false, Ordering::Release);
            self.set_state(SessionState::Online);
            self.dispatch(SessionEvent::Established);
        }
        let _ = conn_id;
        self.ops.on_msg(self.id, &msg);
        self.runtime
            .observers
            .dispatch(self.id, SessionEvent::NewMessage(Arc::new(msg)));
    }

    pub fn handle_response(&self, conn_id: ConnectionId, msg: Message) {
        let _ = conn_id;
        self.ops.on_msg(self.id, &msg);
    }

    pub fn handle_delivered(&self, conn_id: ConnectionId, msg: Message) {
        let _ = conn_id;
        self.ops.on_msg_delivered(self.id, &msg);
    }

    /// Convenience used by simple request/response callers (e.g. the demo
    /// CLI): build a response to `request_serial` and send it on whichever
    /// connection is currently holding that inbound task.
    pub fn reply(&self, request_serial: u64, header: Vec<u8>, data: Vec<u8>) {
        let conns = self.connections.lock().clone();
        for conn in conns {
            if conn.has_inbound(request_serial) {
                let msg = Message::new_response(request_serial, header, data);
                tokio::spawn(async move {
                    let _ = conn.send_response(msg).await;
                });
                return;
            }
        }
        warn!(
            session_id = self.id,
            request_serial, "reply() found no connection holding that request"
        );
    }

    pub fn notify_send_complete(&self, serial_num: u64) {
        self.ops.on_msg_send_complete(self.id, serial_num);
        self.runtime
            .observers
            .dispatch(self.id, SessionEvent::SendCompletion { serial_num });
    }

    pub fn handle_cancel_request(&self, conn_id: ConnectionId, serial_num: u64) {
        let granted = self.ops.on_cancel_request(self.id, serial_num);
        if let Some(conn) = self.find_connection(conn_id) {
            tokio::spawn(async move {
                let _ = conn.send_cancel_response(serial_num, granted).await;
            });
        }
    }

    pub fn handle_cancel_response(&self, _conn_id: ConnectionId, serial_num: u64, canceled: bool) {
        self.ops.on_cancel(self.id, serial_num, canceled);
    }

    pub fn notify_msg_error(&self, serial_num: u64, reason: Reason) {
        self.ops.on_msg_error(self.id, serial_num, reason);
        self.runtime
            .observers
            .dispatch(self.id, SessionEvent::MessageError { serial_num, reason });
    }

    pub fn notify_error(&self, reason: Reason) {
        self.set_state(SessionState::Closing);
        self.dispatch(SessionEvent::Error { reason });
    }

    // ---- connection lifecycle notifications -----------------------------

    pub fn notify_conn_closed(&self, conn_id: ConnectionId) {
        self.maybe_teardown(conn_id, SessionEvent::Closed);
    }

    pub fn notify_conn_disconnected(&self, conn_id: ConnectionId, reason: Reason) {
        self.maybe_teardown(conn_id, SessionEvent::Disconnected { reason });
    }

    pub fn notify_conn_error(&self, conn_id: ConnectionId, reason: String) {
        warn!(session_id = self.id, conn_id, %reason, "connection error");
        self.maybe_teardown(conn_id, SessionEvent::ConnectionError { reason });
    }

    /// A connection reached CLOSE/DISCONNECT; if every connection the
    /// session owns has now done so, fire the (at-most-once) teardown
    /// event and move to CLOSED.
    fn maybe_teardown(&self, conn_id: ConnectionId, event: SessionEvent) {
        info!(session_id = self.id, conn_id, "connection torn down");
        self.connections.lock().retain(|c| c.id != conn_id);
        self.runtime.connections.remove(conn_id);

        let remaining = self.connections.lock().len();
        if remaining == 0 && *self.state.lock() != SessionState::Closed {
            self.set_state(SessionState::Closing);
            self.dispatch(event);
            self.set_state(SessionState::Closed);
            self.dispatch(SessionEvent::Closed);
            self.runtime.sessions.remove(self.id);
        } else {
            self.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    struct NoopOps;
    impl SessionOps for NoopOps {
        fn on_session_event(&self, _session_id: u32, _event: &SessionEvent) {}
    }

    #[test]
    fn pick_portal_round_robins_at_conn_idx_zero_and_is_deterministic_otherwise() {
        let runtime = CoreRuntime::init(CoreConfig::default());
        let session = Session::new(
            runtime,
            SessionKind::Client,
            "loopback://pick-portal-test".to_string(),
            Arc::new(NoopOps),
            0,
            Vec::new(),
        );
        *session.portals.lock() = vec!["p0".to_string(), "p1".to_string(), "p2".to_string()];

        // conn_idx == 0 advances a shared cursor across successive calls.
        assert_eq!(session.pick_portal(0).as_deref(), Some("p0"));
        assert_eq!(session.pick_portal(0).as_deref(), Some("p1"));
        assert_eq!(session.pick_portal(0).as_deref(), Some("p2"));
        assert_eq!(session.pick_portal(0).as_deref(), Some("p0"));

        // conn_idx != 0 deterministically maps to conn_idx % len and never
        // touches the round-robin cursor.
        assert_eq!(session.pick_portal(1).as_deref(), Some("p1"));
        assert_eq!(session.pick_portal(4).as_deref(), Some("p1"));
        assert_eq!(session.pick_portal(3).as_deref(), Some("p0"));
        assert_eq!(session.pick_portal(1).as_deref(), Some("p1"));
    }

    #[test]
    fn pick_portal_returns_none_when_no_portals_advertised() {
        let runtime = CoreRuntime::init(CoreConfig::default());
        let session = Session::new(
            runtime,
            SessionKind::Client,
            "loopback://pick-portal-empty".to_string(),
            Arc::new(NoopOps),
            0,
            Vec::new(),
        );
        assert!(session.pick_portal(0).is_none());
        assert!(session.pick_portal(2).is_none());
    }
}
