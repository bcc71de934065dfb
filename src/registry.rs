//! Process-wide id→object registries.
//!
//! Grounded on `xio_conns_store.h`: a session registry keyed by a
//! monotonic, wrap-around `session_id`, and a connection registry keyed by
//! a similarly-allocated `conn_id` plus a secondary `(context, portal_uri)`
//! index so an already-open peer connection can be reused instead of
//! re-dialed. Both are guarded with `parking_lot::RwLock`, matching the
//! synchronization the teacher codebase already reaches for around shared
//! maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;
use crate::session::Session;

/// Allocates process-unique 32-bit ids with wrap-around, retrying on
/// collision against a live set — mirrors the source's session id
/// allocator, which reuses ids only after the owning session
/// de-registers.
struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    fn new() -> Self {
        IdAllocator {
            next: AtomicU32::new(1),
        }
    }

    fn alloc(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // Skip the reserved sentinel value 0 (used on the wire to mean
            // "no peer session id yet") on wrap-around.
        }
    }
}

/// `session_id → Session`.
pub struct SessionRegistry {
    ids: IdAllocator,
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            ids: IdAllocator::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve a fresh id and register `session` under it.
    pub fn insert(&self, make: impl FnOnce(u32) -> Arc<Session>) -> Arc<Session> {
        loop {
            let id = self.ids.alloc();
            let mut map = self.sessions.write();
            if map.contains_key(&id) {
                continue;
            }
            let session = make(id);
            map.insert(id, session.clone());
            return session;
        }
    }

    pub fn lookup(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn remove(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.write().remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `conn_id → Connection`, plus `(context_id, portal_uri) → conn_id` for
/// peer reuse.
pub struct ConnectionRegistry {
    id_seq: AtomicU64,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    by_endpoint: RwLock<HashMap<(u64, String), u64>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            id_seq: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            by_endpoint: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve a fresh connection id without registering anything yet —
    /// needed because a [`Connection`] must know its own id before it can
    /// be constructed.
    pub fn next_id(&self) -> u64 {
        self.id_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, id: u64, context_id: u64, portal_uri: Option<&str>, conn: Arc<Connection>) {
        self.connections.write().insert(id, conn);
        if let Some(uri) = portal_uri {
            self.by_endpoint
                .write()
                .insert((context_id, uri.to_string()), id);
        }
    }

    pub fn lookup(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&conn_id).cloned()
    }

    pub fn find_by_endpoint(&self, context_id: u64, portal_uri: &str) -> Option<Arc<Connection>> {
        let id = *self
            .by_endpoint
            .read()
            .get(&(context_id, portal_uri.to_string()))?;
        self.lookup(id)
    }

    pub fn remove(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.connections.write().remove(&conn_id)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocator_never_yields_zero() {
        let alloc = IdAllocator::new();
        for _ in 0..10 {
            assert_ne!(alloc.alloc(), 0);
        }
    }
}
