//! Typed, synchronous pub-sub bus keyed by `session_id`.
//!
//! Grounded on the session event dispatch in `xio_session.c`
//! (`xio_session_notify_*` family): every event is delivered synchronously,
//! on whatever thread raised it, to every observer registered against that
//! session id. There is no queueing or cross-thread hop — callers that want
//! async delivery schedule their own task from inside the callback.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Reason;
use crate::message::Message;

/// Every event an observer can subscribe to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    NewMessage(Arc<Message>),
    SendCompletion { serial_num: u64 },
    AssignInBuf { serial_num: u64 },
    CancelRequest { serial_num: u64 },
    CancelResponse { serial_num: u64 },
    Established,
    Disconnected { reason: Reason },
    Closed,
    Refused { reason: Reason },
    MessageError { serial_num: u64, reason: Reason },
    ConnectionError { reason: String },
    Error { reason: Reason },
}

/// Implemented by anything that wants to observe a session's events.
///
/// Default bodies make every method optional, the way the source's ops
/// struct treats unset callback pointers as no-ops.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, session_id: u32, event: &SessionEvent) {
        let _ = (session_id, event);
    }
}

/// A free function observer, for callers who don't need their own type.
pub struct FnObserver<F>(pub F)
where
    F: Fn(u32, &SessionEvent) + Send + Sync;

impl<F> SessionObserver for FnObserver<F>
where
    F: Fn(u32, &SessionEvent) + Send + Sync,
{
    fn on_event(&self, session_id: u32, event: &SessionEvent) {
        (self.0)(session_id, event)
    }
}

/// Registry of observers keyed by the session they're watching.
///
/// Dispatch is synchronous and happens on the calling thread — by
/// construction that's always the owning context's single thread, so no
/// two dispatches for the same session can ever interleave.
#[derive(Default)]
pub struct ObserverBus {
    observers: RwLock<HashMap<u32, Vec<Arc<dyn SessionObserver>>>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        ObserverBus {
            observers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, session_id: u32, observer: Arc<dyn SessionObserver>) {
        self.observers
            .write()
            .entry(session_id)
            .or_default()
            .push(observer);
    }

    pub fn unsubscribe_all(&self, session_id: u32) {
        self.observers.write().remove(&session_id);
    }

    /// Dispatch `event` to every observer registered for `session_id`, in
    /// registration order.
    pub fn dispatch(&self, session_id: u32, event: SessionEvent) {
        let observers = {
            let guard = self.observers.read();
            match guard.get(&session_id) {
                Some(v) => v.clone(),
                None => return,
            }
        };
        for obs in &observers {
            obs.on_event(session_id, &event);
        }
    }
}
