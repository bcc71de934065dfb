//! # Portal RPC — session and connection core
//!
//! A session/connection runtime for RDMA-class RPC transports: setup
//! negotiation (accept/redirect/reject), multi-portal load distribution,
//! request/response correlation, read-receipts, one-way delivery
//! notification, and cooperative teardown — everything above the wire
//! driver itself, which callers supply through [`transport::Transport`].

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod logging;
pub mod message;
pub mod observer;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod session;
pub mod transport;

pub use client::Client;
pub use config::CoreConfig;
pub use connection::{Connection, ConnectionId, ConnState};
pub use error::{CoreError, Reason, Result};
pub use message::{Message, MessageKind, MsgFlags, MsgStatus};
pub use observer::{ObserverBus, SessionEvent, SessionObserver};
pub use pool::{SizeClass, Task, TaskPool};
pub use runtime::CoreRuntime;
pub use server::{Server, ServerHandle};
pub use session::{BufDecision, NewSessionDecision, Session, SessionKind, SessionOps, SessionState};
pub use transport::{LoopbackTransport, Transport, TransportEvent};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
