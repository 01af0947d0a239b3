//! chatcast - real-time presence and live delivery for two-party chat
//!
//! Tracks which users hold a live WebSocket connection, broadcasts the online
//! set to every client whenever it changes, and pushes already-persisted
//! messages to the receiver's live connection when there is one.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → connection → registry ─┬→ presence topic → hub → every client
//! Persistence → deliver / pub/sub → router → hub → receiver's client
//! ```
//!
//! Authentication and message storage belong to the persistence collaborator;
//! this crate only does best-effort live notification.
//!
//! The collaborator reaches the router through `POST /internal/deliver` (only
//! mounted when a deliver token is configured) or, with the `postgres`
//! feature, through LISTEN/NOTIFY. The default `memory` backend is in-process
//! only and serves embedders and tests.

// Compile-time feature validation: exactly one pub/sub backend required
#[cfg(not(any(feature = "postgres", feature = "memory")))]
compile_error!(
    "chatcast requires a pub/sub backend. Enable: --features postgres OR --features memory"
);

#[cfg(all(feature = "postgres", feature = "memory"))]
compile_error!(
    "Only one pub/sub backend can be enabled. Use --no-default-features --features postgres."
);

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod pubsub;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use client::{ClientState, Subscriber};
pub use config::Config;
pub use events::{ChatMessage, ServerEvent};
pub use hub::Hub;
pub use presence::PresenceBroadcaster;
pub use pubsub::PubSub;
pub use registry::ConnectionRegistry;
pub use router::{DeliveryOutcome, MessageRouter};
pub use server::{AppState, build_router};
pub use session::{ConnId, Session};

#[cfg(feature = "postgres")]
pub use pubsub::PostgresPubSub;

#[cfg(feature = "memory")]
pub use pubsub::MemoryPubSub;
