//! # rapid-sync: real-time document synchronization client
//!
//! Subscribes to live queries over collections of JSON documents, writes
//! with optional etag preconditions, and runs optimistic read-modify-write
//! executions, all multiplexed over one WebSocket connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  subscribe / write   ┌──────────────┐   frames    ┌─────────────┐
//! │ RapidClient  │ ───────────────────► │ SyncEngine   │ ──────────► │ Transport   │
//! │ (handles,    │ ◄─────────────────── │ (pending,    │ ◄────────── │ (WebSocket  │
//! │  futures)    │  diffs / completions │  subs, acts) │  ack/val/.. │  or channel)│
//! └──────────────┘                      └──────────────┘             └──────┬──────┘
//!                                                                           │
//!                                                                    ┌──────┴──────┐
//!                                                                    │ SyncServer  │
//!                                                                    │ (reference) │
//!                                                                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes, client requests and server messages
//! - [`query`]: filters, ordering and paging, evaluated on both ends
//! - [`diff`]: result-set diffing for subscription updates
//! - [`subscription`]: shared subscriptions and their handles
//! - [`mutation`]: optimistic executions with conflict retry
//! - [`actions`]: on-connect and on-disconnect writes
//! - [`pending`]: correlation table with per-request timeouts
//! - [`engine`]: the synchronous state machine tying the above together
//! - [`client`]: async facade over the engine
//! - [`transport`]: WebSocket and in-memory connectors
//! - [`server`]: in-memory reference server

pub mod actions;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod diff;
pub mod document;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod pending;
pub mod protocol;
pub mod query;
pub mod reconnect;
pub mod reference;
pub mod server;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use actions::ActionEvent;
pub use client::{ActionHandle, RapidClient, RequestFuture, SubscriptionHandle};
pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionState};
pub use diff::Diff;
pub use document::{object, DocumentSnapshot, JsonObject};
pub use error::{RapidError, Result};
pub use mutation::ExecutionResult;
pub use protocol::{EtagCondition, WriteKind, WriteOp};
pub use query::{Direction, Filter, Query};
pub use reconnect::{ExponentialBackoff, RetryStrategy};
pub use reference::{CollectionRef, DocumentRef};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use subscription::SubscriptionEvent;
pub use transport::{ChannelConnector, Connector, WebSocketConnector};
