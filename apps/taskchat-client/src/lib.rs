//! taskchat sync client: keeps a chat session connected to the live event
//! stream, queues actions while offline and reconciles optimistic UI state
//! with what the server confirms.

pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod mention;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod reconnect;
pub mod rest;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use config::{RetryPolicy, SyncConfig};
pub use error::SyncError;
pub use session::{ConnectionState, SyncHandle, SyncSession, SyncStatus};
pub use taskchat_proto as proto;
