//! Agora client-side synchronization cache.
//!
//! Keeps an application's view of the Agora community platform responsive
//! while treating the server as the arbiter of truth:
//!
//! - **Entry Store**: stale-while-revalidate cache keyed by a hierarchical
//!   key space over the five resource collections
//! - **Fetch Coordinator**: request coalescing, retry with doubling backoff,
//!   and the polling/focus/reconnect refresh triggers
//! - **Mutation Pipeline**: synchronous optimistic apply, settle against the
//!   REST API, reconcile or roll back
//! - **Invalidation Planner**: rule table mapping a settled mutation to the
//!   key prefixes that must be refetched
//!
//! ## Configuration
//!
//! Behavior is controlled via an optional TOML file layered with
//! `AGORA_SYNC_*` environment variables:
//!
//! ```toml
//! [retry]
//! max_retries = 3
//!
//! [forum_post]
//! stale_after_ms = 15000
//! poll_interval_ms = 20000
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod kind;
mod lock;
pub mod model;
pub mod mutation;
pub mod planner;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use client::{BackgroundTasks, SyncClient};
pub use config::SyncConfig;
pub use error::{SyncError, TransportError};
pub use key::CacheKey;
pub use kind::ResourceKind;
pub use mutation::{MutationHandle, MutationRequest, MutationState, PendingId};
pub use store::{EntrySnapshot, EntryStatus, Subscription};
pub use transport::{CredentialProvider, HttpTransport, ResourceTransport, StaticCredentials};
