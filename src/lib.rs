//! Axon Dash - real-time usage metrics for the Axon dashboard.
//!
//! Axon Dash keeps a client-side view of gateway usage current by combining two
//! sources: authoritative **snapshots** pulled over REST and incremental
//! **deltas** pushed over a long-lived channel. It follows the same
//! **hexagonal architecture** as the gateway: transports are ports, the
//! reconciliation logic lives in `core`, and adapters are swappable (WebSocket
//! and reqwest in production, in-memory for tests).
//!
//! # Features
//! - Authenticated push channel with exponential backoff + jitter reconnect
//! - Typed subscriptions with idempotent unsubscribe
//! - Snapshot seeding, weighted-mean delta merging and resync on reconnect
//! - Per-API live metrics filtered from the same delta stream
//! - Queue introspection client
//! - Structured tracing via `tracing` and counters via the `metrics` facade
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use axon_dash::{
//!     ApiHttpClient, ConnectionManager, HttpSnapshotFetcher, ReconcileSettings,
//!     ReconciliationEngine, SnapshotCache, WebSocketTransport,
//!     config::load_config,
//!     core::{backoff::BackoffPolicy, model::Period},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("dash.toml").await?;
//! let manager = ConnectionManager::new(
//!     Arc::new(WebSocketTransport::from_config(&config)?),
//!     BackoffPolicy::default(),
//! );
//! manager.connect(config.token()).await?;
//!
//! let fetcher = HttpSnapshotFetcher::new(ApiHttpClient::from_config(&config)?);
//! let engine = ReconciliationEngine::start(
//!     Period::Last30Days,
//!     &manager,
//!     Arc::new(fetcher),
//!     Arc::new(SnapshotCache::new()),
//!     ReconcileSettings::default(),
//! );
//! let mut views = engine.watch();
//! views.changed().await?;
//! println!("{:?}", *views.borrow());
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Transport-facing APIs return the error enum of their port (`ChannelError`,
//! `FetchError`, `QueueApiError`). Configuration and CLI plumbing return
//! `eyre::Result<T>` with `WrapErr` context.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        ApiHttpClient, HttpQueueClient, HttpSnapshotFetcher, MemorySnapshotSource,
        MemoryTransport, WebSocketTransport,
    },
    core::{
        ConnectionManager, EntityWatcher, ReconcileSettings, ReconciliationEngine, SnapshotCache,
        Subscription,
    },
    utils::GracefulShutdown,
};
