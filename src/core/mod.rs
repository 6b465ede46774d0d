pub mod backoff;
pub mod channel;
pub mod entity_watch;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod snapshot_cache;

pub use channel::{ChannelStats, ConnectionManager};
pub use entity_watch::{EntityReading, EntityWatcher};
pub use reconciler::{EnginePhase, ReconcileSettings, ReconciliationEngine};
pub use registry::{SubscriberRegistry, Subscription};
pub use snapshot_cache::SnapshotCache;
