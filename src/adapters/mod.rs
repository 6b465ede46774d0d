pub mod http_client;
pub mod http_snapshot;
pub mod memory;
pub mod queue_client;
pub mod ws_channel;

/// Re-export commonly used types from adapters
pub use http_client::{ApiError, ApiHttpClient};
pub use http_snapshot::HttpSnapshotFetcher;
pub use memory::{MemorySnapshotSource, MemoryTransport};
pub use queue_client::HttpQueueClient;
pub use ws_channel::WebSocketTransport;
