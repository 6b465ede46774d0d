pub mod push_channel;
pub mod queue_api;
pub mod snapshot_source;

pub use push_channel::{ChannelError, ChannelResult, FrameStream, PushTransport};
pub use queue_api::{QueueApi, QueueApiError, QueueApiResult};
pub use snapshot_source::{FetchError, FetchResult, SnapshotSource};
