//! Live metrics of a single API, straight from `api.metrics.update` events.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    core::{
        channel::ConnectionManager,
        model::{API_METRICS_UPDATE, ApiMetrics, ApiMetricsUpdate, DeltaEvent},
        registry::Subscription,
    },
    metrics,
    ports::push_channel::ChannelResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Most recent metrics pushed for the watched entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityReading {
    pub api_id: String,
    pub api_name: String,
    pub metrics: ApiMetrics,
    pub updated_at: DateTime<Utc>,
}

type ReadingSender = watch::Sender<Option<EntityReading>>;

/// Filters the delta stream down to one entity. No merging: each matching
/// event replaces the reading.
pub struct EntityWatcher {
    manager: ConnectionManager,
    readings: Arc<ReadingSender>,
    entity_id: Mutex<String>,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for EntityWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityWatcher")
            .field("entity_id", &*lock(&self.entity_id))
            .finish()
    }
}

/// Decode `event` when it targets `entity_id`.
///
/// Updates for other entities are skipped on their `api_id` alone, so a
/// malformed payload is only reported by the watcher it was meant for.
fn decode_for(entity_id: &str, event: &DeltaEvent) -> ChannelResult<Option<ApiMetricsUpdate>> {
    if event.data.get("api_id").and_then(Value::as_str) != Some(entity_id) {
        return Ok(None);
    }
    event.decode().map(Some)
}

fn subscribe_entity(
    manager: &ConnectionManager,
    entity_id: String,
    readings: Weak<ReadingSender>,
) -> Subscription {
    manager.subscribe(API_METRICS_UPDATE, move |event| {
        let update = match decode_for(&entity_id, event) {
            Ok(Some(update)) => update,
            Ok(None) => return,
            Err(err) => {
                metrics::increment_decode_errors("entity");
                warn!(error = %err, sequence = event.sequence, "Dropping malformed entity update");
                return;
            }
        };
        if let Some(readings) = readings.upgrade() {
            readings.send_replace(Some(EntityReading {
                api_id: update.api_id,
                api_name: update.api_name,
                metrics: update.metrics,
                updated_at: event.received_at,
            }));
        }
    })
}

impl EntityWatcher {
    /// Start watching `entity_id` on `manager`'s delta stream.
    pub fn watch(manager: &ConnectionManager, entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        let (tx, _) = watch::channel(None);
        let readings = Arc::new(tx);
        let subscription =
            subscribe_entity(manager, entity_id.clone(), Arc::downgrade(&readings));
        debug!(%entity_id, "Watching entity metrics");

        Self {
            manager: manager.clone(),
            readings,
            entity_id: Mutex::new(entity_id),
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// `(live_metrics, last_update)` for the watched entity
    pub fn latest(&self) -> (Option<ApiMetrics>, Option<DateTime<Utc>>) {
        match &*self.readings.borrow() {
            Some(reading) => (Some(reading.metrics.clone()), Some(reading.updated_at)),
            None => (None, None),
        }
    }

    pub fn reading(&self) -> Option<EntityReading> {
        self.readings.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<EntityReading>> {
        self.readings.subscribe()
    }

    pub fn entity_id(&self) -> String {
        lock(&self.entity_id).clone()
    }

    /// Switch to another entity. The previous reading is cleared.
    pub fn set_entity(&self, entity_id: impl Into<String>) {
        let entity_id = entity_id.into();
        let mut subscription = lock(&self.subscription);
        if let Some(previous) = subscription.take() {
            previous.unsubscribe();
        }
        self.readings.send_replace(None);
        *subscription = Some(subscribe_entity(
            &self.manager,
            entity_id.clone(),
            Arc::downgrade(&self.readings),
        ));
        debug!(%entity_id, "Switched watched entity");
        *lock(&self.entity_id) = entity_id;
    }

    /// Stop receiving updates. The last reading stays readable.
    pub fn stop(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
    }
}

impl Drop for EntityWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
