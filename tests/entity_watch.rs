// Per-API live metrics delivered over a shared push channel
#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use axon_dash::{
        ConnectionManager, EntityWatcher, MemorySnapshotSource, MemoryTransport,
        ReconcileSettings, ReconciliationEngine, SnapshotCache,
        core::{
            backoff::BackoffPolicy,
            entity_watch::EntityReading,
            model::{API_METRICS_UPDATE, METRICS_UPDATE, Period, Snapshot, ViewStatus},
        },
        ports::PushTransport,
    };
    use serde_json::json;
    use tokio::sync::watch;

    fn manager(transport: &Arc<MemoryTransport>) -> ConnectionManager {
        ConnectionManager::new(
            Arc::clone(transport) as Arc<dyn PushTransport>,
            BackoffPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: 0.0,
                max_consecutive_failures: 3,
            },
        )
    }

    fn api_update(api_id: &str, requests_today: u64, p95: f64) -> serde_json::Value {
        json!({
            "type": API_METRICS_UPDATE,
            "data": {
                "api_id": api_id,
                "api_name": format!("{api_id} service"),
                "metrics": {
                    "requests_today": requests_today,
                    "requests_hour": 12,
                    "success_rate": 98.5,
                    "avg_latency_ms": 20.0,
                    "p95_latency_ms": p95,
                    "error_count": 2,
                    "last_request_at": "2025-06-01T12:00:00Z"
                }
            }
        })
    }

    async fn next_reading(
        readings: &mut watch::Receiver<Option<EntityReading>>,
    ) -> EntityReading {
        tokio::time::timeout(Duration::from_secs(2), readings.wait_for(Option::is_some))
            .await
            .expect("no reading in time")
            .expect("watcher dropped")
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_watcher_sees_only_its_entity() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        manager.connect("token").await.unwrap();

        let watcher = EntityWatcher::watch(&manager, "api-a");
        let mut readings = watcher.subscribe();

        transport.push(api_update("api-b", 999, 1.0).to_string());
        transport.push(api_update("api-a", 42, 77.0).to_string());

        let reading = next_reading(&mut readings).await;
        assert_eq!(reading.api_id, "api-a");
        assert_eq!(reading.api_name, "api-a service");
        assert_eq!(reading.metrics.requests_today, 42);
        assert_eq!(reading.metrics.p95_latency_ms, 77.0);
        assert_eq!(
            reading.metrics.last_request_at.as_deref(),
            Some("2025-06-01T12:00:00Z")
        );

        let (metrics, updated_at) = watcher.latest();
        assert_eq!(metrics.unwrap().requests_today, 42);
        assert_eq!(updated_at, Some(reading.updated_at));

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_watcher_and_engine_share_channel() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        manager.connect("token").await.unwrap();

        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
                Period::Last30Days,
                10,
                0,
                10.0,
                10.0,
            ))),
            Arc::new(SnapshotCache::new()),
            ReconcileSettings::default(),
        );
        let mut views = engine.watch();
        tokio::time::timeout(Duration::from_secs(2), views.wait_for(ViewStatus::is_live))
            .await
            .unwrap()
            .unwrap();

        let watcher = EntityWatcher::watch(&manager, "api-a");
        let mut readings = watcher.subscribe();

        transport.push(api_update("api-a", 5, 30.0).to_string());
        transport.push_event(
            METRICS_UPDATE,
            json!({ "requests": 10, "bytes": 0, "avg_latency": 30.0 }),
        );

        let reading = next_reading(&mut readings).await;
        assert_eq!(reading.metrics.requests_today, 5);

        let status = tokio::time::timeout(
            Duration::from_secs(2),
            views.wait_for(|s| s.view().is_some_and(|v| v.total_streams == 20)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(status.view().unwrap().avg_duration_ms, 20.0);

        // Per-API events never leak into the global view
        assert_eq!(status.view().unwrap().deltas_applied, 1);

        engine.stop();
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_watcher_survives_reconnect() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        manager.connect("token").await.unwrap();

        let watcher = EntityWatcher::watch(&manager, "api-a");
        let mut readings = watcher.subscribe();

        transport.drop_connection();
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.open_count() < 2 || !transport.is_open() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("channel did not reconnect");

        transport.push(api_update("api-a", 7, 10.0).to_string());
        let reading = next_reading(&mut readings).await;
        assert_eq!(reading.metrics.requests_today, 7);

        watcher.stop();
        manager.disconnect().await;
    }
}
