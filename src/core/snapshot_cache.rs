//! Freshness cache of the last snapshot per period, shared by engines.
use std::{
    fmt,
    time::{Duration, Instant},
};

use scc::HashMap;

use crate::core::model::{Period, Snapshot};

#[derive(Default)]
pub struct SnapshotCache {
    entries: HashMap<Period, (Snapshot, Instant)>,
}

impl fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("periods", &self.entries.len())
            .finish()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached snapshot for `period` if it is younger than `window`.
    pub fn fresh(&self, period: Period, window: Duration) -> Option<Snapshot> {
        self.entries
            .read_sync(&period, |_, (snapshot, stored_at)| {
                (stored_at.elapsed() < window).then(|| snapshot.clone())
            })
            .flatten()
    }

    pub fn store(&self, snapshot: Snapshot) {
        let period = snapshot.period;
        let entry = (snapshot, Instant::now());
        if self
            .entries
            .update_sync(&period, |_, current| *current = entry.clone())
            .is_some()
        {
            return;
        }
        if let Err((_, entry)) = self.entries.insert_sync(period, entry) {
            self.entries.update_sync(&period, |_, current| *current = entry);
        }
    }

    /// Forget `period`, so the next unforced seed pulls again.
    pub fn invalidate(&self, period: Period) {
        self.entries.remove_sync(&period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_within_window() {
        let cache = SnapshotCache::new();
        cache.store(Snapshot::new(Period::Last24Hours, 3, 0, 1.0, 1.0));

        assert!(cache.fresh(Period::Last24Hours, Duration::from_secs(60)).is_some());
        assert!(cache.fresh(Period::Last7Days, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_zero_window_never_fresh() {
        let cache = SnapshotCache::new();
        cache.store(Snapshot::new(Period::Last24Hours, 3, 0, 1.0, 1.0));

        assert!(cache.fresh(Period::Last24Hours, Duration::ZERO).is_none());
    }

    #[test]
    fn test_store_replaces_entry() {
        let cache = SnapshotCache::new();
        cache.store(Snapshot::new(Period::Last7Days, 3, 0, 1.0, 1.0));
        cache.store(Snapshot::new(Period::Last7Days, 9, 0, 2.0, 2.0));

        let fresh = cache.fresh(Period::Last7Days, Duration::from_secs(60)).unwrap();
        assert_eq!(fresh.total_streams, 9);
    }

    #[test]
    fn test_invalidate() {
        let cache = SnapshotCache::new();
        cache.store(Snapshot::new(Period::Last90Days, 3, 0, 1.0, 1.0));
        cache.invalidate(Period::Last90Days);

        assert!(cache.fresh(Period::Last90Days, Duration::from_secs(60)).is_none());
    }
}
