use std::time::Duration;

use tracing::{debug, error, info};

use crate::store::{MemoryStore, StoreError};

const COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the store's WAL once `threshold` appends
/// have accumulated since the last compaction.
pub async fn run_compactor(store: MemoryStore, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&store, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when the append count reached `threshold`. Returns whether it did.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    store.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SeatStore;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatclaim_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = MemoryStore::open(&path).unwrap();

        let movie = store.create_movie("Arrival").await.unwrap();
        for _ in 0..3 {
            store.create_seat(movie.id).await.unwrap();
        }
        assert_eq!(store.wal_appends_since_compact().await, 4);
        assert!(!compact_if_due(&store, 10).await.unwrap());

        for _ in 0..6 {
            store.create_seat(movie.id).await.unwrap();
        }
        assert!(compact_if_due(&store, 10).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 0);
        store.close().await.unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.seats_for_movie(movie.id).await.unwrap().len(), 9);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn ephemeral_store_never_compacts() {
        let store = MemoryStore::ephemeral();
        assert!(!compact_if_due(&store, 0).await.unwrap());
    }
}
