use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::observability::{SESSIONS_ACTIVE, WAL_COMPACTIONS_TOTAL};
use crate::session::SessionStore;
use crate::store::{StorageError, Store};

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Drop sessions idle for at least `lifetime`. Returns how many went.
pub fn reap_sessions_once(sessions: &SessionStore, lifetime: Duration) -> usize {
    let expired = sessions.expire_idle(lifetime);
    if expired > 0 {
        info!("reaped {expired} idle sessions");
    }
    metrics::gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
    expired
}

/// Background task that periodically expires idle sessions.
pub async fn run_session_reaper(sessions: Arc<SessionStore>, lifetime: Duration) {
    let mut interval = tokio::time::interval(REAP_INTERVAL.min(lifetime).max(Duration::from_secs(1)));
    loop {
        interval.tick().await;
        reap_sessions_once(&sessions, lifetime);
    }
}

/// Rewrite the WAL once enough appends have piled up since the last
/// rewrite. Returns whether it compacted.
pub async fn compact_if_needed(store: &Store, threshold: u64) -> Result<bool, StorageError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    store.compact_wal().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that compacts the WAL past `threshold` appends.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::session::Session;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookings_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn reaper_expires_idle_sessions() {
        let sessions = SessionStore::new();
        let id = sessions.create();
        let mut session = Session::new();
        session.flash("hello");
        sessions.save(id, session);

        assert_eq!(reap_sessions_once(&sessions, Duration::from_secs(3600)), 0);
        assert_eq!(sessions.len(), 1);

        assert_eq!(reap_sessions_once(&sessions, Duration::ZERO), 1);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let path = test_wal_path("compact_threshold.wal");
        let store = Store::open(&path, Duration::from_secs(3)).unwrap();
        let room = Room { id: Ulid::new(), name: "General's Quarters".into() };
        store.create_room(room.clone()).await.unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let block = store.insert_restriction(RoomRestriction::block(room.id, day)).await.unwrap();
        store.remove_restriction(block).await.unwrap();

        assert!(!compact_if_needed(&store, 100).await.unwrap());
        assert!(compact_if_needed(&store, 3).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 0);

        drop(store);
        let reopened = Store::open(&path, Duration::from_secs(3)).unwrap();
        assert_eq!(reopened.all_rooms(), vec![room.clone()]);
        assert!(
            reopened
                .restrictions_for_room_in_range(room.id, &DateSpan::single_day(day))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
