use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that rewrites the WAL once enough appends accumulate,
/// keeping restart replay time bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreateClassCommand, Span, HOUR_MS};
    use crate::notify::EventHub;
    use crate::rules::RulesHandle;
    use ulid::Ulid;

    #[tokio::test]
    async fn compaction_resets_append_counter() {
        let dir = std::env::temp_dir().join("repset_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("compact_counter.wal");
        let _ = std::fs::remove_file(&path);

        let rules = RulesHandle::default();
        let engine = Arc::new(
            Engine::new(path, Arc::new(EventHub::new()), rules.subscribe()).unwrap(),
        );

        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
            + 48 * HOUR_MS;
        let detail = engine
            .create_class(CreateClassCommand {
                location_id: Ulid::new(),
                coach_id: Ulid::new(),
                name: "Barre".into(),
                description: String::new(),
                class_type: "barre".into(),
                room: None,
                span: Span::new(start, start + HOUR_MS),
                capacity: 5,
            })
            .await
            .unwrap();
        engine.book_class(detail.id, Ulid::new()).await.unwrap();
        assert!(engine.wal_appends_since_compact().await >= 2);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
