use core_logic::{AsyncDbConfig, DatabaseManager, FallbackStrategy, RunRecord};
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn open_db(dir: &TempDir) -> DatabaseManager {
    let path = dir.path().join("spam.db");
    DatabaseManager::new(path.to_str().unwrap()).await.unwrap()
}

#[tokio::test]
async fn test_transactions_roundtrip_and_misses() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let stored = db
        .store_transactions(&[
            ("AAA".to_string(), "{\"value\":1}".to_string()),
            ("BBB".to_string(), "{\"value\":0}".to_string()),
        ])
        .await
        .unwrap();
    assert_eq!(stored, 2);

    let found = db
        .get_transactions(&["BBB".to_string(), "ZZZ".to_string(), "AAA".to_string()])
        .await
        .unwrap();
    assert_eq!(
        found,
        vec![
            Some("{\"value\":0}".to_string()),
            None,
            Some("{\"value\":1}".to_string()),
        ]
    );

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let entry = vec![("AAA".to_string(), "{}".to_string())];
    db.store_transactions(&entry).await.unwrap();
    db.store_transactions(&entry).await.unwrap();

    let found = db.get_transactions(&["AAA".to_string()]).await.unwrap();
    assert_eq!(found, vec![Some("{}".to_string())]);
    assert!(db.get_transactions(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_logs_are_ordered_per_run() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create_run("run-a", "2026-01-01T00:00:00.000000000+00:00")
        .await
        .unwrap();
    db.create_run("run-a", "2026-01-01T00:00:00.000000000+00:00")
        .await
        .unwrap();
    db.create_run("run-b", "2026-01-02T00:00:00.000000000+00:00")
        .await
        .unwrap();

    let records = [
        RunRecord::Sent {
            run_id: "run-a".into(),
            timestamp: "2026-01-01T00:00:02.000000000+00:00".into(),
            hash: "SECOND".into(),
        },
        RunRecord::Sent {
            run_id: "run-a".into(),
            timestamp: "2026-01-01T00:00:01.000000000+00:00".into(),
            hash: "FIRST".into(),
        },
        RunRecord::Sent {
            run_id: "run-b".into(),
            timestamp: "2026-01-02T00:00:01.000000000+00:00".into(),
            hash: "OTHER".into(),
        },
        RunRecord::Log {
            run_id: "run-a".into(),
            timestamp: "2026-01-01T00:00:00.500000000+00:00".into(),
            message: "started".into(),
        },
    ];
    for record in &records {
        db.log_record(record).await.unwrap();
    }

    let sent = db.get_sent("run-a").await.unwrap();
    let hashes: Vec<_> = sent.iter().map(|(_, h)| h.as_str()).collect();
    assert_eq!(hashes, vec!["FIRST", "SECOND"]);

    let logs = db.get_run_logs("run-a").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].1, "started");

    let runs = db.list_runs().await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, "run-a");
}

#[tokio::test]
async fn test_async_queue_flushes_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("async.db");
    let path = path.to_str().unwrap();

    let config = AsyncDbConfig {
        channel_capacity: 16,
        batch_size: 100,
        flush_interval_ms: 60_000,
    };
    let db = DatabaseManager::new_with_async(path, config, FallbackStrategy::Hybrid)
        .await
        .unwrap();
    assert!(db.is_async());

    for i in 0..5 {
        db.queue_record(RunRecord::Sent {
            run_id: "run".into(),
            timestamp: format!("2026-01-01T00:00:0{}.000000000+00:00", i),
            hash: format!("HASH{}", i),
        })
        .await
        .unwrap();
    }
    let stats = db.get_metrics();
    assert_eq!((stats.queued_records, stats.dropped_records), (5, 0));

    // The flush interval is a minute out, so only the closed channel can end the worker
    let started = Instant::now();
    db.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let reopened = DatabaseManager::new(path).await.unwrap();
    let sent = reopened.get_sent("run").await.unwrap();
    assert_eq!(sent.len(), 5);
    assert_eq!(sent[0].1, "HASH0");
}

#[tokio::test]
async fn test_queue_drops_when_full() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("full.db");

    let config = AsyncDbConfig {
        channel_capacity: 1,
        batch_size: 100,
        flush_interval_ms: 60_000,
    };
    let db = DatabaseManager::new_with_async(path.to_str().unwrap(), config, FallbackStrategy::Drop)
        .await
        .unwrap();

    for i in 0..50 {
        db.queue_record(RunRecord::Log {
            run_id: "run".into(),
            timestamp: format!("{:02}", i),
            message: "spam".into(),
        })
        .await
        .unwrap();
    }

    let stats = db.get_metrics();
    assert_eq!(stats.queued_records + stats.dropped_records, 50);
    assert!(stats.dropped_records > 0);
}

#[tokio::test]
async fn test_queue_requires_async_mode() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let result = db.queue_record(RunRecord::Log {
        run_id: "run".into(),
        timestamp: "0".into(),
        message: "x".into(),
    })
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_sync_fallback_writes_when_full() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync.db");
    let path = path.to_str().unwrap();

    let config = AsyncDbConfig {
        channel_capacity: 1,
        batch_size: 100,
        flush_interval_ms: 60_000,
    };
    let db = DatabaseManager::new_with_async(path, config, FallbackStrategy::Sync)
        .await
        .unwrap();

    for i in 0..20 {
        db.queue_record(RunRecord::Sent {
            run_id: "run".into(),
            timestamp: format!("{:02}", i),
            hash: format!("HASH{}", i),
        })
        .await
        .unwrap();
    }

    let stats = db.get_metrics();
    assert_eq!(stats.dropped_records, 0);
    assert!(stats.total_inserts > 0);
    db.shutdown().await.unwrap();

    let reopened = DatabaseManager::new(path).await.unwrap();
    assert_eq!(reopened.get_sent("run").await.unwrap().len(), 20);
}
