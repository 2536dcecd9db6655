use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fishfarm_etl::pipeline::loader::{BulkLoader, LoadSettings};
use fishfarm_etl::types::{CleanRow, CleanValue};
use fishfarm_etl::{EtlError, RecordType, SqliteSink};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn settings(chunk_size: usize) -> LoadSettings {
    LoadSettings {
        chunk_size,
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
    }
}

async fn seeded_sink(db_path: &Path) -> Arc<SqliteSink> {
    let sink = Arc::new(SqliteSink::open(db_path, 2, Duration::from_millis(2000)).unwrap());
    sink.bootstrap().await.unwrap();

    let ponds = vec![
        CleanRow::new(0)
            .with("name", CleanValue::Text("Pond A".into()))
            .with("capacity", CleanValue::Integer(1000))
            .with("status", CleanValue::Text("occupied".into())),
        CleanRow::new(1)
            .with("name", CleanValue::Text("Pond B".into()))
            .with("capacity", CleanValue::Integer(600))
            .with("status", CleanValue::Text("occupied".into())),
    ];
    BulkLoader::new(sink.clone(), settings(100))
        .load(&RecordType::Pond.schema(), &ponds, &CancellationToken::new())
        .await
        .unwrap();
    sink
}

fn daily(index: usize, pond: &str, day: u32, mortality: i64) -> CleanRow {
    CleanRow::new(index)
        .with(
            "record_date",
            CleanValue::Date(NaiveDate::from_ymd_opt(2021, 3, day).unwrap()),
        )
        .with("pond", CleanValue::Text(pond.into()))
        .with("batch", CleanValue::Null)
        .with("feed_eaten", CleanValue::Float(850.5))
        .with("mortality", CleanValue::Integer(mortality))
}

fn count(db_path: &Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[tokio::test]
async fn test_foreign_key_failure_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("farm.db");
    let sink = seeded_sink(&db_path).await;
    let loader = BulkLoader::new(sink, settings(4));

    let mut rows: Vec<CleanRow> = (0..10)
        .map(|i| daily(i, if i % 2 == 0 { "Pond A" } else { "pond b" }, i as u32 + 1, 0))
        .collect();
    rows.push(daily(10, "Pond Z", 20, 0));

    let err = loader
        .load(&RecordType::DailyRecord.schema(), &rows, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EtlError::Load {
            table,
            row_index,
            constraint,
            message,
        } => {
            assert_eq!(table, "daily_record");
            assert_eq!(row_index, Some(10));
            assert_eq!(constraint.as_deref(), Some("daily_record.pond_id -> pond.name"));
            assert!(message.contains("Pond Z"), "{message}");
        }
        other => panic!("expected a load error, got {other:?}"),
    }
    assert_eq!(count(&db_path, "daily_record"), 0);
}

#[tokio::test]
async fn test_check_constraint_failure_names_the_row() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("farm.db");
    let sink = seeded_sink(&db_path).await;
    let loader = BulkLoader::new(sink, settings(2));

    let rows = vec![daily(0, "Pond A", 1, 2), daily(1, "Pond A", 2, 1), daily(2, "Pond A", 3, -4)];
    let err = loader
        .load(&RecordType::DailyRecord.schema(), &rows, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EtlError::Load { row_index: Some(2), constraint: Some(ref c), .. } if c.contains("CHECK")
    ));
    assert_eq!(count(&db_path, "daily_record"), 0);
}

#[tokio::test]
async fn test_reload_counts_updates_not_duplicates() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("farm.db");
    let sink = seeded_sink(&db_path).await;
    let loader = BulkLoader::new(sink, settings(3));
    let schema = RecordType::DailyRecord.schema();
    let cancel = CancellationToken::new();

    let rows: Vec<CleanRow> = (0..7).map(|i| daily(i, "Pond A", i as u32 + 1, 1)).collect();
    let first = loader.load(&schema, &rows, &cancel).await.unwrap();
    assert_eq!((first.inserted, first.updated), (7, 0));
    assert_eq!(first.chunks, 3);
    assert_eq!(first.attempts, 1);

    // Same keys with new mortality, plus one new day
    let mut changed: Vec<CleanRow> = (0..7).map(|i| daily(i, "Pond A", i as u32 + 1, 5)).collect();
    changed.push(daily(7, "Pond A", 8, 0));
    let second = loader.load(&schema, &changed, &cancel).await.unwrap();
    assert_eq!((second.inserted, second.updated), (1, 7));

    assert_eq!(count(&db_path, "daily_record"), 8);
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let total: i64 = conn
        .query_row("SELECT SUM(mortality) FROM daily_record", [], |r| r.get(0))
        .unwrap();
    assert_eq!(total, 35);
}

#[tokio::test]
async fn test_cancelled_load_commits_nothing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("farm.db");
    let sink = seeded_sink(&db_path).await;
    let loader = BulkLoader::new(sink, settings(2));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let rows: Vec<CleanRow> = (0..5).map(|i| daily(i, "Pond A", i as u32 + 1, 0)).collect();
    let err = loader
        .load(&RecordType::DailyRecord.schema(), &rows, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::Cancelled { .. }));
    assert_eq!(count(&db_path, "daily_record"), 0);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_store() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("farm.db");
    let sink = seeded_sink(&db_path).await;
    let loader = Arc::new(BulkLoader::new(sink, settings(5)));

    let mut tasks = tokio::task::JoinSet::new();
    for pond in ["Pond A", "Pond B"] {
        let loader = Arc::clone(&loader);
        tasks.spawn(async move {
            let rows: Vec<CleanRow> = (0..20).map(|i| daily(i, pond, (i % 28) as u32 + 1, 0)).collect();
            loader
                .load(&RecordType::DailyRecord.schema(), &rows, &CancellationToken::new())
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let summary = joined.unwrap().unwrap();
        assert_eq!(summary.inserted, 20);
    }

    assert_eq!(count(&db_path, "daily_record"), 40);
}
