use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dock_pressure::config::{RollupSettings, StoreLayout};
use dock_pressure::error::{RollupError, StoreError};
use dock_pressure::reference::{FlowRow, FlowTable};
use dock_pressure::rollup::daily::read_daily;
use dock_pressure::rollup::lock::RunLock;
use dock_pressure::rollup::types::UnitOutcome;
use dock_pressure::rollup::{
    DpiRow, Mode, NoDataReason, RollupJob, RollupOutcome, Strategy, read_artifact,
};
use dock_pressure::snapshot::encode_gzip_json;
use dock_pressure::store::{CSV, JSON, LocalStore, ObjectStore, PARQUET};
use serde_json::{Value, json};
use tempfile::TempDir;

const CAPACITY_CSV: &str = "station_id,legacy_id,name,lat,lon,capacity\n\
S1,L1,Clark & Lake,41.886,-87.631,10\n\
S2,L2,Wells & Huron,41.894,-87.634,0\n";

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn jan(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

async fn put_snapshot(store: &dyn ObjectStore, key: &str, docks: &[(&str, u32)]) {
    let stations: Vec<_> = docks
        .iter()
        .map(|(id, d)| json!({"station_id": id, "num_docks_available": d, "num_bikes_available": 3}))
        .collect();
    put_station_objects(store, key, stations).await;
}

async fn put_station_objects(store: &dyn ObjectStore, key: &str, stations: Vec<Value>) {
    let body = json!({"timestamp": "2024-01-01T14:00:00Z", "stations": stations});
    store
        .put(key, encode_gzip_json(&body).unwrap(), JSON)
        .await
        .unwrap();
}

async fn put_reference_tables(store: &dyn ObjectStore) {
    let layout = StoreLayout::default();
    store
        .put(&layout.capacity_key, CAPACITY_CSV.as_bytes().to_vec(), CSV)
        .await
        .unwrap();

    let flows = FlowTable::new(vec![
        FlowRow {
            station_id: "L1".into(),
            starts: 5,
            ends: 20,
        },
        FlowRow {
            station_id: "L2".into(),
            starts: 1,
            ends: 50,
        },
    ]);
    store
        .put(&layout.flows_key, flows.to_parquet().unwrap(), PARQUET)
        .await
        .unwrap();
}

/// Store with the reference tables in place and two snapshots on 2024-01-01.
async fn seeded() -> (TempDir, Arc<dyn ObjectStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    put_reference_tables(store.as_ref()).await;
    put_snapshot(store.as_ref(), "snapshots/2024/01/01/080000.json.gz", &[("S1", 0), ("S2", 0)]).await;
    put_snapshot(store.as_ref(), "snapshots/2024/01/01/090000.json.gz", &[("S1", 2), ("S2", 0)]).await;
    (dir, store)
}

fn job(store: &Arc<dyn ObjectStore>) -> RollupJob {
    RollupJob::new(store.clone(), StoreLayout::default(), RollupSettings::default()).unwrap()
}

fn expected_s1() -> DpiRow {
    DpiRow {
        station_id: "S1".into(),
        station_name: "Clark & Lake".into(),
        overflow_per_dock: 1.5,
        pct_full: 0.5,
        dpi: 0.75,
    }
}

#[tokio::test]
async fn test_first_run_publishes_ranked_artifact() {
    let (_dir, store) = seeded().await;
    let layout = StoreLayout::default();
    let now = at("2024-01-01T18:00:00Z");

    let outcome = job(&store).run(now).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.mode, Mode::Full);
    assert_eq!(summary.strategy, Strategy::FlatWindow);
    assert_eq!(summary.rows, 1);
    assert_eq!(summary.top_station, Some(("S1".to_string(), 0.75)));
    assert_eq!(summary.snapshots_loaded, 2);
    assert_eq!(summary.join.unusable_capacity, 1);

    let rows = read_artifact(store.as_ref(), &layout.artifact_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows, vec![expected_s1()]);

    let checkpoint = store.get(&layout.checkpoint_key).await.unwrap().unwrap();
    assert_eq!(String::from_utf8(checkpoint).unwrap(), now.to_rfc3339());

    match read_daily(store.as_ref(), &layout, jan(1)).await.unwrap() {
        Some(UnitOutcome::Loaded(day)) => assert_eq!(day.get("S1"), Some(0.5)),
        other => panic!("unexpected {other:?}"),
    }
    assert!(store.get(&layout.lock_key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_incremental_mode_averages_days() {
    let (_dir, store) = seeded().await;
    put_snapshot(store.as_ref(), "snapshots/2024/01/04/080000.json.gz", &[("S1", 4)]).await;

    let outcome = job(&store).run(at("2024-01-04T18:00:00Z")).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.mode, Mode::Incremental);
    assert_eq!(summary.strategy, Strategy::DayGrouped);
    assert_eq!(summary.days_written, 2);

    // Day means 0.5 and 0.0
    let rows = read_artifact(store.as_ref(), &StoreLayout::default().artifact_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows[0].pct_full, 0.25);
    assert_eq!(rows[0].dpi, 0.375);
}

#[tokio::test]
async fn test_rerun_without_new_snapshots_is_idempotent() {
    let (_dir, store) = seeded().await;
    let layout = StoreLayout::default();
    put_snapshot(store.as_ref(), "snapshots/2024/01/04/080000.json.gz", &[("S1", 4)]).await;

    job(&store).run(at("2024-01-04T18:00:00Z")).await.unwrap();
    let first_artifact = read_artifact(store.as_ref(), &layout.artifact_key).await.unwrap();
    let first_day = store.get(&layout.daily_key(jan(1))).await.unwrap();

    let outcome = job(&store).run(at("2024-01-04T19:00:00Z")).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.days_written, 0);
    assert_eq!(summary.snapshots_loaded, 0);
    assert_eq!(read_artifact(store.as_ref(), &layout.artifact_key).await.unwrap(), first_artifact);
    assert_eq!(store.get(&layout.daily_key(jan(1))).await.unwrap(), first_day);
}

#[tokio::test]
async fn test_empty_store_publishes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    let layout = StoreLayout::default();

    let outcome = job(&store).run(at("2024-01-01T18:00:00Z")).await.unwrap();
    assert_eq!(outcome, RollupOutcome::NoData(NoDataReason::NoSnapshots));
    assert!(store.get(&layout.artifact_key).await.unwrap().is_none());
    assert!(store.get(&layout.checkpoint_key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshots_outside_window_are_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    put_reference_tables(store.as_ref()).await;
    put_snapshot(store.as_ref(), "snapshots/2023/06/01/080000.json.gz", &[("S1", 0)]).await;

    let outcome = job(&store).run(at("2024-01-04T18:00:00Z")).await.unwrap();
    assert_eq!(outcome, RollupOutcome::NoData(NoDataReason::EmptyWindow));
    assert!(
        store
            .get(&StoreLayout::default().checkpoint_key)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_corrupt_snapshot_is_skipped() {
    let (_dir, store) = seeded().await;
    store
        .put("snapshots/2024/01/01/100000.json.gz", b"not gzip".to_vec(), JSON)
        .await
        .unwrap();

    let outcome = job(&store).run(at("2024-01-01T18:00:00Z")).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.snapshots_loaded, 2);
    assert_eq!(summary.snapshots_skipped, 1);
    assert_eq!(summary.top_station, Some(("S1".to_string(), 0.75)));
}

#[tokio::test]
async fn test_station_without_docks_does_not_sink_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    put_reference_tables(store.as_ref()).await;
    for (key, docks) in [
        ("snapshots/2024/01/01/080000.json.gz", 0),
        ("snapshots/2024/01/01/090000.json.gz", 2),
    ] {
        let stations = vec![
            json!({"station_id": "S1", "num_docks_available": docks}),
            json!({"station_id": "V1", "num_bikes_available": 3}),
        ];
        put_station_objects(store.as_ref(), key, stations).await;
    }

    let outcome = job(&store).run(at("2024-01-01T18:00:00Z")).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.snapshots_loaded, 2);
    assert_eq!(summary.snapshots_skipped, 0);
    assert_eq!(summary.unusable_records, 2);
    assert_eq!(summary.top_station, Some(("S1".to_string(), 0.75)));

    let rows = read_artifact(store.as_ref(), &StoreLayout::default().artifact_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows, vec![expected_s1()]);
}

#[tokio::test]
async fn test_missing_capacity_table_is_terminal() {
    let (_dir, store) = seeded().await;
    let layout = StoreLayout::default();
    store.delete(&layout.capacity_key).await.unwrap();

    let err = job(&store).run(at("2024-01-01T18:00:00Z")).await.unwrap_err();
    assert!(matches!(err, RollupError::MissingReference { ref key } if key == "station_capacity.csv"));
    assert!(store.get(&layout.checkpoint_key).await.unwrap().is_none());
    assert!(store.get(&layout.lock_key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_held_lock_rejects_run() {
    let (_dir, store) = seeded().await;
    let layout = StoreLayout::default();
    let ttl = RollupSettings::default().lock_ttl;
    let _held = RunLock::acquire(store.as_ref(), &layout.lock_key, ttl, Utc::now())
        .await
        .unwrap();

    let err = job(&store).run(at("2024-01-01T18:00:00Z")).await.unwrap_err();
    assert!(matches!(err, RollupError::LockHeld { .. }));
    assert!(store.get(&layout.artifact_key).await.unwrap().is_none());
}

/// Hands the lock to another holder when the first daily aggregate is written.
struct TakeOverMidRun {
    inner: LocalStore,
    lock_key: String,
    taken: AtomicBool,
}

#[async_trait]
impl ObjectStore for TakeOverMidRun {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        if key.starts_with("daily/") && !self.taken.swap(true, Ordering::SeqCst) {
            self.inner.delete(&self.lock_key).await?;
            let ttl = RollupSettings::default().lock_ttl;
            RunLock::acquire(&self.inner, &self.lock_key, ttl, Utc::now())
                .await
                .map_err(|e| StoreError::backend(&self.lock_key, e.to_string()))?;
        }
        self.inner.put(key, body, content_type).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<bool, StoreError> {
        self.inner.put_if_absent(key, body, content_type).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_lock_taken_over_mid_run_stops_before_publish() {
    let (dir, _) = seeded().await;
    let layout = StoreLayout::default();
    let store: Arc<dyn ObjectStore> = Arc::new(TakeOverMidRun {
        inner: LocalStore::new(dir.path()),
        lock_key: layout.lock_key.clone(),
        taken: AtomicBool::new(false),
    });

    let err = job(&store).run(at("2024-01-01T18:00:00Z")).await.unwrap_err();
    assert!(matches!(err, RollupError::LockLost { .. }));
    assert!(store.get(&layout.artifact_key).await.unwrap().is_none());
    assert!(store.get(&layout.checkpoint_key).await.unwrap().is_none());
    // The new holder keeps its lock
    assert!(store.get(&layout.lock_key).await.unwrap().is_some());
}

/// Delegates to a local store but refuses writes to one key.
struct RejectWrites {
    inner: LocalStore,
    key: String,
}

#[async_trait]
impl ObjectStore for RejectWrites {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        if key == self.key {
            return Err(StoreError::backend(key, "write rejected"));
        }
        self.inner.put(key, body, content_type).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<bool, StoreError> {
        self.inner.put_if_absent(key, body, content_type).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_failed_checkpoint_write_reprocesses_next_run() {
    let (dir, _) = seeded().await;
    let layout = StoreLayout::default();
    let now = at("2024-01-01T18:00:00Z");

    let failing: Arc<dyn ObjectStore> = Arc::new(RejectWrites {
        inner: LocalStore::new(dir.path()),
        key: layout.checkpoint_key.clone(),
    });
    let err = job(&failing).run(now).await.unwrap_err();
    assert!(matches!(err, RollupError::Persistence { ref key, .. } if *key == layout.checkpoint_key));

    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    assert!(store.get(&layout.checkpoint_key).await.unwrap().is_none());
    assert!(store.get(&layout.lock_key).await.unwrap().is_none());

    let outcome = job(&store).run(now).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.snapshots_loaded, 2);
    assert!(store.get(&layout.checkpoint_key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_checkpoint_write_in_incremental_mode_recovers() {
    let (dir, _) = seeded().await;
    let layout = StoreLayout::default();
    let plain = LocalStore::new(dir.path());
    put_snapshot(&plain, "snapshots/2024/01/04/080000.json.gz", &[("S1", 4)]).await;
    let now = at("2024-01-04T18:00:00Z");

    let failing: Arc<dyn ObjectStore> = Arc::new(RejectWrites {
        inner: LocalStore::new(dir.path()),
        key: layout.checkpoint_key.clone(),
    });
    let err = job(&failing).run(now).await.unwrap_err();
    assert!(matches!(err, RollupError::Persistence { ref key, .. } if *key == layout.checkpoint_key));

    let store: Arc<dyn ObjectStore> = Arc::new(plain);
    let first_artifact = read_artifact(store.as_ref(), &layout.artifact_key)
        .await
        .unwrap()
        .unwrap();

    let outcome = job(&store).run(now).await.unwrap();
    let RollupOutcome::Published(summary) = outcome else {
        panic!("expected a publish, got {outcome:?}");
    };
    assert_eq!(summary.mode, Mode::Incremental);
    assert_eq!(summary.strategy, Strategy::DayGrouped);
    // Without a checkpoint every date in the window is rebuilt again
    assert_eq!(summary.days_written, 2);
    let second_artifact = read_artifact(store.as_ref(), &layout.artifact_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_artifact, first_artifact);
    assert_eq!(second_artifact[0].pct_full, 0.25);
    assert!(store.get(&layout.checkpoint_key).await.unwrap().is_some());
}
