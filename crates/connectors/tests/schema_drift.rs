use anyhow::anyhow;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use askql_common::models::{SchemaChangeRecord, SchemaSnapshot};
use askql_common::store::{MemoryStore, SnapshotStore};
use askql_connectors::testing::{fake_gateway, FakeBackend, FakeFactory, RecordingCatalog};
use askql_connectors::{DriftOutcome, SchemaDiff, SchemaDriftMonitor};

const DAY: Duration = Duration::from_secs(24 * 3600);

struct Harness {
    backend: Arc<FakeBackend>,
    store: Arc<MemoryStore>,
    catalog: Arc<RecordingCatalog>,
    monitor: SchemaDriftMonitor,
}

fn harness(ids: &[&str]) -> Harness {
    let backend = FakeBackend::new();
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(RecordingCatalog::default());
    let gateway = fake_gateway(FakeFactory::new(backend.clone()), ids, 50);
    let monitor = SchemaDriftMonitor::new(Arc::new(gateway), store.clone(), catalog.clone(), DAY);
    Harness {
        backend,
        store,
        catalog,
        monitor,
    }
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[tokio::test]
async fn test_first_check_stores_baseline() {
    let h = harness(&["shop"]);
    h.backend.set_schema(&[("T1", &[("a", "int")])]);

    let outcome = h.monitor.check("shop", false).await.unwrap();

    assert_eq!(outcome, DriftOutcome::Baseline { tables: 1 });
    let snapshot = h.store.latest_snapshot("shop").await.unwrap().unwrap();
    assert!(snapshot.schema_json.contains("\"T1\""));
    assert!(h.store.list_changes("shop", 10).await.unwrap().is_empty());
    assert!(h.catalog.recording("shop").upserted().is_empty());
}

#[tokio::test]
async fn test_recent_snapshot_skips_check() {
    let h = harness(&["shop"]);
    h.backend.set_schema(&[("T1", &[("a", "int")])]);
    h.monitor.check("shop", false).await.unwrap();

    h.backend.set_schema(&[("T1", &[("b", "int")])]);
    assert_eq!(
        h.monitor.check("shop", false).await.unwrap(),
        DriftOutcome::Skipped
    );
    assert_eq!(
        h.monitor.check("shop", true).await.unwrap(),
        DriftOutcome::Changed {
            diff: SchemaDiff {
                added: vec![],
                removed: vec![],
                changed: vec!["T1".to_string()],
            },
            reindexed: vec!["T1".to_string()],
            failed: vec![],
        }
    );
}

#[tokio::test]
async fn test_added_and_changed_tables_are_reindexed() {
    let h = harness(&["shop"]);
    h.backend.set_schema(&[("T1", &[("a", "int")])]);
    h.monitor.check("shop", false).await.unwrap();

    h.backend
        .set_schema(&[("T1", &[("b", "int")]), ("T2", &[("c", "varchar(32)")])]);
    let outcome = h.monitor.check("shop", true).await.unwrap();

    let (diff, reindexed, failed) = match outcome {
        DriftOutcome::Changed {
            diff,
            reindexed,
            failed,
        } => (diff, reindexed, failed),
        other => panic!("expected a change, got {other:?}"),
    };
    assert_eq!(diff.added, vec!["T2"]);
    assert_eq!(diff.changed, vec!["T1"]);
    assert!(diff.removed.is_empty());
    assert_eq!(sorted(reindexed), vec!["T1", "T2"]);
    assert!(failed.is_empty());

    let index = h.catalog.recording("shop");
    assert_eq!(sorted(index.upserted()), vec!["table::T1", "table::T2"]);
    assert!(index.deleted().is_empty());

    let changes = h.store.list_changes("shop", 10).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].added, vec!["T2"]);
    assert_eq!(changes[0].changed, vec!["T1"]);

    assert_eq!(
        h.monitor.check("shop", true).await.unwrap(),
        DriftOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_removed_table_is_purged() {
    let h = harness(&["shop"]);
    h.backend
        .set_schema(&[("T1", &[("a", "int")]), ("T2", &[("b", "int")])]);
    h.monitor.check("shop", false).await.unwrap();
    assert_eq!(h.monitor.rebuild_index("shop").await.unwrap(), 2);

    h.backend.set_schema(&[("T1", &[("a", "int")])]);
    let outcome = h.monitor.check("shop", true).await.unwrap();

    assert!(matches!(
        outcome,
        DriftOutcome::Changed { ref diff, ref reindexed, .. }
            if diff.removed == vec!["T2".to_string()] && reindexed.is_empty()
    ));
    let index = h.catalog.recording("shop");
    assert_eq!(index.deleted(), vec!["table::T2"]);
    assert_eq!(index.ids(), vec!["table::T1"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_table_still_replaces_snapshot() {
    let h = harness(&["shop"]);
    h.backend.set_schema(&[("T1", &[("a", "int")])]);
    h.monitor.check("shop", false).await.unwrap();

    h.backend.set_schema(&[
        ("T1", &[("a", "int")]),
        ("T2", &[("c", "int")]),
        ("T3", &[("d", "int")]),
    ]);
    h.backend.fail_columns_for("T2");
    let outcome = h.monitor.check("shop", true).await.unwrap();

    let (reindexed, failed) = match outcome {
        DriftOutcome::Changed {
            reindexed, failed, ..
        } => (reindexed, failed),
        other => panic!("expected a change, got {other:?}"),
    };
    assert_eq!(reindexed, vec!["T3"]);
    assert_eq!(failed, vec!["T2"]);

    let snapshot = h.store.latest_snapshot("shop").await.unwrap().unwrap();
    assert!(snapshot.schema_json.contains("\"T2\""));
    assert_eq!(
        h.monitor.check("shop", true).await.unwrap(),
        DriftOutcome::Unchanged
    );
}

/// Snapshot store that cannot read one datasource, and optionally cannot
/// write the change log at all.
struct BrokenFor {
    inner: MemoryStore,
    broken: &'static str,
    change_log_down: bool,
}

impl SnapshotStore for BrokenFor {
    fn latest_snapshot<'a>(
        &'a self,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<SchemaSnapshot>>> {
        if datasource_id == self.broken {
            return Box::pin(async { Err(anyhow!("disk I/O error")) });
        }
        self.inner.latest_snapshot(datasource_id)
    }

    fn save_snapshot<'a>(&'a self, snapshot: &'a SchemaSnapshot) -> BoxFuture<'a, anyhow::Result<()>> {
        self.inner.save_snapshot(snapshot)
    }

    fn append_change<'a>(
        &'a self,
        record: &'a SchemaChangeRecord,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        if self.change_log_down {
            return Box::pin(async { Err(anyhow!("database is locked")) });
        }
        self.inner.append_change(record)
    }

    fn list_changes<'a>(
        &'a self,
        datasource_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<SchemaChangeRecord>>> {
        self.inner.list_changes(datasource_id, limit)
    }
}

#[tokio::test]
async fn test_run_all_continues_past_failure() {
    let backend = FakeBackend::new();
    backend.set_schema(&[("T1", &[("a", "int")])]);
    let store = Arc::new(BrokenFor {
        inner: MemoryStore::new(),
        broken: "crm",
        change_log_down: false,
    });
    let gateway = fake_gateway(FakeFactory::new(backend), &["shop", "crm"], 50);
    let monitor = SchemaDriftMonitor::new(
        Arc::new(gateway),
        store.clone(),
        Arc::new(RecordingCatalog::default()),
        DAY,
    );

    let results = monitor.run_all().await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "crm");
    assert!(results[0].1.is_err());
    assert_eq!(results[1].0, "shop");
    assert!(matches!(
        results[1].1,
        Ok(DriftOutcome::Baseline { tables: 1 })
    ));
    assert!(store.inner.latest_snapshot("shop").await.unwrap().is_some());
}

#[tokio::test]
async fn test_change_log_failure_still_reindexes_and_replaces_snapshot() {
    let backend = FakeBackend::new();
    backend.set_schema(&[("T1", &[("a", "int")])]);
    let store = Arc::new(BrokenFor {
        inner: MemoryStore::new(),
        broken: "none",
        change_log_down: true,
    });
    let catalog = Arc::new(RecordingCatalog::default());
    let gateway = fake_gateway(FakeFactory::new(backend.clone()), &["shop"], 50);
    let monitor = SchemaDriftMonitor::new(Arc::new(gateway), store.clone(), catalog.clone(), DAY);
    monitor.check("shop", false).await.unwrap();

    backend.set_schema(&[("T1", &[("a", "int")]), ("T2", &[("b", "int")])]);
    let outcome = monitor.check("shop", true).await.unwrap();

    let reindexed = match outcome {
        DriftOutcome::Changed { reindexed, .. } => reindexed,
        other => panic!("expected a change, got {other:?}"),
    };
    assert_eq!(reindexed, vec!["T2"]);
    assert_eq!(catalog.recording("shop").upserted(), vec!["table::T2"]);
    let snapshot = store.inner.latest_snapshot("shop").await.unwrap().unwrap();
    assert!(snapshot.schema_json.contains("\"T2\""));
    assert!(store.inner.list_changes("shop", 10).await.unwrap().is_empty());
    assert_eq!(
        monitor.check("shop", true).await.unwrap(),
        DriftOutcome::Unchanged
    );
}
