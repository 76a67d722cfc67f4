mod common;

use ch_backup::clickhouse::DatabaseControl;
use ch_backup::{BackupError, BackupOptions, RestoreOptions};
use common::{test_config, test_layout, tool, FakeControl, FakePart};
use std::sync::Arc;

const FIRST: &str = "2024-01-01T00-00-00";
const SECOND: &str = "2024-01-02T00-00-00";

fn named(name: &str) -> BackupOptions {
    BackupOptions {
        name: Some(name.to_string()),
        ..BackupOptions::default()
    }
}

fn p1() -> FakePart {
    FakePart::new(
        "p1",
        "abc",
        100,
        &[("checksums.txt", b"p1 checksums"), ("data.bin", b"p1 data")],
    )
}

fn p2(checksum: &str, data: &'static [u8]) -> FakePart {
    FakePart::new("p2", checksum, 50, &[("data.bin", data)])
}

#[tokio::test]
async fn test_second_backup_links_unchanged_parts() {
    let config = test_config("", false);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1(), p2("def", b"first p2")]);
    assert_eq!(app.backup(named(FIRST)).await.unwrap(), FIRST);

    let first = app.show(FIRST).await.unwrap();
    assert!(first.is_complete());
    assert!(first.parts().all(|p| p.link.is_none()));
    assert_eq!(first.rows, 150);
    assert_eq!(first.bytes, p1().size() + p2("def", b"first p2").size());

    control.set_parts("db1", "t1", vec![p1(), p2("xyz", b"second p2")]);
    app.backup(named(SECOND)).await.unwrap();

    let second = app.show(SECOND).await.unwrap();
    let parts: Vec<_> = second.parts().collect();
    assert_eq!(parts.len(), 2);
    let linked = parts.iter().find(|p| p.name == "p1").unwrap();
    assert_eq!(linked.link.as_deref(), Some(FIRST));
    let fresh = parts.iter().find(|p| p.name == "p2").unwrap();
    assert_eq!(fresh.link, None);
    assert_eq!(fresh.checksum, "xyz");

    // nothing of p1 was written under the second backup
    let objects = layout.backup_objects(SECOND).await.unwrap();
    assert!(objects.iter().all(|o| !o.contains("/p1/")), "{:?}", objects);
    assert!(objects.iter().any(|o| o.ends_with("/p2/data.bin")));

    assert_eq!(app.list().await.unwrap(), vec![SECOND, FIRST]);
}

#[tokio::test]
async fn test_restore_applies_schema_before_attaching() {
    let config = test_config("ch_backup", true);
    let layout = test_layout(&config);
    let source = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &source).await;

    source.set_parts("db1", "t1", vec![p1(), p2("def", b"first p2")]);
    source.set_parts("db1", "t2", vec![p2("ghi", b"other table")]);
    app.backup(named(FIRST)).await.unwrap();
    source.set_parts("db1", "t1", vec![p1(), p2("xyz", b"second p2")]);
    app.backup(named(SECOND)).await.unwrap();

    let target = Arc::new(FakeControl::new());
    let restorer = tool(&config, &layout, &target).await;
    restorer.restore(SECOND, RestoreOptions::default()).await.unwrap();

    let schemas = target.applied_schemas();
    assert_eq!(schemas.len(), 3);
    assert!(schemas[0].starts_with("CREATE DATABASE db1"));
    assert!(schemas[1].starts_with("CREATE TABLE `db1`.t1"));
    assert!(schemas[2].starts_with("CREATE TABLE `db1`.t2"));

    let mut attached: Vec<String> = target
        .attached()
        .into_iter()
        .map(|(db, table, part)| format!("{}.{}.{}", db, table, part))
        .collect();
    attached.sort();
    assert_eq!(attached, vec!["db1.t1.p1", "db1.t1.p2", "db1.t2.p2"]);

    // p1 comes from the first backup through its link
    let detached = target.detached_table_path("db1", "t1");
    assert_eq!(std::fs::read(detached.join("p1/data.bin")).unwrap(), b"p1 data");
    assert_eq!(std::fs::read(detached.join("p2/data.bin")).unwrap(), b"second p2");
    assert!(target.owned().contains(&detached));
}

#[tokio::test]
async fn test_restore_of_unknown_databases_fails_before_any_change() {
    let config = test_config("", false);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1()]);
    app.backup(named(FIRST)).await.unwrap();

    let target = Arc::new(FakeControl::new());
    let restorer = tool(&config, &layout, &target).await;
    let err = restorer
        .restore(
            FIRST,
            RestoreOptions {
                databases: Some(vec!["db1".into(), "db2".into(), "db3".into()]),
                keep_going: false,
            },
        )
        .await
        .unwrap_err();

    match err {
        BackupError::MissingDatabases { backup, missing } => {
            assert_eq!(backup, FIRST);
            assert_eq!(missing, vec!["db2", "db3"]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(target.applied_schemas().is_empty());
    assert!(target.attached().is_empty());
}

#[tokio::test]
async fn test_failed_freeze_leaves_backup_incomplete() {
    let config = test_config("", false);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1()]);
    control.set_parts("db1", "t2", vec![p2("def", b"p2")]);
    control.fail_freeze("db1", "t2");

    let err = app.backup(named(FIRST)).await.unwrap_err();
    assert!(matches!(err, BackupError::Freeze { ref table, .. } if table == "t2"));

    let failed = app.show(FIRST).await.unwrap();
    assert!(!failed.is_complete());
    assert!(app.list().await.unwrap().is_empty());
    assert!(matches!(
        tool(&config, &layout, &control)
            .await
            .restore(FIRST, RestoreOptions::default())
            .await,
        Err(BackupError::BackupIncomplete(_))
    ));

    // the incomplete run is never a deduplication source
    control.clear_failures();
    app.backup(named(SECOND)).await.unwrap();
    let second = app.show(SECOND).await.unwrap();
    assert!(second.is_complete());
    assert!(second.parts().all(|p| p.link.is_none()));
    assert_eq!(app.list().await.unwrap(), vec![SECOND]);
}

#[tokio::test]
async fn test_min_interval_reuses_recent_backup() {
    let mut config = test_config("", false);
    config.backup.min_interval_minutes = 60;
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1()]);
    app.backup(named(FIRST)).await.unwrap();
    assert_eq!(app.backup(named(SECOND)).await.unwrap(), FIRST);

    let forced = BackupOptions {
        force: true,
        ..named(SECOND)
    };
    assert_eq!(app.backup(forced).await.unwrap(), SECOND);
}

#[tokio::test]
async fn test_delete_keeps_linked_objects() {
    let config = test_config("", false);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1(), p2("def", b"first p2")]);
    app.backup(named(FIRST)).await.unwrap();
    control.set_parts("db1", "t1", vec![p1(), p2("xyz", b"second p2")]);
    app.backup(named(SECOND)).await.unwrap();

    app.delete(FIRST).await.unwrap();
    assert_eq!(app.list().await.unwrap(), vec![SECOND]);

    let remaining = layout.backup_objects(FIRST).await.unwrap();
    let mut remaining: Vec<&str> = remaining.iter().map(String::as_str).collect();
    remaining.sort();
    assert_eq!(
        remaining,
        vec![
            "2024-01-01T00-00-00/data/db1/t1/p1/checksums.txt",
            "2024-01-01T00-00-00/data/db1/t1/p1/data.bin",
        ]
    );

    // the second backup is still restorable
    let target = Arc::new(FakeControl::new());
    tool(&config, &layout, &target)
        .await
        .restore(SECOND, RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(target.attached().len(), 2);

    // deleting the last link owner releases the kept objects too
    app.delete(SECOND).await.unwrap();
    assert!(layout.backup_objects(FIRST).await.unwrap().is_empty());
    assert!(layout.backup_objects(SECOND).await.unwrap().is_empty());
    assert!(matches!(
        app.delete(SECOND).await,
        Err(BackupError::BackupNotFound(_))
    ));
}

#[tokio::test]
async fn test_purge_applies_retain_count() {
    let mut config = test_config("", false);
    config.backup.retain_count = Some(1);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1()]);
    app.backup(named(FIRST)).await.unwrap();
    app.backup(named(SECOND)).await.unwrap();
    app.backup(named("2024-01-03T00-00-00")).await.unwrap();

    let purged = app.purge().await.unwrap();
    assert_eq!(purged, vec![FIRST, SECOND]);
    assert_eq!(app.list().await.unwrap(), vec!["2024-01-03T00-00-00"]);
}

#[tokio::test]
async fn test_access_control_roundtrip() {
    let mut config = test_config("", false);
    config.backup.backup_access_control = true;
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    let access = control.root().join("access");
    std::fs::create_dir_all(&access).unwrap();
    std::fs::write(access.join("u1.sql"), b"ATTACH USER alice").unwrap();
    control.set_parts("db1", "t1", vec![p1()]);
    app.backup(named(FIRST)).await.unwrap();
    assert_eq!(app.show(FIRST).await.unwrap().access_control, vec!["u1"]);

    let target = Arc::new(FakeControl::new());
    tool(&config, &layout, &target)
        .await
        .restore(FIRST, RestoreOptions::default())
        .await
        .unwrap();
    let restored = target.root().join("access");
    assert_eq!(std::fs::read(restored.join("u1.sql")).unwrap(), b"ATTACH USER alice");
    assert!(restored.join("need_rebuild_lists.mark").exists());
}

#[tokio::test]
async fn test_failed_upload_leaves_backup_incomplete() {
    let config = test_config("", false);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1(), p2("def", b"first p2")]);
    control.lose_frozen_part("db1", "t1", "p2");

    let err = app.backup(named(FIRST)).await.unwrap_err();
    assert!(
        matches!(err, BackupError::JobFailed { ref id, .. } if id == "db1.t1.p2"),
        "unexpected error: {}",
        err
    );
    assert!(!app.show(FIRST).await.unwrap().is_complete());
    assert!(app.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_keep_going_backup_omits_failed_part() {
    let config = test_config("ch_backup", true);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1(), p2("def", b"first p2")]);
    control.lose_frozen_part("db1", "t1", "p2");

    let options = BackupOptions {
        keep_going: true,
        ..named(FIRST)
    };
    assert_eq!(app.backup(options).await.unwrap(), FIRST);

    let meta = app.show(FIRST).await.unwrap();
    assert!(meta.is_complete());
    let names: Vec<&str> = meta.parts().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["p1"]);
    assert_eq!(meta.rows, 100);
    assert_eq!(meta.bytes, p1().size());
    assert_eq!(app.list().await.unwrap(), vec![FIRST]);
}

#[tokio::test]
async fn test_keep_going_restore_skips_part_that_failed_to_download() {
    let config = test_config("", false);
    let layout = test_layout(&config);
    let control = Arc::new(FakeControl::new());
    let app = tool(&config, &layout, &control).await;

    control.set_parts("db1", "t1", vec![p1(), p2("def", b"first p2")]);
    app.backup(named(FIRST)).await.unwrap();

    let meta = app.show(FIRST).await.unwrap();
    let lost = meta.parts().find(|p| p.name == "p2").unwrap();
    for path in layout.part_remote_paths(&meta.path, lost) {
        layout.engine().delete_file(&path).await.unwrap();
    }

    let strict = Arc::new(FakeControl::new());
    let err = tool(&config, &layout, &strict)
        .await
        .restore(FIRST, RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::JobFailed { .. }), "unexpected error: {}", err);
    assert!(strict.attached().is_empty());

    let lenient = Arc::new(FakeControl::new());
    tool(&config, &layout, &lenient)
        .await
        .restore(
            FIRST,
            RestoreOptions {
                databases: None,
                keep_going: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        lenient.attached(),
        vec![("db1".to_string(), "t1".to_string(), "p1".to_string())]
    );
}
