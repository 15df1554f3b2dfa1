// End-to-end engine scenarios against the in-process store.
use std::time::Duration;

use keyferry::api::{
    DumpOptions, ErrorKind, MemoryServer, Record, RestoreOptions, ScanOptions, SyncOptions,
    WritePolicy, dump, restore, sync,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

fn small_scan() -> ScanOptions {
    ScanOptions {
        count: 3,
        ..ScanOptions::default()
    }
}

fn seeded_source() -> MemoryServer {
    let server = MemoryServer::new(3);
    server.insert(0, "plain", b"alpha".to_vec(), None);
    server.insert(0, "expiring", b"beta".to_vec(), Some(Duration::from_secs(120)));
    server.insert(1, "bin\nary", vec![0u8, 255, 10, 13], None);
    for i in 0..25 {
        server.insert(2, &format!("bulk:{i}"), format!("v{i}").into_bytes(), None);
    }
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dump_then_restore_reproduces_the_keyspace() {
    let source = seeded_source();
    let options = DumpOptions {
        threads: 4,
        scan: small_scan(),
        ..DumpOptions::default()
    };
    let (report, output) = dump(&source.connector(), Vec::new(), &options)
        .await
        .expect("dump");
    assert_eq!(report.records, 28);

    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("dump.json");
    let mut file = tokio::fs::File::create(&path).await.expect("create");
    file.write_all(&output).await.expect("write");
    file.flush().await.expect("flush");
    drop(file);

    let dest = MemoryServer::new(3);
    let file = tokio::fs::File::open(&path).await.expect("open");
    let restored = restore(
        &dest.connector(),
        tokio::io::BufReader::new(file),
        &RestoreOptions::default(),
    )
    .await
    .expect("restore");
    assert_eq!(restored.restored, 28);
    assert_eq!(restored.databases, vec![0, 1, 2]);

    for db in 0..3 {
        assert_eq!(dest.keys(db), source.keys(db));
        for key in source.keys(db) {
            assert_eq!(dest.get(db, &key), source.get(db, &key));
        }
    }
    assert_eq!(dest.ttl_of(0, "plain"), None);
    let ttl = dest.ttl_of(0, "expiring").expect("ttl");
    assert!(ttl >= Duration::from_secs(118) && ttl <= Duration::from_secs(120));
}

#[tokio::test]
async fn restoring_twice_with_replace_is_idempotent() {
    let dest = MemoryServer::new(1);
    let line = Record::new(0, "k", b"value".to_vec(), 0)
        .to_json_line()
        .expect("line");
    let input = format!("{line}\n");
    for _ in 0..2 {
        let report = restore(&dest.connector(), input.as_bytes(), &RestoreOptions::default())
            .await
            .expect("restore");
        assert_eq!(report.restored, 1);
    }
    assert_eq!(dest.keys(0), vec!["k".to_string()]);
    assert_eq!(dest.get(0, "k"), Some(b"value".to_vec()));
}

#[tokio::test]
async fn negative_ttl_restores_without_expiry() {
    let dest = MemoryServer::new(1);
    let input = "{\"db\":0,\"key\":\"k\",\"value\":\"dg==\",\"ttl\":-1}\n";
    restore(&dest.connector(), input.as_bytes(), &RestoreOptions::default())
        .await
        .expect("restore");
    assert_eq!(dest.get(0, "k"), Some(b"v".to_vec()));
    assert_eq!(dest.ttl_of(0, "k"), None);
}

#[tokio::test]
async fn malformed_line_between_good_ones_is_skipped() {
    let dest = MemoryServer::new(1);
    let input = concat!(
        "{\"db\":0,\"key\":\"a\",\"value\":\"MQ==\",\"ttl\":0}\n",
        "{\"db\":0,\"key\":\"b\",\"value\":\"Mg==\",\"ttl\":\"soon\"}\n",
        "{\"db\":0,\"key\":\"c\",\"value\":\"Mw==\",\"ttl\":0}\n",
    );
    let report = restore(&dest.connector(), input.as_bytes(), &RestoreOptions::default())
        .await
        .expect("restore");
    assert_eq!(report.restored, 2);
    assert_eq!(report.skipped_lines, 1);
    assert_eq!(dest.keys(0), vec!["a".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn delete_then_write_overwrites_existing_key() {
    let dest = MemoryServer::new(1);
    dest.insert(0, "a", b"old".to_vec(), None);
    let input = concat!(
        "{\"db\":0,\"key\":\"a\",\"value\":\"MQ==\",\"ttl\":0}\n",
        "{\"db\":0,\"key\":\"b\",\"value\":\"Mg==\",\"ttl\":0}\n",
    );
    let options = RestoreOptions {
        write_policy: WritePolicy::DeleteThenWrite,
        ..RestoreOptions::default()
    };
    let report = restore(&dest.connector(), input.as_bytes(), &options)
        .await
        .expect("delete-then-write succeeds");
    assert_eq!(report.restored, 2);
    assert_eq!(dest.get(0, "a"), Some(b"1".to_vec()));
}

#[tokio::test]
async fn sync_converges_source_and_destination() {
    let source = MemoryServer::new(1);
    let dest = MemoryServer::new(1);
    source.insert(0, "a", b"1".to_vec(), None);
    source.insert(0, "b", b"2".to_vec(), Some(Duration::from_secs(30)));
    dest.insert(0, "b", b"old".to_vec(), Some(Duration::from_secs(5)));
    dest.insert(0, "c", b"3".to_vec(), None);

    let options = SyncOptions {
        threads: 2,
        rounds: 1,
        scan: small_scan(),
        ..SyncOptions::default()
    };
    let (_tx, rx) = watch::channel(false);
    let report = sync(&source.connector(), &dest.connector(), options, rx)
        .await
        .expect("sync");

    let totals = &report.databases[0];
    assert_eq!(totals.rounds, 1);
    assert_eq!(totals.copied, 2);
    assert_eq!(totals.pruned, 1);
    assert_eq!(totals.failed, 0);
    assert_eq!(dest.keys(0), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(dest.get(0, "b"), Some(b"2".to_vec()));
    let ttl = dest.ttl_of(0, "b").expect("ttl");
    assert!(ttl > Duration::from_secs(28) && ttl <= Duration::from_secs(30));
}

#[tokio::test]
async fn failed_sync_copy_is_retried_next_round() {
    use keyferry::store::memory::FailOp;

    let source = MemoryServer::new(1);
    let dest = MemoryServer::new(1);
    source.insert(0, "flaky", b"x".to_vec(), None);
    dest.fail(0, "flaky", FailOp::Restore);

    let options = SyncOptions {
        threads: 1,
        rounds: 1,
        idle_backoff: Duration::from_millis(5),
        ..SyncOptions::default()
    };
    let (_tx, rx) = watch::channel(false);
    let report = sync(&source.connector(), &dest.connector(), options.clone(), rx.clone())
        .await
        .expect("first");
    assert_eq!(report.databases[0].failed, 1);
    assert!(dest.keys(0).is_empty());

    dest.heal(0, "flaky", FailOp::Restore);
    let report = sync(&source.connector(), &dest.connector(), options, rx)
        .await
        .expect("second");
    assert_eq!(report.databases[0].copied, 1);
    assert_eq!(dest.get(0, "flaky"), Some(b"x".to_vec()));
}

#[tokio::test]
async fn sync_rejects_unknown_destination_database() {
    let source = MemoryServer::new(2);
    let dest = MemoryServer::new(1);
    let options = SyncOptions {
        rounds: 1,
        ..SyncOptions::default()
    };
    let (_tx, rx) = watch::channel(false);
    let err = sync(&source.connector(), &dest.connector(), options, rx)
        .await
        .expect_err("db 1 missing on dest");
    assert_eq!(err.kind(), ErrorKind::Transport);
}
