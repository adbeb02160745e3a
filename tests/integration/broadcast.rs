//! Upload, table sync and table broadcast across several clients.

use std::time::Duration;

use fshare::client::Client;
use fshare::protocol::Flag;
use tempfile::TempDir;

use crate::helpers::{ARRIVAL_TIMEOUT, QUIET_PERIOD, RawConnection, TestServer, init_test_tracing};

/// A uploads; A, B and C each see exactly one refreshed table ending with the new file.
#[tokio::test]
async fn save_is_broadcast_to_every_client_once() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let server = TestServer::start(tmp.path()).await;

    let mut a = server.client().await;
    let mut b = server.client().await;
    let mut c = server.client().await;
    assert!(a.table().is_empty());

    let local = tmp.path().join("x.txt");
    tokio::fs::write(&local, b"abc").await.unwrap();
    assert_eq!(a.upload(&local).await.unwrap(), 3);

    for client in [&mut a, &mut b, &mut c] {
        let table = client
            .wait_for_table(ARRIVAL_TIMEOUT)
            .await
            .unwrap()
            .expect("no table broadcast");
        let last = table.last().unwrap();
        assert_eq!(last.file_name, "x.txt");
        assert_eq!(last.link, server.link("x.txt"));
    }
    for client in [&mut a, &mut b, &mut c] {
        assert!(client.wait_for_table(QUIET_PERIOD).await.unwrap().is_none());
    }

    let stored = tokio::fs::read(server.upload_dir.join("x.txt")).await.unwrap();
    assert_eq!(stored, b"abc");
    server.stop();
}

/// The exact bytes of the save scenario: padded header in, `upd` envelope out.
#[tokio::test]
async fn raw_save_produces_update_envelope() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let server = TestServer::start(tmp.path()).await;
    let mut raw = RawConnection::connect(server.addr).await;

    raw.send_raw("flag:save,fileName:x.txt,fileSize:3;", b"abc").await;
    let update = raw.recv().await;
    assert_eq!(update.flag(), Flag::Update);

    let encoded = update.encode().unwrap();
    assert!(encoded.starts_with(b"flag:upd,"));

    let snapshot = String::from_utf8(update.payload.to_vec()).unwrap();
    let last = snapshot.lines().last().unwrap();
    assert!(
        last.ends_with(&format!(",x.txt,{}", server.link("x.txt"))),
        "unexpected row {last:?}"
    );
    raw.expect_silence().await;
    server.stop();
}

/// A table request is answered to the requester only.
#[tokio::test]
async fn update_request_is_not_broadcast() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let server = TestServer::start(tmp.path()).await;

    let mut a = server.client().await;
    let mut b = server.client().await;
    a.request_table().await.unwrap();
    assert!(b.wait_for_table(QUIET_PERIOD).await.unwrap().is_none());
    server.stop();
}

/// A client that vanished does not stop the others from getting the table.
#[tokio::test]
async fn departed_client_does_not_break_broadcast() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let server = TestServer::start(tmp.path()).await;

    let mut a = server.client().await;
    let gone = server.client().await;
    let mut b = server.client().await;
    drop(gone);

    let local = tmp.path().join("y.bin");
    tokio::fs::write(&local, [0u8, 1, 2, 255]).await.unwrap();
    a.upload(&local).await.unwrap();

    for client in [&mut a, &mut b] {
        let table = client.wait_for_table(ARRIVAL_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(table.last().unwrap().file_name, "y.bin");
    }
    server.stop();
}

/// Malformed or unsafe frames are dropped and the session keeps serving.
#[tokio::test]
async fn bad_frames_are_dropped_without_closing() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let server = TestServer::start(tmp.path()).await;
    let mut raw = RawConnection::connect(server.addr).await;

    raw.send_raw("flag:delete,fileName:null,fileSize:null;", b"").await;
    raw.send_raw("fileName:a,fileSize:1;", b"a").await;
    raw.send_raw("flag:save,fileName:../escape.txt,fileSize:1;", b"x").await;
    raw.send_raw("flag:save,fileName:null,fileSize:1;", b"x").await;
    raw.expect_silence().await;

    raw.send_raw("flag:upd,fileName:null,fileSize:null;", b"").await;
    let update = raw.recv().await;
    assert_eq!(update.flag(), Flag::Update);
    assert!(update.payload.is_empty());
    assert!(!tmp.path().join("escape.txt").exists());
    server.stop();
}

/// Entries written before a restart are still served afterwards, new ones go last.
#[tokio::test]
async fn table_survives_restart() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let local = tmp.path().join("first.txt");
    tokio::fs::write(&local, b"1").await.unwrap();

    let server = TestServer::start(tmp.path()).await;
    let mut client = server.client().await;
    client.upload(&local).await.unwrap();
    client.wait_for_table(ARRIVAL_TIMEOUT).await.unwrap().unwrap();
    drop(client);
    server.stop();

    let server = TestServer::start(tmp.path()).await;
    let mut client = server.client().await;
    let names: Vec<String> = client.table().iter().map(|e| e.file_name.clone()).collect();
    assert_eq!(names, vec!["first.txt"]);

    let second = tmp.path().join("second.txt");
    tokio::fs::write(&second, b"2").await.unwrap();
    client.upload(&second).await.unwrap();
    let table = client.wait_for_table(ARRIVAL_TIMEOUT).await.unwrap().unwrap();
    let names: Vec<&str> = table.iter().map(|e| e.file_name.as_str()).collect();
    assert_eq!(names, vec!["first.txt", "second.txt"]);
    server.stop();
}

/// A failed store is logged only: nothing is appended or broadcast and the
/// session keeps answering.
#[tokio::test]
async fn failed_store_changes_nothing() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let table_path = tmp.path().join("TableFile.txt");
    let server = TestServer::start(tmp.path()).await;
    let mut raw = RawConnection::connect(server.addr).await;
    let mut other = server.client().await;

    raw.send_raw("flag:save,fileName:kept.txt,fileSize:1;", b"k").await;
    assert_eq!(raw.recv().await.flag(), Flag::Update);
    other.wait_for_table(ARRIVAL_TIMEOUT).await.unwrap().unwrap();
    let before = tokio::fs::read(&table_path).await.unwrap();

    tokio::fs::remove_dir_all(&server.upload_dir).await.unwrap();
    tokio::fs::write(&server.upload_dir, b"not a directory").await.unwrap();

    raw.send_raw("flag:save,fileName:lost.txt,fileSize:4;", b"lost").await;
    raw.expect_silence().await;
    assert!(other.wait_for_table(QUIET_PERIOD).await.unwrap().is_none());
    assert_eq!(tokio::fs::read(&table_path).await.unwrap(), before);

    raw.send_raw("flag:upd,fileName:null,fileSize:null;", b"").await;
    let update = raw.recv().await;
    assert_eq!(update.flag(), Flag::Update);
    assert_eq!(update.payload.as_ref(), before.as_slice());
    server.stop();
}

/// A client that keeps uploading without reading its broadcasts stalls neither
/// itself nor the server.
#[tokio::test]
async fn uploads_without_reading_do_not_stall() {
    init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let rows: String = (0..4000)
        .map(|i| format!("01.01.2024/00:00:00.000,seed-{i}.bin,file:///seed/seed-{i}.bin\n"))
        .collect();
    tokio::fs::write(tmp.path().join("TableFile.txt"), rows).await.unwrap();
    let server = TestServer::start(tmp.path()).await;
    let mut idle = server.client().await;

    let local = tmp.path().join("blob.bin");
    tokio::fs::write(&local, vec![7u8; 64 * 1024]).await.unwrap();
    let mut pusher = Client::connect(server.client_config()).await.unwrap();
    let pushed = tokio::time::timeout(Duration::from_secs(30), async {
        for _ in 0..200 {
            pusher.upload(&local).await.unwrap();
        }
    })
    .await;
    assert!(pushed.is_ok(), "uploads stalled");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let rows = server.client().await.table().len();
        if rows == 4200 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "table stuck at {rows} rows");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The idle client missed broadcasts but its connection still works.
    assert!(idle.request_table().await.is_ok());
    server.stop();
}
