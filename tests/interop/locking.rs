use smbserve::client::{ClientError, OpenRequest};
use smbserve::disk::CreateDisposition;
use smbserve::status::Status;

use super::common::Fixture;

#[tokio::test]
async fn exclusive_range_blocks_other_handles() {
    let fixture = Fixture::start().await;

    let (_client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;

    let a = tree_a
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();
    let b = tree_b
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();

    a.lock(0, 64, true).await.expect("exclusive lock");

    match b.lock(32, 16, true).await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::LOCK_NOT_GRANTED),
        other => panic!("expected lock conflict, got {other:?}"),
    }
    match b.read(0, 16).await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::FILE_LOCK_CONFLICT),
        other => panic!("expected read conflict, got {other:?}"),
    }
    // Outside the locked range the other handle reads freely.
    b.read(100, 16).await.expect("read past the lock");

    a.unlock(0, 64).await.expect("unlock");
    b.lock(32, 16, true).await.expect("lock after unlock");
    b.unlock(32, 16).await.unwrap();
}

#[tokio::test]
async fn shared_locks_coexist_and_block_writers() {
    let fixture = Fixture::start().await;

    let (_client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;

    let a = tree_a
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();
    let b = tree_b
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();

    a.lock(0, 32, false).await.expect("shared lock");
    b.lock(16, 32, false).await.expect("overlapping shared lock");

    match b.write(8, b"denied").await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::FILE_LOCK_CONFLICT),
        other => panic!("expected write conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn unlock_must_match_grant() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;
    let file = tree
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();

    file.lock(10, 20, true).await.unwrap();
    match file.unlock(10, 19).await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::RANGE_NOT_LOCKED),
        other => panic!("expected range-not-locked, got {other:?}"),
    }
    file.unlock(10, 20).await.unwrap();
}

#[tokio::test]
async fn locks_die_with_the_handle() {
    let fixture = Fixture::start().await;

    let (_client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;

    let a = tree_a
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();
    a.lock(0, 64, true).await.unwrap();
    a.close().await.unwrap();

    let b = tree_b
        .open("\\shared.bin", OpenRequest::read_write(CreateDisposition::Open))
        .await
        .unwrap();
    b.lock(0, 64, true).await.expect("range free after close");
}
