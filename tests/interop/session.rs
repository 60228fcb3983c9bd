use smbserve::client::{ClientError, OpenRequest};
use smbserve::disk::{CreateDisposition, DesiredAccess, SharingMode};
use smbserve::status::Status;

use super::common::Fixture;

#[tokio::test]
async fn negotiate_then_anonymous_read() {
    let fixture = Fixture::start().await;
    let client = fixture.client().await;

    let negotiated = client
        .negotiate(&["PC NETWORK PROGRAM 1.0", "NT LM 0.12"])
        .await
        .expect("negotiate");
    assert_eq!(negotiated.dialect_index, 1, "NT LM 0.12 is the best offered dialect");
    assert_ne!(negotiated.challenge, [0u8; 8]);

    let session = client.session_setup("", "", "").await.expect("guest session");
    assert_eq!(session.uid, 100, "first circuit gets the first UID");

    let tree = session.tree_connect("\\\\SERVER\\PUBLIC").await.expect("tree connect");
    let file = tree
        .open("\\hello.txt", OpenRequest::read(CreateDisposition::Open))
        .await
        .expect("open hello.txt");
    assert_eq!(file.size, 13);

    let data = file.read(0, 64).await.expect("read");
    assert_eq!(data, b"Hello, SMB!\r\n");

    file.close().await.expect("close");
    tree.disconnect().await.expect("tree disconnect");
    session.logoff().await.expect("logoff");
}

#[tokio::test]
async fn unknown_share_is_refused() {
    let fixture = Fixture::start().await;
    let client = fixture.client().await;
    client.negotiate(&["NT LM 0.12"]).await.unwrap();
    let session = client.session_setup("", "", "").await.unwrap();
    match session.tree_connect("\\\\SERVER\\NOPE").await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::BAD_NETWORK_NAME),
        other => panic!("expected bad network name, got {:?}", other.map(|t| t.tid)),
    }
}

#[tokio::test]
async fn sharing_violation_between_circuits() {
    let fixture = Fixture::start().await;

    let (_client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let holder = tree_a
        .open(
            "\\shared.bin",
            OpenRequest {
                access: DesiredAccess::READ_DATA | DesiredAccess::WRITE_DATA,
                sharing: SharingMode::READ,
                disposition: CreateDisposition::Open,
                options: smbserve::disk::CreateOptions::empty(),
                request_oplock: false,
            },
        )
        .await
        .expect("first opener wins");

    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;
    let refused = tree_b
        .open(
            "\\shared.bin",
            OpenRequest {
                access: DesiredAccess::WRITE_DATA,
                sharing: SharingMode::READ | SharingMode::WRITE,
                disposition: CreateDisposition::Open,
                options: smbserve::disk::CreateOptions::empty(),
                request_oplock: false,
            },
        )
        .await;
    match refused {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::SHARING_VIOLATION),
        other => panic!("expected sharing violation, got {:?}", other.map(|f| f.fid)),
    }

    // Once the holder closes, the same open succeeds.
    holder.close().await.unwrap();
    tree_b
        .open(
            "\\shared.bin",
            OpenRequest::read_write(CreateDisposition::Open),
        )
        .await
        .expect("open after close");
}

#[tokio::test]
async fn repeated_tree_disconnect_is_flagged() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;
    tree.disconnect().await.expect("first disconnect");
    match tree.disconnect().await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::SMB_BAD_TID),
        other => panic!("expected bad tid, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_password_fails_logon() {
    let fixture = Fixture::start().await;
    let client = fixture.client().await;
    client.negotiate(&["NT LM 0.12"]).await.unwrap();
    match client.session_setup("alice", "wrong", "WORKGROUP").await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::LOGON_FAILURE),
        other => panic!("expected logon failure, got {:?}", other.map(|s| s.uid)),
    }
    // The connection survives an authentication failure.
    let session = client.session_setup("alice", "secret", "WORKGROUP").await.expect("retry");
    assert!(session.uid >= 100);
}

#[tokio::test]
async fn write_then_read_back() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    let file = tree
        .open("\\fresh.txt", OpenRequest::read_write(CreateDisposition::Create))
        .await
        .expect("create");
    let written = file.write(0, b"first draft").await.expect("write");
    assert_eq!(written, 11);
    assert_eq!(file.read(0, 64).await.unwrap(), b"first draft");
    assert_eq!(file.read(6, 64).await.unwrap(), b"draft");
    file.close().await.unwrap();

    // Creating over an existing file is a collision.
    match tree.open("\\fresh.txt", OpenRequest::read(CreateDisposition::Create)).await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::OBJECT_NAME_COLLISION),
        other => panic!("expected collision, got {:?}", other.map(|f| f.fid)),
    }
}

#[tokio::test]
async fn rename_and_delete_round_trip() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    let file = tree
        .open("\\draft.txt", OpenRequest::read_write(CreateDisposition::Create))
        .await
        .unwrap();
    file.write(0, b"payload").await.unwrap();
    file.close().await.unwrap();

    tree.rename("\\draft.txt", "\\final.txt").await.expect("rename");
    let renamed = tree
        .open("\\final.txt", OpenRequest::read(CreateDisposition::Open))
        .await
        .expect("open renamed");
    assert_eq!(renamed.read(0, 16).await.unwrap(), b"payload");
    renamed.close().await.unwrap();

    tree.delete("\\final.txt").await.expect("delete");
    match tree.open("\\final.txt", OpenRequest::read(CreateDisposition::Open)).await {
        Err(ClientError::Server(status)) => assert_eq!(status, Status::OBJECT_NAME_NOT_FOUND),
        other => panic!("expected not found, got {:?}", other.map(|f| f.fid)),
    }
}
