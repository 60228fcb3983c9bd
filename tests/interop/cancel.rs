use smbserve::client::OpenRequest;
use smbserve::disk::{CreateDisposition, CreateOptions, DesiredAccess, SharingMode};
use smbserve::notify::{action, completion_filter};
use smbserve::status::Status;

use super::common::Fixture;

fn open_directory() -> OpenRequest {
    OpenRequest {
        access: DesiredAccess::READ_DATA | DesiredAccess::READ_ATTRIBUTES,
        sharing: SharingMode::READ | SharingMode::WRITE,
        disposition: CreateDisposition::Open,
        options: CreateOptions::DIRECTORY_FILE,
        request_oplock: false,
    }
}

#[tokio::test]
async fn change_notify_fires_on_create() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    let docs = tree.open("\\docs", open_directory()).await.expect("open directory");
    let watch = tree
        .change_notify(&docs, completion_filter::FILE_NAME)
        .await
        .expect("arm watch");

    let file = tree
        .open("\\docs\\new.txt", OpenRequest::read_write(CreateDisposition::Create))
        .await
        .expect("create inside watched dir");
    file.close().await.unwrap();

    let outcome = watch.wait().await.expect("watch resolves");
    assert_eq!(outcome.status, Status::SUCCESS);
    assert_eq!(outcome.changes, vec![(action::ADDED, "new.txt".to_string())]);
}

#[tokio::test]
async fn nt_cancel_answers_with_cancelled() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    let docs = tree.open("\\docs", open_directory()).await.expect("open directory");
    let watch = tree
        .change_notify(&docs, completion_filter::FILE_NAME)
        .await
        .expect("arm watch");

    watch.cancel().await.expect("cancel sent");
    let outcome = watch.wait().await.expect("watch resolves");
    assert_eq!(outcome.status, Status::CANCELLED);
    assert!(outcome.changes.is_empty());

    // The watch is gone: later changes in the directory stay quiet, and a
    // freshly armed watch sees only its own change.
    let unseen = tree
        .open("\\docs\\after-cancel.txt", OpenRequest::read_write(CreateDisposition::Create))
        .await
        .unwrap();
    unseen.close().await.unwrap();

    let watch = tree
        .change_notify(&docs, completion_filter::FILE_NAME)
        .await
        .unwrap();
    let file = tree
        .open("\\docs\\visible.txt", OpenRequest::read_write(CreateDisposition::Create))
        .await
        .unwrap();
    file.close().await.unwrap();
    let outcome = watch.wait().await.unwrap();
    assert_eq!(outcome.changes, vec![(action::ADDED, "visible.txt".to_string())]);
}

#[tokio::test]
async fn cancel_leaves_other_pending_requests_alone() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    fixture.disk.seed_directory("docs\\inner").await;
    let outer = tree.open("\\docs", open_directory()).await.unwrap();
    let inner = tree.open("\\docs\\inner", open_directory()).await.unwrap();

    let outer_watch = tree.change_notify(&outer, completion_filter::FILE_NAME).await.unwrap();
    let inner_watch = tree.change_notify(&inner, completion_filter::FILE_NAME).await.unwrap();

    outer_watch.cancel().await.unwrap();
    let outcome = outer_watch.wait().await.unwrap();
    assert_eq!(outcome.status, Status::CANCELLED);

    // The second watch is unaffected and still fires.
    let file = tree
        .open(
            "\\docs\\inner\\report.txt",
            OpenRequest::read_write(CreateDisposition::Create),
        )
        .await
        .unwrap();
    file.close().await.unwrap();
    let outcome = inner_watch.wait().await.unwrap();
    assert_eq!(outcome.status, Status::SUCCESS);
    assert_eq!(outcome.changes, vec![(action::ADDED, "report.txt".to_string())]);
}
