use std::time::Duration;

use smbserve::client::OpenRequest;
use smbserve::disk::CreateDisposition;

use super::common::Fixture;

/// Two connections flood the server at once; the per-run packet budget
/// keeps both progressing, so every request completes well inside the
/// deadline even though each connection queued far more than one run's
/// worth of frames.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections_share_the_workers() {
    let fixture = Fixture::start().await;

    let (_client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;

    let flood = |tree: smbserve::client::ClientTree, tag: &'static str| async move {
        let mut tasks = Vec::new();
        for index in 0..32u32 {
            let tree = tree.clone();
            tasks.push(tokio::spawn(async move {
                let path = format!("\\{tag}-{index}.bin");
                let file = tree
                    .open(&path, OpenRequest::read_write(CreateDisposition::Create))
                    .await
                    .expect("create");
                file.write(0, &index.to_le_bytes()).await.expect("write");
                let back = file.read(0, 4).await.expect("read");
                assert_eq!(back, index.to_le_bytes());
                file.close().await.expect("close");
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
    };

    let deadline = Duration::from_secs(30);
    tokio::time::timeout(deadline, async {
        tokio::join!(flood(tree_a, "a"), flood(tree_b, "b"));
    })
    .await
    .expect("both floods complete in time");
}
