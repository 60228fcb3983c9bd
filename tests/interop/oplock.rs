use smbserve::client::{BreakDecision, OpenRequest};
use smbserve::disk::CreateDisposition;
use smbserve::state::OplockLevel;
use tokio::sync::mpsc;

use super::common::Fixture;

#[tokio::test]
async fn batch_grant_breaks_to_level_two_on_second_open() {
    let fixture = Fixture::start().await;

    let (client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let (breaks_tx, mut breaks_rx) = mpsc::unbounded_channel();
    client_a.on_oplock_break(move |fid, target| {
        let _ = breaks_tx.send((fid, target));
        BreakDecision::Ack(target)
    });

    let holder = tree_a
        .open(
            "\\exclusive.dat",
            OpenRequest::read(CreateDisposition::Open).with_oplock(),
        )
        .await
        .expect("first open");
    assert_eq!(holder.oplock, OplockLevel::Batch, "sole opener gets batch");

    // The second circuit's open forces a break to level II on the holder.
    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;
    let second = tree_b
        .open(
            "\\exclusive.dat",
            OpenRequest::read(CreateDisposition::Open).with_oplock(),
        )
        .await
        .expect("second open");
    assert_eq!(second.oplock, OplockLevel::LevelII);

    let (broken_fid, target) = breaks_rx.recv().await.expect("break delivered");
    assert_eq!(broken_fid, holder.fid);
    assert_eq!(target, OplockLevel::LevelII);
}

#[tokio::test]
async fn write_open_breaks_level_two_holders_to_none() {
    let fixture = Fixture::start().await;

    let (client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let (breaks_tx, mut breaks_rx) = mpsc::unbounded_channel();
    client_a.on_oplock_break(move |fid, target| {
        let _ = breaks_tx.send((fid, target));
        BreakDecision::Ack(target)
    });

    let holder = tree_a
        .open(
            "\\exclusive.dat",
            OpenRequest::read(CreateDisposition::Open).with_oplock(),
        )
        .await
        .unwrap();
    assert_eq!(holder.oplock, OplockLevel::Batch);

    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;
    let second = tree_b
        .open(
            "\\exclusive.dat",
            OpenRequest::read(CreateDisposition::Open).with_oplock(),
        )
        .await
        .unwrap();
    assert_eq!(second.oplock, OplockLevel::LevelII);
    let (_, first_target) = breaks_rx.recv().await.expect("first break");
    assert_eq!(first_target, OplockLevel::LevelII);

    // A writer arrives: the level-II holder is told to drop to none.
    let (_client_c, _session_c, tree_c) = fixture.guest_tree().await;
    let writer = tree_c
        .open(
            "\\exclusive.dat",
            OpenRequest::read_write(CreateDisposition::Open),
        )
        .await
        .expect("write open proceeds");
    assert_eq!(writer.oplock, OplockLevel::None);

    let (broken_fid, target) = breaks_rx.recv().await.expect("second break");
    assert_eq!(broken_fid, holder.fid);
    assert_eq!(target, OplockLevel::None);
}

#[tokio::test]
async fn closing_the_holder_releases_the_oplock() {
    let fixture = Fixture::start().await;

    let (_client_a, _session_a, tree_a) = fixture.guest_tree().await;
    let holder = tree_a
        .open(
            "\\exclusive.dat",
            OpenRequest::read(CreateDisposition::Open).with_oplock(),
        )
        .await
        .unwrap();
    assert_eq!(holder.oplock, OplockLevel::Batch);
    holder.close().await.unwrap();

    // With the holder gone the next opener is the sole opener again.
    let (_client_b, _session_b, tree_b) = fixture.guest_tree().await;
    let next = tree_b
        .open(
            "\\exclusive.dat",
            OpenRequest::read(CreateDisposition::Open).with_oplock(),
        )
        .await
        .unwrap();
    assert_eq!(next.oplock, OplockLevel::Batch);
}
