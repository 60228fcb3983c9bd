use smbserve::codec::primitive::to_filetime;
use smbserve::trans::trans2::{fs_level, subcommand};

use super::common::{Fixture, VOLUME_CREATED_UNIX};

#[tokio::test]
async fn fragmented_transaction_reassembles() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    // A large data area forced across four secondary frames; the query
    // itself ignores the data, which makes the reassembly observable purely
    // through the response.
    let filler = vec![0xA5u8; 60_000];
    let params = fs_level::VOLUME_INFO.to_le_bytes();
    let (_, data) = tree
        .trans2(&[subcommand::QUERY_FS_INFORMATION], &params, &filler, Some(15_000))
        .await
        .expect("fragmented trans2");

    // volume info: creation time (8), serial (4), label length (4),
    // reserved (2), label
    assert!(data.len() >= 18);
    let created = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let serial = u32::from_le_bytes(data[8..12].try_into().unwrap());
    let expected =
        std::time::UNIX_EPOCH + std::time::Duration::from_secs(VOLUME_CREATED_UNIX);
    assert_eq!(created, to_filetime(expected));
    assert_eq!(serial, 0xC0DE_CAFE);

    let label_len = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
    let label_raw = &data[18..18 + label_len];
    let label: String = label_raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .map(|unit| char::from_u32(u32::from(unit)).unwrap_or('?'))
        .collect();
    assert_eq!(label, "DATA");
}

#[tokio::test]
async fn query_fs_volume_convenience() {
    let fixture = Fixture::start().await;
    let (_client, _session, tree) = fixture.guest_tree().await;
    let volume = tree.query_fs_volume().await.expect("volume query");
    assert_eq!(volume.label, "DATA");
    assert_eq!(volume.serial, 0xC0DE_CAFE);
}

#[tokio::test]
async fn directory_search_via_find_first2() {
    let fixture = Fixture::start().await;
    fixture.disk.seed_file("docs\\alpha.txt", b"a").await;
    fixture.disk.seed_file("docs\\beta.txt", b"b").await;
    fixture.disk.seed_file("docs\\gamma.doc", b"c").await;
    let (_client, _session, tree) = fixture.guest_tree().await;

    // FIND_FIRST2 for *.txt under docs, both-directory-info level
    let mut params = Vec::new();
    params.extend_from_slice(&0x0016u16.to_le_bytes()); // search attributes
    params.extend_from_slice(&16u16.to_le_bytes()); // max count
    params.extend_from_slice(&0u16.to_le_bytes()); // flags: keep handle
    params.extend_from_slice(&0x0104u16.to_le_bytes()); // both directory info
    params.extend_from_slice(&0u32.to_le_bytes()); // storage type
    for unit in "\\docs\\*.txt".encode_utf16() {
        params.extend_from_slice(&unit.to_le_bytes());
    }
    params.extend_from_slice(&[0, 0]);

    let (out_params, out_data) = tree
        .trans2(&[0x0001], &params, &[], None)
        .await
        .expect("find first");
    assert!(out_params.len() >= 10);
    let count = u16::from_le_bytes([out_params[2], out_params[3]]);
    let end_of_search = u16::from_le_bytes([out_params[4], out_params[5]]);
    assert_eq!(count, 2, "two .txt files match");
    assert_ne!(end_of_search, 0);
    assert!(!out_data.is_empty());
}

#[tokio::test]
async fn stale_reassembly_is_reaped() {
    let fixture = Fixture::start().await;
    let (_client, _session, _tree) = fixture.guest_tree().await;

    // An abandoned reassembly sits in the connection's table until the
    // staleness sweep takes it.
    let connection = fixture.server.connection(1).expect("live connection");
    connection.transactions.insert(
        (100, 7),
        smbserve::trans::Assembly {
            kind: smbserve::trans::TransKind::Trans2,
            name: String::new(),
            function: subcommand::QUERY_FS_INFORMATION,
            setup: vec![subcommand::QUERY_FS_INFORMATION],
            total_params: 2,
            total_data: 4096,
            params: Vec::new(),
            data: Vec::new(),
            received_params: 0,
            received_data: 0,
            max_param_reply: 64,
            max_data_reply: 4096,
            since: std::time::Instant::now(),
        },
    );

    assert_eq!(
        smbserve::trans::reap_stale(&connection, std::time::Duration::from_secs(600)),
        0,
        "fresh assemblies stay"
    );
    assert_eq!(smbserve::trans::reap_stale(&connection, std::time::Duration::ZERO), 1);
    assert!(connection.transactions.is_empty());
}
