#![cfg(test)]

use crate::codec::frame::{
    build_session_request, decode_netbios_name, encode_netbios_name, parse_session_request,
    put_header, read_header, session_type,
};

#[tokio::test]
async fn header_round_trip() {
    let mut buf = Vec::new();
    put_header(&mut buf, session_type::MESSAGE, 0x1ABCD);
    let header = read_header(&mut buf.as_slice()).await.unwrap();
    assert_eq!(header.message_type, session_type::MESSAGE);
    assert_eq!(header.length, 0x1ABCD);
}

#[tokio::test]
async fn seventeen_bit_length_extension() {
    let buf = [session_type::MESSAGE, 0x01, 0xFF, 0xFF];
    let header = read_header(&mut buf.as_slice()).await.unwrap();
    assert_eq!(header.length, 0x1FFFF);
}

#[test]
fn netbios_name_round_trip() {
    let encoded = encode_netbios_name("fileserver", 0x20);
    let (name, suffix) = decode_netbios_name(&encoded);
    assert_eq!(name, "FILESERVER");
    assert_eq!(suffix, 0x20);
}

#[test]
fn session_request_round_trip() {
    let body = build_session_request("SERVER", "CLIENT");
    let request = parse_session_request(&body).unwrap();
    assert_eq!(request.called, "SERVER");
    assert_eq!(request.called_suffix, 0x20);
    assert_eq!(request.calling, "CLIENT");
}

#[test]
fn malformed_session_request() {
    assert!(parse_session_request(&[0x20, 0x41]).is_err());
}
