#![cfg(test)]

use std::io::Cursor;

use crate::codec::header::{Command, Flags1, Flags2, Header, HEADER_LEN};
use crate::codec::Error;
use crate::status::Status;

fn sample_header() -> Header {
    Header {
        command: Command::NtCreateAndX as u8,
        status: Status::SUCCESS,
        flags: Flags1::CASELESS | Flags1::CANONICAL_PATHS,
        flags2: Flags2::NT_STATUS | Flags2::UNICODE | Flags2::LONG_NAMES,
        pid_high: 0,
        signature: [0; 8],
        tid: 3,
        pid: 0xFEFF,
        uid: 100,
        mid: 42,
    }
}

#[test]
fn header_round_trip() {
    let header = sample_header();
    let mut buf = Vec::new();
    header.write(&mut buf).unwrap();
    assert_eq!(buf.len(), HEADER_LEN);

    let parsed = Header::parse(&mut Cursor::new(buf)).unwrap();
    assert_eq!(parsed.command, Command::NtCreateAndX as u8);
    assert_eq!(parsed.status, Status::SUCCESS);
    assert_eq!(parsed.flags2, header.flags2);
    assert_eq!(parsed.tid, 3);
    assert_eq!(parsed.uid, 100);
    assert_eq!(parsed.mid, 42);
}

#[test]
fn rejects_wrong_magic() {
    let mut buf = Vec::new();
    sample_header().write(&mut buf).unwrap();
    buf[0] = 0xFE;
    assert!(matches!(Header::parse(&mut Cursor::new(buf)), Err(Error::BadMagic)));
}

#[test]
fn dos_mode_writes_class_and_code() {
    let mut header = sample_header();
    header.flags2 = Flags2::LONG_NAMES; // no NT_STATUS
    header.status = Status::OBJECT_NAME_NOT_FOUND;
    let mut buf = Vec::new();
    header.write(&mut buf).unwrap();
    // error class DOS(1), reserved, code 2 (file not found)
    assert_eq!(buf[5], 1);
    assert_eq!(u16::from_le_bytes([buf[7], buf[8]]), 2);
}

#[test]
fn reply_sets_response_flag() {
    let reply = sample_header().reply();
    assert!(reply.flags.contains(Flags1::RESPONSE));
    assert_eq!(reply.mid, 42);
}

#[test]
fn unknown_command_is_none() {
    let mut header = sample_header();
    header.command = 0xE7;
    assert!(header.known_command().is_none());
}
