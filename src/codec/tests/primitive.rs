#![cfg(test)]

use std::io::Cursor;

use crate::codec::primitive::{
    oem_string, put_oem_string, put_u16, put_u32, put_unicode_string, to_filetime, u16, u32,
    unicode_sized, unicode_string,
};
use crate::codec::Error;

#[test]
fn u16_little_endian() {
    let mut src = Cursor::new(vec![0x34, 0x12, 0xFF, 0xFF]);
    assert_eq!(u16(&mut src).unwrap(), 0x1234);
    assert_eq!(u16(&mut src).unwrap(), 0xFFFF);
}

#[test]
fn u32_round_trip() {
    let init = [0u32, 7, 0xC0DE_CAFE];
    let mut buf = Vec::new();
    for v in init {
        put_u32(&mut buf, v).unwrap();
    }
    let mut src = Cursor::new(buf);
    for v in init {
        assert_eq!(u32(&mut src).unwrap(), v);
    }
}

#[test]
fn short_read_is_io_error() {
    let mut src = Cursor::new(vec![0x01]);
    assert!(matches!(u16(&mut src), Err(Error::IO(_))));
}

#[test]
fn oem_string_round_trip() {
    let mut buf = Vec::new();
    put_oem_string(&mut buf, "PUBLIC").unwrap();
    assert_eq!(buf.last(), Some(&0));
    let parsed = oem_string(&mut Cursor::new(buf)).unwrap();
    assert_eq!(parsed, "PUBLIC");
}

#[test]
fn oem_string_substitutes_wide_characters() {
    let mut buf = Vec::new();
    put_oem_string(&mut buf, "a\u{2603}b").unwrap();
    assert_eq!(buf, vec![b'a', b'?', b'b', 0]);
}

#[test]
fn unicode_string_round_trip() {
    let mut buf = Vec::new();
    put_unicode_string(&mut buf, "hello.txt").unwrap();
    let parsed = unicode_string(&mut Cursor::new(buf)).unwrap();
    assert_eq!(parsed, "hello.txt");
}

#[test]
fn unicode_string_stops_at_terminator() {
    let mut buf = Vec::new();
    put_unicode_string(&mut buf, "ab").unwrap();
    put_u16(&mut buf, 0x0063).unwrap();
    let mut src = Cursor::new(buf);
    assert_eq!(unicode_string(&mut src).unwrap(), "ab");
    assert_eq!(u16(&mut src).unwrap(), 0x0063);
}

#[test]
fn unicode_sized_reads_exact_length() {
    let mut buf = Vec::new();
    put_unicode_string(&mut buf, "docs").unwrap();
    // sized read takes the characters only, leaving the terminator
    let parsed = unicode_sized(&mut Cursor::new(&buf[..]), 8).unwrap();
    assert_eq!(parsed, "docs");
}

#[test]
fn filetime_of_known_date() {
    // 2024-01-01T00:00:00Z
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_704_067_200);
    assert_eq!(to_filetime(t), 133_485_408_000_000_000);
}
