#![cfg(test)]

use crate::codec::header::{Command, Flags1, Flags2, Header, NO_ANDX_COMMAND};
use crate::codec::packet::{parse, Body, ReplyBuilder};
use crate::codec::{primitive, Error};
use crate::status::Status;

fn request_header(command: Command) -> Header {
    Header {
        command: command as u8,
        status: Status::SUCCESS,
        flags: Flags1::CASELESS,
        flags2: Flags2::NT_STATUS | Flags2::UNICODE,
        pid_high: 0,
        signature: [0; 8],
        tid: 1,
        pid: 2,
        uid: 3,
        mid: 4,
    }
}

fn echo_frame(repeat: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    request_header(Command::Echo).write(&mut frame).unwrap();
    frame.push(1); // word count
    frame.extend_from_slice(&repeat.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[test]
fn parses_words_and_bytes() {
    let frame = echo_frame(2, b"ping");
    let (header, body) = parse(&frame).unwrap();
    assert_eq!(header.known_command(), Some(Command::Echo));
    assert_eq!(body.word_count(), 1);
    assert_eq!(body.byte_count(), 4);

    let mut words = body.words();
    assert_eq!(primitive::u16(&mut words).unwrap(), 2);
    let mut bytes = body.bytes();
    assert_eq!(bytes.take(4).unwrap(), b"ping");
}

#[test]
fn truncated_byte_area_is_rejected() {
    let mut frame = echo_frame(1, b"ping");
    frame.truncate(frame.len() - 2);
    assert!(matches!(parse(&frame), Err(Error::Truncated)));
}

#[test]
fn word_count_check() {
    let frame = echo_frame(1, b"");
    let (_, body) = parse(&frame).unwrap();
    assert!(matches!(
        body.require_words(4),
        Err(Error::WordCount { expected: 4, actual: 1 })
    ));
}

#[test]
fn andx_chain_walk() {
    // Hand-build a SessionSetup block chaining into a TreeConnect block.
    let mut frame = Vec::new();
    request_header(Command::SessionSetupAndX).write(&mut frame).unwrap();
    let second_at: usize = 32 + 1 + 2 * 4 + 2; // one 4-word block, empty byte area
    frame.push(4);
    frame.push(Command::TreeConnectAndX as u8);
    frame.push(0);
    frame.extend_from_slice(&(second_at as u16).to_le_bytes());
    frame.extend_from_slice(&[0u8; 4]); // remaining two words
    frame.extend_from_slice(&[0, 0]); // byte count
    frame.push(2); // second block: word count
    frame.push(NO_ANDX_COMMAND);
    frame.push(0);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&[0, 0]); // byte count

    let (_, body) = parse(&frame).unwrap();
    let (next, offset) = body.andx().unwrap().expect("chained command");
    assert_eq!(next, Command::TreeConnectAndX as u8);
    assert_eq!(offset, second_at);

    let second = Body::at(&frame, offset).unwrap();
    assert_eq!(second.word_count(), 2);
    assert!(second.andx().unwrap().is_none());
}

#[test]
fn reply_builder_block_layout() {
    let mut buf = Vec::with_capacity(256);
    let mut reply = ReplyBuilder::new(&mut buf, request_header(Command::Echo).reply()).unwrap();
    reply.begin(1);
    reply.u16(1);
    reply.begin_bytes();
    reply.bytes(b"pong");
    reply.finish_block();
    let len = reply.finish().unwrap();

    let (header, body) = parse(&buf[..len]).unwrap();
    assert!(header.flags.contains(Flags1::RESPONSE));
    assert_eq!(body.word_count(), 1);
    assert_eq!(body.byte_count(), 4);
    let mut bytes = body.bytes();
    assert_eq!(bytes.take(4).unwrap(), b"pong");
}

#[test]
fn reply_builder_chains_blocks() {
    let mut buf = Vec::with_capacity(256);
    let mut reply =
        ReplyBuilder::new(&mut buf, request_header(Command::SessionSetupAndX).reply()).unwrap();
    reply.begin(3);
    reply.andx_slot();
    reply.u16(0);
    reply.begin_bytes();
    reply.finish_block();

    reply.patch_chain(Command::TreeConnectAndX as u8);
    reply.begin(3);
    reply.andx_slot();
    reply.u16(0);
    reply.begin_bytes();
    reply.string("IPC", false);
    reply.finish_block();
    let len = reply.finish().unwrap();

    let (_, first) = parse(&buf[..len]).unwrap();
    let (next, offset) = first.andx().unwrap().expect("patched chain");
    assert_eq!(next, Command::TreeConnectAndX as u8);
    let second = Body::at(&buf[..len], offset).unwrap();
    assert_eq!(second.word_count(), 3);
    assert!(second.andx().unwrap().is_none());
    assert_eq!(second.byte_count(), 4);
}

#[test]
fn error_reply_shape() {
    let mut buf = Vec::with_capacity(64);
    let len = ReplyBuilder::error(&mut buf, &request_header(Command::Close), Status::INVALID_HANDLE);
    let (header, body) = parse(&buf[..len]).unwrap();
    assert_eq!(header.status, Status::INVALID_HANDLE);
    assert_eq!(body.word_count(), 0);
    assert_eq!(body.byte_count(), 0);
}

#[test]
fn unicode_strings_align_to_even_offsets() {
    let mut buf = Vec::with_capacity(128);
    let mut reply = ReplyBuilder::new(&mut buf, request_header(Command::Echo).reply()).unwrap();
    reply.begin(0);
    reply.begin_bytes();
    // the byte area starts at frame offset 35, which is odd
    reply.string("x", true);
    reply.finish_block();
    let len = reply.finish().unwrap();

    let (_, body) = parse(&buf[..len]).unwrap();
    assert_eq!(body.byte_count(), 5); // pad + two code units
    let mut bytes = body.bytes();
    let s = bytes.read_string(true).unwrap();
    assert_eq!(s, "x");
}
