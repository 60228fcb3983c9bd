//! The transaction subsystem: Trans, Trans2, and NT-Trans carry a
//! sub-command plus a {setup[], parameters[], data[]} triple, any part of
//! which may arrive split across the primary frame and `*_SECONDARY`
//! frames. Frames are absorbed into an [`Assembly`] keyed by (UID, MID)
//! until the declared totals are reached, then the whole logical request is
//! dispatched to the sub-command handler. Responses follow the same triple
//! and are split when they exceed the client's declared buffer size.

pub mod nttrans;
pub mod rap;
pub mod trans2;

use std::io::Read;
use std::time::Instant;

use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::{primitive, Error, Result};
use crate::session::Connection;

/// Which transaction family a reassembly belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransKind {
    Trans,
    Trans2,
    NtTrans,
}

/// A transaction being reassembled, keyed by (UID, MID) on the connection.
pub struct Assembly {
    pub kind: TransKind,
    /// Transaction name (`\PIPE\LANMAN` and friends); empty for Trans2/NT.
    pub name: String,
    /// Sub-command: Trans2 setup word 0, or the NT-Trans function code.
    pub function: u16,
    pub setup: Vec<u16>,
    pub total_params: usize,
    pub total_data: usize,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
    /// Bytes actually received so far; a tail-first secondary grows the
    /// buffers past what has arrived, so completion tracks these counts.
    pub received_params: usize,
    pub received_data: usize,
    pub max_param_reply: usize,
    pub max_data_reply: usize,
    pub since: Instant,
}

impl Assembly {
    pub fn complete(&self) -> bool {
        self.received_params >= self.total_params && self.received_data >= self.total_data
    }
}

fn area(frame: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if offset + len > frame.len() {
        return Err(Error::Truncated);
    }
    Ok(&frame[offset..offset + len])
}

fn append_at(dest: &mut Vec<u8>, displacement: usize, piece: &[u8], total: usize) -> Result<()> {
    if displacement + piece.len() > total {
        return Err(Error::Truncated);
    }
    if dest.len() < displacement + piece.len() {
        dest.resize(displacement + piece.len(), 0);
    }
    dest[displacement..displacement + piece.len()].copy_from_slice(piece);
    Ok(())
}

/// Parses a Trans or Trans2 primary frame.
pub fn parse_primary(
    frame: &[u8],
    body: &Body<'_>,
    kind: TransKind,
    unicode: bool,
) -> Result<Assembly> {
    let mut words = body.require_words(14)?;
    let total_params = primitive::u16(&mut words)? as usize;
    let total_data = primitive::u16(&mut words)? as usize;
    let max_param_reply = primitive::u16(&mut words)? as usize;
    let max_data_reply = primitive::u16(&mut words)? as usize;
    primitive::u8(&mut words)?; // max setup count
    primitive::u8(&mut words)?;
    primitive::u16(&mut words)?; // flags
    primitive::u32(&mut words)?; // timeout
    primitive::u16(&mut words)?;
    let param_count = primitive::u16(&mut words)? as usize;
    let param_offset = primitive::u16(&mut words)? as usize;
    let data_count = primitive::u16(&mut words)? as usize;
    let data_offset = primitive::u16(&mut words)? as usize;
    let setup_count = primitive::u8(&mut words)? as usize;
    primitive::u8(&mut words)?;
    let mut setup = Vec::with_capacity(setup_count);
    for _ in 0..setup_count {
        setup.push(primitive::u16(&mut words)?);
    }

    let name = match kind {
        TransKind::Trans => body.bytes().read_string(unicode)?,
        _ => String::new(),
    };

    let mut assembly = Assembly {
        kind,
        name,
        function: setup.first().copied().unwrap_or(0),
        setup,
        total_params,
        total_data,
        params: Vec::with_capacity(total_params),
        data: Vec::with_capacity(total_data),
        received_params: param_count,
        received_data: data_count,
        max_param_reply,
        max_data_reply,
        since: Instant::now(),
    };
    append_at(&mut assembly.params, 0, area(frame, param_offset, param_count)?, total_params)?;
    append_at(&mut assembly.data, 0, area(frame, data_offset, data_count)?, total_data)?;
    Ok(assembly)
}

/// Parses an NT-Trans primary frame.
pub fn parse_nt_primary(frame: &[u8], body: &Body<'_>) -> Result<Assembly> {
    let mut words = body.require_words(19)?;
    primitive::u8(&mut words)?; // max setup count
    primitive::u16(&mut words)?;
    let total_params = primitive::u32(&mut words)? as usize;
    let total_data = primitive::u32(&mut words)? as usize;
    primitive::u32(&mut words)?; // max parameter reply
    let max_data_reply = primitive::u32(&mut words)? as usize;
    let param_count = primitive::u32(&mut words)? as usize;
    let param_offset = primitive::u32(&mut words)? as usize;
    let data_count = primitive::u32(&mut words)? as usize;
    let data_offset = primitive::u32(&mut words)? as usize;
    let setup_count = primitive::u8(&mut words)? as usize;
    let function = primitive::u16(&mut words)?;
    let mut setup = Vec::with_capacity(setup_count);
    for _ in 0..setup_count {
        setup.push(primitive::u16(&mut words)?);
    }

    let mut assembly = Assembly {
        kind: TransKind::NtTrans,
        name: String::new(),
        function,
        setup,
        total_params,
        total_data,
        params: Vec::with_capacity(total_params),
        data: Vec::with_capacity(total_data),
        received_params: param_count,
        received_data: data_count,
        max_param_reply: 0,
        max_data_reply,
        since: Instant::now(),
    };
    append_at(&mut assembly.params, 0, area(frame, param_offset, param_count)?, total_params)?;
    append_at(&mut assembly.data, 0, area(frame, data_offset, data_count)?, total_data)?;
    Ok(assembly)
}

/// Absorbs a Trans/Trans2 secondary frame into the reassembly.
pub fn absorb_secondary(frame: &[u8], body: &Body<'_>, assembly: &mut Assembly) -> Result<()> {
    let mut words = body.require_words(8)?;
    let total_params = primitive::u16(&mut words)? as usize;
    let total_data = primitive::u16(&mut words)? as usize;
    let param_count = primitive::u16(&mut words)? as usize;
    let param_offset = primitive::u16(&mut words)? as usize;
    let param_disp = primitive::u16(&mut words)? as usize;
    let data_count = primitive::u16(&mut words)? as usize;
    let data_offset = primitive::u16(&mut words)? as usize;
    let data_disp = primitive::u16(&mut words)? as usize;
    // totals may be revised downward by a secondary
    assembly.total_params = assembly.total_params.min(total_params.max(assembly.received_params));
    assembly.total_data = assembly.total_data.min(total_data.max(assembly.received_data));
    append_at(
        &mut assembly.params,
        param_disp,
        area(frame, param_offset, param_count)?,
        assembly.total_params,
    )?;
    append_at(
        &mut assembly.data,
        data_disp,
        area(frame, data_offset, data_count)?,
        assembly.total_data,
    )?;
    assembly.received_params += param_count;
    assembly.received_data += data_count;
    Ok(())
}

/// Absorbs an NT-Trans secondary frame.
pub fn absorb_nt_secondary(frame: &[u8], body: &Body<'_>, assembly: &mut Assembly) -> Result<()> {
    let mut words = body.require_words(18)?;
    primitive::skip(&mut words, 3)?;
    let total_params = primitive::u32(&mut words)? as usize;
    let total_data = primitive::u32(&mut words)? as usize;
    let param_count = primitive::u32(&mut words)? as usize;
    let param_offset = primitive::u32(&mut words)? as usize;
    let param_disp = primitive::u32(&mut words)? as usize;
    let data_count = primitive::u32(&mut words)? as usize;
    let data_offset = primitive::u32(&mut words)? as usize;
    let data_disp = primitive::u32(&mut words)? as usize;
    assembly.total_params = assembly.total_params.min(total_params.max(assembly.received_params));
    assembly.total_data = assembly.total_data.min(total_data.max(assembly.received_data));
    append_at(
        &mut assembly.params,
        param_disp,
        area(frame, param_offset, param_count)?,
        assembly.total_params,
    )?;
    append_at(
        &mut assembly.data,
        data_disp,
        area(frame, data_offset, data_count)?,
        assembly.total_data,
    )?;
    assembly.received_params += param_count;
    assembly.received_data += data_count;
    Ok(())
}

/// Writes one Trans/Trans2 response block carrying the given slice of the
/// full parameter and data areas.
#[allow(clippy::too_many_arguments)]
pub fn put_trans2_block(
    reply: &mut ReplyBuilder<'_>,
    setup: &[u16],
    total_params: usize,
    total_data: usize,
    params: &[u8],
    param_disp: usize,
    data: &[u8],
    data_disp: usize,
) {
    let words = 10 + setup.len() as u8;
    let byte_area = 32 + 1 + 2 * words as usize + 2;
    let pad1 = (4 - byte_area % 4) % 4;
    let param_offset = byte_area + pad1;
    let pad2 = (4 - (param_offset + params.len()) % 4) % 4;
    let data_offset = param_offset + params.len() + pad2;

    reply.begin(words);
    reply.u16(total_params as u16);
    reply.u16(total_data as u16);
    reply.u16(0);
    reply.u16(params.len() as u16);
    reply.u16(if params.is_empty() { 0 } else { param_offset as u16 });
    reply.u16(param_disp as u16);
    reply.u16(data.len() as u16);
    reply.u16(if data.is_empty() { 0 } else { data_offset as u16 });
    reply.u16(data_disp as u16);
    reply.u8(setup.len() as u8);
    reply.u8(0);
    for word in setup {
        reply.u16(*word);
    }
    reply.begin_bytes();
    reply.bytes(&vec![0u8; pad1]);
    reply.bytes(params);
    reply.bytes(&vec![0u8; pad2]);
    reply.bytes(data);
    reply.finish_block();
}

/// Writes one NT-Trans response block.
#[allow(clippy::too_many_arguments)]
pub fn put_nt_block(
    reply: &mut ReplyBuilder<'_>,
    setup: &[u16],
    total_params: usize,
    total_data: usize,
    params: &[u8],
    param_disp: usize,
    data: &[u8],
    data_disp: usize,
) {
    let words = 18 + setup.len() as u8;
    let byte_area = 32 + 1 + 2 * words as usize + 2;
    let pad1 = (4 - byte_area % 4) % 4;
    let param_offset = byte_area + pad1;
    let pad2 = (4 - (param_offset + params.len()) % 4) % 4;
    let data_offset = param_offset + params.len() + pad2;

    reply.begin(words);
    reply.u8(0);
    reply.u16(0); // reserved
    reply.u32(total_params as u32);
    reply.u32(total_data as u32);
    reply.u32(params.len() as u32);
    reply.u32(if params.is_empty() { 0 } else { param_offset as u32 });
    reply.u32(param_disp as u32);
    reply.u32(data.len() as u32);
    reply.u32(if data.is_empty() { 0 } else { data_offset as u32 });
    reply.u32(data_disp as u32);
    reply.u8(setup.len() as u8);
    for word in setup {
        reply.u16(*word);
    }
    reply.begin_bytes();
    reply.bytes(&vec![0u8; pad1]);
    reply.bytes(params);
    reply.bytes(&vec![0u8; pad2]);
    reply.bytes(data);
    reply.finish_block();
}

/// Conservative per-frame overhead: header, response words, padding.
const RESPONSE_OVERHEAD: usize = 128;

/// Writes a Trans2 response, splitting it across several frames when it
/// exceeds the client's declared buffer size. The split path pushes every
/// frame straight into the connection's write funnel and reports
/// [`Action::NoReply`] so the dispatcher drops the loaned reply buffer.
pub fn respond_trans2(
    connection: &Connection,
    reply: &mut ReplyBuilder<'_>,
    header: &crate::codec::header::Header,
    setup: &[u16],
    params: &[u8],
    data: &[u8],
) -> std::result::Result<crate::dispatch::Action, crate::status::Status> {
    let max_buffer =
        connection.max_buffer_size.load(std::sync::atomic::Ordering::Acquire) as usize;
    if params.len() + data.len() + RESPONSE_OVERHEAD <= max_buffer {
        put_trans2_block(reply, setup, params.len(), data.len(), params, 0, data, 0);
        return Ok(crate::dispatch::Action::Done);
    }

    let chunk = max_buffer.saturating_sub(RESPONSE_OVERHEAD + params.len()).max(1);
    let mut data_disp = 0;
    let mut first = true;
    while first || data_disp < data.len() {
        let piece = &data[data_disp..(data_disp + chunk).min(data.len())];
        let mut frame = Vec::with_capacity(RESPONSE_OVERHEAD + params.len() + piece.len());
        let mut block = ReplyBuilder::new(&mut frame, header.reply())
            .map_err(|_| crate::status::Status::INSUFFICIENT_RESOURCES)?;
        let param_piece = if first { params } else { &[] };
        put_trans2_block(
            &mut block,
            setup,
            params.len(),
            data.len(),
            param_piece,
            0,
            piece,
            data_disp,
        );
        let _ = block.finish();
        let _ = connection.sender.send(crate::message_types::Outgoing::Owned(frame));
        connection
            .stats
            .packets_out
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        data_disp += piece.len();
        first = false;
    }
    Ok(crate::dispatch::Action::NoReply)
}

/// NT-Trans counterpart of [`respond_trans2`].
pub fn respond_nt(
    connection: &Connection,
    reply: &mut ReplyBuilder<'_>,
    header: &crate::codec::header::Header,
    setup: &[u16],
    params: &[u8],
    data: &[u8],
) -> std::result::Result<crate::dispatch::Action, crate::status::Status> {
    let max_buffer =
        connection.max_buffer_size.load(std::sync::atomic::Ordering::Acquire) as usize;
    if params.len() + data.len() + RESPONSE_OVERHEAD <= max_buffer {
        put_nt_block(reply, setup, params.len(), data.len(), params, 0, data, 0);
        return Ok(crate::dispatch::Action::Done);
    }
    let chunk = max_buffer.saturating_sub(RESPONSE_OVERHEAD + params.len()).max(1);
    let mut data_disp = 0;
    let mut first = true;
    while first || data_disp < data.len() {
        let piece = &data[data_disp..(data_disp + chunk).min(data.len())];
        let mut frame = Vec::with_capacity(RESPONSE_OVERHEAD + params.len() + piece.len());
        let mut block = ReplyBuilder::new(&mut frame, header.reply())
            .map_err(|_| crate::status::Status::INSUFFICIENT_RESOURCES)?;
        let param_piece = if first { params } else { &[] };
        put_nt_block(&mut block, setup, params.len(), data.len(), param_piece, 0, piece, data_disp);
        let _ = block.finish();
        let _ = connection.sender.send(crate::message_types::Outgoing::Owned(frame));
        connection
            .stats
            .packets_out
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        data_disp += piece.len();
        first = false;
    }
    Ok(crate::dispatch::Action::NoReply)
}

/// Drops reassemblies older than `max_age`. Returns how many were dropped.
pub fn reap_stale(connection: &Connection, max_age: std::time::Duration) -> usize {
    let before = connection.transactions.len();
    connection.transactions.retain(|_, assembly| assembly.since.elapsed() < max_age);
    before - connection.transactions.len()
}

/// Reads a null-terminated parameter-area path for the path-based Trans2
/// sub-commands.
pub fn read_param_path(params: &[u8], at: usize, unicode: bool) -> Result<String> {
    let mut src = &params[at.min(params.len())..];
    if unicode {
        primitive::unicode_string(&mut src)
    } else {
        let mut bytes = Vec::new();
        loop {
            let mut b = [0u8; 1];
            if src.read(&mut b).map_err(Error::IO)? == 0 || b[0] == 0 {
                break;
            }
            bytes.push(b[0]);
        }
        String::from_utf8(bytes).map_err(Error::BadString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::header::{Command, Flags1, Flags2, Header};
    use crate::codec::packet;
    use crate::status::Status;

    fn trans2_header() -> Header {
        Header {
            command: Command::Transaction2 as u8,
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

    /// Builds a Trans2 primary frame with the given split of params/data.
    fn primary_frame(
        total_params: usize,
        total_data: usize,
        params: &[u8],
        data: &[u8],
        setup: &[u16],
    ) -> Vec<u8> {
        let mut frame = Vec::new();
        trans2_header().write(&mut frame).unwrap();
        let words = 14 + setup.len() as u8;
        frame.push(words);
        let fixed = frame.len();
        // placeholder words, patched below
        frame.extend_from_slice(&vec![0u8; 2 * words as usize]);
        frame.extend_from_slice(&[0, 0]); // byte count patched below
        let param_offset = frame.len();
        frame.extend_from_slice(params);
        let data_offset = frame.len();
        frame.extend_from_slice(data);
        let byte_count = (frame.len() - param_offset) as u16;

        let mut words_buf = Vec::new();
        for value in [total_params as u16, total_data as u16, 64, 4096] {
            words_buf.extend_from_slice(&value.to_le_bytes());
        }
        words_buf.push(0); // max setup count
        words_buf.push(0); // reserved
        words_buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        words_buf.extend_from_slice(&0u32.to_le_bytes()); // timeout
        words_buf.extend_from_slice(&0u16.to_le_bytes()); // reserved2
        words_buf.extend_from_slice(&(params.len() as u16).to_le_bytes());
        words_buf.extend_from_slice(&(param_offset as u16).to_le_bytes());
        words_buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
        words_buf.extend_from_slice(&(data_offset as u16).to_le_bytes());
        words_buf.push(setup.len() as u8);
        words_buf.push(0);
        for word in setup {
            words_buf.extend_from_slice(&word.to_le_bytes());
        }
        frame[fixed..fixed + words_buf.len()].copy_from_slice(&words_buf);
        let bc_at = fixed + 2 * words as usize;
        frame[bc_at..bc_at + 2].copy_from_slice(&byte_count.to_le_bytes());
        frame
    }

    fn secondary_frame(piece: &[u8], disp: usize, total_params: usize, total_data: usize) -> Vec<u8> {
        let mut frame = Vec::new();
        let mut header = trans2_header();
        header.command = Command::Transaction2Secondary as u8;
        header.write(&mut frame).unwrap();
        frame.push(8);
        let data_offset = 32 + 1 + 16 + 2;
        for value in [
            total_params as u16,
            total_data as u16,
            0,
            0,
            0,
            piece.len() as u16,
            data_offset as u16,
            disp as u16,
        ] {
            frame.extend_from_slice(&value.to_le_bytes());
        }
        frame.extend_from_slice(&(piece.len() as u16).to_le_bytes());
        frame.extend_from_slice(piece);
        frame
    }

    #[test]
    fn primary_with_all_data_is_complete() {
        let frame = primary_frame(4, 3, &[1, 2, 3, 4], &[9, 9, 9], &[0x0003]);
        let (_, body) = packet::parse(&frame).unwrap();
        let assembly = parse_primary(&frame, &body, TransKind::Trans2, true).unwrap();
        assert!(assembly.complete());
        assert_eq!(assembly.function, 0x0003);
        assert_eq!(assembly.params, vec![1, 2, 3, 4]);
        assert_eq!(assembly.data, vec![9, 9, 9]);
    }

    #[test]
    fn secondaries_fill_in_any_order() {
        let frame = primary_frame(0, 6, &[], &[], &[0x0001]);
        let (_, body) = packet::parse(&frame).unwrap();
        let mut assembly = parse_primary(&frame, &body, TransKind::Trans2, true).unwrap();
        assert!(!assembly.complete());

        let tail = secondary_frame(&[4, 5, 6], 3, 0, 6);
        let (_, body) = packet::parse(&tail).unwrap();
        absorb_secondary(&tail, &body, &mut assembly).unwrap();
        assert!(!assembly.complete());

        let head = secondary_frame(&[1, 2, 3], 0, 0, 6);
        let (_, body) = packet::parse(&head).unwrap();
        absorb_secondary(&head, &body, &mut assembly).unwrap();
        assert!(assembly.complete());
        assert_eq!(assembly.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn overflowing_secondary_is_rejected() {
        let frame = primary_frame(0, 4, &[], &[], &[0x0001]);
        let (_, body) = packet::parse(&frame).unwrap();
        let mut assembly = parse_primary(&frame, &body, TransKind::Trans2, true).unwrap();

        let bad = secondary_frame(&[1, 2, 3], 2, 0, 4);
        let (_, body) = packet::parse(&bad).unwrap();
        assert!(absorb_secondary(&bad, &body, &mut assembly).is_err());
    }

    #[test]
    fn response_block_round_trips() {
        let mut buf = Vec::with_capacity(512);
        let mut reply = ReplyBuilder::new(&mut buf, trans2_header().reply()).unwrap();
        let params = [0xAAu8; 6];
        let data = [0x55u8; 10];
        put_trans2_block(&mut reply, &[], 6, 10, &params, 0, &data, 0);
        let len = reply.finish().unwrap();

        let (_, body) = packet::parse(&buf[..len]).unwrap();
        let mut words = body.words();
        assert_eq!(primitive::u16(&mut words).unwrap(), 6); // total params
        assert_eq!(primitive::u16(&mut words).unwrap(), 10); // total data
        primitive::u16(&mut words).unwrap();
        assert_eq!(primitive::u16(&mut words).unwrap(), 6); // param count
        let param_offset = primitive::u16(&mut words).unwrap() as usize;
        primitive::u16(&mut words).unwrap();
        assert_eq!(primitive::u16(&mut words).unwrap(), 10); // data count
        let data_offset = primitive::u16(&mut words).unwrap() as usize;
        assert_eq!(param_offset % 4, 0);
        assert_eq!(&buf[param_offset..param_offset + 6], &params);
        assert_eq!(&buf[data_offset..data_offset + 10], &data);
    }
}
