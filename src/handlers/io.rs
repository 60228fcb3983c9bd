//! ReadAndX, WriteAndX, and Flush.

use std::sync::Arc;

use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive;
use crate::dispatch::Action;
use crate::locks::LockOwner;
use crate::notify::{action, completion_filter};
use crate::session::Connection;
use crate::status::Status;
use crate::Server;

mod write_mode {
    pub const WRITE_THROUGH: u16 = 0x0001;
}

/// SMB_COM_READ_ANDX.
pub async fn read(
    connection: &Arc<Connection>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let word_count = body.word_count();
    let mut words = body.require_words(10).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?;
    let fid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let offset_low = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let max_count = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // min count
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // timeout / high count
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // remaining
    let offset = if word_count >= 12 {
        let high = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
        (u64::from(high) << 32) | u64::from(offset_low)
    } else {
        u64::from(offset_low)
    };

    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
    if !open.access.wants_read() {
        return Err(Status::ACCESS_DENIED);
    }
    let owner = LockOwner { connection: connection.id, uid: open.uid, fid, pid: header.pid };
    let blocked = open
        .state
        .locked(|inner| inner.locks.blocks_io(owner, offset, u64::from(max_count), false));
    if blocked {
        return Err(Status::FILE_LOCK_CONFLICT);
    }

    let data = open
        .share
        .disk
        .read(open.handle, offset, max_count as usize)
        .await
        .map_err(|e| e.status())?;
    open.position.store(offset + data.len() as u64, std::sync::atomic::Ordering::Release);

    reply.begin(12);
    reply.andx_slot();
    reply.u16(0xFFFF); // available (not a pipe)
    reply.u16(0); // data compaction mode
    reply.u16(0);
    reply.u16(data.len() as u16);
    // data offset patched after the byte area is laid out
    let base = reply.len();
    reply.u16(0);
    reply.u16(0); // data length high
    for _ in 0..4 {
        reply.u16(0);
    }
    reply.begin_bytes();
    reply.align2();
    let data_offset = reply.len() as u16;
    reply.bytes(&data);
    reply.finish_block();
    reply.patch_u16(base, data_offset);
    Ok(Action::Done)
}

/// SMB_COM_WRITE_ANDX.
pub async fn write(
    server: &Server,
    connection: &Arc<Connection>,
    header: &crate::codec::header::Header,
    frame: &[u8],
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let word_count = body.word_count();
    let mut words = body.require_words(12).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?;
    let fid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let offset_low = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // timeout
    let mode = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // remaining
    let length_high = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let length = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let data_offset = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)? as usize;
    let offset = if word_count >= 14 {
        let high = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
        (u64::from(high) << 32) | u64::from(offset_low)
    } else {
        u64::from(offset_low)
    };
    let length = (usize::from(length_high) << 16) | usize::from(length);
    if data_offset + length > frame.len() {
        return Err(Status::INVALID_SMB);
    }
    let data = &frame[data_offset..data_offset + length];

    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
    if !open.access.wants_write() {
        return Err(Status::ACCESS_DENIED);
    }
    let owner = LockOwner { connection: connection.id, uid: open.uid, fid, pid: header.pid };
    let blocked = open
        .state
        .locked(|inner| inner.locks.blocks_io(owner, offset, data.len() as u64, true));
    if blocked {
        return Err(Status::FILE_LOCK_CONFLICT);
    }

    let write_through = open.write_through || mode & write_mode::WRITE_THROUGH != 0;
    let written = open
        .share
        .disk
        .write(open.handle, offset, data, write_through)
        .await
        .map_err(|e| e.status())?;
    open.position.store(offset + written as u64, std::sync::atomic::Ordering::Release);
    crate::notify::post(
        server,
        &open.share,
        &open.path,
        completion_filter::LAST_WRITE | completion_filter::SIZE,
        action::MODIFIED,
    )
    .await;

    reply.begin(6);
    reply.andx_slot();
    reply.u16(written as u16);
    reply.u16(0xFFFF); // available
    reply.u32((written >> 16) as u32 & 0xFFFF); // count high + reserved
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}

/// SMB_COM_SEEK: moves the legacy implied file position.
pub async fn seek(
    connection: &Arc<Connection>,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(4).map_err(|_| Status::INVALID_SMB)?;
    let fid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let mode = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let offset = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)? as i32;

    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
    let base = match mode {
        0 => 0,
        1 => open.position.load(std::sync::atomic::Ordering::Acquire),
        2 => {
            let info =
                open.share.disk.query_handle(open.handle).await.map_err(|e| e.status())?;
            info.size
        }
        _ => return Err(Status::INVALID_PARAMETER),
    };
    let position = base.saturating_add_signed(i64::from(offset));
    open.position.store(position, std::sync::atomic::Ordering::Release);

    reply.begin(2);
    reply.u32(position as u32);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}

/// SMB_COM_FLUSH: one FID, or every open file of the circuit with 0xFFFF.
pub async fn flush(
    connection: &Arc<Connection>,
    vc: &Arc<crate::session::VirtualCircuit>,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(1).map_err(|_| Status::INVALID_SMB)?;
    let fid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;

    if fid == 0xFFFF {
        let opens = connection.opens_of_circuit(vc.uid);
        for open in opens {
            open.share.disk.flush(open.handle).await.map_err(|e| e.status())?;
        }
    } else {
        let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
        open.share.disk.flush(open.handle).await.map_err(|e| e.status())?;
    }

    reply.begin(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
