//! LockingAndX: byte-range lock and unlock ranges, and the client's
//! acknowledgement of a server-initiated oplock break.

use std::sync::Arc;

use tracing::debug;

use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive;
use crate::dispatch::Action;
use crate::locks::{ByteRangeLock, LockOwner};
use crate::oplock::lock_type;
use crate::session::Connection;
use crate::state::OplockLevel;
use crate::status::Status;

struct Range {
    pid: u16,
    offset: u64,
    len: u64,
}

fn read_ranges(
    bytes: &mut crate::codec::packet::ByteArea<'_>,
    count: u16,
    large: bool,
) -> Result<Vec<Range>, Status> {
    let mut ranges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let range = if large {
            let pid = primitive::u16(bytes).map_err(|_| Status::INVALID_SMB)?;
            primitive::u16(bytes).map_err(|_| Status::INVALID_SMB)?;
            let offset_high = primitive::u32(bytes).map_err(|_| Status::INVALID_SMB)?;
            let offset_low = primitive::u32(bytes).map_err(|_| Status::INVALID_SMB)?;
            let len_high = primitive::u32(bytes).map_err(|_| Status::INVALID_SMB)?;
            let len_low = primitive::u32(bytes).map_err(|_| Status::INVALID_SMB)?;
            Range {
                pid,
                offset: (u64::from(offset_high) << 32) | u64::from(offset_low),
                len: (u64::from(len_high) << 32) | u64::from(len_low),
            }
        } else {
            let pid = primitive::u16(bytes).map_err(|_| Status::INVALID_SMB)?;
            let offset = primitive::u32(bytes).map_err(|_| Status::INVALID_SMB)?;
            let len = primitive::u32(bytes).map_err(|_| Status::INVALID_SMB)?;
            Range { pid, offset: u64::from(offset), len: u64::from(len) }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

/// SMB_COM_LOCKING_ANDX.
pub async fn handle(
    connection: &Arc<Connection>,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(8).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?;
    let fid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let type_of_lock = primitive::u8(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let new_oplock_level = primitive::u8(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // timeout
    let unlock_count = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let lock_count = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;

    if type_of_lock & lock_type::CANCEL_LOCK != 0
        || type_of_lock & lock_type::CHANGE_LOCKTYPE != 0
    {
        return Err(Status::NOT_SUPPORTED);
    }

    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;

    if type_of_lock & lock_type::OPLOCK_RELEASE != 0 {
        let level = if new_oplock_level & 0x01 != 0 {
            OplockLevel::LevelII
        } else {
            OplockLevel::None
        };
        let settled = crate::oplock::apply_break_ack(&open.state, connection.id, fid, level);
        open.set_oplock(settled);
        debug!(fid, ?settled, "oplock break acknowledged");
        if unlock_count == 0 && lock_count == 0 {
            // A pure break acknowledgement gets no response.
            return Ok(Action::NoReply);
        }
    }

    let large = type_of_lock & lock_type::LARGE_FILES != 0;
    let shared = type_of_lock & lock_type::SHARED_LOCK != 0;
    let mut bytes = body.bytes();
    let unlocks = read_ranges(&mut bytes, unlock_count, large)?;
    let locks = read_ranges(&mut bytes, lock_count, large)?;

    let status = open.state.locked(|inner| {
        for range in &unlocks {
            let owner = LockOwner {
                connection: connection.id,
                uid: open.uid,
                fid,
                pid: range.pid,
            };
            inner.locks.unlock(owner, range.offset, range.len)?;
        }
        let mut granted = 0;
        for range in &locks {
            let owner = LockOwner {
                connection: connection.id,
                uid: open.uid,
                fid,
                pid: range.pid,
            };
            let lock = ByteRangeLock {
                owner,
                offset: range.offset,
                len: range.len,
                exclusive: !shared,
            };
            if let Err(status) = inner.locks.try_lock(lock) {
                // A partial grant unrolls so the request is all-or-nothing.
                for undone in &locks[..granted] {
                    let owner = LockOwner {
                        connection: connection.id,
                        uid: open.uid,
                        fid,
                        pid: undone.pid,
                    };
                    let _ = inner.locks.unlock(owner, undone.offset, undone.len);
                }
                return Err(status);
            }
            granted += 1;
        }
        Ok(())
    });
    status?;

    reply.begin(2);
    reply.andx_slot();
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
