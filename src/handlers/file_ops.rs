//! Path-level file operations: rename, delete, directory management, and
//! the legacy query/set information commands.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive;
use crate::disk::{FileAttributes, SetInfo};
use crate::dispatch::Action;
use crate::notify::{action, completion_filter};
use crate::session::Tree;
use crate::state::StateKey;
use crate::status::Status;
use crate::Server;

const BUFFER_FORMAT_ASCII: u8 = 0x04;

fn read_formatted_string(
    bytes: &mut crate::codec::packet::ByteArea<'_>,
    unicode: bool,
) -> Result<String, Status> {
    match primitive::u8(bytes) {
        Ok(BUFFER_FORMAT_ASCII) => {}
        _ => return Err(Status::INVALID_SMB),
    }
    bytes.read_string(unicode).map_err(|_| Status::INVALID_SMB)
}

fn empty_reply(reply: &mut ReplyBuilder<'_>) -> Result<Action, Status> {
    reply.begin(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}

fn require_writable(tree: &Tree) -> Result<(), Status> {
    if tree.writable() {
        Ok(())
    } else {
        Err(Status::ACCESS_DENIED)
    }
}

/// Renames `from` to `to` under the state cache's two-key lock discipline:
/// entries lock in ascending key order, and a path with live openers
/// refuses to move.
pub async fn rename_paths(
    server: &Server,
    tree: &Arc<Tree>,
    from: &str,
    to: &str,
    replace: bool,
) -> Result<(), Status> {
    require_writable(tree)?;
    let from_key = StateKey::new(tree.share.id, from);
    let to_key = StateKey::new(tree.share.id, to);

    let from_entry = tree.share.cache.acquire(from_key.clone()).await;
    let to_entry = tree.share.cache.acquire(to_key.clone()).await;

    let busy = {
        let (first, second) = match from_key.lock_order(&to_key) {
            std::cmp::Ordering::Greater => (&to_entry, &from_entry),
            _ => (&from_entry, &to_entry),
        };
        first.locked(|a| {
            if from_key == to_key {
                return !a.openers.is_empty();
            }
            second.locked(|b| !a.openers.is_empty() || !b.openers.is_empty())
        })
    };
    let outcome = if busy {
        Err(Status::SHARING_VIOLATION)
    } else {
        tree.share.disk.rename(from, to, replace).await.map_err(|e| e.status())
    };
    tree.share.cache.release(&from_entry).await;
    tree.share.cache.release(&to_entry).await;
    outcome?;

    tree.share.cache.set_exists(&from_key, false);
    tree.share.cache.set_exists(&to_key, true);
    crate::notify::post(server, &tree.share, from, completion_filter::FILE_NAME, action::RENAMED_OLD)
        .await;
    crate::notify::post(server, &tree.share, to, completion_filter::FILE_NAME, action::RENAMED_NEW)
        .await;
    Ok(())
}

/// SMB_COM_RENAME.
pub async fn rename(
    server: &Server,
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    body.require_words(1).map_err(|_| Status::INVALID_SMB)?;
    let mut bytes = body.bytes();
    let from = read_formatted_string(&mut bytes, header.unicode())?;
    let to = read_formatted_string(&mut bytes, header.unicode())?;
    let from = crate::handlers::canonicalize(&from)?;
    let to = crate::handlers::canonicalize(&to)?;
    rename_paths(server, tree, &from, &to, false).await?;
    empty_reply(reply)
}

/// SMB_COM_DELETE. The name may carry wildcards; every match goes.
pub async fn delete(
    server: &Server,
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    body.require_words(1).map_err(|_| Status::INVALID_SMB)?;
    require_writable(tree)?;
    let mut bytes = body.bytes();
    let raw = read_formatted_string(&mut bytes, header.unicode())?;
    let (directory, pattern) = crate::handlers::canonicalize_search(&raw)?;

    let matches = tree
        .share
        .disk
        .enumerate(&directory, &pattern)
        .await
        .map_err(|e| e.status())?;
    let victims: Vec<_> = matches.into_iter().filter(|m| !m.is_directory()).collect();
    if victims.is_empty() {
        return Err(Status::OBJECT_NAME_NOT_FOUND);
    }

    for victim in victims {
        let path = if directory.is_empty() {
            victim.name.clone()
        } else {
            format!("{}\\{}", directory, victim.name)
        };
        let key = StateKey::new(tree.share.id, &path);
        let busy = tree
            .share
            .cache
            .find(&key)
            .map(|entry| entry.locked(|inner| !inner.openers.is_empty()))
            .unwrap_or(false);
        if busy {
            return Err(Status::SHARING_VIOLATION);
        }
        tree.share.disk.unlink(&path).await.map_err(|e| e.status())?;
        tree.share.cache.set_exists(&key, false);
        crate::notify::post(server, &tree.share, &path, completion_filter::FILE_NAME, action::REMOVED)
            .await;
    }
    empty_reply(reply)
}

/// SMB_COM_CREATE_DIRECTORY.
pub async fn create_directory(
    server: &Server,
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    require_writable(tree)?;
    let mut bytes = body.bytes();
    let raw = read_formatted_string(&mut bytes, header.unicode())?;
    let path = crate::handlers::canonicalize(&raw)?;
    tree.share.disk.make_directory(&path).await.map_err(|e| e.status())?;
    tree.share.cache.set_exists(&StateKey::new(tree.share.id, &path), true);
    crate::notify::post(server, &tree.share, &path, completion_filter::DIR_NAME, action::ADDED)
        .await;
    empty_reply(reply)
}

/// SMB_COM_DELETE_DIRECTORY.
pub async fn delete_directory(
    server: &Server,
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    require_writable(tree)?;
    let mut bytes = body.bytes();
    let raw = read_formatted_string(&mut bytes, header.unicode())?;
    let path = crate::handlers::canonicalize(&raw)?;
    tree.share.disk.remove_directory(&path).await.map_err(|e| e.status())?;
    tree.share.cache.set_exists(&StateKey::new(tree.share.id, &path), false);
    crate::notify::post(server, &tree.share, &path, completion_filter::DIR_NAME, action::REMOVED)
        .await;
    empty_reply(reply)
}

/// SMB_COM_CHECK_DIRECTORY.
pub async fn check_directory(
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut bytes = body.bytes();
    let raw = read_formatted_string(&mut bytes, header.unicode())?;
    let path = crate::handlers::canonicalize(&raw)?;
    let info = tree.share.disk.query_path(&path).await.map_err(|e| e.status())?;
    if !info.is_directory() {
        return Err(Status::NOT_A_DIRECTORY);
    }
    empty_reply(reply)
}

fn utime(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs() as u32
}

/// SMB_COM_QUERY_INFORMATION: the legacy attribute probe.
pub async fn query_information(
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut bytes = body.bytes();
    let raw = read_formatted_string(&mut bytes, header.unicode())?;
    let path = crate::handlers::canonicalize(&raw)?;
    let info = tree.share.disk.query_path(&path).await.map_err(|e| e.status())?;

    reply.begin(10);
    reply.u16(info.attributes.bits() as u16);
    reply.u32(utime(info.written));
    reply.u32(info.size as u32);
    for _ in 0..5 {
        reply.u16(0);
    }
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}

/// SMB_COM_SET_INFORMATION.
pub async fn set_information(
    server: &Server,
    tree: &Arc<Tree>,
    header: &crate::codec::header::Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(8).map_err(|_| Status::INVALID_SMB)?;
    let attributes = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let last_write = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    require_writable(tree)?;
    let mut bytes = body.bytes();
    let raw = read_formatted_string(&mut bytes, header.unicode())?;
    let path = crate::handlers::canonicalize(&raw)?;

    let out = tree
        .share
        .disk
        .open(
            &path,
            crate::disk::CreateDisposition::Open,
            crate::disk::CreateOptions::empty(),
            FileAttributes::empty(),
        )
        .await
        .map_err(|e| e.status())?;
    let written = (last_write != 0)
        .then(|| UNIX_EPOCH + Duration::from_secs(u64::from(last_write)));
    let applied = tree
        .share
        .disk
        .set_info(
            out.handle,
            SetInfo::Basic {
                attributes: Some(FileAttributes::from_bits_truncate(u32::from(attributes))),
                created: None,
                accessed: None,
                written,
            },
        )
        .await;
    let _ = tree.share.disk.close(out.handle).await;
    applied.map_err(|e| e.status())?;
    crate::notify::post(server, &tree.share, &path, completion_filter::ATTRIBUTES, action::MODIFIED)
        .await;
    empty_reply(reply)
}

/// SMB_COM_QUERY_INFORMATION_DISK: 16-bit geometry for ancient clients.
pub async fn query_information_disk(
    tree: &Arc<Tree>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let geometry = tree.share.disk.geometry();
    reply.begin(5);
    reply.u16(geometry.total_units.min(0xFFFF) as u16);
    reply.u16(geometry.sectors_per_unit.min(0xFFFF) as u16);
    reply.u16(geometry.bytes_per_sector.min(0xFFFF) as u16);
    reply.u16(geometry.free_units.min(0xFFFF) as u16);
    reply.u16(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
