//! Directory change notifications.
//!
//! A change-notify request parks: the handler records a subscriber on the
//! watched directory's file-state entry, stashes the MID in the circuit's
//! pending map, and sends no reply. Mutating handlers call [`post`], which
//! fires an NT-Trans completion at every subscriber whose filter covers the
//! change. `NT_CANCEL` answers the parked MID with `STATUS_CANCELLED`
//! instead. Subscribers pin their directory entry with a cache citation so
//! the reaper leaves it alone.

use std::sync::Arc;

use tracing::debug;

use crate::codec::header::Header;
use crate::codec::packet::ReplyBuilder;
use crate::message_types::Outgoing;
use crate::share::Share;
use crate::state::{NotifySubscriber, StateKey};
use crate::status::Status;
use crate::Server;

/// Completion filter bits of NT-Trans NOTIFY_CHANGE.
pub mod completion_filter {
    pub const FILE_NAME: u32 = 0x0001;
    pub const DIR_NAME: u32 = 0x0002;
    pub const ATTRIBUTES: u32 = 0x0004;
    pub const SIZE: u32 = 0x0008;
    pub const LAST_WRITE: u32 = 0x0010;
    pub const LAST_ACCESS: u32 = 0x0020;
    pub const CREATION: u32 = 0x0040;
    pub const EA: u32 = 0x0080;
    pub const SECURITY: u32 = 0x0100;
}

/// `FILE_NOTIFY_INFORMATION` action codes.
pub mod action {
    pub const ADDED: u32 = 1;
    pub const REMOVED: u32 = 2;
    pub const MODIFIED: u32 = 3;
    pub const RENAMED_OLD: u32 = 4;
    pub const RENAMED_NEW: u32 = 5;
}

/// Splits a canonical path into its parent directory and leaf name.
pub fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('\\');
    match trimmed.rfind('\\') {
        Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
        None => ("", trimmed),
    }
}

/// Registers a watch on `directory`, pinning its state entry.
pub async fn subscribe(share: &Arc<Share>, directory: &str, subscriber: NotifySubscriber)
    -> StateKey {
    let key = StateKey::new(share.id, directory);
    let entry = share.cache.acquire(key.clone()).await;
    debug!(key = ?key, mid = subscriber.mid, "change notify armed");
    entry.locked(|inner| inner.subscribers.push(subscriber));
    key
}

/// Removes a watch and drops its pin. Quietly tolerates a watch that has
/// already fired.
pub async fn unsubscribe(server: &Server, connection: u64, uid: u16, mid: u16, key: &StateKey) {
    let Some(share) = server.share_by_id(key.share) else { return };
    let Some(entry) = share.cache.find(key) else { return };
    let removed = entry.locked(|inner| {
        let before = inner.subscribers.len();
        inner
            .subscribers
            .retain(|s| !(s.connection == connection && s.uid == uid && s.mid == mid));
        before - inner.subscribers.len()
    });
    for _ in 0..removed {
        share.cache.release(&entry).await;
    }
}

/// Builds the NT-Trans completion frame for one change.
pub fn build_completion(reply_header: &Header, change_action: u32, name: &str) -> Vec<u8> {
    let mut file_name = Vec::new();
    for unit in name.encode_utf16() {
        file_name.extend_from_slice(&unit.to_le_bytes());
    }
    let mut params = Vec::with_capacity(12 + file_name.len());
    params.extend_from_slice(&0u32.to_le_bytes()); // next entry offset
    params.extend_from_slice(&change_action.to_le_bytes());
    params.extend_from_slice(&(file_name.len() as u32).to_le_bytes());
    params.extend_from_slice(&file_name);

    let mut buf = Vec::with_capacity(128 + params.len());
    let mut reply = match ReplyBuilder::new(&mut buf, reply_header.clone()) {
        Ok(reply) => reply,
        Err(_) => unreachable!("completion header serialization"),
    };
    crate::trans::put_nt_block(&mut reply, &[], params.len(), 0, &params, 0, &[], 0);
    let _ = reply.finish();
    buf
}

/// Answers a parked watch with `STATUS_CANCELLED`.
pub fn build_cancelled(reply_header: &Header) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    let len = ReplyBuilder::error(&mut buf, reply_header, Status::CANCELLED);
    buf.truncate(len);
    buf
}

/// Cancels the parked watch behind `mid`: the watcher gets
/// `STATUS_CANCELLED`, the subscriber record and its pin go away, and
/// every other pending request is untouched. Returns whether a watch was
/// found.
pub async fn cancel(
    server: &Server,
    connection: u64,
    vc: &crate::session::VirtualCircuit,
    mid: u16,
) -> bool {
    let Some((_, crate::session::PendingAsync::Notify { key })) = vc.pending.remove(&mid) else {
        return false;
    };
    let Some(share) = server.share_by_id(key.share) else { return false };
    let Some(entry) = share.cache.find(&key) else { return false };
    let cancelled = entry.locked(|inner| {
        let at = inner
            .subscribers
            .iter()
            .position(|s| s.connection == connection && s.uid == vc.uid && s.mid == mid);
        at.map(|at| inner.subscribers.swap_remove(at))
    });
    match cancelled {
        Some(sub) => {
            let _ = sub.sender.send(Outgoing::Owned(build_cancelled(&sub.reply_header)));
            share.cache.release(&entry).await;
            true
        }
        None => false,
    }
}

/// Fires every matching watch: the parent directory's watches always, and
/// recursive watches on any ancestor. The change is described by one
/// filter bit and one action code.
pub async fn post(server: &Server, share: &Arc<Share>, path: &str, filter_bit: u32, act: u32) {
    if !share.notify_enabled {
        return;
    }
    let (parent, leaf) = split_parent(path);
    fire(server, share, parent, leaf, filter_bit, act, false).await;

    let mut ancestor = parent;
    while !ancestor.is_empty() {
        let (up, _) = split_parent(ancestor);
        fire(server, share, up, leaf, filter_bit, act, true).await;
        ancestor = up;
    }
}

async fn fire(
    server: &Server,
    share: &Arc<Share>,
    directory: &str,
    leaf: &str,
    filter_bit: u32,
    act: u32,
    recursive_only: bool,
) {
    let key = StateKey::new(share.id, directory);
    let Some(entry) = share.cache.find(&key) else { return };

    let fired: Vec<NotifySubscriber> = entry.locked(|inner| {
        let mut fired = Vec::new();
        let mut keep = Vec::new();
        for sub in inner.subscribers.drain(..) {
            if sub.filter & filter_bit != 0 && (!recursive_only || sub.recursive) {
                fired.push(sub);
            } else {
                keep.push(sub);
            }
        }
        inner.subscribers = keep;
        fired
    });

    for sub in fired {
        debug!(key = ?key, mid = sub.mid, act, "change notify fired");
        let frame = build_completion(&sub.reply_header, act, leaf);
        let _ = sub.sender.send(Outgoing::Owned(frame));
        if sub.auto_resubmit {
            // The watch re-arms itself under the same MID; the parked
            // request stays in the circuit's pending map.
            entry.locked(|inner| inner.subscribers.push(sub));
            continue;
        }
        if let Some(connection) = server.connection(sub.connection) {
            if let Some(vc) = connection.vc(sub.uid) {
                vc.pending.remove(&sub.mid);
            }
        }
        share.cache.release(&entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_split() {
        assert_eq!(split_parent("\\docs\\a.txt"), ("docs", "a.txt"));
        assert_eq!(split_parent("top.txt"), ("", "top.txt"));
        assert_eq!(split_parent("\\a\\b\\c"), ("a\\b", "c"));
    }
}
