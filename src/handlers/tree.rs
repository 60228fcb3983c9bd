//! SMB_COM_TREE_CONNECT_ANDX and SMB_COM_TREE_DISCONNECT.

use std::sync::Arc;

use tracing::{debug, info};

use crate::acl::{AccessSubject, Decision};
use crate::codec::header::Header;
use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive;
use crate::dispatch::Action;
use crate::session::{self, Connection, Tree, VirtualCircuit};
use crate::status::Status;
use crate::Server;

mod connect_flags {
    pub const EXTENDED_RESPONSE: u16 = 0x0008;
}

/// Pulls the share name out of a `\\SERVER\SHARE` UNC path.
fn share_name(path: &str) -> &str {
    path.trim_end_matches('\\').rsplit('\\').next().unwrap_or(path)
}

fn subject_for(server: &Server, connection: &Connection, vc: &VirtualCircuit) -> AccessSubject {
    let identity = vc.identity().unwrap_or_else(crate::auth::Identity::guest);
    AccessSubject {
        user: identity.account,
        domain: if identity.domain.is_empty() {
            server.config.domain.clone()
        } else {
            identity.domain
        },
        protocol: crate::acl::Protocol::Smb,
        address: connection.peer.ip(),
        unix_uid: identity.unix_uid,
        unix_gids: identity.unix_gids,
    }
}

/// Granted-access mask reported in the extended tree-connect response.
fn access_mask_of(level: Decision) -> u32 {
    match level {
        Decision::ReadWrite => 0x001F_01FF, // file all access
        Decision::Read => 0x0012_00A9,      // read + execute
        _ => 0,
    }
}

/// SMB_COM_TREE_CONNECT_ANDX.
pub async fn connect(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(4).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?;
    let flags = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let password_len = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)? as usize;

    let mut bytes = body.bytes();
    bytes.take(password_len).map_err(|_| Status::INVALID_SMB)?;
    let path = bytes.read_string(header.unicode()).map_err(|_| Status::INVALID_SMB)?;
    // The service field is always OEM, whatever Flags2 says.
    let requested_service = primitive::oem_string(&mut bytes).unwrap_or_default();

    let name = share_name(&path);
    let share = server.shares.find(name).ok_or(Status::BAD_NETWORK_NAME)?;
    if requested_service != "?????" && requested_service != share.kind.service() {
        return Err(Status::BAD_DEVICE_TYPE);
    }

    let verdict = server.access.check(&subject_for(server, connection, vc), &share);
    if verdict.level <= Decision::NoAccess {
        debug!(share = %share.name, "tree connect refused");
        return Err(Status::ACCESS_DENIED);
    }

    let tid = connection.allocate_tid();
    let tree = Arc::new(Tree::new(tid, vc.uid, Arc::clone(&share), verdict.level, verdict.admin));
    vc.insert_tree(Arc::clone(&tree));
    info!(
        connection = connection.id,
        uid = vc.uid,
        tid,
        share = %share.name,
        access = ?verdict.level,
        "tree connected"
    );

    reply.set_tid(tid);
    if flags & connect_flags::EXTENDED_RESPONSE != 0 {
        reply.begin(7);
        reply.andx_slot();
        reply.u16(0); // optional support
        reply.u32(access_mask_of(verdict.level));
        reply.u32(access_mask_of(Decision::Read));
    } else {
        reply.begin(3);
        reply.andx_slot();
        reply.u16(0);
    }
    reply.begin_bytes();
    // service is OEM in the reply as well
    for b in share.kind.service().bytes() {
        reply.u8(b);
    }
    reply.u8(0);
    reply.string("NTFS", header.unicode());
    reply.finish_block();
    Ok(Action::Done)
}

/// SMB_COM_TREE_DISCONNECT. Disconnecting an already-gone TID fails with
/// `SMB_BAD_TID` and has no side effects.
pub async fn disconnect(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    header: &Header,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let tree = vc.remove_tree(header.tid).ok_or(Status::SMB_BAD_TID)?;
    session::disconnect_tree(server, connection, &tree).await;
    debug!(connection = connection.id, tid = tree.tid, "tree disconnected");

    reply.begin(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
