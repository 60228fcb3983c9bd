//! The `\PIPE\LANMAN` remote-administration endpoint carried over plain
//! Trans: just enough RAP to answer NetShareEnum level 1, which is what
//! clients browse the share list with. The visible set is the access-control
//! filter's output for the session.

use std::sync::Arc;

use crate::acl::AccessSubject;
use crate::codec::header::Header;
use crate::codec::packet::ReplyBuilder;
use crate::dispatch::Action;
use crate::session::{Connection, Tree, VirtualCircuit};
use crate::share::ShareKind;
use crate::status::Status;
use crate::Server;

use super::Assembly;

const NET_SHARE_ENUM: u16 = 0;

const RAP_SUCCESS: u16 = 0;
const RAP_UNSUPPORTED: u16 = 50;

/// Handles a Trans request addressed to `\PIPE\LANMAN`.
pub async fn dispatch(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    if !tree.share.is_ipc() {
        return Err(Status::INVALID_DEVICE_REQUEST);
    }
    let params = &assembly.params;
    if params.len() < 2 {
        return Err(Status::INVALID_PARAMETER);
    }
    let function = u16::from_le_bytes([params[0], params[1]]);
    match function {
        NET_SHARE_ENUM => share_enum(server, connection, vc, header, reply),
        _ => {
            let out = [RAP_UNSUPPORTED.to_le_bytes(), 0u16.to_le_bytes()].concat();
            super::respond_trans2(connection, reply, header, &[], &out, &[])
        }
    }
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

fn share_enum(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    header: &Header,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let subject = subject_for(server, connection, vc);
    let visible = server.access.filter(&subject, server.shares.all());

    // share_info_1: name[13], pad, type, remark pointer
    const ENTRY_LEN: usize = 20;
    let mut entries = Vec::with_capacity(visible.len() * ENTRY_LEN);
    let mut remarks = Vec::new();
    let remark_base = visible.len() * ENTRY_LEN;
    for share in &visible {
        let mut name = [0u8; 13];
        let bytes = share.name.as_bytes();
        name[..bytes.len().min(12)].copy_from_slice(&bytes[..bytes.len().min(12)]);
        entries.extend_from_slice(&name);
        entries.push(0);
        let kind = match share.kind {
            ShareKind::Disk => 0u16,
            ShareKind::Printer => 1,
            ShareKind::Ipc => 3,
        };
        entries.extend_from_slice(&kind.to_le_bytes());
        entries.extend_from_slice(&((remark_base + remarks.len()) as u32).to_le_bytes());
        remarks.extend_from_slice(share.comment.as_bytes());
        remarks.push(0);
    }
    entries.extend_from_slice(&remarks);

    let mut params = Vec::with_capacity(8);
    params.extend_from_slice(&RAP_SUCCESS.to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes()); // converter
    params.extend_from_slice(&(visible.len() as u16).to_le_bytes());
    params.extend_from_slice(&(visible.len() as u16).to_le_bytes());
    super::respond_trans2(connection, reply, header, &[], &params, &entries)
}
