//! NT-Trans functions: change-notify arming and the long-form create.

use std::sync::Arc;

use crate::codec::header::Header;
use crate::codec::packet::ReplyBuilder;
use crate::codec::primitive::to_filetime;
use crate::dispatch::Action;
use crate::session::{Connection, PendingAsync, Tree, VirtualCircuit};
use crate::state::NotifySubscriber;
use crate::status::Status;
use crate::Server;

use super::Assembly;

/// NT-Trans function codes.
pub mod function {
    pub const CREATE: u16 = 1;
    pub const IOCTL: u16 = 2;
    pub const SET_SECURITY_DESC: u16 = 3;
    pub const NOTIFY_CHANGE: u16 = 4;
    pub const RENAME: u16 = 5;
    pub const QUERY_SECURITY_DESC: u16 = 6;
}

/// Routes a fully reassembled NT-Trans request.
pub async fn dispatch(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    match assembly.function {
        function::NOTIFY_CHANGE => notify_change(connection, vc, tree, header, assembly).await,
        function::CREATE => nt_create(server, connection, vc, tree, header, assembly, reply).await,
        _ => Err(Status::NOT_SUPPORTED),
    }
}

/// Parks a change-notify watch. No reply leaves the server until a change
/// fires or the request is cancelled.
async fn notify_change(
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
) -> Result<Action, Status> {
    if assembly.setup.len() < 4 {
        return Err(Status::INVALID_PARAMETER);
    }
    let filter =
        u32::from(assembly.setup[0]) | (u32::from(assembly.setup[1]) << 16);
    let fid = assembly.setup[2];
    let watch_tree = assembly.setup[3] & 0x00FF != 0;

    if !tree.share.notify_enabled {
        return Err(Status::NOT_SUPPORTED);
    }
    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
    if !open.directory {
        return Err(Status::INVALID_PARAMETER);
    }

    let subscriber = NotifySubscriber {
        connection: connection.id,
        uid: vc.uid,
        mid: header.mid,
        filter,
        recursive: watch_tree,
        auto_resubmit: false,
        reply_header: header.reply(),
        sender: connection.sender.clone(),
    };
    let key = crate::notify::subscribe(&tree.share, &open.path, subscriber).await;
    vc.pending.insert(header.mid, PendingAsync::Notify { key });
    Ok(Action::NoReply)
}

#[allow(clippy::too_many_arguments)]
async fn nt_create(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    use crate::handlers::create::{create_file, CreateArgs};

    let params = &assembly.params;
    if params.len() < 53 {
        return Err(Status::INVALID_PARAMETER);
    }
    let flags = u32::from_le_bytes(params[0..4].try_into().unwrap_or_default());
    let access = u32::from_le_bytes(params[8..12].try_into().unwrap_or_default());
    let allocation = u64::from_le_bytes(params[12..20].try_into().unwrap_or_default());
    let attributes = u32::from_le_bytes(params[20..24].try_into().unwrap_or_default());
    let sharing = u32::from_le_bytes(params[24..28].try_into().unwrap_or_default());
    let disposition = u32::from_le_bytes(params[28..32].try_into().unwrap_or_default());
    let options = u32::from_le_bytes(params[32..36].try_into().unwrap_or_default());
    let name_length = u32::from_le_bytes(params[44..48].try_into().unwrap_or_default()) as usize;
    if 53 + name_length > params.len() {
        return Err(Status::INVALID_PARAMETER);
    }
    let raw_name = &params[53..53 + name_length];
    let path = if header.unicode() {
        crate::codec::primitive::unicode_sized(&mut &raw_name[..], raw_name.len())
            .map_err(|_| Status::OBJECT_NAME_INVALID)?
    } else {
        String::from_utf8(raw_name.to_vec()).map_err(|_| Status::OBJECT_NAME_INVALID)?
    };

    let args = CreateArgs::from_wire(
        path, flags, access, allocation, attributes, sharing, disposition, options,
    )?;
    let outcome = create_file(server, connection, vc, tree, args).await?;

    let mut out = Vec::with_capacity(70);
    out.push(outcome.oplock as u8);
    out.push(0); // reserved
    out.extend_from_slice(&outcome.fid.to_le_bytes());
    out.extend_from_slice(&(outcome.action as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // ea error offset
    for time in [
        outcome.info.created,
        outcome.info.accessed,
        outcome.info.written,
        outcome.info.changed,
    ] {
        out.extend_from_slice(&to_filetime(time).to_le_bytes());
    }
    out.extend_from_slice(&outcome.info.attributes.bits().to_le_bytes());
    out.extend_from_slice(&outcome.info.allocation.to_le_bytes());
    out.extend_from_slice(&outcome.info.size.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // resource type: disk
    out.extend_from_slice(&0u16.to_le_bytes()); // pipe status
    out.push(outcome.directory as u8);
    super::respond_nt(connection, reply, header, &[], &out, &[])
}
