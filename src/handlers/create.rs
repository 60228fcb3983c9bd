//! NTCreateAndX and its relatives: the open/create path, the legacy
//! OpenAndX view of it, and Close.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::codec::header::Header;
use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive::{self, to_filetime};
use crate::disk::{
    CreateAction, CreateDisposition, CreateOptions, DesiredAccess, FileAttributes, FileInfo,
    SharingMode,
};
use crate::dispatch::Action;
use crate::notify::{action as notify_action, completion_filter};
use crate::session::{self, Connection, OpenFile, Tree, VirtualCircuit};
use crate::state::{sharing_compatible, Opener, OplockLevel, OplockOwner, StateKey};
use crate::status::Status;
use crate::Server;

/// NTCreateAndX request flag bits.
mod create_flags {
    pub const REQUEST_OPLOCK: u32 = 0x0002;
    pub const REQUEST_BATCH_OPLOCK: u32 = 0x0004;
    pub const OPEN_DIRECTORY: u32 = 0x0008;
}

/// Everything the create path needs, independent of which wire form
/// carried it.
pub struct CreateArgs {
    pub path: String,
    pub access: DesiredAccess,
    pub allocation: u64,
    pub attributes: FileAttributes,
    pub sharing: SharingMode,
    pub disposition: CreateDisposition,
    pub options: CreateOptions,
    pub requested_oplock: bool,
}

impl CreateArgs {
    /// Builds the arguments from raw NTCreate wire fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_wire(
        path: String,
        flags: u32,
        access: u32,
        allocation: u64,
        attributes: u32,
        sharing: u32,
        disposition: u32,
        options: u32,
    ) -> Result<CreateArgs, Status> {
        let disposition = num_traits::FromPrimitive::from_u32(disposition)
            .ok_or(Status::INVALID_PARAMETER)?;
        let mut options = CreateOptions::from_bits_truncate(options);
        if flags & create_flags::OPEN_DIRECTORY != 0 {
            options |= CreateOptions::DIRECTORY_FILE;
        }
        Ok(CreateArgs {
            path,
            access: DesiredAccess::from_bits_truncate(access).normalized(),
            allocation,
            attributes: FileAttributes::from_bits_truncate(attributes),
            sharing: SharingMode::from_bits_truncate(sharing),
            disposition,
            options,
            requested_oplock: flags
                & (create_flags::REQUEST_OPLOCK | create_flags::REQUEST_BATCH_OPLOCK)
                != 0,
        })
    }
}

/// What the create path produced, ready for whichever reply format.
pub struct CreateReply {
    pub fid: u16,
    pub oplock: OplockLevel,
    pub action: CreateAction,
    pub info: FileInfo,
    pub directory: bool,
}

fn truncates(disposition: CreateDisposition) -> bool {
    matches!(
        disposition,
        CreateDisposition::Overwrite
            | CreateDisposition::OverwriteIf
            | CreateDisposition::Supersede
    )
}

fn may_create(disposition: CreateDisposition) -> bool {
    !matches!(disposition, CreateDisposition::Open | CreateDisposition::Overwrite)
}

/// The open/create procedure shared by NTCreateAndX, NT-Trans create, and
/// OpenAndX.
pub async fn create_file(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    args: CreateArgs,
) -> Result<CreateReply, Status> {
    let path = crate::handlers::canonicalize(&args.path)?;
    let write_intent = args.access.wants_write()
        || truncates(args.disposition)
        || args.options.contains(CreateOptions::DELETE_ON_CLOSE);
    if write_intent && !tree.writable() {
        return Err(Status::ACCESS_DENIED);
    }
    if args.options.contains(CreateOptions::DELETE_ON_CLOSE) && !args.access.wants_delete() {
        return Err(Status::INVALID_PARAMETER);
    }

    let key = StateKey::new(tree.share.id, &path);
    // Negative caching spares the backend a lookup for opens of paths known
    // to be absent.
    if !may_create(args.disposition) && tree.share.cache.cached_exists(&key) == Some(false) {
        return Err(Status::OBJECT_NAME_NOT_FOUND);
    }

    let entry = tree.share.cache.acquire(key).await;
    let patience = Duration::from_secs(server.config.oplock_break_timeout_secs);
    crate::oplock::break_for_open(&entry, write_intent, patience).await;

    // Reserve the opener slot before touching the disk so concurrent opens
    // serialize their sharing checks on the entry.
    let fid = connection.allocate_fid();
    let reservation = entry.locked(|inner| {
        if inner.delete_on_close {
            return Err(Status::DELETE_PENDING);
        }
        sharing_compatible(&inner.openers, args.access, args.sharing)?;
        let had_others = !inner.openers.is_empty();
        inner.openers.push(Opener {
            connection: connection.id,
            uid: vc.uid,
            fid,
            access: args.access,
            sharing: args.sharing,
        });
        Ok(had_others)
    });
    let had_others = match reservation {
        Ok(had_others) => had_others,
        Err(status) => {
            tree.share.cache.release(&entry).await;
            return Err(status);
        }
    };

    let outcome = tree
        .share
        .disk
        .open(&path, args.disposition, args.options, args.attributes)
        .await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if err == crate::disk::Error::NotFound {
                tree.share.cache.set_exists(&entry.key, false);
            }
            entry.locked(|inner| {
                inner
                    .openers
                    .retain(|o| !(o.connection == connection.id && o.fid == fid));
            });
            tree.share.cache.release(&entry).await;
            return Err(err.status());
        }
    };
    tree.share.cache.set_exists(&entry.key, true);

    if args.allocation > 0
        && !matches!(outcome.action, CreateAction::Opened)
        && !outcome.info.is_directory()
    {
        let _ = tree
            .share
            .disk
            .set_info(outcome.handle, crate::disk::SetInfo::AllocationSize(args.allocation))
            .await;
    }

    let directory = outcome.info.is_directory();
    let granted = entry.locked(|inner| {
        let level = if !args.requested_oplock || directory || inner.breaking.is_some() {
            OplockLevel::None
        } else if !had_others {
            OplockLevel::Batch
        } else if inner.oplock.is_none() {
            OplockLevel::LevelII
        } else {
            OplockLevel::None
        };
        crate::oplock::record_grant(
            inner,
            OplockOwner {
                connection: connection.id,
                uid: vc.uid,
                tid: tree.tid,
                fid,
                level,
                sender: connection.sender.clone(),
            },
        );
        level
    });

    let open = Arc::new(OpenFile::new(
        fid,
        vc.uid,
        tree.tid,
        path.clone(),
        args.access,
        args.sharing,
        directory,
        args.options.contains(CreateOptions::WRITE_THROUGH),
        outcome.handle,
        Arc::clone(&tree.share),
        Arc::clone(&entry),
    ));
    open.set_oplock(granted);
    if args.options.contains(CreateOptions::DELETE_ON_CLOSE) {
        open.delete_on_close.store(true, Ordering::Release);
    }
    connection.insert_open(Arc::clone(&open));
    tree.track_fid(fid);
    debug!(fid, path = %path, action = ?outcome.action, oplock = ?granted, "open");

    match outcome.action {
        CreateAction::Created | CreateAction::Superseded => {
            crate::notify::post(
                server,
                &tree.share,
                &path,
                completion_filter::FILE_NAME,
                notify_action::ADDED,
            )
            .await;
        }
        CreateAction::Overwritten => {
            crate::notify::post(
                server,
                &tree.share,
                &path,
                completion_filter::SIZE,
                notify_action::MODIFIED,
            )
            .await;
        }
        CreateAction::Opened => {}
    }

    Ok(CreateReply { fid, oplock: granted, action: outcome.action, info: outcome.info, directory })
}

/// SMB_COM_NT_CREATE_ANDX.
pub async fn nt_create(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(24).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?; // andx
    primitive::u8(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // name length
    let flags = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // root fid
    let access = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let allocation = primitive::u64(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let attributes = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let sharing = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let disposition = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let options = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;

    let path = body.bytes().read_string(header.unicode()).map_err(|_| Status::INVALID_SMB)?;
    let args = CreateArgs::from_wire(
        path, flags, access, allocation, attributes, sharing, disposition, options,
    )?;
    let out = create_file(server, connection, vc, tree, args).await?;

    reply.begin(34);
    reply.andx_slot();
    reply.u8(out.oplock as u8);
    reply.u16(out.fid);
    reply.u32(out.action as u32);
    for time in [out.info.created, out.info.accessed, out.info.written, out.info.changed] {
        reply.u64(to_filetime(time));
    }
    reply.u32(out.info.attributes.bits());
    reply.u64(out.info.allocation);
    reply.u64(out.info.size);
    reply.u16(0); // resource type: disk
    reply.u16(0); // named-pipe state
    reply.u8(out.directory as u8);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}

mod open_mode {
    pub const ACCESS_MASK: u16 = 0x0007;
    pub const SHARING_SHIFT: u16 = 4;
}

/// SMB_COM_OPEN_ANDX: the legacy open, expressed as a restricted view of
/// the NT create path.
pub async fn open_andx(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(15).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?;
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // flags
    let mode = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // search attributes
    let attributes = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // creation time
    let open_function = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let allocation = primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?;

    let access = match mode & open_mode::ACCESS_MASK {
        0 => DesiredAccess::READ_DATA | DesiredAccess::READ_ATTRIBUTES,
        1 => DesiredAccess::WRITE_DATA | DesiredAccess::READ_ATTRIBUTES,
        2 => {
            DesiredAccess::READ_DATA | DesiredAccess::WRITE_DATA | DesiredAccess::READ_ATTRIBUTES
        }
        _ => return Err(Status::INVALID_PARAMETER),
    };
    let sharing = match (mode >> open_mode::SHARING_SHIFT) & 0x7 {
        1 => SharingMode::empty(),
        2 => SharingMode::READ,
        3 => SharingMode::WRITE,
        _ => SharingMode::READ | SharingMode::WRITE,
    };
    let create = open_function & 0x0010 != 0;
    let disposition = match (open_function & 0x0003, create) {
        (1, true) => CreateDisposition::OpenIf,
        (1, false) => CreateDisposition::Open,
        (2, true) => CreateDisposition::OverwriteIf,
        (2, false) => CreateDisposition::Overwrite,
        (0, true) => CreateDisposition::Create,
        _ => return Err(Status::INVALID_PARAMETER),
    };

    let path = body.bytes().read_string(header.unicode()).map_err(|_| Status::INVALID_SMB)?;
    let args = CreateArgs {
        path,
        access,
        allocation: u64::from(allocation),
        attributes: FileAttributes::from_bits_truncate(u32::from(attributes)),
        sharing,
        disposition,
        options: CreateOptions::NON_DIRECTORY_FILE,
        requested_oplock: false,
    };
    let out = create_file(server, connection, vc, tree, args).await?;

    let action = match out.action {
        CreateAction::Opened => 1u16,
        CreateAction::Created => 2,
        _ => 3,
    };
    reply.begin(15);
    reply.andx_slot();
    reply.u16(out.fid);
    reply.u16(out.info.attributes.bits() as u16);
    reply.u32(0); // last write, legacy UTIME
    reply.u32(out.info.size as u32);
    reply.u16(mode & open_mode::ACCESS_MASK);
    reply.u16(0); // file type: disk
    reply.u16(0); // device state
    reply.u16(action);
    reply.u32(0); // server fid
    reply.u16(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}

/// SMB_COM_CLOSE.
pub async fn close(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(3).map_err(|_| Status::INVALID_SMB)?;
    let fid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;

    let open = connection.remove_open(fid).ok_or(Status::INVALID_HANDLE)?;
    if let Some(tree) = vc.tree(open.tid) {
        tree.forget_fid(fid);
    }
    session::close_open_file(server, connection, &open).await;

    reply.begin(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
