//! Trans2 sub-commands: resumable directory search and the query/set
//! information levels. Each level's layout is the documented Windows
//! structure, byte for byte.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::header::Header;
use crate::codec::packet::ReplyBuilder;
use crate::codec::primitive::{self, to_filetime};
use crate::disk::{FileAttributes, FileInfo, SetInfo};
use crate::dispatch::Action;
use crate::notify::{action, completion_filter};
use crate::session::{Connection, Search, Tree, VirtualCircuit};
use crate::status::Status;
use crate::Server;

use super::Assembly;

/// Trans2 sub-command codes.
pub mod subcommand {
    pub const FIND_FIRST2: u16 = 0x0001;
    pub const FIND_NEXT2: u16 = 0x0002;
    pub const QUERY_FS_INFORMATION: u16 = 0x0003;
    pub const QUERY_PATH_INFORMATION: u16 = 0x0005;
    pub const SET_PATH_INFORMATION: u16 = 0x0006;
    pub const QUERY_FILE_INFORMATION: u16 = 0x0007;
    pub const SET_FILE_INFORMATION: u16 = 0x0008;
}

/// Query information levels.
pub mod info_level {
    pub const STANDARD: u16 = 0x0001;
    pub const EA_SIZE: u16 = 0x0002;
    pub const BASIC: u16 = 0x0101;
    pub const STANDARD_INFO: u16 = 0x0102;
    pub const EA_INFO: u16 = 0x0103;
    pub const NAME_INFO: u16 = 0x0104;
    pub const ALL_INFO: u16 = 0x0107;
    pub const ALT_NAME_INFO: u16 = 0x0108;
    pub const STREAM_INFO: u16 = 0x0109;
    pub const COMPRESSION_INFO: u16 = 0x010B;
}

/// Set information levels.
pub mod set_level {
    pub const BASIC: u16 = 0x0101;
    pub const DISPOSITION: u16 = 0x0102;
    pub const ALLOCATION: u16 = 0x0103;
    pub const END_OF_FILE: u16 = 0x0104;
    /// NT pass-through FileRenameInformation.
    pub const RENAME: u16 = 0x03F2;
}

/// Filesystem information levels.
pub mod fs_level {
    pub const ALLOCATION: u16 = 0x0001;
    pub const VOLUME: u16 = 0x0002;
    pub const VOLUME_INFO: u16 = 0x0102;
    pub const SIZE_INFO: u16 = 0x0103;
    pub const DEVICE_INFO: u16 = 0x0104;
    pub const ATTRIBUTE_INFO: u16 = 0x0105;
}

/// Directory-search information levels.
pub mod find_level {
    pub const STANDARD: u16 = 0x0001;
    pub const DIRECTORY_INFO: u16 = 0x0101;
    pub const BOTH_DIRECTORY_INFO: u16 = 0x0104;
}

mod find_flags {
    pub const CLOSE_AFTER_REQUEST: u16 = 0x0001;
    pub const CLOSE_AT_EOS: u16 = 0x0002;
}

/// Routes a fully reassembled Trans2 request.
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
        subcommand::FIND_FIRST2 => find_first2(connection, tree, header, assembly, reply).await,
        subcommand::FIND_NEXT2 => find_next2(connection, header, assembly, reply).await,
        subcommand::QUERY_FS_INFORMATION => query_fs(connection, tree, header, assembly, reply),
        subcommand::QUERY_PATH_INFORMATION => {
            query_path(connection, tree, header, assembly, reply).await
        }
        subcommand::QUERY_FILE_INFORMATION => {
            query_file(connection, tree, header, assembly, reply).await
        }
        subcommand::SET_PATH_INFORMATION => {
            set_path(server, connection, tree, header, assembly, reply).await
        }
        subcommand::SET_FILE_INFORMATION => {
            set_file(server, connection, tree, header, assembly, reply).await
        }
        _ => Err(Status::NOT_SUPPORTED),
    }
}

fn param_u16(params: &[u8], at: usize) -> Result<u16, Status> {
    if at + 2 > params.len() {
        return Err(Status::INVALID_PARAMETER);
    }
    Ok(u16::from_le_bytes([params[at], params[at + 1]]))
}

fn param_u32(params: &[u8], at: usize) -> Result<u32, Status> {
    if at + 4 > params.len() {
        return Err(Status::INVALID_PARAMETER);
    }
    Ok(u32::from_le_bytes([params[at], params[at + 1], params[at + 2], params[at + 3]]))
}

/// Encodes a `SystemTime` as the legacy two-second DOS date/time pair.
fn dos_date_time(time: SystemTime) -> (u16, u16) {
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs();
    let days = secs / 86_400;
    // Coarse calendar math is fine here: the legacy levels only exist for
    // pre-NT clients and round to two seconds anyway.
    let year = 1970 + (days * 4 / 1461) as u16;
    let day_secs = secs % 86_400;
    let date = ((year.saturating_sub(1980) & 0x7F) << 9) | (1 << 5) | 1;
    let time = (((day_secs / 3600) as u16) << 11)
        | ((((day_secs % 3600) / 60) as u16) << 5)
        | ((day_secs % 60) / 2) as u16;
    (date, time)
}

fn put_filetime(dest: &mut Vec<u8>, time: SystemTime) {
    dest.extend_from_slice(&to_filetime(time).to_le_bytes());
}

/// 8.3-style alternate name: uppercase, truncated.
fn short_name(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{}.{}", &stem[..stem.len().min(8)], &ext[..ext.len().min(3)])
        }
        _ => upper.chars().take(11).collect(),
    }
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Serializes one query-information level for `info`.
pub fn write_info_level(level: u16, info: &FileInfo, path: &str) -> Result<Vec<u8>, Status> {
    let mut data = Vec::new();
    match level {
        info_level::STANDARD | info_level::EA_SIZE => {
            for time in [info.created, info.accessed, info.written] {
                let (date, dos_time) = dos_date_time(time);
                data.extend_from_slice(&date.to_le_bytes());
                data.extend_from_slice(&dos_time.to_le_bytes());
            }
            data.extend_from_slice(&(info.size as u32).to_le_bytes());
            data.extend_from_slice(&(info.allocation as u32).to_le_bytes());
            data.extend_from_slice(&(info.attributes.bits() as u16).to_le_bytes());
            if level == info_level::EA_SIZE {
                data.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        info_level::BASIC => {
            for time in [info.created, info.accessed, info.written, info.changed] {
                put_filetime(&mut data, time);
            }
            data.extend_from_slice(&info.attributes.bits().to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
        }
        info_level::STANDARD_INFO => {
            data.extend_from_slice(&info.allocation.to_le_bytes());
            data.extend_from_slice(&info.size.to_le_bytes());
            data.extend_from_slice(&1u32.to_le_bytes()); // links
            data.push(0); // delete pending
            data.push(info.is_directory() as u8);
        }
        info_level::EA_INFO => {
            data.extend_from_slice(&0u32.to_le_bytes());
        }
        info_level::NAME_INFO => {
            let name = utf16_bytes(path);
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(&name);
        }
        info_level::ALL_INFO => {
            for time in [info.created, info.accessed, info.written, info.changed] {
                put_filetime(&mut data, time);
            }
            data.extend_from_slice(&info.attributes.bits().to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&info.allocation.to_le_bytes());
            data.extend_from_slice(&info.size.to_le_bytes());
            data.extend_from_slice(&1u32.to_le_bytes());
            data.push(0);
            data.push(info.is_directory() as u8);
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(&0u32.to_le_bytes()); // ea size
            let name = utf16_bytes(path);
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(&name);
        }
        info_level::ALT_NAME_INFO => {
            let name = utf16_bytes(&short_name(&info.name));
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(&name);
        }
        info_level::STREAM_INFO => {
            if info.is_directory() {
                return Ok(data);
            }
            let name = utf16_bytes("::$DATA");
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(&info.size.to_le_bytes());
            data.extend_from_slice(&info.allocation.to_le_bytes());
            data.extend_from_slice(&name);
        }
        info_level::COMPRESSION_INFO => {
            data.extend_from_slice(&info.size.to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes()); // COMPRESSION_FORMAT_NONE
            data.extend_from_slice(&[0, 0, 0, 0, 0]);
        }
        _ => return Err(Status::NOT_SUPPORTED),
    }
    Ok(data)
}

fn query_fs(
    connection: &Arc<Connection>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let level = param_u16(&assembly.params, 0)?;
    let geometry = tree.share.disk.geometry();
    let volume = &tree.share.volume;
    let mut data = Vec::new();
    match level {
        fs_level::ALLOCATION => {
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&geometry.sectors_per_unit.to_le_bytes());
            data.extend_from_slice(&(geometry.total_units as u32).to_le_bytes());
            data.extend_from_slice(&(geometry.free_units as u32).to_le_bytes());
            data.extend_from_slice(&(geometry.bytes_per_sector as u16).to_le_bytes());
        }
        fs_level::VOLUME => {
            data.extend_from_slice(&volume.serial.to_le_bytes());
            let label = utf16_bytes(&volume.label);
            data.push(label.len() as u8);
            data.extend_from_slice(&label);
        }
        fs_level::VOLUME_INFO => {
            put_filetime(&mut data, volume.created);
            data.extend_from_slice(&volume.serial.to_le_bytes());
            let label = utf16_bytes(&volume.label);
            data.extend_from_slice(&(label.len() as u32).to_le_bytes());
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(&label);
        }
        fs_level::SIZE_INFO => {
            data.extend_from_slice(&geometry.total_units.to_le_bytes());
            data.extend_from_slice(&geometry.free_units.to_le_bytes());
            data.extend_from_slice(&geometry.sectors_per_unit.to_le_bytes());
            data.extend_from_slice(&geometry.bytes_per_sector.to_le_bytes());
        }
        fs_level::DEVICE_INFO => {
            data.extend_from_slice(&0x0007u32.to_le_bytes()); // FILE_DEVICE_DISK
            data.extend_from_slice(&0u32.to_le_bytes());
        }
        fs_level::ATTRIBUTE_INFO => {
            data.extend_from_slice(&0x0006u32.to_le_bytes()); // case preserved + unicode
            data.extend_from_slice(&255u32.to_le_bytes());
            let name = utf16_bytes("NTFS");
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(&name);
        }
        _ => return Err(Status::NOT_SUPPORTED),
    }
    super::respond_trans2(connection, reply, header, &[], &[], &data)
}

async fn query_path(
    connection: &Arc<Connection>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let level = param_u16(&assembly.params, 0)?;
    // information level (2), reserved (4), then the path
    let path = super::read_param_path(&assembly.params, 6, header.unicode())
        .map_err(|_| Status::INVALID_PARAMETER)?;
    let path = crate::handlers::canonicalize(&path)?;
    let info = tree.share.disk.query_path(&path).await.map_err(|e| e.status())?;
    let data = write_info_level(level, &info, &path)?;
    super::respond_trans2(connection, reply, header, &[], &0u16.to_le_bytes(), &data)
}

async fn query_file(
    connection: &Arc<Connection>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let fid = param_u16(&assembly.params, 0)?;
    let level = param_u16(&assembly.params, 2)?;
    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
    let info = tree.share.disk.query_handle(open.handle).await.map_err(|e| e.status())?;
    let data = write_info_level(level, &info, &open.path)?;
    super::respond_trans2(connection, reply, header, &[], &0u16.to_le_bytes(), &data)
}

fn data_u64(data: &[u8], at: usize) -> Result<u64, Status> {
    if at + 8 > data.len() {
        return Err(Status::INVALID_PARAMETER);
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    Ok(u64::from_le_bytes(raw))
}

/// Decodes one set-information payload into the disk mutation plus side
/// effects the caller applies (delete-on-close, rename).
enum SetOutcome {
    Disk(SetInfo),
    Disposition(bool),
    Rename { target: String, replace: bool },
}

fn parse_set_payload(level: u16, data: &[u8], unicode: bool) -> Result<SetOutcome, Status> {
    match level {
        set_level::BASIC => {
            fn time_of(data: &[u8], at: usize) -> Result<Option<SystemTime>, Status> {
                let raw = data_u64(data, at)?;
                // zero and -1 both mean "leave unchanged"
                if raw == 0 || raw == u64::MAX {
                    return Ok(None);
                }
                Ok(Some(primitive::from_filetime(raw)))
            }
            let created = time_of(data, 0)?;
            let accessed = time_of(data, 8)?;
            let written = time_of(data, 16)?;
            let attributes = param_u32(data, 32)?;
            let attributes = if attributes == 0 {
                None
            } else {
                Some(FileAttributes::from_bits_truncate(attributes))
            };
            Ok(SetOutcome::Disk(SetInfo::Basic { attributes, created, accessed, written }))
        }
        set_level::DISPOSITION => {
            let pending = *data.first().ok_or(Status::INVALID_PARAMETER)? != 0;
            Ok(SetOutcome::Disposition(pending))
        }
        set_level::ALLOCATION => Ok(SetOutcome::Disk(SetInfo::AllocationSize(data_u64(data, 0)?))),
        set_level::END_OF_FILE => Ok(SetOutcome::Disk(SetInfo::EndOfFile(data_u64(data, 0)?))),
        set_level::RENAME => {
            let replace = *data.first().ok_or(Status::INVALID_PARAMETER)? != 0;
            let length = param_u32(data, 8)? as usize;
            if 12 + length > data.len() {
                return Err(Status::INVALID_PARAMETER);
            }
            let raw = &data[12..12 + length];
            let target = if unicode {
                primitive::unicode_sized(&mut &raw[..], raw.len())
                    .map_err(|_| Status::INVALID_PARAMETER)?
            } else {
                String::from_utf8(raw.to_vec()).map_err(|_| Status::INVALID_PARAMETER)?
            };
            Ok(SetOutcome::Rename { target, replace })
        }
        _ => Err(Status::NOT_SUPPORTED),
    }
}

#[allow(clippy::too_many_arguments)]
async fn set_file(
    server: &Server,
    connection: &Arc<Connection>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let fid = param_u16(&assembly.params, 0)?;
    let level = param_u16(&assembly.params, 2)?;
    let open = connection.open(fid).ok_or(Status::INVALID_HANDLE)?;
    if !tree.writable() {
        return Err(Status::ACCESS_DENIED);
    }
    match parse_set_payload(level, &assembly.data, header.unicode())? {
        SetOutcome::Disk(info) => {
            let size_change = matches!(info, SetInfo::EndOfFile(_) | SetInfo::AllocationSize(_));
            open.share.disk.set_info(open.handle, info).await.map_err(|e| e.status())?;
            let filter = if size_change {
                completion_filter::SIZE
            } else {
                completion_filter::ATTRIBUTES
            };
            crate::notify::post(server, &open.share, &open.path, filter, action::MODIFIED).await;
        }
        SetOutcome::Disposition(pending) => {
            if pending && !open.access.wants_delete() {
                return Err(Status::ACCESS_DENIED);
            }
            open.delete_on_close
                .store(pending, std::sync::atomic::Ordering::Release);
        }
        SetOutcome::Rename { target, replace } => {
            let target = crate::handlers::canonicalize(&target)?;
            crate::handlers::file_ops::rename_paths(server, tree, &open.path, &target, replace)
                .await?;
        }
    }
    super::respond_trans2(connection, reply, header, &[], &0u16.to_le_bytes(), &[])
}

#[allow(clippy::too_many_arguments)]
async fn set_path(
    server: &Server,
    connection: &Arc<Connection>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let level = param_u16(&assembly.params, 0)?;
    let path = super::read_param_path(&assembly.params, 6, header.unicode())
        .map_err(|_| Status::INVALID_PARAMETER)?;
    let path = crate::handlers::canonicalize(&path)?;
    if !tree.writable() {
        return Err(Status::ACCESS_DENIED);
    }
    match parse_set_payload(level, &assembly.data, header.unicode())? {
        SetOutcome::Disk(info) => {
            // Path form goes through a transient handle.
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
            let applied = tree.share.disk.set_info(out.handle, info).await;
            let _ = tree.share.disk.close(out.handle).await;
            applied.map_err(|e| e.status())?;
            crate::notify::post(
                server,
                &tree.share,
                &path,
                completion_filter::ATTRIBUTES,
                action::MODIFIED,
            )
            .await;
        }
        SetOutcome::Rename { target, replace } => {
            let target = crate::handlers::canonicalize(&target)?;
            crate::handlers::file_ops::rename_paths(server, tree, &path, &target, replace)
                .await?;
        }
        SetOutcome::Disposition(_) => return Err(Status::NOT_SUPPORTED),
    }
    super::respond_trans2(connection, reply, header, &[], &0u16.to_le_bytes(), &[])
}

/// Serializes one directory entry at the requested find level. Returns the
/// entry bytes with `NextEntryOffset` already patched for chaining.
fn write_find_entry(level: u16, info: &FileInfo, resume_key: u32, last: bool)
    -> Result<Vec<u8>, Status> {
    let mut entry = Vec::new();
    match level {
        find_level::STANDARD => {
            entry.extend_from_slice(&resume_key.to_le_bytes());
            for time in [info.created, info.accessed, info.written] {
                let (date, time) = dos_date_time(time);
                entry.extend_from_slice(&date.to_le_bytes());
                entry.extend_from_slice(&time.to_le_bytes());
            }
            entry.extend_from_slice(&(info.size as u32).to_le_bytes());
            entry.extend_from_slice(&(info.allocation as u32).to_le_bytes());
            entry.extend_from_slice(&(info.attributes.bits() as u16).to_le_bytes());
            entry.push(info.name.len() as u8);
            entry.extend_from_slice(info.name.as_bytes());
            entry.push(0);
        }
        find_level::DIRECTORY_INFO | find_level::BOTH_DIRECTORY_INFO => {
            let name = utf16_bytes(&info.name);
            entry.extend_from_slice(&0u32.to_le_bytes()); // next entry, patched below
            entry.extend_from_slice(&resume_key.to_le_bytes());
            for time in [info.created, info.accessed, info.written, info.changed] {
                put_filetime(&mut entry, time);
            }
            entry.extend_from_slice(&info.size.to_le_bytes());
            entry.extend_from_slice(&info.allocation.to_le_bytes());
            entry.extend_from_slice(&info.attributes.bits().to_le_bytes());
            entry.extend_from_slice(&(name.len() as u32).to_le_bytes());
            if level == find_level::BOTH_DIRECTORY_INFO {
                entry.extend_from_slice(&0u32.to_le_bytes()); // ea size
                let alt = utf16_bytes(&short_name(&info.name));
                entry.push(alt.len() as u8);
                entry.push(0);
                let mut padded = [0u8; 24];
                padded[..alt.len().min(24)].copy_from_slice(&alt[..alt.len().min(24)]);
                entry.extend_from_slice(&padded);
            }
            entry.extend_from_slice(&name);
            // entries chain at 4-byte alignment
            while entry.len() % 4 != 0 {
                entry.push(0);
            }
            if !last {
                let next = entry.len() as u32;
                entry[0..4].copy_from_slice(&next.to_le_bytes());
            }
        }
        _ => return Err(Status::NOT_SUPPORTED),
    }
    Ok(entry)
}

const DIRECTORY_SEARCH_ATTR: u16 = 0x0010;

async fn find_first2(
    connection: &Arc<Connection>,
    tree: &Arc<Tree>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let search_attributes = param_u16(&assembly.params, 0)?;
    let max_count = param_u16(&assembly.params, 2)? as usize;
    let flags = param_u16(&assembly.params, 4)?;
    let level = param_u16(&assembly.params, 6)?;
    let raw_path = super::read_param_path(&assembly.params, 12, header.unicode())
        .map_err(|_| Status::INVALID_PARAMETER)?;

    let (directory, pattern) = crate::handlers::canonicalize_search(&raw_path)?;
    let mut entries = tree
        .share
        .disk
        .enumerate(&directory, &pattern)
        .await
        .map_err(|e| e.status())?;
    if search_attributes & DIRECTORY_SEARCH_ATTR == 0 {
        entries.retain(|e| !e.is_directory());
    }
    if entries.is_empty() {
        return Err(Status::NO_MORE_FILES);
    }

    let mut search = Search { directory, pattern, entries, next: 0 };
    let (data, taken, end) = fill_find_data(&mut search, level, max_count)?;

    let close_now = flags & find_flags::CLOSE_AFTER_REQUEST != 0
        || (end && flags & find_flags::CLOSE_AT_EOS != 0);
    let sid = if close_now { 0 } else { connection.insert_search(search) };

    let mut params = Vec::with_capacity(10);
    params.extend_from_slice(&sid.to_le_bytes());
    params.extend_from_slice(&(taken as u16).to_le_bytes());
    params.extend_from_slice(&(end as u16).to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes()); // ea error offset
    params.extend_from_slice(&0u16.to_le_bytes()); // last name offset
    super::respond_trans2(connection, reply, header, &[], &params, &data)
}

async fn find_next2(
    connection: &Arc<Connection>,
    header: &Header,
    assembly: &Assembly,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let sid = param_u16(&assembly.params, 0)?;
    let max_count = param_u16(&assembly.params, 2)? as usize;
    let level = param_u16(&assembly.params, 4)?;
    let _resume_key = param_u32(&assembly.params, 6)?;
    let flags = param_u16(&assembly.params, 10)?;

    let mut search = connection.searches.get_mut(&sid).ok_or(Status::INVALID_HANDLE)?;
    let (data, taken, end) = fill_find_data(&mut search, level, max_count)?;
    drop(search);
    if end && flags & find_flags::CLOSE_AT_EOS != 0 {
        connection.searches.remove(&sid);
    }

    let mut params = Vec::with_capacity(8);
    params.extend_from_slice(&(taken as u16).to_le_bytes());
    params.extend_from_slice(&(end as u16).to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes());
    super::respond_trans2(connection, reply, header, &[], &params, &data)
}

fn fill_find_data(
    search: &mut Search,
    level: u16,
    max_count: usize,
) -> Result<(Vec<u8>, usize, bool), Status> {
    let budget = if max_count == 0 { 128 } else { max_count };
    let mut data = Vec::new();
    let mut taken = 0;
    while taken < budget && search.next < search.entries.len() {
        let index = search.next;
        let last = taken + 1 == budget || index + 1 == search.entries.len();
        let entry = write_find_entry(level, &search.entries[index], index as u32 + 1, last)?;
        data.extend_from_slice(&entry);
        search.next += 1;
        taken += 1;
    }
    let end = search.next >= search.entries.len();
    Ok((data, taken, end))
}
