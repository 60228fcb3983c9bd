//! Defines the pluggable disk backend interface --- [`Disk`].
//!
//! The protocol engine never touches storage directly: every tree maps to a
//! context created by a [`DiskDriver`], and all file operations go through
//! the [`Disk`] trait. The shipped [`memory::MemoryDisk`] backend keeps
//! everything in process and is what the test suite runs against.

pub mod memory;

use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use num_derive::FromPrimitive;

use crate::status::Status;

/// Result of [`Disk`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Disk backend errors. Each maps onto one NT status via [`Error::status`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The final path component does not exist.
    NotFound,
    /// An intermediate path component does not exist or is not a directory.
    PathNotFound,
    /// The target already exists and the operation required it not to.
    Exists,
    /// The backend refused access to the object.
    AccessDenied,
    /// A directory was given to a file-only operation.
    IsDirectory,
    /// A file was given to a directory-only operation.
    NotDirectory,
    /// Directory removal attempted on a non-empty directory.
    NotEmpty,
    /// The backend is out of space.
    DiskFull,
    /// The path contains characters the backend cannot store.
    InvalidName,
    /// The handle is unknown or already closed.
    BadHandle,
    /// A hard backend failure.
    Io,
}

impl Error {
    pub fn status(self) -> Status {
        match self {
            Error::NotFound => Status::OBJECT_NAME_NOT_FOUND,
            Error::PathNotFound => Status::OBJECT_PATH_NOT_FOUND,
            Error::Exists => Status::OBJECT_NAME_COLLISION,
            Error::AccessDenied => Status::ACCESS_DENIED,
            Error::IsDirectory => Status::FILE_IS_A_DIRECTORY,
            Error::NotDirectory => Status::NOT_A_DIRECTORY,
            Error::NotEmpty => Status::DIRECTORY_NOT_EMPTY,
            Error::DiskFull => Status::DISK_FULL,
            Error::InvalidName => Status::OBJECT_NAME_INVALID,
            Error::BadHandle => Status::INVALID_HANDLE,
            Error::Io => Status::UNSUCCESSFUL,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "disk backend error: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Handle issued by a disk context, opaque to the protocol engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fh(pub u64);

bitflags! {
    /// NT desired-access mask, as carried by NTCreateAndX.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DesiredAccess: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const READ_EA = 0x0000_0008;
        const WRITE_EA = 0x0000_0010;
        const EXECUTE = 0x0000_0020;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;
    }
}

impl DesiredAccess {
    /// Resolves generic bits into their specific equivalents.
    pub fn normalized(self) -> DesiredAccess {
        let mut out = self & !(DesiredAccess::GENERIC_ALL
            | DesiredAccess::GENERIC_EXECUTE
            | DesiredAccess::GENERIC_WRITE
            | DesiredAccess::GENERIC_READ);
        if self.contains(DesiredAccess::GENERIC_READ) || self.contains(DesiredAccess::GENERIC_ALL) {
            out |= DesiredAccess::READ_DATA
                | DesiredAccess::READ_EA
                | DesiredAccess::READ_ATTRIBUTES
                | DesiredAccess::READ_CONTROL;
        }
        if self.contains(DesiredAccess::GENERIC_WRITE) || self.contains(DesiredAccess::GENERIC_ALL)
        {
            out |= DesiredAccess::WRITE_DATA
                | DesiredAccess::APPEND_DATA
                | DesiredAccess::WRITE_EA
                | DesiredAccess::WRITE_ATTRIBUTES;
        }
        if self.contains(DesiredAccess::GENERIC_EXECUTE)
            || self.contains(DesiredAccess::GENERIC_ALL)
        {
            out |= DesiredAccess::EXECUTE | DesiredAccess::READ_ATTRIBUTES;
        }
        if self.contains(DesiredAccess::GENERIC_ALL) {
            out |= DesiredAccess::DELETE | DesiredAccess::WRITE_DAC | DesiredAccess::WRITE_OWNER;
        }
        out
    }

    pub fn wants_read(self) -> bool {
        self.intersects(DesiredAccess::READ_DATA | DesiredAccess::EXECUTE)
    }

    pub fn wants_write(self) -> bool {
        self.intersects(DesiredAccess::WRITE_DATA | DesiredAccess::APPEND_DATA)
    }

    pub fn wants_delete(self) -> bool {
        self.contains(DesiredAccess::DELETE)
    }
}

bitflags! {
    /// Share-access mask: what the opener permits other openers to do.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SharingMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const DELETE = 0x4;
    }
}

/// NTCreateAndX create disposition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum CreateDisposition {
    Supersede = 0,
    Open = 1,
    Create = 2,
    OpenIf = 3,
    Overwrite = 4,
    OverwriteIf = 5,
}

/// Outcome reported back in the create response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CreateAction {
    Superseded = 0,
    Opened = 1,
    Created = 2,
    Overwritten = 3,
}

bitflags! {
    /// NTCreateAndX create options.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CreateOptions: u32 {
        const DIRECTORY_FILE = 0x0000_0001;
        const WRITE_THROUGH = 0x0000_0002;
        const SEQUENTIAL_ONLY = 0x0000_0004;
        const NON_DIRECTORY_FILE = 0x0000_0040;
        const RANDOM_ACCESS = 0x0000_0800;
        const DELETE_ON_CLOSE = 0x0000_1000;
        const OPEN_REPARSE_POINT = 0x0020_0000;
    }
}

bitflags! {
    /// DOS/NT file attribute bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
        const NORMAL = 0x0080;
    }
}

/// Metadata for one file or directory.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Final component name, as stored.
    pub name: String,
    pub attributes: FileAttributes,
    pub size: u64,
    pub allocation: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub written: SystemTime,
    pub changed: SystemTime,
    pub file_id: u64,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }
}

/// What an [`Disk::open`] call produced.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub handle: Fh,
    pub info: FileInfo,
    pub action: CreateAction,
}

/// Handle-level metadata mutation, one variant per supported info class.
#[derive(Debug, Clone)]
pub enum SetInfo {
    Basic {
        attributes: Option<FileAttributes>,
        created: Option<SystemTime>,
        accessed: Option<SystemTime>,
        written: Option<SystemTime>,
    },
    AllocationSize(u64),
    EndOfFile(u64),
}

/// Fixed geometry reported for free-space queries.
#[derive(Debug, Copy, Clone)]
pub struct DiskGeometry {
    pub total_units: u64,
    pub free_units: u64,
    pub sectors_per_unit: u32,
    pub bytes_per_sector: u32,
}

/// Builds a [`Disk`] context for a share at configuration time.
#[async_trait]
pub trait DiskDriver: Send + Sync {
    async fn create_context(
        &self,
        share_name: &str,
        params: &toml::Table,
    ) -> Result<std::sync::Arc<dyn Disk>>;
}

/// One share's storage.
#[async_trait]
pub trait Disk: Send + Sync {
    /// Opens or creates `path` per the disposition. Truncation for the
    /// overwrite dispositions happens here.
    async fn open(
        &self,
        path: &str,
        disposition: CreateDisposition,
        options: CreateOptions,
        attributes: FileAttributes,
    ) -> Result<OpenOutcome>;

    async fn read(&self, handle: Fh, offset: u64, len: usize) -> Result<Vec<u8>>;

    async fn write(&self, handle: Fh, offset: u64, data: &[u8], write_through: bool)
        -> Result<usize>;

    async fn flush(&self, handle: Fh) -> Result<()>;

    async fn query_handle(&self, handle: Fh) -> Result<FileInfo>;

    async fn query_path(&self, path: &str) -> Result<FileInfo>;

    async fn set_info(&self, handle: Fh, info: SetInfo) -> Result<()>;

    async fn rename(&self, from: &str, to: &str, replace: bool) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    async fn make_directory(&self, path: &str) -> Result<()>;

    async fn remove_directory(&self, path: &str) -> Result<()>;

    /// Lists `dir` entries matching `pattern` (DOS wildcards). The engine
    /// snapshots the result for resumable directory searches.
    async fn enumerate(&self, dir: &str, pattern: &str) -> Result<Vec<FileInfo>>;

    async fn close(&self, handle: Fh) -> Result<()>;

    fn geometry(&self) -> DiskGeometry;
}

/// DOS wildcard match: `*` any run, `?` any single character, case folded.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some(b'?'), Some(_)) => matches(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) => {
                p.eq_ignore_ascii_case(n) && matches(&pattern[1..], &name[1..])
            }
            _ => false,
        }
    }
    if pattern.is_empty() || pattern == "*" || pattern == "*.*" {
        return true;
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_read_resolves() {
        let access = DesiredAccess::GENERIC_READ.normalized();
        assert!(access.contains(DesiredAccess::READ_DATA));
        assert!(!access.wants_write());
    }

    #[test]
    fn generic_all_resolves_to_everything() {
        let access = DesiredAccess::GENERIC_ALL.normalized();
        assert!(access.wants_read());
        assert!(access.wants_write());
        assert!(access.wants_delete());
    }

    #[test]
    fn wildcard_rules() {
        assert!(wildcard_match("*", "anything.txt"));
        assert!(wildcard_match("*.*", "bare"));
        assert!(wildcard_match("*.txt", "REPORT.TXT"));
        assert!(wildcard_match("data??.bin", "data01.bin"));
        assert!(!wildcard_match("*.txt", "report.doc"));
        assert!(!wildcard_match("a?c", "abbc"));
    }
}
