//! The fixed 32-byte SMB1 header and its flag words.

use std::io::{Read, Write};

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::{primitive, Error, Result};
use crate::status::Status;

/// Protocol marker opening every SMB1 frame.
pub const SMB_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// Total size of the fixed header, up to and excluding the word count.
pub const HEADER_LEN: usize = 32;

/// `AndXCommand` value meaning "no further command in this frame".
pub const NO_ANDX_COMMAND: u8 = 0xFF;

/// SMB1 command codes handled by this server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    CreateDirectory = 0x00,
    DeleteDirectory = 0x01,
    Close = 0x04,
    Flush = 0x05,
    Delete = 0x06,
    Rename = 0x07,
    QueryInformation = 0x08,
    SetInformation = 0x09,
    CheckDirectory = 0x10,
    Seek = 0x12,
    LockingAndX = 0x24,
    Transaction = 0x25,
    TransactionSecondary = 0x26,
    Echo = 0x2B,
    OpenAndX = 0x2D,
    ReadAndX = 0x2E,
    WriteAndX = 0x2F,
    Transaction2 = 0x32,
    Transaction2Secondary = 0x33,
    FindClose2 = 0x34,
    TreeDisconnect = 0x71,
    Negotiate = 0x72,
    SessionSetupAndX = 0x73,
    LogoffAndX = 0x74,
    TreeConnectAndX = 0x75,
    QueryInformationDisk = 0x80,
    NtTransact = 0xA0,
    NtTransactSecondary = 0xA1,
    NtCreateAndX = 0xA2,
    NtCancel = 0xA4,
}

bitflags! {
    /// First header flags byte.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Flags1: u8 {
        const LOCK_AND_READ_OK = 0x01;
        const CASELESS = 0x08;
        const CANONICAL_PATHS = 0x10;
        const OPLOCK = 0x20;
        const OPLOCK_NOTIFY = 0x40;
        const RESPONSE = 0x80;
    }
}

bitflags! {
    /// Second header flags word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Flags2: u16 {
        const LONG_NAMES = 0x0001;
        const EXTENDED_ATTRIBUTES = 0x0002;
        const SECURITY_SIGNATURES = 0x0004;
        const IS_LONG_NAME = 0x0040;
        const EXTENDED_SECURITY = 0x0800;
        const DFS = 0x1000;
        const PAGING_IO = 0x2000;
        const NT_STATUS = 0x4000;
        const UNICODE = 0x8000;
    }
}

/// The fixed SMB1 header. The status field is stored in its NT form; the DOS
/// downgrade happens at write time when the request lacked `NT_STATUS`.
#[derive(Debug, Clone)]
pub struct Header {
    pub command: u8,
    pub status: Status,
    pub flags: Flags1,
    pub flags2: Flags2,
    pub pid_high: u16,
    pub signature: [u8; 8],
    pub tid: u16,
    pub pid: u16,
    pub uid: u16,
    pub mid: u16,
}

impl Header {
    /// Parses the fixed header, consuming exactly [`HEADER_LEN`] bytes.
    pub fn parse(src: &mut impl Read) -> Result<Header> {
        let magic = primitive::array::<4>(src)?;
        if magic != SMB_MAGIC {
            return Err(Error::BadMagic);
        }
        let command = primitive::u8(src)?;
        let status = Status(primitive::u32(src)?);
        let flags = Flags1::from_bits_truncate(primitive::u8(src)?);
        let flags2 = Flags2::from_bits_truncate(primitive::u16(src)?);
        let pid_high = primitive::u16(src)?;
        let signature = primitive::array::<8>(src)?;
        primitive::skip(src, 2)?;
        let tid = primitive::u16(src)?;
        let pid = primitive::u16(src)?;
        let uid = primitive::u16(src)?;
        let mid = primitive::u16(src)?;
        Ok(Header { command, status, flags, flags2, pid_high, signature, tid, pid, uid, mid })
    }

    /// Serializes the fixed header.
    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        primitive::put_bytes(dest, &SMB_MAGIC)?;
        primitive::put_u8(dest, self.command)?;
        if self.flags2.contains(Flags2::NT_STATUS) {
            primitive::put_u32(dest, self.status.0)?;
        } else {
            let (class, code) = self.status.dos();
            primitive::put_u8(dest, class)?;
            primitive::put_u8(dest, 0)?;
            primitive::put_u16(dest, code)?;
        }
        primitive::put_u8(dest, self.flags.bits())?;
        primitive::put_u16(dest, self.flags2.bits())?;
        primitive::put_u16(dest, self.pid_high)?;
        primitive::put_bytes(dest, &self.signature)?;
        primitive::put_u16(dest, 0)?;
        primitive::put_u16(dest, self.tid)?;
        primitive::put_u16(dest, self.pid)?;
        primitive::put_u16(dest, self.uid)?;
        primitive::put_u16(dest, self.mid)?;
        Ok(())
    }

    /// Command code as a known [`Command`], if this server implements it.
    pub fn known_command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }

    /// Whether the client encodes strings as UTF-16LE on this exchange.
    pub fn unicode(&self) -> bool {
        self.flags2.contains(Flags2::UNICODE)
    }

    /// Builds a response header for this request: same ids, response bit set,
    /// status filled in by the reply writer.
    pub fn reply(&self) -> Header {
        let mut hdr = self.clone();
        hdr.flags |= Flags1::RESPONSE;
        hdr.status = Status::SUCCESS;
        hdr
    }

    /// Builds a request-shaped header the server originates itself (oplock
    /// break notifications).
    pub fn unsolicited(command: Command, tid: u16, uid: u16) -> Header {
        Header {
            command: command as u8,
            status: Status::SUCCESS,
            flags: Flags1::RESPONSE | Flags1::CANONICAL_PATHS | Flags1::CASELESS,
            flags2: Flags2::NT_STATUS | Flags2::LONG_NAMES,
            pid_high: 0,
            signature: [0; 8],
            tid,
            pid: 0xFFFF,
            uid,
            mid: 0xFFFF,
        }
    }
}
