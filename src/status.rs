//! NT status codes and their DOS-era class/code equivalents.
//!
//! Every request either succeeds or fails with a [`Status`]. Whether the
//! 32-bit NT value or the legacy class/code pair goes on the wire depends on
//! the `NT_STATUS` bit the client set in Flags2; [`Status::dos`] performs the
//! downgrade mapping for clients that never asked for NT status codes.

/// A 32-bit NT status as carried in the SMB header status field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Status(pub u32);

/// DOS error classes (SMB error class byte).
pub mod class {
    pub const SUCCESS: u8 = 0x00;
    pub const DOS: u8 = 0x01;
    pub const SERVER: u8 = 0x02;
    pub const HARDWARE: u8 = 0x03;
}

impl Status {
    pub const SUCCESS: Status = Status(0);

    pub const BUFFER_OVERFLOW: Status = Status(0x8000_0005);
    pub const NO_MORE_FILES: Status = Status(0x8000_0006);

    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const NOT_IMPLEMENTED: Status = Status(0xC000_0002);
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    pub const INVALID_DEVICE_REQUEST: Status = Status(0xC000_0010);
    pub const END_OF_FILE: Status = Status(0xC000_0011);
    pub const MORE_PROCESSING_REQUIRED: Status = Status(0xC000_0016);
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    pub const BUFFER_TOO_SMALL: Status = Status(0xC000_0023);
    pub const OBJECT_NAME_INVALID: Status = Status(0xC000_0033);
    pub const OBJECT_NAME_NOT_FOUND: Status = Status(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: Status = Status(0xC000_0035);
    pub const OBJECT_PATH_NOT_FOUND: Status = Status(0xC000_003A);
    pub const OBJECT_PATH_SYNTAX_BAD: Status = Status(0xC000_003B);
    pub const SHARING_VIOLATION: Status = Status(0xC000_0043);
    pub const FILE_LOCK_CONFLICT: Status = Status(0xC000_0054);
    pub const LOCK_NOT_GRANTED: Status = Status(0xC000_0055);
    pub const DELETE_PENDING: Status = Status(0xC000_0056);
    pub const LOGON_FAILURE: Status = Status(0xC000_006D);
    pub const RANGE_NOT_LOCKED: Status = Status(0xC000_007E);
    pub const DISK_FULL: Status = Status(0xC000_007F);
    pub const INSUFFICIENT_RESOURCES: Status = Status(0xC000_009A);
    pub const FILE_IS_A_DIRECTORY: Status = Status(0xC000_00BA);
    pub const NOT_SUPPORTED: Status = Status(0xC000_00BB);
    pub const BAD_DEVICE_TYPE: Status = Status(0xC000_00CB);
    pub const BAD_NETWORK_NAME: Status = Status(0xC000_00CC);
    pub const NETWORK_ACCESS_DENIED: Status = Status(0xC000_00CA);
    pub const DIRECTORY_NOT_EMPTY: Status = Status(0xC000_0101);
    pub const NOT_A_DIRECTORY: Status = Status(0xC000_0103);
    pub const CANCELLED: Status = Status(0xC000_0120);
    pub const CANNOT_DELETE: Status = Status(0xC000_0121);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const INVALID_SMB: Status = Status(0x0001_0002);
    pub const SMB_BAD_TID: Status = Status(0x0005_0002);
    pub const SMB_BAD_UID: Status = Status(0x005B_0002);
    pub const SMB_BAD_FID: Status = Status(0x0006_0001);
    pub const SMB_USE_STANDARD: Status = Status(0x00FB_0002);

    /// True for the success severity (including warnings the client is
    /// expected to examine, such as `BUFFER_OVERFLOW`).
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::SUCCESS
                | Status::BUFFER_OVERFLOW
                | Status::NO_MORE_FILES
                | Status::MORE_PROCESSING_REQUIRED
        )
    }

    /// Maps the NT status onto the legacy (error class, error code) pair for
    /// clients that did not negotiate NT status codes.
    pub fn dos(self) -> (u8, u16) {
        match self {
            Status::SUCCESS => (class::SUCCESS, 0),
            Status::OBJECT_NAME_NOT_FOUND | Status::OBJECT_PATH_NOT_FOUND => (class::DOS, 2),
            Status::OBJECT_PATH_SYNTAX_BAD | Status::OBJECT_NAME_INVALID => (class::DOS, 3),
            Status::ACCESS_DENIED | Status::CANNOT_DELETE => (class::DOS, 5),
            Status::INVALID_HANDLE | Status::SMB_BAD_FID => (class::DOS, 6),
            Status::INSUFFICIENT_RESOURCES => (class::DOS, 8),
            Status::SHARING_VIOLATION => (class::DOS, 32),
            Status::FILE_LOCK_CONFLICT | Status::LOCK_NOT_GRANTED | Status::RANGE_NOT_LOCKED => {
                (class::DOS, 33)
            }
            Status::OBJECT_NAME_COLLISION => (class::DOS, 80),
            Status::DIRECTORY_NOT_EMPTY => (class::DOS, 145),
            Status::DISK_FULL => (class::HARDWARE, 39),
            Status::LOGON_FAILURE => (class::SERVER, 4),
            Status::SMB_BAD_UID => (class::SERVER, 91),
            Status::SMB_BAD_TID | Status::BAD_NETWORK_NAME => (class::SERVER, 5),
            Status::BAD_DEVICE_TYPE => (class::SERVER, 6),
            Status::NOT_SUPPORTED | Status::NOT_IMPLEMENTED => (class::SERVER, 50),
            Status::INVALID_SMB | Status::INVALID_PARAMETER => (class::SERVER, 1),
            _ => (class::HARDWARE, 31),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_split() {
        assert!(Status::SUCCESS.is_success());
        assert!(Status::BUFFER_OVERFLOW.is_success());
        assert!(!Status::ACCESS_DENIED.is_success());
        assert!(!Status::SMB_BAD_TID.is_success());
    }

    #[test]
    fn dos_downgrade() {
        assert_eq!(Status::OBJECT_NAME_NOT_FOUND.dos(), (class::DOS, 2));
        assert_eq!(Status::SHARING_VIOLATION.dos(), (class::DOS, 32));
        assert_eq!(Status::LOGON_FAILURE.dos(), (class::SERVER, 4));
        assert_eq!(Status::SUCCESS.dos(), (class::SUCCESS, 0));
    }
}
