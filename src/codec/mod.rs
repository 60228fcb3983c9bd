//! SMB1 wire codec: header, parameter/byte-area cursors, framing.

pub mod frame;
pub mod header;
pub mod packet;
pub mod primitive;

#[cfg(test)]
mod tests;

use std::io;
use std::string::FromUtf8Error;

/// Result of codec operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while decoding or encoding SMB1 frames.
#[derive(Debug)]
pub enum Error {
    /// Underlying reader or writer failed, including short reads of a
    /// parameter or byte area.
    IO(io::Error),
    /// Frame does not start with the `\xFF S M B` marker.
    BadMagic,
    /// A frame is shorter than the fixed header or its declared areas.
    Truncated,
    /// A word count does not match what the command requires.
    WordCount { expected: u8, actual: u8 },
    /// A wire discriminant does not map onto any known variant.
    EnumMismatch,
    /// An OEM string was not valid in the negotiated character set.
    BadString(FromUtf8Error),
    /// A UTF-16 string contained an unpaired surrogate.
    BadUnicode,
    /// A reply outgrew the buffer it is being built into.
    ReplyOverflow,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IO(err) => write!(f, "i/o failure: {err}"),
            Error::BadMagic => write!(f, "missing SMB protocol marker"),
            Error::Truncated => write!(f, "frame shorter than declared"),
            Error::WordCount { expected, actual } => {
                write!(f, "word count {actual}, command requires {expected}")
            }
            Error::EnumMismatch => write!(f, "unknown wire discriminant"),
            Error::BadString(err) => write!(f, "malformed OEM string: {err}"),
            Error::BadUnicode => write!(f, "malformed UTF-16 string"),
            Error::ReplyOverflow => write!(f, "reply exceeds buffer capacity"),
        }
    }
}

impl std::error::Error for Error {}
