//! Primitive SMB1 data type parsing and serialization.
//!
//! SMB1 fields are little-endian. Strings come in two encodings selected by
//! the `UNICODE` bit of Flags2: null-terminated OEM bytes, or null-terminated
//! UTF-16LE. Unicode strings in the byte area are additionally aligned to a
//! 2-byte boundary relative to the start of the SMB header; alignment is the
//! caller's business (see [`crate::codec::packet::ByteArea`]), these helpers
//! only convert.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use super::{Error, Result};

/// Parses a `u8` from the `Read` source.
pub fn u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::IO)
}

/// Parses a `u16` from the `Read` source, little-endian.
pub fn u16(src: &mut impl Read) -> Result<u16> {
    src.read_u16::<LittleEndian>().map_err(Error::IO)
}

/// Parses a `u32` from the `Read` source, little-endian.
pub fn u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<LittleEndian>().map_err(Error::IO)
}

/// Parses a `u64` from the `Read` source, little-endian.
pub fn u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<LittleEndian>().map_err(Error::IO)
}

/// Parses a fixed-size array of bytes from the `Read` source.
pub fn array<const N: usize>(src: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf).map_err(Error::IO)?;
    Ok(buf)
}

/// Parses exactly `n` bytes into a vector.
pub fn vector(src: &mut impl Read, n: usize) -> Result<Vec<u8>> {
    let mut vec = vec![0u8; n];
    src.read_exact(vec.as_mut_slice()).map_err(Error::IO)?;
    Ok(vec)
}

/// Reads and discards `n` bytes.
pub fn skip(src: &mut impl Read, n: usize) -> Result<()> {
    let mut buf = [0u8; 8];
    let mut left = n;
    while left > 0 {
        let take = left.min(buf.len());
        src.read_exact(&mut buf[..take]).map_err(Error::IO)?;
        left -= take;
    }
    Ok(())
}

/// Parses a wire discriminant (`u8`) into an enum variant.
pub fn variant8<T: FromPrimitive>(src: &mut impl Read) -> Result<T> {
    FromPrimitive::from_u8(u8(src)?).ok_or(Error::EnumMismatch)
}

/// Parses a wire discriminant (`u16`) into an enum variant.
pub fn variant16<T: FromPrimitive>(src: &mut impl Read) -> Result<T> {
    FromPrimitive::from_u16(u16(src)?).ok_or(Error::EnumMismatch)
}

/// Parses a null-terminated OEM string.
pub fn oem_string(src: &mut impl Read) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = u8(src)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(Error::BadString)
}

/// Parses a null-terminated UTF-16LE string. The source must already sit on
/// the string's first code unit.
pub fn unicode_string(src: &mut impl Read) -> Result<String> {
    let mut units = Vec::new();
    loop {
        let unit = u16(src)?;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16(&units).map_err(|_| Error::BadUnicode)
}

/// Parses a UTF-16LE string of exactly `len` bytes with no terminator.
pub fn unicode_sized(src: &mut impl Read, len: usize) -> Result<String> {
    let mut units = Vec::with_capacity(len / 2);
    let mut left = len;
    while left >= 2 {
        units.push(u16(src)?);
        left -= 2;
    }
    if left == 1 {
        u8(src)?;
    }
    String::from_utf16(&units).map_err(|_| Error::BadUnicode)
}

/// Serializes a `u8`.
pub fn put_u8(dest: &mut impl Write, n: u8) -> Result<()> {
    dest.write_u8(n).map_err(Error::IO)
}

/// Serializes a `u16`, little-endian.
pub fn put_u16(dest: &mut impl Write, n: u16) -> Result<()> {
    dest.write_u16::<LittleEndian>(n).map_err(Error::IO)
}

/// Serializes a `u32`, little-endian.
pub fn put_u32(dest: &mut impl Write, n: u32) -> Result<()> {
    dest.write_u32::<LittleEndian>(n).map_err(Error::IO)
}

/// Serializes a `u64`, little-endian.
pub fn put_u64(dest: &mut impl Write, n: u64) -> Result<()> {
    dest.write_u64::<LittleEndian>(n).map_err(Error::IO)
}

/// Serializes a raw byte slice.
pub fn put_bytes(dest: &mut impl Write, bytes: &[u8]) -> Result<()> {
    dest.write_all(bytes).map_err(Error::IO)
}

/// Serializes a null-terminated OEM string.
pub fn put_oem_string(dest: &mut impl Write, s: &str) -> Result<()> {
    // Characters above the OEM range are substituted, never dropped, so the
    // terminator position stays predictable for the client.
    for ch in s.chars() {
        let b = if (ch as u32) < 0x100 { ch as u32 as u8 } else { b'?' };
        dest.write_u8(b).map_err(Error::IO)?;
    }
    dest.write_u8(0).map_err(Error::IO)
}

/// Serializes a null-terminated UTF-16LE string.
pub fn put_unicode_string(dest: &mut impl Write, s: &str) -> Result<()> {
    for unit in s.encode_utf16() {
        dest.write_u16::<LittleEndian>(unit).map_err(Error::IO)?;
    }
    dest.write_u16::<LittleEndian>(0).map_err(Error::IO)
}

/// Serializes a UTF-16LE string without a terminator, returning the byte
/// length written.
pub fn put_unicode_sized(dest: &mut impl Write, s: &str) -> Result<usize> {
    let mut written = 0;
    for unit in s.encode_utf16() {
        dest.write_u16::<LittleEndian>(unit).map_err(Error::IO)?;
        written += 2;
    }
    Ok(written)
}

/// Number of 100ns intervals between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_DELTA: u64 = 116_444_736_000_000_000;

/// Converts a [`std::time::SystemTime`] to a Windows FILETIME value.
pub fn to_filetime(time: std::time::SystemTime) -> u64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => FILETIME_UNIX_DELTA + d.as_secs() * 10_000_000 + u64::from(d.subsec_nanos()) / 100,
        Err(_) => 0,
    }
}

/// Converts a Windows FILETIME value to a [`std::time::SystemTime`].
pub fn from_filetime(filetime: u64) -> std::time::SystemTime {
    let unix_100ns = filetime.saturating_sub(FILETIME_UNIX_DELTA);
    std::time::UNIX_EPOCH + std::time::Duration::from_nanos(unix_100ns.saturating_mul(100))
}
