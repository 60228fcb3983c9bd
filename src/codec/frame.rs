//! Transport framing for native SMB (445) and the NetBIOS session service
//! (139).
//!
//! Both transports prefix each SMB frame with four bytes. On 445 the prefix
//! is a zero type byte followed by a 24-bit big-endian body length. On 139
//! the prefix is an RFC 1002 session header: one type byte, one flags byte
//! whose low bit extends the length to 17 bits, and a 16-bit big-endian
//! length. Port 139 additionally requires a session-request / positive-
//! response exchange, keyed by 32-byte first-level encoded NetBIOS names,
//! before any SMB traffic.

use std::io::{self, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// RFC 1002 session message types.
pub mod session_type {
    pub const MESSAGE: u8 = 0x00;
    pub const REQUEST: u8 = 0x81;
    pub const POSITIVE_RESPONSE: u8 = 0x82;
    pub const NEGATIVE_RESPONSE: u8 = 0x83;
    pub const RETARGET_RESPONSE: u8 = 0x84;
    pub const KEEP_ALIVE: u8 = 0x85;
}

/// Largest body this server will accept in a single frame.
pub const MAX_FRAME_LEN: usize = 0x1FFFF;

/// A decoded 4-byte transport header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u8,
    pub length: usize,
}

/// Reads the 4-byte transport header from the socket.
pub async fn read_header(src: &mut (impl AsyncRead + Unpin)) -> io::Result<FrameHeader> {
    let mut raw = [0u8; 4];
    src.read_exact(&mut raw).await?;
    let length = ((raw[1] as usize & 0x01) << 16) | ((raw[2] as usize) << 8) | raw[3] as usize;
    if length > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame length exceeds maximum"));
    }
    Ok(FrameHeader { message_type: raw[0], length })
}

/// Reads exactly `header.length` body bytes into `dest`.
pub async fn read_body(
    src: &mut (impl AsyncRead + Unpin),
    header: FrameHeader,
    dest: &mut [u8],
) -> io::Result<()> {
    debug_assert!(dest.len() >= header.length);
    src.read_exact(&mut dest[..header.length]).await?;
    Ok(())
}

/// Writes the transport header for a session message of `len` body bytes.
pub fn put_header(dest: &mut Vec<u8>, message_type: u8, len: usize) {
    dest.push(message_type);
    dest.push(((len >> 16) & 0x01) as u8);
    dest.push((len >> 8) as u8);
    dest.push(len as u8);
}

/// Writes a complete framed message to the socket.
pub async fn write_frame(
    dst: &mut (impl AsyncWrite + Unpin),
    body: &[u8],
) -> io::Result<()> {
    let mut header = [0u8; 4];
    header[0] = session_type::MESSAGE;
    header[1] = ((body.len() >> 16) & 0x01) as u8;
    header[2] = (body.len() >> 8) as u8;
    header[3] = body.len() as u8;
    dst.write_all(&header).await?;
    dst.write_all(body).await?;
    dst.flush().await
}

/// First-level encodes a NetBIOS name (RFC 1001 §14): the name is padded to
/// 15 characters, a one-byte suffix appended, and each byte split into two
/// nibbles biased by `'A'`.
pub fn encode_netbios_name(name: &str, suffix: u8) -> [u8; 32] {
    let mut padded = [b' '; 16];
    for (i, b) in name.bytes().take(15).enumerate() {
        padded[i] = b.to_ascii_uppercase();
    }
    padded[15] = suffix;
    let mut out = [0u8; 32];
    for (i, b) in padded.iter().enumerate() {
        out[i * 2] = b'A' + (b >> 4);
        out[i * 2 + 1] = b'A' + (b & 0x0F);
    }
    out
}

/// Reverses [`encode_netbios_name`], returning the name with padding trimmed.
pub fn decode_netbios_name(encoded: &[u8; 32]) -> (String, u8) {
    let mut raw = [0u8; 16];
    for i in 0..16 {
        let hi = encoded[i * 2].wrapping_sub(b'A') & 0x0F;
        let lo = encoded[i * 2 + 1].wrapping_sub(b'A') & 0x0F;
        raw[i] = (hi << 4) | lo;
    }
    let suffix = raw[15];
    let name = String::from_utf8_lossy(&raw[..15]).trim_end().to_string();
    (name, suffix)
}

/// A parsed RFC 1002 session request: called and calling names.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub called: String,
    pub called_suffix: u8,
    pub calling: String,
    pub calling_suffix: u8,
}

/// Parses the body of a session-request message. Each name is one length
/// byte (0x20), 32 encoded bytes, and a zero scope terminator.
pub fn parse_session_request(body: &[u8]) -> io::Result<SessionRequest> {
    fn name_at(body: &[u8], at: usize) -> io::Result<([u8; 32], usize)> {
        if body.len() < at + 34 || body[at] != 0x20 || body[at + 33] != 0 {
            return Err(io::Error::new(ErrorKind::InvalidData, "malformed NetBIOS name"));
        }
        let mut encoded = [0u8; 32];
        encoded.copy_from_slice(&body[at + 1..at + 33]);
        Ok((encoded, at + 34))
    }
    let (called, next) = name_at(body, 0)?;
    let (calling, _) = name_at(body, next)?;
    let (called, called_suffix) = decode_netbios_name(&called);
    let (calling, calling_suffix) = decode_netbios_name(&calling);
    Ok(SessionRequest { called, called_suffix, calling, calling_suffix })
}

/// Builds the body of a session-request message.
pub fn build_session_request(called: &str, calling: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(68);
    body.push(0x20);
    body.extend_from_slice(&encode_netbios_name(called, 0x20));
    body.push(0);
    body.push(0x20);
    body.extend_from_slice(&encode_netbios_name(calling, 0x00));
    body.push(0);
    body
}
