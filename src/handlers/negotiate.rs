//! SMB_COM_NEGOTIATE: dialect selection and the server challenge.

use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::header::Header;
use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive::{self, to_filetime};
use crate::dispatch::Action;
use crate::session::{Connection, Dialect};
use crate::status::Status;
use crate::Server;

const DIALECT_FORMAT: u8 = 0x02;
const NO_COMMON_DIALECT: u16 = 0xFFFF;

mod security_mode {
    /// User-level security.
    pub const USER: u8 = 0x01;
}

mod capabilities {
    pub const UNICODE: u32 = 0x0004;
    pub const LARGE_FILES: u32 = 0x0008;
    pub const NT_SMBS: u32 = 0x0010;
    pub const STATUS32: u32 = 0x0040;
    pub const LEVEL_II_OPLOCKS: u32 = 0x0080;
    pub const NT_FIND: u32 = 0x0200;
}

/// Parses the client's dialect list out of the byte area.
fn client_dialects(body: &Body<'_>) -> Result<Vec<String>, Status> {
    let mut bytes = body.bytes();
    let mut dialects = Vec::new();
    while bytes.remaining() > 0 {
        if primitive::u8(&mut bytes).map_err(|_| Status::INVALID_SMB)? != DIALECT_FORMAT {
            return Err(Status::INVALID_SMB);
        }
        dialects.push(primitive::oem_string(&mut bytes).map_err(|_| Status::INVALID_SMB)?);
    }
    Ok(dialects)
}

/// Picks the most featureful enabled dialect present in the client's list,
/// returning it with its index in that list.
fn select(server: &Server, offered: &[String]) -> Option<(Dialect, u16)> {
    let mut best: Option<(Dialect, u16)> = None;
    for dialect in Dialect::all() {
        if !server.config.dialect_enabled(dialect.group()) {
            continue;
        }
        if let Some(index) = offered.iter().position(|name| name == dialect.wire_name()) {
            best = Some((*dialect, index as u16));
        }
    }
    best
}

/// SMB_COM_NEGOTIATE.
pub async fn handle(
    server: &Server,
    connection: &Arc<Connection>,
    _header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    if connection.dialect().is_some() {
        // The dialect froze with the first negotiate.
        return Err(Status::INVALID_SMB);
    }
    let offered = client_dialects(body)?;
    debug!(connection = connection.id, ?offered, "negotiate");

    let Some((dialect, index)) = select(server, &offered) else {
        // No common ground: report 0xFFFF and stay in the negotiate state.
        reply.begin(1);
        reply.u16(NO_COMMON_DIALECT);
        reply.begin_bytes();
        reply.finish_block();
        return Ok(Action::Done);
    };

    connection.set_dialect(dialect);
    let challenge = crate::auth::generate_challenge();
    connection.set_challenge(challenge);
    info!(connection = connection.id, dialect = dialect.wire_name(), "dialect selected");

    match dialect {
        Dialect::NtLm012 => {
            reply.begin(17);
            reply.u16(index);
            reply.u8(security_mode::USER);
            reply.u16(50); // max multiplexed requests
            reply.u16(u16::from(server.config.max_virtual_circuits));
            reply.u32(server.pool.largest() as u32);
            reply.u32(0x0001_0000); // max raw
            reply.u32(0); // session key
            reply.u32(
                capabilities::UNICODE
                    | capabilities::LARGE_FILES
                    | capabilities::NT_SMBS
                    | capabilities::STATUS32
                    | capabilities::LEVEL_II_OPLOCKS
                    | capabilities::NT_FIND,
            );
            reply.u64(to_filetime(std::time::SystemTime::now()));
            reply.u16(0); // server time zone
            reply.u8(challenge.len() as u8);
            reply.begin_bytes();
            reply.bytes(&challenge);
            reply.string(&server.config.domain, true);
            reply.finish_block();
        }
        Dialect::Lanman10 | Dialect::Lanman12 | Dialect::Lanman21 => {
            reply.begin(13);
            reply.u16(index);
            reply.u16(u16::from(security_mode::USER));
            reply.u16(server.pool.largest().min(0xFFFF) as u16);
            reply.u16(50);
            reply.u16(u16::from(server.config.max_virtual_circuits));
            reply.u16(0); // raw mode off
            reply.u32(0); // session key
            reply.u16(0); // server time
            reply.u16(0); // server date
            reply.u16(0); // time zone
            reply.u16(challenge.len() as u16);
            reply.u16(0);
            reply.begin_bytes();
            reply.bytes(&challenge);
            reply.string(&server.config.domain, false);
            reply.finish_block();
        }
        Dialect::Core => {
            reply.begin(1);
            reply.u16(index);
            reply.begin_bytes();
            reply.finish_block();
        }
    }
    Ok(Action::Done)
}
