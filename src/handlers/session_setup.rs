//! SMB_COM_SESSION_SETUP_ANDX and SMB_COM_LOGOFF_ANDX.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::{AuthOutcome, AuthRequest};
use crate::codec::header::Header;
use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive;
use crate::dispatch::Action;
use crate::session::{self, Connection, VcPhase};
use crate::status::Status;
use crate::Server;

mod setup_action {
    pub const GUEST: u16 = 0x0001;
}

/// SMB_COM_SESSION_SETUP_ANDX.
pub async fn handle(
    server: &Server,
    connection: &Arc<Connection>,
    header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    if connection.dialect().is_none() {
        return Err(Status::INVALID_SMB);
    }
    let mut words = body.require_words(13).map_err(|_| Status::INVALID_SMB)?;
    primitive::skip(&mut words, 4).map_err(|_| Status::INVALID_SMB)?;
    let max_buffer = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?; // max mpx
    let vc_number = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // session key
    let ansi_len = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)? as usize;
    let unicode_len = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)? as usize;
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // reserved
    primitive::u32(&mut words).map_err(|_| Status::INVALID_SMB)?; // capabilities

    let mut bytes = body.bytes();
    let ansi_response = bytes.take(ansi_len).map_err(|_| Status::INVALID_SMB)?.to_vec();
    let unicode_response = bytes.take(unicode_len).map_err(|_| Status::INVALID_SMB)?.to_vec();
    let account = bytes.read_string(header.unicode()).map_err(|_| Status::INVALID_SMB)?;
    let domain = bytes.read_string(header.unicode()).unwrap_or_default();

    if connection.vc_count() >= usize::from(server.config.max_virtual_circuits) {
        return Err(Status::INSUFFICIENT_RESOURCES);
    }
    if server.authenticator.sharemode_authentication_required() {
        return Err(Status::ACCESS_DENIED);
    }
    let challenge = connection.challenge().ok_or(Status::INVALID_SMB)?;

    if max_buffer >= 1024 {
        connection.max_buffer_size.store(u32::from(max_buffer), Ordering::Release);
    }

    let request = AuthRequest {
        account: &account,
        domain: &domain,
        ansi_response: &ansi_response,
        unicode_response: &unicode_response,
    };
    // A continuation round arrives under the UID handed out with
    // MORE_PROCESSING_REQUIRED; anything else starts a fresh circuit.
    let continued = match connection.vc(header.uid) {
        Some(vc) if vc.phase() == VcPhase::Authenticating => Some(vc),
        _ => None,
    };
    match server.authenticator.authenticate_user(&challenge, &request).await {
        AuthOutcome::Granted(identity) => {
            let vc = continued.unwrap_or_else(|| connection.create_vc(vc_number));
            let guest = identity.guest;
            info!(
                connection = connection.id,
                uid = vc.uid,
                account = %identity.account,
                guest,
                "session established"
            );
            vc.establish(identity);

            reply.set_uid(vc.uid);
            reply.begin(3);
            reply.andx_slot();
            reply.u16(if guest { setup_action::GUEST } else { 0 });
            reply.begin_bytes();
            reply.string("Unix", header.unicode());
            reply.string("smbserve", header.unicode());
            reply.string(&server.config.domain, header.unicode());
            reply.finish_block();
            Ok(Action::Done)
        }
        AuthOutcome::More(token) => {
            // Multi-round exchange: the circuit exists but stays in the
            // authenticating phase until a later round grants it.
            let vc = continued.unwrap_or_else(|| connection.create_vc(vc_number));
            debug!(connection = connection.id, uid = vc.uid, "authentication continues");
            reply.set_uid(vc.uid);
            reply.set_status(Status::MORE_PROCESSING_REQUIRED);
            reply.begin(4);
            reply.andx_slot();
            reply.u16(0);
            reply.u16(token.len() as u16);
            reply.begin_bytes();
            reply.bytes(&token);
            reply.finish_block();
            Ok(Action::Done)
        }
        AuthOutcome::Denied(status) => {
            debug!(connection = connection.id, account = %account, %status, "logon refused");
            Err(status)
        }
    }
}

/// SMB_COM_LOGOFF_ANDX.
pub async fn logoff(
    server: &Server,
    connection: &Arc<Connection>,
    header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    body.require_words(2).map_err(|_| Status::INVALID_SMB)?;
    let vc = connection.remove_vc(header.uid).ok_or(Status::SMB_BAD_UID)?;
    vc.advance(VcPhase::Closing);
    session::teardown_vc(server, connection, &vc).await;
    debug!(connection = connection.id, uid = vc.uid, "logoff");

    reply.begin(2);
    reply.andx_slot();
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
