//! Echo, cancellation, and search-handle close.

use std::sync::Arc;

use tracing::debug;

use crate::codec::header::Header;
use crate::codec::packet::{Body, ReplyBuilder};
use crate::codec::primitive;
use crate::dispatch::Action;
use crate::message_types::Outgoing;
use crate::session::{Connection, VirtualCircuit};
use crate::status::Status;
use crate::Server;

/// SMB_COM_ECHO: the payload comes back `echo_count` times. A count of
/// zero is legal and produces no response at all.
pub async fn echo(
    connection: &Arc<Connection>,
    header: &Header,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(1).map_err(|_| Status::INVALID_SMB)?;
    let echo_count = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    let mut bytes = body.bytes();
    let payload = bytes.rest().to_vec();

    if echo_count == 0 {
        return Ok(Action::NoReply);
    }

    // Repeats beyond the first go straight to the write funnel.
    for sequence in 2..=echo_count {
        let mut frame = Vec::with_capacity(64 + payload.len());
        let mut extra = ReplyBuilder::new(&mut frame, header.reply())
            .map_err(|_| Status::INSUFFICIENT_RESOURCES)?;
        extra.begin(1);
        extra.u16(sequence);
        extra.begin_bytes();
        extra.bytes(&payload);
        extra.finish_block();
        let _ = extra.finish();
        let _ = connection.sender.send(Outgoing::Owned(frame));
        connection.stats.packets_out.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    reply.begin(1);
    reply.u16(1);
    reply.begin_bytes();
    reply.bytes(&payload);
    reply.finish_block();
    Ok(Action::Done)
}

/// SMB_COM_NT_CANCEL: answers the pending request with the same MID with
/// `STATUS_CANCELLED`. The cancel itself never gets a response.
pub async fn nt_cancel(
    server: &Server,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    header: &Header,
) -> Result<Action, Status> {
    let cancelled = crate::notify::cancel(server, connection.id, vc, header.mid).await;
    if !cancelled {
        debug!(mid = header.mid, "cancel for unknown pending request");
    }
    Ok(Action::NoReply)
}

/// SMB_COM_FIND_CLOSE2.
pub async fn find_close2(
    connection: &Arc<Connection>,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let mut words = body.require_words(1).map_err(|_| Status::INVALID_SMB)?;
    let sid = primitive::u16(&mut words).map_err(|_| Status::INVALID_SMB)?;
    connection.searches.remove(&sid).ok_or(Status::INVALID_HANDLE)?;
    reply.begin(0);
    reply.begin_bytes();
    reply.finish_block();
    Ok(Action::Done)
}
