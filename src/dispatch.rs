//! Command dispatch: frame parse, session-state checks, the command table,
//! `AndX` chain execution, and error replies.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use num_traits::FromPrimitive;
use tracing::{debug, warn};

use crate::codec::header::{Command, Flags1, Header};
use crate::codec::packet::{self, Body, ReplyBuilder};
use crate::message_types::Outgoing;
use crate::session::{Connection, Request, Tree, VcPhase, VirtualCircuit};
use crate::status::Status;
use crate::trans::{self, TransKind};
use crate::Server;

/// What a handler did with the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    /// The reply block is written; send it.
    Done,
    /// No frame goes out now (deferred async request, pure break ack, or
    /// the handler already wrote to the funnel itself).
    NoReply,
}

/// The connection is beyond saving: framing garbage or a dead transport.
pub struct Fatal;

fn command_of(value: u8) -> Option<Command> {
    Command::from_u8(value)
}

/// Whether replies to this command may carry an `AndX` follow-up.
fn chainable(command: Command) -> bool {
    matches!(
        command,
        Command::SessionSetupAndX
            | Command::TreeConnectAndX
            | Command::LogoffAndX
            | Command::NtCreateAndX
            | Command::OpenAndX
            | Command::ReadAndX
            | Command::WriteAndX
            | Command::LockingAndX
    )
}

fn reply_size_hint(server: &Server, connection: &Connection, command: u8) -> usize {
    match command_of(command) {
        Some(
            Command::ReadAndX
            | Command::Transaction
            | Command::Transaction2
            | Command::NtTransact
            | Command::TransactionSecondary
            | Command::Transaction2Secondary
            | Command::NtTransactSecondary,
        ) => server.pool.largest(),
        _ => (connection.max_buffer_size.load(Ordering::Acquire) as usize).min(4096),
    }
}

/// Processes one inbound frame end to end. Returns `Err(Fatal)` when the
/// connection must be dropped.
pub async fn process(
    server: &Arc<Server>,
    connection: &Arc<Connection>,
    request: Request,
) -> Result<(), Fatal> {
    connection.stats.packets_in.fetch_add(1, Ordering::Relaxed);
    connection.stats.bytes_in.fetch_add(request.buffer.len() as u64, Ordering::Relaxed);

    // Enough header to route? Anything less is framing garbage.
    let header = match packet::parse(&request.buffer) {
        Ok((header, _)) => header,
        Err(crate::codec::Error::Truncated) if request.buffer.len() >= 35 => {
            // Header arrived, areas are short: protocol error, answer it.
            match Header::parse(&mut std::io::Cursor::new(&request.buffer[..])) {
                Ok(header) => {
                    send_error(connection, &header, Status::INVALID_SMB);
                    return Ok(());
                }
                Err(_) => return Err(Fatal),
            }
        }
        Err(err) => {
            warn!(connection = connection.id, %err, "unparseable frame");
            return Err(Fatal);
        }
    };

    if header.flags.contains(Flags1::RESPONSE) {
        // Clients do not send response frames; drop it on the floor.
        debug!(connection = connection.id, "response-flagged frame ignored");
        return Ok(());
    }

    let hint = reply_size_hint(server, connection, header.command);
    let mut reply_buffer = match server.pool.try_acquire(hint) {
        Ok(buffer) => buffer,
        Err(_) => {
            send_error(connection, &header, Status::INSUFFICIENT_RESOURCES);
            return Ok(());
        }
    };

    let action = run_chain(server, connection, &request.buffer, reply_buffer.vec_mut()).await?;
    match action {
        Action::Done => {
            connection.stats.packets_out.fetch_add(1, Ordering::Relaxed);
            connection
                .stats
                .bytes_out
                .fetch_add(reply_buffer.len() as u64, Ordering::Relaxed);
            let _ = connection.sender.send(Outgoing::Pooled(reply_buffer));
        }
        Action::NoReply => {}
    }
    Ok(())
}

fn send_error(connection: &Arc<Connection>, header: &Header, status: Status) {
    // The pool may be exhausted here, so the error frame is plain heap.
    let mut buf = Vec::with_capacity(40);
    ReplyBuilder::error(&mut buf, header, status);
    connection.stats.packets_out.fetch_add(1, Ordering::Relaxed);
    let _ = connection.sender.send(Outgoing::Owned(buf));
}

/// Resolves the circuit a non-setup command runs under.
fn require_vc(connection: &Connection, header: &Header) -> Result<Arc<VirtualCircuit>, Status> {
    let vc = connection.vc(header.uid).ok_or(Status::SMB_BAD_UID)?;
    if vc.phase() != VcPhase::Established {
        return Err(Status::SMB_BAD_UID);
    }
    Ok(vc)
}

fn require_tree(vc: &VirtualCircuit, header: &Header) -> Result<Arc<Tree>, Status> {
    vc.tree(header.tid).ok_or(Status::SMB_BAD_TID)
}

async fn run_chain(
    server: &Arc<Server>,
    connection: &Arc<Connection>,
    frame: &[u8],
    out: &mut Vec<u8>,
) -> Result<Action, Fatal> {
    let (header, first) = match packet::parse(frame) {
        Ok(parsed) => parsed,
        Err(_) => return Err(Fatal),
    };

    let mut reply = match ReplyBuilder::new(&mut *out, header.reply()) {
        Ok(reply) => reply,
        Err(_) => return Err(Fatal),
    };

    let mut body = first;
    let mut command = header.command;
    loop {
        let outcome = execute(server, connection, &header, command, &body, &mut reply).await;
        match outcome {
            Ok(Action::NoReply) => return Ok(Action::NoReply),
            Ok(Action::Done) => {}
            Err(status) => {
                debug!(
                    connection = connection.id,
                    command, %status, "request failed"
                );
                let mut error_header = header.reply();
                error_header.command = command;
                ReplyBuilder::error(reply.into_inner(), &error_header, status);
                return Ok(Action::Done);
            }
        }

        let next = match command_of(command) {
            Some(known) if chainable(known) => body.andx().unwrap_or(None),
            _ => None,
        };
        let Some((next_command, offset)) = next else { break };
        body = match Body::at(frame, offset) {
            Ok(body) => body,
            Err(_) => {
                let mut error_header = header.reply();
                error_header.command = next_command;
                ReplyBuilder::error(reply.into_inner(), &error_header, Status::INVALID_SMB);
                return Ok(Action::Done);
            }
        };
        reply.patch_chain(next_command);
        command = next_command;
    }

    match reply.finish() {
        Ok(_) => Ok(Action::Done),
        Err(_) => {
            ReplyBuilder::error(out, &header.reply(), Status::INSUFFICIENT_RESOURCES);
            Ok(Action::Done)
        }
    }
}

async fn execute(
    server: &Arc<Server>,
    connection: &Arc<Connection>,
    header: &Header,
    command: u8,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    use crate::handlers::{create, file_ops, io, locking, misc, negotiate, session_setup, tree};

    let Some(known) = command_of(command) else {
        return Err(Status::NOT_IMPLEMENTED);
    };

    // Pre-NT dialects are restricted views of the NT path: the NT command
    // family simply does not exist for them.
    let nt_only = matches!(
        known,
        Command::NtCreateAndX
            | Command::NtTransact
            | Command::NtTransactSecondary
            | Command::NtCancel
    );
    if nt_only && !connection.dialect().map(|d| d.is_nt()).unwrap_or(false) {
        return Err(Status::NOT_SUPPORTED);
    }

    match known {
        Command::Negotiate => negotiate::handle(server, connection, header, body, reply).await,
        Command::SessionSetupAndX => {
            session_setup::handle(server, connection, header, body, reply).await
        }
        Command::Echo => {
            if connection.dialect().is_none() {
                return Err(Status::INVALID_SMB);
            }
            misc::echo(connection, header, body, reply).await
        }
        _ => {
            let vc = require_vc(connection, header)?;
            match known {
                Command::LogoffAndX => {
                    session_setup::logoff(server, connection, header, body, reply).await
                }
                Command::TreeConnectAndX => {
                    tree::connect(server, connection, &vc, header, body, reply).await
                }
                Command::TreeDisconnect => {
                    tree::disconnect(server, connection, &vc, header, reply).await
                }
                Command::NtCancel => misc::nt_cancel(server, connection, &vc, header).await,
                Command::Close => create::close(server, connection, &vc, body, reply).await,
                Command::Flush => io::flush(connection, &vc, body, reply).await,
                Command::ReadAndX => io::read(connection, header, body, reply).await,
                Command::Seek => io::seek(connection, body, reply).await,
                Command::WriteAndX => {
                    io::write(server, connection, header, frame_of(body), body, reply).await
                }
                Command::LockingAndX => locking::handle(connection, body, reply).await,
                Command::FindClose2 => misc::find_close2(connection, body, reply).await,
                _ => {
                    let tree = require_tree(&vc, header)?;
                    match known {
                        Command::NtCreateAndX => {
                            create::nt_create(
                                server, connection, &vc, &tree, header, body, reply,
                            )
                            .await
                        }
                        Command::OpenAndX => {
                            create::open_andx(
                                server, connection, &vc, &tree, header, body, reply,
                            )
                            .await
                        }
                        Command::Rename => {
                            file_ops::rename(server, &tree, header, body, reply).await
                        }
                        Command::Delete => {
                            file_ops::delete(server, &tree, header, body, reply).await
                        }
                        Command::CreateDirectory => {
                            file_ops::create_directory(server, &tree, header, body, reply).await
                        }
                        Command::DeleteDirectory => {
                            file_ops::delete_directory(server, &tree, header, body, reply).await
                        }
                        Command::CheckDirectory => {
                            file_ops::check_directory(&tree, header, body, reply).await
                        }
                        Command::QueryInformation => {
                            file_ops::query_information(&tree, header, body, reply).await
                        }
                        Command::SetInformation => {
                            file_ops::set_information(server, &tree, header, body, reply).await
                        }
                        Command::QueryInformationDisk => {
                            file_ops::query_information_disk(&tree, reply).await
                        }
                        Command::Transaction
                        | Command::Transaction2
                        | Command::NtTransact
                        | Command::TransactionSecondary
                        | Command::Transaction2Secondary
                        | Command::NtTransactSecondary => {
                            transact(
                                server, connection, &vc, &tree, header, known, body, reply,
                            )
                            .await
                        }
                        _ => Err(Status::NOT_SUPPORTED),
                    }
                }
            }
        }
    }
}

fn frame_of<'a>(body: &Body<'a>) -> &'a [u8] {
    body.frame()
}

#[allow(clippy::too_many_arguments)]
async fn transact(
    server: &Arc<Server>,
    connection: &Arc<Connection>,
    vc: &Arc<VirtualCircuit>,
    tree: &Arc<Tree>,
    header: &Header,
    command: Command,
    body: &Body<'_>,
    reply: &mut ReplyBuilder<'_>,
) -> Result<Action, Status> {
    let frame = body.frame();
    let key = (header.uid, header.mid);

    let assembly = match command {
        Command::Transaction | Command::Transaction2 => {
            let kind = if command == Command::Transaction {
                TransKind::Trans
            } else {
                TransKind::Trans2
            };
            let assembly = trans::parse_primary(frame, body, kind, header.unicode())
                .map_err(|_| Status::INVALID_SMB)?;
            if !assembly.complete() {
                connection.transactions.insert(key, assembly);
                // Interim response: ready for the secondaries.
                reply.begin(0);
                reply.begin_bytes();
                reply.finish_block();
                return Ok(Action::Done);
            }
            assembly
        }
        Command::NtTransact => {
            let assembly =
                trans::parse_nt_primary(frame, body).map_err(|_| Status::INVALID_SMB)?;
            if !assembly.complete() {
                connection.transactions.insert(key, assembly);
                reply.begin(0);
                reply.begin_bytes();
                reply.finish_block();
                return Ok(Action::Done);
            }
            assembly
        }
        Command::TransactionSecondary
        | Command::Transaction2Secondary
        | Command::NtTransactSecondary => {
            let mut slot = connection
                .transactions
                .get_mut(&key)
                .ok_or(Status::INVALID_PARAMETER)?;
            let absorbed = if command == Command::NtTransactSecondary {
                trans::absorb_nt_secondary(frame, body, &mut slot)
            } else {
                trans::absorb_secondary(frame, body, &mut slot)
            };
            if absorbed.is_err() {
                drop(slot);
                connection.transactions.remove(&key);
                return Err(Status::INVALID_SMB);
            }
            let complete = slot.complete();
            drop(slot);
            if !complete {
                return Ok(Action::NoReply);
            }
            match connection.transactions.remove(&key) {
                Some((_, assembly)) => assembly,
                None => return Ok(Action::NoReply),
            }
        }
        _ => return Err(Status::NOT_SUPPORTED),
    };

    match assembly.kind {
        TransKind::Trans => {
            if assembly.name.to_ascii_uppercase().ends_with("\\PIPE\\LANMAN") {
                trans::rap::dispatch(server, connection, vc, tree, header, &assembly, reply).await
            } else {
                Err(Status::NOT_SUPPORTED)
            }
        }
        TransKind::Trans2 => {
            trans::trans2::dispatch(server, connection, vc, tree, header, &assembly, reply).await
        }
        TransKind::NtTrans => {
            trans::nttrans::dispatch(server, connection, vc, tree, header, &assembly, reply).await
        }
    }
}
