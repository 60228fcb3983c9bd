//! Reads SMB frames from a network connection into pooled buffers and
//! forwards them to the worker pool via the connection's run queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::frame::{self, session_type};
use crate::message_types::Outgoing;
use crate::session::{self, Connection, Request};
use crate::Server;

/// Reads framed SMB requests from one connection, parses the transport
/// layer, and hands each frame to the worker pool.
pub struct ReadTask {
    server: Arc<Server>,
    connection: Arc<Connection>,
    readhalf: OwnedReadHalf,
    /// NetBIOS session service (port 139): a session-request exchange
    /// precedes SMB traffic and keep-alives may appear at any time.
    netbios: bool,
}

impl ReadTask {
    /// Creates a new instance of [`ReadTask`].
    pub fn spawn(
        server: Arc<Server>,
        connection: Arc<Connection>,
        readhalf: OwnedReadHalf,
        netbios: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { server, connection, readhalf, netbios }.run())
    }

    async fn run(mut self) {
        if let Err(err) = self.read_loop().await {
            debug!(connection = self.connection.id, %err, "transport closed");
        }
        session::teardown_connection(&self.server, &self.connection).await;
        self.server.forget_connection(self.connection.id);
    }

    async fn read_loop(&mut self) -> std::io::Result<()> {
        let timeout = Duration::from_secs(self.server.config.session_timeout_secs);
        loop {
            let header = if timeout.is_zero() {
                frame::read_header(&mut self.readhalf).await?
            } else {
                match tokio::time::timeout(timeout, frame::read_header(&mut self.readhalf)).await {
                    Ok(header) => header?,
                    Err(_) => {
                        warn!(connection = self.connection.id, "session read timeout");
                        return Ok(());
                    }
                }
            };

            if self.connection.closing.load(std::sync::atomic::Ordering::Acquire) {
                return Ok(());
            }
            match header.message_type {
                session_type::MESSAGE => self.read_message(header.length).await?,
                session_type::REQUEST if self.netbios => {
                    self.session_request(header.length).await?
                }
                session_type::KEEP_ALIVE => {
                    trace!(connection = self.connection.id, "keep-alive");
                    self.discard(header.length).await?;
                }
                other => {
                    debug!(connection = self.connection.id, other, "unexpected session type");
                    self.discard(header.length).await?;
                }
            }
        }
    }

    async fn read_message(&mut self, length: usize) -> std::io::Result<()> {
        let wait = Duration::from_millis(self.server.config.buffer_wait_millis);
        let mut buffer = match self.server.pool.acquire(length, wait).await {
            Ok(buffer) => buffer,
            Err(err) => {
                // Backpressure exhausted: drop this frame, keep the session.
                warn!(connection = self.connection.id, %err, "dropping frame");
                return self.discard(length).await;
            }
        };
        buffer.reset(length);
        let header = frame::FrameHeader { message_type: session_type::MESSAGE, length };
        frame::read_body(&mut self.readhalf, header, &mut buffer).await?;
        self.connection.enqueue(&self.server, Request { buffer });
        Ok(())
    }

    /// RFC 1002 session establishment on 139: any well-formed request gets
    /// a positive response.
    async fn session_request(&mut self, length: usize) -> std::io::Result<()> {
        let mut body = vec![0u8; length];
        self.readhalf.read_exact(&mut body).await?;
        match frame::parse_session_request(&body) {
            Ok(request) => {
                debug!(
                    connection = self.connection.id,
                    called = %request.called,
                    calling = %request.calling,
                    "netbios session request"
                );
                let response = vec![session_type::POSITIVE_RESPONSE, 0, 0, 0];
                let _ = self.connection.sender.send(Outgoing::Raw(response));
                Ok(())
            }
            Err(err) => {
                let response = vec![session_type::NEGATIVE_RESPONSE, 0, 0, 1, 0x8F];
                let _ = self.connection.sender.send(Outgoing::Raw(response));
                Err(err)
            }
        }
    }

    async fn discard(&mut self, length: usize) -> std::io::Result<()> {
        let mut scratch = [0u8; 512];
        let mut left = length;
        while left > 0 {
            let take = left.min(scratch.len());
            self.readhalf.read_exact(&mut scratch[..take]).await?;
            left -= take;
        }
        Ok(())
    }
}
