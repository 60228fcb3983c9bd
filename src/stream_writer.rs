//! Writes reply and notification frames to a network connection.
//!
//! One writer task per connection is the single consumer of the write
//! funnel, which is what gives the ordering guarantee: replies and
//! server-initiated breaks leave the socket in funnel order, never
//! interleaved.

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::frame;
use crate::message_types::{Outgoing, OutgoingReceiver};

/// Drains a connection's write funnel onto the socket.
pub struct StreamWriter {
    writehalf: OwnedWriteHalf,
    recv: OutgoingReceiver,
}

impl StreamWriter {
    /// Creates a new instance of [`StreamWriter`].
    pub fn spawn(writehalf: OwnedWriteHalf, recv: OutgoingReceiver) -> JoinHandle<()> {
        tokio::spawn(Self { writehalf, recv }.run())
    }

    async fn run(mut self) {
        while let Some(outgoing) = self.recv.recv().await {
            let result = match &outgoing {
                Outgoing::Raw(raw) => self.writehalf.write_all(raw).await,
                framed => frame::write_frame(&mut self.writehalf, framed.as_slice()).await,
            };
            if let Err(err) = result {
                debug!(%err, "write side closed");
                return;
            }
        }
        let _ = self.writehalf.shutdown().await;
    }
}
