//! Channel message types connecting the per-connection tasks.
//!
//! Every frame leaving a connection --- replies from workers, asynchronous
//! oplock breaks, change-notify completions --- goes through one
//! [`OutgoingSender`] funnel drained by the connection's
//! [`crate::stream_writer::StreamWriter`]. That single consumer is what
//! serializes writes on the socket.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

use crate::pool::PooledBuffer;

/// One frame headed for the wire.
pub enum Outgoing {
    /// A reply built in place inside a loaned pool buffer.
    Pooled(PooledBuffer),
    /// A server-originated frame (oplock break, notify completion).
    Owned(Vec<u8>),
    /// Pre-framed bytes written verbatim (NetBIOS session responses).
    Raw(Vec<u8>),
}

impl Outgoing {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Outgoing::Pooled(buffer) => buffer.as_slice(),
            Outgoing::Owned(vec) => vec.as_slice(),
            Outgoing::Raw(vec) => vec.as_slice(),
        }
    }
}

/// Sender half of a connection's write funnel.
#[derive(Clone)]
pub struct OutgoingSender {
    sender: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for OutgoingSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutgoingSender")
    }
}

impl OutgoingSender {
    /// Queues a frame for the connection. Failure means the connection is
    /// already torn down, which every caller treats as "drop the frame".
    pub fn send(&self, frame: Outgoing) -> Result<(), SendError<Outgoing>> {
        self.sender.send(frame)
    }
}

/// Receiver half, owned by the stream writer task.
pub struct OutgoingReceiver {
    recv: mpsc::UnboundedReceiver<Outgoing>,
}

impl OutgoingReceiver {
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.recv.recv().await
    }
}

/// Creates a connection's write funnel.
pub fn create_outgoing_channel() -> (OutgoingSender, OutgoingReceiver) {
    let (sender, recv) = mpsc::unbounded_channel::<Outgoing>();
    (OutgoingSender { sender }, OutgoingReceiver { recv })
}
